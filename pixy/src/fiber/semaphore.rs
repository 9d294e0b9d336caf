//! Bounded counting semaphore.
//!
//! The counter moves inside `[min_value, max_value]`. [`Semaphore::down`]
//! blocks at the lower bound, [`Semaphore::up`] at the upper one; each side
//! keeps a FIFO of waiting fibers and wakes the head whenever it creates
//! headroom for it.
//!
//! Wakeups are speculative: the head waiter is resumed while still on the
//! waiter queue and claims the counter only when it actually runs. If, in
//! between, a faster fiber takes the counter back to the bound, the waiter
//! is *unresumed* — pulled back out of the ready queue — so it can never
//! observe a depleted semaphore.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

use crate::error::{Error, Result};
use crate::runtime;
use crate::sched::FiberRef;

/// Counting semaphore with both bounds enforced.
///
/// ```
/// use std::rc::Rc;
/// use pixy::fiber::{self, Semaphore};
///
/// pixy::run(|| {
///     let sem = Rc::new(Semaphore::new(0, 0, 1).unwrap());
///     let s = Rc::clone(&sem);
///     fiber::start(move || s.down()); // blocks: counter at min
///     sem.up();                       // releases the waiter
///     0
/// });
/// ```
pub struct Semaphore {
    value: Cell<i32>,
    min_value: i32,
    max_value: i32,
    down_waiters: RefCell<VecDeque<FiberRef>>,
    up_waiters: RefCell<VecDeque<FiberRef>>,
}

impl Semaphore {
    /// Builds a semaphore with the given initial value and bounds; the
    /// value must lie within them.
    pub fn new(value: i32, min_value: i32, max_value: i32) -> Result<Semaphore> {
        if min_value > value || max_value < value {
            return Err(Error::InvalidArgument(
                "semaphore value outside [min_value, max_value]",
            ));
        }
        Ok(Semaphore {
            value: Cell::new(value),
            min_value,
            max_value,
            down_waiters: RefCell::new(VecDeque::new()),
            up_waiters: RefCell::new(VecDeque::new()),
        })
    }

    /// Current counter value.
    pub fn value(&self) -> i32 {
        self.value.get()
    }

    /// Decrements the counter, waiting while it sits at the lower bound.
    ///
    /// # Panics
    ///
    /// Panics when called outside a fiber.
    pub fn down(&self) {
        let rt = runtime::current();
        if self.value.get() == self.min_value {
            let current = rt.sched.current();
            self.down_waiters.borrow_mut().push_back(current);
            rt.sched.suspend_current();
            let head = self.down_waiters.borrow_mut().pop_front();
            debug_assert_eq!(head, Some(current));

            self.value.set(self.value.get() - 1);
            if self.value.get() > self.min_value {
                // Pass the remaining headroom down the queue.
                if let Some(&next) = self.down_waiters.borrow().front() {
                    rt.sched.resume(next);
                }
            }
        } else {
            self.value.set(self.value.get() - 1);
            if self.value.get() == self.min_value {
                // A waiter resumed for headroom that no longer exists must
                // not run and find the counter depleted.
                if let Some(&head) = self.down_waiters.borrow().front() {
                    rt.sched.unresume(head);
                }
            }
        }

        if self.value.get() == self.max_value - 1 {
            if let Some(&head) = self.up_waiters.borrow().front() {
                rt.sched.resume(head);
            }
        }
    }

    /// Increments the counter, waiting while it sits at the upper bound.
    ///
    /// # Panics
    ///
    /// Panics when called outside a fiber.
    pub fn up(&self) {
        let rt = runtime::current();
        if self.value.get() == self.max_value {
            let current = rt.sched.current();
            self.up_waiters.borrow_mut().push_back(current);
            rt.sched.suspend_current();
            let head = self.up_waiters.borrow_mut().pop_front();
            debug_assert_eq!(head, Some(current));

            self.value.set(self.value.get() + 1);
            if self.value.get() < self.max_value {
                if let Some(&next) = self.up_waiters.borrow().front() {
                    rt.sched.resume(next);
                }
            }
        } else {
            self.value.set(self.value.get() + 1);
            if self.value.get() == self.max_value {
                if let Some(&head) = self.up_waiters.borrow().front() {
                    rt.sched.unresume(head);
                }
            }
        }

        if self.value.get() == self.min_value + 1 {
            if let Some(&head) = self.down_waiters.borrow().front() {
                rt.sched.resume(head);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc;

    #[test]
    fn rejects_value_outside_bounds() {
        assert!(Semaphore::new(2, 0, 1).is_err());
        assert!(Semaphore::new(-1, 0, 1).is_err());
        assert!(Semaphore::new(0, 0, 0).is_ok());
    }

    #[test]
    fn down_blocks_until_up() {
        let trace = Rc::new(StdRefCell::new(Vec::new()));
        let t = Rc::clone(&trace);
        crate::run(move || {
            let sem = Rc::new(Semaphore::new(0, 0, 1).unwrap());
            let s = Rc::clone(&sem);
            let t2 = Rc::clone(&t);
            crate::fiber::start(move || {
                t2.borrow_mut().push("down-begin");
                s.down();
                t2.borrow_mut().push("down-end");
            });
            t.borrow_mut().push("up");
            sem.up();
            crate::fiber::reschedule();
            assert_eq!(sem.value(), 0);
            0
        });
        assert_eq!(*trace.borrow(), ["down-begin", "up", "down-end"]);
    }

    #[test]
    fn up_blocks_at_max() {
        let trace = Rc::new(StdRefCell::new(Vec::new()));
        let t = Rc::clone(&trace);
        crate::run(move || {
            let sem = Rc::new(Semaphore::new(1, 0, 1).unwrap());
            let s = Rc::clone(&sem);
            let t2 = Rc::clone(&t);
            crate::fiber::start(move || {
                t2.borrow_mut().push("up-begin");
                s.up();
                t2.borrow_mut().push("up-end");
            });
            t.borrow_mut().push("down");
            sem.down();
            crate::fiber::reschedule();
            assert_eq!(sem.value(), 1);
            0
        });
        assert_eq!(*trace.borrow(), ["up-begin", "down", "up-end"]);
    }

    #[test]
    fn value_stays_within_bounds_under_contention() {
        let violations = Rc::new(StdRefCell::new(0));
        let v = Rc::clone(&violations);
        crate::run(move || {
            let sem = Rc::new(Semaphore::new(1, 0, 2).unwrap());
            for _ in 0..4 {
                let sem = Rc::clone(&sem);
                let v = Rc::clone(&v);
                crate::fiber::defer(move || {
                    for _ in 0..50 {
                        sem.down();
                        if sem.value() < 0 || sem.value() > 2 {
                            *v.borrow_mut() += 1;
                        }
                        crate::fiber::reschedule();
                        sem.up();
                        if sem.value() < 0 || sem.value() > 2 {
                            *v.borrow_mut() += 1;
                        }
                        crate::fiber::reschedule();
                    }
                });
            }
            0
        });
        assert_eq!(*violations.borrow(), 0);
    }

    #[test]
    fn chained_wakeups_release_every_waiter() {
        let done = Rc::new(StdRefCell::new(0));
        let d = Rc::clone(&done);
        crate::run(move || {
            let sem = Rc::new(Semaphore::new(0, 0, 8).unwrap());
            for _ in 0..3 {
                let sem = Rc::clone(&sem);
                let d = Rc::clone(&d);
                crate::fiber::defer(move || {
                    sem.down();
                    *d.borrow_mut() += 1;
                });
            }
            crate::fiber::reschedule(); // let all three block
            let s = Rc::clone(&sem);
            crate::fiber::defer(move || {
                s.up();
                s.up();
                s.up();
            });
            0
        });
        assert_eq!(*done.borrow(), 3);
    }
}
