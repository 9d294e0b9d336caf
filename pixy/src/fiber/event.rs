//! Broadcast one-shot event.

use std::cell::Cell;
use std::ptr;

use crate::runtime;
use crate::sched::FiberRef;

struct Waiter {
    prev: *mut Waiter,
    fiber: FiberRef,
}

/// Wakes every waiting fiber at once.
///
/// [`Event::wait`] suspends the calling fiber until somebody calls
/// [`Event::trigger`]; a trigger releases exactly the fibers that were
/// waiting at that moment and leaves the event empty, ready for reuse.
///
/// ```
/// use std::rc::Rc;
/// use pixy::fiber::{self, Event};
///
/// pixy::run(|| {
///     let gate = Rc::new(Event::new());
///     for _ in 0..3 {
///         let gate = Rc::clone(&gate);
///         fiber::start(move || gate.wait());
///     }
///     gate.trigger(); // all three resume
///     0
/// });
/// ```
pub struct Event {
    last_waiter: Cell<*mut Waiter>,
}

impl Event {
    pub fn new() -> Event {
        Event {
            last_waiter: Cell::new(ptr::null_mut()),
        }
    }

    /// Suspends the current fiber until the next [`Event::trigger`].
    ///
    /// # Panics
    ///
    /// Panics when called outside a fiber.
    pub fn wait(&self) {
        let rt = runtime::current();
        let mut waiter = Waiter {
            prev: self.last_waiter.get(),
            fiber: rt.sched.current(),
        };
        self.last_waiter.set(&mut waiter);
        rt.sched.suspend_current();
    }

    /// Resumes every fiber currently waiting and empties the waiter stack.
    /// Does nothing when nobody waits; never suspends the caller.
    pub fn trigger(&self) {
        let mut waiter = self.last_waiter.replace(ptr::null_mut());
        if waiter.is_null() {
            return;
        }
        let rt = runtime::current();
        while !waiter.is_null() {
            let w = unsafe { &*waiter };
            rt.sched.resume(w.fiber);
            waiter = w.prev;
        }
    }
}

impl Default for Event {
    fn default() -> Event {
        Event::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell as StdCell;
    use std::rc::Rc;

    #[test]
    fn trigger_wakes_every_waiter_exactly_once() {
        let woken = Rc::new(StdCell::new(0));
        let w = Rc::clone(&woken);
        crate::run(move || {
            let event = Rc::new(Event::new());
            for _ in 0..5 {
                let event = Rc::clone(&event);
                let w = Rc::clone(&w);
                crate::fiber::start(move || {
                    event.wait();
                    w.set(w.get() + 1);
                });
            }
            assert_eq!(w.get(), 0);
            event.trigger();
            crate::fiber::reschedule();
            assert_eq!(w.get(), 5);
            // A second trigger has nobody left to wake.
            event.trigger();
            crate::fiber::reschedule();
            assert_eq!(w.get(), 5);
            0
        });
        assert_eq!(woken.get(), 5);
    }

    #[test]
    fn late_waiter_needs_the_next_trigger() {
        let trace = Rc::new(StdCell::new(0));
        let t = Rc::clone(&trace);
        crate::run(move || {
            let event = Rc::new(Event::new());
            event.trigger(); // nobody waiting: lost, not latched
            let e2 = Rc::clone(&event);
            let t2 = Rc::clone(&t);
            crate::fiber::start(move || {
                e2.wait();
                t2.set(t2.get() + 1);
            });
            assert_eq!(t.get(), 0);
            event.trigger();
            crate::fiber::reschedule();
            assert_eq!(t.get(), 1);
            0
        });
    }
}
