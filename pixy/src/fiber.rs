//! Cooperative multitasking.
//!
//! A fiber is a set of instructions executed with cooperative multitasking:
//! it runs until it reaches a suspension point — [`reschedule`], [`sleep`],
//! a blocking call in [`crate::coio`], or one of the synchronization
//! primitives below — and only there may another fiber run. There is no
//! preemption and no parallelism between fibers; plain `Rc<RefCell<…>>`
//! sharing is safe as long as no borrow is held across a suspension point.
//!
//! Fibers exist only inside [`crate::run`]. Example:
//!
//! ```
//! pixy::run(|| {
//!     pixy::fiber::start(|| {
//!         println!("runs first");
//!     });
//!     println!("runs second");
//!     0
//! });
//! ```

use std::time::Duration;

use crate::runtime;
use crate::sched::FiberRef;

pub mod event;
pub mod mailbox;
pub mod semaphore;

pub use event::Event;
pub use mailbox::{Mail, Mailbox};
pub use semaphore::Semaphore;

/// Spawns a fiber at the back of the ready queue.
///
/// The new fiber does not run until the caller reaches a suspension point
/// and the ready fibers ahead of it have had their turn.
///
/// # Panics
///
/// Panics when called outside the runtime.
pub fn defer<F>(f: F)
where
    F: FnOnce() + 'static,
{
    runtime::current().sched.add(Box::new(f));
}

/// Spawns a fiber and transfers control to it immediately.
///
/// The caller is requeued at the *front* of the ready queue: it resumes
/// ahead of every other ready fiber, as soon as the new fiber suspends or
/// finishes.
///
/// # Panics
///
/// Panics when called outside a fiber.
pub fn start<F>(f: F)
where
    F: FnOnce() + 'static,
{
    runtime::current().sched.add_and_run(Box::new(f));
}

/// Requeues the current fiber at the back of the ready queue and runs the
/// next one. Returns immediately when no other fiber is ready.
///
/// # Panics
///
/// Panics when called outside a fiber.
pub fn reschedule() {
    runtime::current().sched.yield_current();
}

/// Puts the current fiber to sleep for at least `time`.
///
/// Driven by the runtime's coarse-millisecond timer; the actual delay is
/// rounded up to the next timer tick.
///
/// # Panics
///
/// Panics when called outside a fiber.
pub fn sleep(time: Duration) {
    let rt = runtime::current();
    let fiber = rt.sched.current();
    rt.timer
        .set(time.as_millis() as i64, fiber.as_ptr() as *mut (), wake);
    rt.sched.suspend_current();
}

/// Terminates the current fiber. Pending destructors of its frames do not
/// run; prefer returning from the entry function when cleanup matters.
///
/// # Panics
///
/// Panics when called outside a fiber.
pub fn exit() -> ! {
    let sched = runtime::scheduler_ptr();
    unsafe { sched.as_ref().exit_current() }
}

/// Number of live fibers (created minus exited) in this thread's runtime.
///
/// # Panics
///
/// Panics when called outside the runtime.
pub fn count() -> usize {
    runtime::current().sched.fiber_count()
}

unsafe fn wake(token: *mut ()) {
    let fiber = FiberRef::new_unchecked(token as *mut _);
    runtime::current().sched.resume(fiber);
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::{Duration, Instant};

    #[test]
    fn start_runs_child_first() {
        let trace = Rc::new(RefCell::new(Vec::new()));
        let t = Rc::clone(&trace);
        let status = crate::run(move || {
            let t2 = Rc::clone(&t);
            crate::fiber::start(move || t2.borrow_mut().push("child"));
            t.borrow_mut().push("parent");
            7
        });
        assert_eq!(status, 7);
        assert_eq!(*trace.borrow(), ["child", "parent"]);
    }

    #[test]
    fn defer_runs_child_later() {
        let trace = Rc::new(RefCell::new(Vec::new()));
        let t = Rc::clone(&trace);
        crate::run(move || {
            let t2 = Rc::clone(&t);
            crate::fiber::defer(move || t2.borrow_mut().push("child"));
            t.borrow_mut().push("parent");
            0
        });
        assert_eq!(*trace.borrow(), ["parent", "child"]);
    }

    #[test]
    fn starter_resumes_ahead_of_ready_fibers() {
        // After `start`, the parent sits at the front of the ready queue:
        // the moment the child suspends, the parent runs, before fibers
        // that were already waiting.
        let trace = Rc::new(RefCell::new(Vec::new()));
        let t = Rc::clone(&trace);
        crate::run(move || {
            let t1 = Rc::clone(&t);
            crate::fiber::defer(move || t1.borrow_mut().push("bystander"));
            let t2 = Rc::clone(&t);
            crate::fiber::start(move || {
                t2.borrow_mut().push("child");
                crate::fiber::reschedule();
                t2.borrow_mut().push("child again");
            });
            t.borrow_mut().push("parent");
            0
        });
        assert_eq!(
            *trace.borrow(),
            ["child", "parent", "bystander", "child again"]
        );
    }

    #[test]
    fn round_robin_yield_order() {
        let trace = Rc::new(RefCell::new(Vec::new()));
        let t = Rc::clone(&trace);
        crate::run(move || {
            for who in ["A", "B"] {
                let t = Rc::clone(&t);
                crate::fiber::defer(move || {
                    for i in 1..=3 {
                        t.borrow_mut().push(format!("{}-{}", who, i));
                        crate::fiber::reschedule();
                    }
                });
            }
            0
        });
        assert_eq!(
            *trace.borrow(),
            ["A-1", "B-1", "A-2", "B-2", "A-3", "B-3"]
        );
    }

    #[test]
    fn yield_alone_is_a_noop() {
        let status = crate::run(|| {
            crate::fiber::reschedule();
            crate::fiber::reschedule();
            3
        });
        assert_eq!(status, 3);
    }

    #[test]
    fn sleep_waits_long_enough() {
        let elapsed = Rc::new(RefCell::new(Duration::ZERO));
        let e = Rc::clone(&elapsed);
        crate::run(move || {
            let begin = Instant::now();
            crate::fiber::sleep(Duration::from_millis(120));
            *e.borrow_mut() = begin.elapsed();
            0
        });
        let elapsed = *elapsed.borrow();
        // The coarse timer clock may lag the precise one by a kernel tick,
        // so allow a little slack below the nominal 120 ms.
        assert!(elapsed >= Duration::from_millis(100), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1000), "{:?}", elapsed);
    }

    #[test]
    fn exit_skips_the_rest_of_the_fiber() {
        let trace = Rc::new(RefCell::new(Vec::new()));
        let t = Rc::clone(&trace);
        crate::run(move || {
            let t2 = Rc::clone(&t);
            crate::fiber::start(move || {
                t2.borrow_mut().push("before");
                crate::fiber::exit();
                #[allow(unreachable_code)]
                t2.borrow_mut().push("after");
            });
            t.borrow_mut().push("parent");
            0
        });
        assert_eq!(*trace.borrow(), ["before", "parent"]);
    }

    #[test]
    fn count_tracks_creations_and_exits() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&seen);
        crate::run(move || {
            s.borrow_mut().push(crate::fiber::count()); // root only
            let s2 = Rc::clone(&s);
            crate::fiber::start(move || {
                s2.borrow_mut().push(crate::fiber::count()); // root + child
            });
            s.borrow_mut().push(crate::fiber::count()); // child exited
            0
        });
        assert_eq!(*seen.borrow(), [1, 2, 1]);
    }

    #[test]
    fn runtime_can_run_twice_on_one_thread() {
        assert_eq!(crate::run(|| 1), 1);
        assert_eq!(crate::run(|| 2), 2);
    }

    #[test]
    fn many_fibers_reuse_stacks() {
        let status = crate::run(|| {
            for _ in 0..64 {
                crate::fiber::start(|| {
                    crate::fiber::reschedule();
                });
            }
            for _ in 0..1024 {
                crate::fiber::defer(|| {});
                crate::fiber::reschedule();
            }
            0
        });
        assert_eq!(status, 0);
    }
}
