//! Runtime state and the event loop.
//!
//! One runtime per thread, live for the duration of [`run`]. All components
//! except the worker threads execute on the owning thread, so the state is
//! plain thread-local data behind an `Rc`; entry points clone the handle out
//! of the thread-local slot and never hold the slot borrowed across a
//! context switch.

use std::cell::{Cell, RefCell};
use std::ptr::NonNull;
use std::rc::Rc;

use crate::dispatch::DispatchQueue;
use crate::log::fatal;
use crate::poller::IoPoller;
use crate::sched::Scheduler;
use crate::thread_pool::ThreadPool;
use crate::timer::Timer;

pub(crate) struct Runtime {
    pub sched: Scheduler,
    pub poller: IoPoller,
    pub timer: Timer,
    pub pool: ThreadPool,
    pub dispatch: DispatchQueue,
}

impl Runtime {
    fn new() -> std::io::Result<Runtime> {
        Ok(Runtime {
            sched: Scheduler::new(),
            poller: IoPoller::new()?,
            timer: Timer::new(),
            pool: ThreadPool::new()?,
            dispatch: DispatchQueue::new(),
        })
    }
}

thread_local! {
    static RUNTIME: RefCell<Option<Rc<Runtime>>> = RefCell::new(None);
}

/// Clones the current thread's runtime handle.
///
/// Panics outside [`run`]; every public entry point that ends up here is
/// documented as requiring the runtime.
pub(crate) fn current() -> Rc<Runtime> {
    RUNTIME.with(|slot| {
        slot.borrow()
            .as_ref()
            .expect("no fiber runtime on this thread")
            .clone()
    })
}

/// Raw pointer to the current scheduler, for the one caller that must not
/// hold a runtime handle: a fiber about to exit never returns, so anything
/// it still owns would leak.
pub(crate) fn scheduler_ptr() -> NonNull<Scheduler> {
    RUNTIME.with(|slot| {
        let slot = slot.borrow();
        let rt = slot.as_ref().expect("no fiber runtime on this thread");
        NonNull::from(&rt.sched)
    })
}

/// Runs `main` as the root fiber of a fresh runtime and returns its status.
///
/// Initializes the scheduler, reactor, timer and worker pool; drives the
/// event loop until every fiber has exited; shuts the components down in
/// reverse order. Fibers spawned by `main` (and theirs, recursively) all
/// finish before this returns.
///
/// ```
/// let status = pixy::run(|| {
///     pixy::fiber::start(|| println!("hello from a fiber"));
///     0
/// });
/// assert_eq!(status, 0);
/// ```
///
/// # Panics
///
/// Panics when a runtime is already active on this thread.
pub fn run<F>(main: F) -> i32
where
    F: FnOnce() -> i32 + 'static,
{
    crate::log::init();

    let rt = match Runtime::new() {
        Ok(rt) => Rc::new(rt),
        Err(err) => fatal!("runtime initialization failed: {}", err),
    };
    RUNTIME.with(|slot| {
        let mut slot = slot.borrow_mut();
        assert!(slot.is_none(), "fiber runtime already running on this thread");
        *slot = Some(Rc::clone(&rt));
    });

    rt.pool.start(&rt.poller);

    let status = Rc::new(Cell::new(0));
    {
        let status = Rc::clone(&status);
        rt.sched.add(Box::new(move || status.set(main())));
    }

    event_loop(&rt);

    rt.pool.stop();
    rt.pool.detach(&rt.poller);
    RUNTIME.with(|slot| slot.borrow_mut().take());
    drop(rt);
    status.get()
}

/// One iteration: run every ready fiber, then sleep in the reactor until
/// readiness or the next deadline, then deliver what woke us up.
fn event_loop(rt: &Runtime) {
    loop {
        rt.sched.tick();

        if rt.sched.fiber_count() == 0 {
            break;
        }

        let wait_time = rt.timer.wait_time();
        loop {
            match rt.poller.tick(wait_time, &rt.dispatch) {
                Ok(()) => break,
                Err(err) if err.raw_os_error() == Some(libc::EINTR) => continue,
                Err(err) => fatal!("reactor tick failed: {}", err),
            }
        }
        rt.dispatch.drain();

        rt.timer.tick(&rt.dispatch);
        rt.dispatch.drain();
    }
}
