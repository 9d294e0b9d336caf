//! Fiber lifecycle and cooperative scheduling.
//!
//! A fiber is a user-space execution context with its own 64 KiB stack. At
//! most one fiber runs at a time; everything here executes on the thread
//! that owns the runtime, so the scheduler needs no locks, only interior
//! mutability. Fibers are `Box`-allocated and never move; the rest of the
//! runtime refers to them through [`FiberRef`] handles that stay valid until
//! the owning scheduler is dropped.
//!
//! State machine per fiber: `ready ↔ running → suspended → ready`, plus
//! `running → dead`. The running fiber is in no list; a suspended fiber is
//! held by whichever primitive arranged its resumption; dead fibers are kept
//! on a LIFO free list so a later spawn reuses a warm stack.

use std::cell::{Cell, RefCell, UnsafeCell};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;

use crate::arch::{pixy_context_switch, Context};
use crate::log::fatal;
use crate::runtime;

/// Size of each fiber stack. May be raised, never lowered.
pub(crate) const FIBER_STACK_SIZE: usize = 65_536;

type Entry = Box<dyn FnOnce()>;

pub(crate) struct Fiber {
    ctx: UnsafeCell<Context>,
    stack: *mut u8,
    entry: Cell<Option<Entry>>,
}

/// Handle to a live fiber. Valid until the scheduler that allocated the
/// fiber is dropped; the runtime only ever stores handles for fibers it is
/// about to resume.
pub(crate) type FiberRef = NonNull<Fiber>;

impl Fiber {
    fn allocate() -> FiberRef {
        let layout = stack_layout();
        let stack = unsafe { std::alloc::alloc(layout) };
        if stack.is_null() {
            std::alloc::handle_alloc_error(layout);
        }
        let fiber = Box::new(Fiber {
            ctx: UnsafeCell::new(Context::zeroed()),
            stack,
            entry: Cell::new(None),
        });
        NonNull::from(Box::leak(fiber))
    }

    /// Arms the fiber for a fresh run of `entry`. Also used when recycling
    /// a dead fiber: the old snapshot is dead weight and is overwritten.
    unsafe fn prepare(&self, entry: Entry) {
        self.entry.set(Some(entry));
        let top = self.stack.add(FIBER_STACK_SIZE);
        *self.ctx.get() = Context::fresh(top, fiber_trampoline);
    }

    #[inline]
    fn ctx(&self) -> *mut Context {
        self.ctx.get()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.stack, stack_layout()) };
    }
}

fn stack_layout() -> std::alloc::Layout {
    std::alloc::Layout::from_size_align(FIBER_STACK_SIZE, 16).unwrap()
}

/// First frame of every fiber: runs the entry, then exits through the
/// scheduler. Entered via a fabricated [`Context`], so it must never return
/// normally.
extern "C" fn fiber_trampoline() -> ! {
    let sched = runtime::scheduler_ptr();
    let entry = unsafe { sched.as_ref() }.take_current_entry();
    if panic::catch_unwind(AssertUnwindSafe(entry)).is_err() {
        // Unwinding across a context switch is not survivable.
        fatal!("fiber entry panicked");
    }
    unsafe { sched.as_ref().exit_current() }
}

////////////////////////////////////////////////////////////////////////////////
// Scheduler
////////////////////////////////////////////////////////////////////////////////

pub(crate) struct Scheduler {
    running: Cell<Option<FiberRef>>,
    ready: RefCell<VecDeque<FiberRef>>,
    dead: RefCell<Vec<FiberRef>>,
    fiber_count: Cell<usize>,
    /// Snapshot of the event loop, taken by [`Scheduler::tick`]; where
    /// control goes when the ready set drains.
    loop_ctx: UnsafeCell<Context>,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler {
            running: Cell::new(None),
            ready: RefCell::new(VecDeque::new()),
            dead: RefCell::new(Vec::new()),
            fiber_count: Cell::new(0),
            loop_ctx: UnsafeCell::new(Context::zeroed()),
        }
    }

    /// Live fibers: creations minus exits.
    #[inline]
    pub fn fiber_count(&self) -> usize {
        self.fiber_count.get()
    }

    /// The currently running fiber.
    ///
    /// Panics when called from the event loop; every public entry point
    /// that needs the current fiber is documented as fiber-only.
    #[inline]
    pub fn current(&self) -> FiberRef {
        self.running
            .get()
            .expect("not running inside a fiber")
    }

    pub(crate) fn take_current_entry(&self) -> Entry {
        let fiber = self.current();
        unsafe { fiber.as_ref() }
            .entry
            .take()
            .expect("fiber started twice")
    }

    /// Creates a fiber and queues it at the back of the ready FIFO,
    /// recycling a dead fiber when one is cached.
    pub fn add(&self, entry: Entry) {
        let fiber = self
            .dead
            .borrow_mut()
            .pop()
            .unwrap_or_else(Fiber::allocate);
        unsafe { fiber.as_ref().prepare(entry) };
        self.ready.borrow_mut().push_back(fiber);
        self.fiber_count.set(self.fiber_count.get() + 1);
    }

    /// Creates a fiber and transfers control to it immediately. The caller
    /// re-enters at the front of the ready queue, ahead of everything that
    /// was already waiting.
    pub fn add_and_run(&self, entry: Entry) {
        let current = self.current();
        self.add(entry);
        let next = {
            let mut ready = self.ready.borrow_mut();
            let next = ready.pop_back().unwrap();
            ready.push_front(current);
            next
        };
        unsafe { self.transfer(current, next) };
    }

    /// Round-robin yield: requeue at the back, run the front. No-op when
    /// nothing else is ready.
    pub fn yield_current(&self) {
        let current = self.current();
        let next = {
            let mut ready = self.ready.borrow_mut();
            if ready.is_empty() {
                return;
            }
            ready.push_back(current);
            ready.pop_front().unwrap()
        };
        unsafe { self.transfer(current, next) };
    }

    /// Stops running the current fiber without requeueing it. The caller
    /// must have arranged for somebody to [`Scheduler::resume`] it later.
    /// Returns when that happens.
    pub fn suspend_current(&self) {
        let current = self.current();
        let next = self.ready.borrow_mut().pop_front();
        match next {
            Some(next) => unsafe { self.transfer(current, next) },
            None => unsafe { self.park_in_loop(current) },
        }
    }

    /// Appends a suspended fiber to the back of the ready queue.
    pub fn resume(&self, fiber: FiberRef) {
        debug_assert_ne!(Some(fiber), self.running.get());
        self.ready.borrow_mut().push_back(fiber);
    }

    /// Takes a fiber that was speculatively resumed back out of the ready
    /// queue; it stays suspended as if the resume never happened.
    pub fn unresume(&self, fiber: FiberRef) {
        let mut ready = self.ready.borrow_mut();
        let before = ready.len();
        ready.retain(|f| *f != fiber);
        debug_assert_eq!(before, ready.len() + 1);
    }

    /// Moves the current fiber to the dead list and runs whatever is next.
    /// The fiber's snapshot is never restored again.
    pub unsafe fn exit_current(&self) -> ! {
        let current = self.current();
        self.dead.borrow_mut().push(current);
        self.fiber_count.set(self.fiber_count.get() - 1);
        let next = self.ready.borrow_mut().pop_front();
        match next {
            Some(next) => self.transfer(current, next),
            None => self.park_in_loop(current),
        }
        unreachable!("dead fiber resumed");
    }

    /// Event-loop entry: runs ready fibers until the ready set is empty,
    /// then returns. Must not be called from fiber code.
    pub fn tick(&self) {
        debug_assert!(self.running.get().is_none());
        let first = match self.ready.borrow_mut().pop_front() {
            Some(fiber) => fiber,
            None => return,
        };
        self.running.set(Some(first));
        unsafe {
            pixy_context_switch(self.loop_ctx.get(), (*first.as_ptr()).ctx());
        }
        debug_assert!(self.running.get().is_none());
    }

    unsafe fn transfer(&self, from: FiberRef, to: FiberRef) {
        self.running.set(Some(to));
        pixy_context_switch((*from.as_ptr()).ctx(), (*to.as_ptr()).ctx());
        // Running again: whoever restored our snapshot set `running` to us.
    }

    unsafe fn park_in_loop(&self, from: FiberRef) {
        self.running.set(None);
        pixy_context_switch((*from.as_ptr()).ctx(), self.loop_ctx.get());
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        debug_assert!(self.running.get().is_none());
        for fiber in self.dead.borrow_mut().drain(..) {
            drop(unsafe { Box::from_raw(fiber.as_ptr()) });
        }
        for fiber in self.ready.borrow_mut().drain(..) {
            drop(unsafe { Box::from_raw(fiber.as_ptr()) });
        }
    }
}
