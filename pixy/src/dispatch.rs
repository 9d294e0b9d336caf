//! Deferred callback queue.
//!
//! The poller and the timer must not run user-visible callbacks while they
//! are still walking their own structures: a callback typically resumes a
//! fiber, and that fiber is free to add or clear watches and timeouts. So
//! both components only append `(callback, token)` pairs here, and the event
//! loop drains the queue between reactor phases, in insertion order.

use std::cell::RefCell;

/// Callback invoked with the token it was registered with.
///
/// Unsafe to call: the token is a type-erased pointer, usually into the
/// frame of a suspended fiber, and the registrar is responsible for keeping
/// it alive until the callback has run or been cancelled.
pub(crate) type Callback = unsafe fn(*mut ());

pub(crate) struct DispatchQueue {
    calls: RefCell<Vec<(Callback, *mut ())>>,
}

impl DispatchQueue {
    pub fn new() -> DispatchQueue {
        DispatchQueue {
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn push(&self, callback: Callback, token: *mut ()) {
        self.calls.borrow_mut().push((callback, token));
    }

    /// Runs the queued callbacks in insertion order. Callbacks pushed while
    /// a drain is in progress are kept for the next drain.
    pub fn drain(&self) {
        let batch = std::mem::take(&mut *self.calls.borrow_mut());
        for (callback, token) in batch {
            unsafe { callback(token) };
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.calls.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    unsafe fn record(token: *mut ()) {
        let cell = &*(token as *const Cell<u32>);
        cell.set(cell.get() * 10 + 1);
    }

    unsafe fn record2(token: *mut ()) {
        let cell = &*(token as *const Cell<u32>);
        cell.set(cell.get() * 10 + 2);
    }

    #[test]
    fn drains_in_insertion_order() {
        let trace = Cell::new(0u32);
        let token = &trace as *const _ as *mut ();
        let queue = DispatchQueue::new();
        queue.push(record, token);
        queue.push(record2, token);
        queue.push(record, token);
        queue.drain();
        assert_eq!(trace.get(), 121);
        assert_eq!(queue.len(), 0);
    }
}
