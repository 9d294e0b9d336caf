//! Monotonic deadline queue.
//!
//! Deadlines are coarse monotonic milliseconds ([`crate::clock::monotonic_ms`]),
//! kept in a min-heap. A negative delay produces an "infinite" deadline:
//! the entry can only ever leave the queue through cancellation and never
//! contributes to the event loop's wait time.
//!
//! Cancellation is lazy. [`Timer::clear`] drops the live entry; the heap key
//! becomes stale and is discarded whenever it surfaces at the top. Handles
//! are never reused, so a stale key can never match a later timeout.

use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use crate::clock;
use crate::dispatch::{Callback, DispatchQueue};

const INFINITE: u64 = u64::MAX;

/// Cancellation handle returned by [`Timer::set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Timeout {
    id: u64,
}

struct TimeoutEntry {
    token: *mut (),
    callback: Callback,
}

pub(crate) struct Timer {
    heap: RefCell<BinaryHeap<Reverse<(u64, u64)>>>,
    entries: RefCell<HashMap<u64, TimeoutEntry>>,
    next_id: Cell<u64>,
}

impl Timer {
    pub fn new() -> Timer {
        Timer {
            heap: RefCell::new(BinaryHeap::new()),
            entries: RefCell::new(HashMap::new()),
            next_id: Cell::new(0),
        }
    }

    /// Schedules `callback(token)` to be queued `delay_ms` milliseconds from
    /// now; negative delay means never (cancellation-only entry).
    pub fn set(&self, delay_ms: i64, token: *mut (), callback: Callback) -> Timeout {
        let due_time = if delay_ms < 0 {
            INFINITE
        } else {
            clock::monotonic_ms() + delay_ms as u64
        };
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.entries
            .borrow_mut()
            .insert(id, TimeoutEntry { token, callback });
        self.heap.borrow_mut().push(Reverse((due_time, id)));
        Timeout { id }
    }

    /// Cancels a pending timeout. The callback will not run.
    pub fn clear(&self, timeout: Timeout) {
        self.entries.borrow_mut().remove(&timeout.id);
    }

    /// Milliseconds until the next live finite deadline: −1 when there is
    /// none, 0 when it is already due.
    pub fn wait_time(&self) -> i64 {
        let mut heap = self.heap.borrow_mut();
        let entries = self.entries.borrow();
        loop {
            let &Reverse((due_time, id)) = match heap.peek() {
                Some(top) => top,
                None => return -1,
            };
            if !entries.contains_key(&id) {
                heap.pop();
                continue;
            }
            if due_time == INFINITE {
                return -1;
            }
            let now = clock::monotonic_ms();
            return if due_time <= now {
                0
            } else {
                (due_time - now) as i64
            };
        }
    }

    /// Queues the callbacks of every expired timeout, earliest first.
    pub fn tick(&self, queue: &DispatchQueue) {
        let now = clock::monotonic_ms();
        let mut heap = self.heap.borrow_mut();
        let mut entries = self.entries.borrow_mut();
        while let Some(&Reverse((due_time, id))) = heap.peek() {
            if !entries.contains_key(&id) {
                heap.pop();
                continue;
            }
            if due_time > now {
                break;
            }
            heap.pop();
            let entry = entries.remove(&id).unwrap();
            queue.push(entry.callback, entry.token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    unsafe fn bump(token: *mut ()) {
        let cell = &*(token as *const Cell<u32>);
        cell.set(cell.get() + 1);
    }

    unsafe fn push_a(token: *mut ()) {
        let cell = &*(token as *const Cell<u32>);
        cell.set(cell.get() * 10 + 1);
    }

    unsafe fn push_b(token: *mut ()) {
        let cell = &*(token as *const Cell<u32>);
        cell.set(cell.get() * 10 + 2);
    }

    #[test]
    fn empty_timer_waits_forever() {
        let timer = Timer::new();
        assert_eq!(timer.wait_time(), -1);
    }

    #[test]
    fn due_timeout_fires_once() {
        let timer = Timer::new();
        let queue = DispatchQueue::new();
        let fired = Cell::new(0u32);
        timer.set(0, &fired as *const _ as *mut (), bump);
        assert_eq!(timer.wait_time(), 0);
        timer.tick(&queue);
        queue.drain();
        assert_eq!(fired.get(), 1);
        timer.tick(&queue);
        queue.drain();
        assert_eq!(fired.get(), 1);
        assert_eq!(timer.wait_time(), -1);
    }

    #[test]
    fn cleared_timeout_never_fires() {
        let timer = Timer::new();
        let queue = DispatchQueue::new();
        let fired = Cell::new(0u32);
        let timeout = timer.set(0, &fired as *const _ as *mut (), bump);
        timer.clear(timeout);
        assert_eq!(timer.wait_time(), -1);
        timer.tick(&queue);
        queue.drain();
        assert_eq!(fired.get(), 0);
    }

    #[test]
    fn infinite_timeout_only_cancels() {
        let timer = Timer::new();
        let queue = DispatchQueue::new();
        let fired = Cell::new(0u32);
        let timeout = timer.set(-1, &fired as *const _ as *mut (), bump);
        assert_eq!(timer.wait_time(), -1);
        timer.tick(&queue);
        queue.drain();
        assert_eq!(fired.get(), 0);
        timer.clear(timeout);
    }

    #[test]
    fn earlier_deadline_fires_first() {
        let timer = Timer::new();
        let queue = DispatchQueue::new();
        let trace = Cell::new(0u32);
        let token = &trace as *const _ as *mut ();
        // Inserted out of order on purpose.
        timer.set(5, token, push_b);
        timer.set(0, token, push_a);
        std::thread::sleep(std::time::Duration::from_millis(30));
        timer.tick(&queue);
        queue.drain();
        assert_eq!(trace.get(), 12);
    }

    #[test]
    fn wait_time_skips_stale_top()  {
        let timer = Timer::new();
        let fired = Cell::new(0u32);
        let token = &fired as *const _ as *mut ();
        let early = timer.set(1, token, bump);
        timer.set(10_000, token, bump);
        timer.clear(early);
        // The cancelled earlier entry must not shrink the wait.
        assert!(timer.wait_time() > 1000);
    }
}
