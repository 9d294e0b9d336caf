//! epoll wrapper: per-fd readiness watches and event dispatch.
//!
//! Each watched fd has one event record holding the mask currently
//! registered with the kernel, the mask the watch lists ask for, and the two
//! watch lists (readable, writable). Registrations are reconciled lazily: a
//! watch change only marks the record dirty, and [`IoPoller::tick`] issues
//! the matching `epoll_ctl` calls in one pass before waiting. A burst of
//! set/clear pairs inside one fiber slice therefore costs at most one
//! syscall, and a watch cleared before the tick drains the kernel events is
//! simply no longer in any list when they arrive.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::io;
use std::os::unix::io::RawFd;

use bitflags::bitflags;

use crate::dispatch::{Callback, DispatchQueue};
use crate::log::fatal;

/// Largest number of kernel events consumed per tick.
const WAIT_BATCH: usize = 8192;

bitflags! {
    struct Interest: u32 {
        const READABLE = libc::EPOLLIN as u32;
        const WRITABLE = libc::EPOLLOUT as u32;
    }
}

/// A single readiness condition on an fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IoCondition {
    Readable,
    Writable,
}

impl IoCondition {
    #[inline]
    fn interest(self) -> Interest {
        match self {
            IoCondition::Readable => Interest::READABLE,
            IoCondition::Writable => Interest::WRITABLE,
        }
    }

    #[inline]
    fn index(self) -> usize {
        match self {
            IoCondition::Readable => 0,
            IoCondition::Writable => 1,
        }
    }
}

/// Handle to one registered watch; used only to clear it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IoWatch {
    fd: RawFd,
    condition: IoCondition,
    id: u64,
}

struct WatchEntry {
    id: u64,
    token: *mut (),
    callback: Callback,
}

struct IoEvent {
    registered: Interest,
    desired: Interest,
    dirty: bool,
    watches: [Vec<WatchEntry>; 2],
}

impl IoEvent {
    fn new() -> IoEvent {
        IoEvent {
            registered: Interest::empty(),
            desired: Interest::empty(),
            dirty: false,
            watches: [Vec::new(), Vec::new()],
        }
    }
}

pub(crate) struct IoPoller {
    epfd: RawFd,
    events: RefCell<BTreeMap<RawFd, IoEvent>>,
    dirty: RefCell<Vec<RawFd>>,
    next_watch_id: Cell<u64>,
}

impl IoPoller {
    pub fn new() -> io::Result<IoPoller> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(IoPoller {
            epfd,
            events: RefCell::new(BTreeMap::new()),
            dirty: RefCell::new(Vec::new()),
            next_watch_id: Cell::new(0),
        })
    }

    /// Subscribes `callback(token)` to one readiness condition on `fd`.
    /// The subscription persists until cleared; with level-triggered epoll
    /// the callback is queued on every tick that observes the condition.
    pub fn set_watch(
        &self,
        fd: RawFd,
        condition: IoCondition,
        token: *mut (),
        callback: Callback,
    ) -> IoWatch {
        debug_assert!(fd >= 0);
        let id = self.next_watch_id.get();
        self.next_watch_id.set(id + 1);

        let mut events = self.events.borrow_mut();
        let event = events.entry(fd).or_insert_with(IoEvent::new);
        event.watches[condition.index()].push(WatchEntry {
            id,
            token,
            callback,
        });
        if !event.desired.contains(condition.interest()) {
            event.desired |= condition.interest();
            self.mark_dirty(fd, event);
        }
        IoWatch { fd, condition, id }
    }

    /// Detaches one watch. Clearing the last watch of a condition drops the
    /// condition from the desired mask; the kernel side catches up on the
    /// next tick.
    pub fn clear_watch(&self, watch: IoWatch) {
        let mut events = self.events.borrow_mut();
        let event = match events.get_mut(&watch.fd) {
            Some(event) => event,
            None => return,
        };
        let list = &mut event.watches[watch.condition.index()];
        list.retain(|entry| entry.id != watch.id);
        if list.is_empty() && event.desired.contains(watch.condition.interest()) {
            event.desired -= watch.condition.interest();
            self.mark_dirty(watch.fd, event);
        }
    }

    /// Drops every watch on `fd` and the kernel registration with them.
    /// Call before closing the fd.
    pub fn clear_watches(&self, fd: RawFd) {
        let mut events = self.events.borrow_mut();
        let event = match events.get_mut(&fd) {
            Some(event) => event,
            None => return,
        };
        event.watches[0].clear();
        event.watches[1].clear();
        event.desired = Interest::empty();
        self.mark_dirty(fd, event);
        if !event.registered.is_empty() {
            // Unregister now rather than at the next tick: the caller is
            // about to close the fd, after which epoll_ctl would fail.
            self.epoll_ctl(libc::EPOLL_CTL_DEL, fd, Interest::empty());
            event.registered = Interest::empty();
        }
    }

    /// One reactor step: reconcile dirty registrations, wait for readiness
    /// up to `timeout_ms` (negative = indefinitely), queue the callbacks of
    /// every matching watch.
    ///
    /// `EINTR` from the wait is returned to the caller with nothing queued;
    /// the event loop retries.
    pub fn tick(&self, timeout_ms: i64, queue: &DispatchQueue) -> io::Result<()> {
        self.flush_dirty();

        let mut buf: Vec<libc::epoll_event> = Vec::with_capacity(WAIT_BATCH);
        let timeout = timeout_ms.clamp(-1, i32::MAX as i64) as libc::c_int;
        let n = unsafe {
            libc::epoll_wait(self.epfd, buf.as_mut_ptr(), WAIT_BATCH as libc::c_int, timeout)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Err(err);
            }
            fatal!("`epoll_wait()` failed: {}", err);
        }
        unsafe { buf.set_len(n as usize) };

        let events = self.events.borrow();
        for ev in &buf {
            let fd = ev.u64 as RawFd;
            let event = match events.get(&fd) {
                Some(event) => event,
                None => continue,
            };
            let kinds = ev.events;
            let error = kinds & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0;
            if error || kinds & Interest::READABLE.bits() != 0 {
                for entry in &event.watches[IoCondition::Readable.index()] {
                    queue.push(entry.callback, entry.token);
                }
            }
            if error || kinds & Interest::WRITABLE.bits() != 0 {
                for entry in &event.watches[IoCondition::Writable.index()] {
                    queue.push(entry.callback, entry.token);
                }
            }
        }
        Ok(())
    }

    fn mark_dirty(&self, fd: RawFd, event: &mut IoEvent) {
        if !event.dirty {
            event.dirty = true;
            self.dirty.borrow_mut().push(fd);
        }
    }

    fn flush_dirty(&self) {
        let dirty = std::mem::take(&mut *self.dirty.borrow_mut());
        if dirty.is_empty() {
            return;
        }
        let mut events = self.events.borrow_mut();
        for fd in dirty {
            let defunct = {
                let event = match events.get_mut(&fd) {
                    Some(event) => event,
                    None => continue,
                };
                if event.registered != event.desired {
                    let op = if event.registered.is_empty() {
                        libc::EPOLL_CTL_ADD
                    } else if event.desired.is_empty() {
                        libc::EPOLL_CTL_DEL
                    } else {
                        libc::EPOLL_CTL_MOD
                    };
                    self.epoll_ctl(op, fd, event.desired);
                    event.registered = event.desired;
                }
                event.dirty = false;
                event.registered.is_empty()
            };
            if defunct {
                events.remove(&fd);
            }
        }
    }

    fn epoll_ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest) {
        let mut ev = libc::epoll_event {
            events: interest.bits(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } < 0 {
            // Only programming errors reach this point; the dirty-list
            // bookkeeping guarantees op and fd are consistent.
            fatal!("`epoll_ctl()` failed: {}", io::Error::last_os_error());
        }
    }

    #[cfg(test)]
    pub fn watched_fd_count(&self) -> usize {
        self.events.borrow().len()
    }
}

impl Drop for IoPoller {
    fn drop(&mut self) {
        if unsafe { libc::close(self.epfd) } < 0 {
            log::error!("`close()` failed: {}", io::Error::last_os_error());
        }
    }
}
