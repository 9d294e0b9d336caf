//! Worker threads for operations that cannot be made non-blocking.
//!
//! A fixed pair of OS threads drains a mutex-protected FIFO of [`Work`]
//! items. Workers never touch scheduler state: when a job finishes, the
//! worker writes the `Work` pointer to a pipe, and the read end — watched
//! Readable by the poller — delivers the completion callback back on the
//! fiber thread. Pointer-sized pipe writes are atomic (they are far below
//! `PIPE_BUF`), so completions arrive whole and in write order.
//!
//! `Work` items live in the frame of the fiber that posted them; that fiber
//! stays suspended until its completion callback runs, which keeps the item
//! alive for the whole round trip.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::dispatch::Callback;
use crate::log::fatal;
use crate::poller::{IoCondition, IoPoller, IoWatch};

const WORKER_COUNT: usize = 2;

/// Capacity of the completion pipe, in pending `Work` pointers.
const PIPE_SLOTS: usize = 8192;

/// One unit of offloaded work: `function(argument)` runs on a worker
/// thread, then `callback(token)` runs back on the fiber thread.
pub(crate) struct Work {
    pub function: unsafe fn(*mut ()),
    pub argument: *mut (),
    pub token: *mut (),
    pub callback: Callback,
}

enum Message {
    Job(usize), // *mut Work, erased so the queue is Send
    Stop,
}

struct Shared {
    queue: Mutex<VecDeque<Message>>,
    condition: Condvar,
}

pub(crate) struct ThreadPool {
    shared: Arc<Shared>,
    threads: RefCell<Vec<JoinHandle<()>>>,
    pipe_read: RawFd,
    pipe_write: RawFd,
    watch: Cell<Option<IoWatch>>,
    drain_buf: RefCell<Vec<usize>>,
}

impl ThreadPool {
    pub fn new() -> io::Result<ThreadPool> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        let (pipe_read, pipe_write) = (fds[0], fds[1]);

        let flags = xfcntl(pipe_read, libc::F_GETFL, 0);
        xfcntl(pipe_read, libc::F_SETFL, flags | libc::O_NONBLOCK);
        xfcntl(
            pipe_write,
            libc::F_SETPIPE_SZ,
            (PIPE_SLOTS * std::mem::size_of::<usize>()) as libc::c_int,
        );

        Ok(ThreadPool {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                condition: Condvar::new(),
            }),
            threads: RefCell::new(Vec::new()),
            pipe_read,
            pipe_write,
            watch: Cell::new(None),
            drain_buf: RefCell::new(Vec::with_capacity(PIPE_SLOTS)),
        })
    }

    /// Registers the completion watch and launches the workers. Split from
    /// construction because the watch token must point at the pool's final
    /// address.
    pub fn start(&self, poller: &IoPoller) {
        debug_assert!(self.threads.borrow().is_empty());
        let watch = poller.set_watch(
            self.pipe_read,
            IoCondition::Readable,
            self as *const ThreadPool as *mut (),
            on_completion_pipe_readable,
        );
        self.watch.set(Some(watch));

        let mut threads = self.threads.borrow_mut();
        for i in 0..WORKER_COUNT {
            let shared = Arc::clone(&self.shared);
            let pipe_write = self.pipe_write;
            let thread = std::thread::Builder::new()
                .name(format!("pixy-worker-{}", i))
                .spawn(move || worker(shared, pipe_write))
                .unwrap_or_else(|err| fatal!("failed to spawn worker thread: {}", err));
            threads.push(thread);
        }
    }

    /// Appends a job. The caller keeps `work` alive and unmoved until its
    /// completion callback has run.
    pub unsafe fn post(&self, work: *mut Work) {
        let mut queue = self.shared.queue.lock().unwrap();
        let was_empty = queue.is_empty();
        queue.push_back(Message::Job(work as usize));
        if was_empty {
            self.shared.condition.notify_one();
        }
    }

    /// Stops and joins the workers. Jobs already queued are finished first;
    /// their completions must already have been delivered (the event loop
    /// only reaches shutdown once every fiber has exited).
    pub fn stop(&self) {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            let was_empty = queue.is_empty();
            queue.push_back(Message::Stop);
            if was_empty {
                self.shared.condition.notify_one();
            }
        }
        for thread in self.threads.borrow_mut().drain(..) {
            if thread.join().is_err() {
                fatal!("worker thread panicked");
            }
        }
        // The workers leave the sentinel in place for each other; the last
        // one out leaves it for us.
        let mut queue = self.shared.queue.lock().unwrap();
        match queue.pop_front() {
            Some(Message::Stop) | None => {}
            Some(Message::Job(_)) => fatal!("work left behind after worker shutdown"),
        }
    }

    /// Unregisters the completion watch and closes the pipe. Call after
    /// [`ThreadPool::stop`], before the poller goes away.
    pub fn detach(&self, poller: &IoPoller) {
        if self.watch.take().is_some() {
            poller.clear_watches(self.pipe_read);
        }
    }

    fn drain_completions(&self) {
        let mut buf = self.drain_buf.borrow_mut();
        buf.clear();
        let byte_cap = PIPE_SLOTS * std::mem::size_of::<usize>();
        let n = loop {
            let n = unsafe {
                libc::read(self.pipe_read, buf.as_mut_ptr() as *mut libc::c_void, byte_cap)
            };
            if n >= 0 {
                break n as usize;
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => break 0,
                _ => fatal!("`read()` from completion pipe failed: {}", err),
            }
        };
        let count = n / std::mem::size_of::<usize>();
        unsafe { buf.set_len(count) };
        for i in 0..count {
            let work = buf[i] as *mut Work;
            unsafe { ((*work).callback)((*work).token) };
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        debug_assert!(self.threads.borrow().is_empty());
        unsafe {
            libc::close(self.pipe_read);
            libc::close(self.pipe_write);
        }
    }
}

unsafe fn on_completion_pipe_readable(token: *mut ()) {
    let pool = &*(token as *const ThreadPool);
    pool.drain_completions();
}

fn worker(shared: Arc<Shared>, pipe_write: RawFd) {
    loop {
        let work = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                match queue.front() {
                    None => {}
                    Some(Message::Stop) => {
                        // Leave the sentinel for the next worker.
                        shared.condition.notify_one();
                        return;
                    }
                    Some(Message::Job(_)) => break,
                }
                queue = shared.condition.wait(queue).unwrap();
            }
            let work = match queue.pop_front() {
                Some(Message::Job(ptr)) => ptr as *mut Work,
                _ => unreachable!(),
            };
            if !queue.is_empty() {
                shared.condition.notify_one();
            }
            work
        };

        unsafe { ((*work).function)((*work).argument) };

        // Hand the pointer back to the fiber thread. The write blocks if
        // the pipe is full, which bounds the number of in-flight
        // completions at PIPE_SLOTS.
        let bytes = (work as usize).to_ne_bytes();
        let mut written = 0;
        while written < bytes.len() {
            let n = unsafe {
                libc::write(
                    pipe_write,
                    bytes[written..].as_ptr() as *const libc::c_void,
                    bytes.len() - written,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                fatal!("`write()` to completion pipe failed: {}", err);
            }
            written += n as usize;
        }
    }
}

fn xfcntl(fd: RawFd, cmd: libc::c_int, arg: libc::c_int) -> libc::c_int {
    let res = unsafe { libc::fcntl(fd, cmd, arg) };
    if res < 0 {
        fatal!("`fcntl()` failed: {}", io::Error::last_os_error());
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchQueue;
    use std::cell::Cell as StdCell;

    unsafe fn double(argument: *mut ()) {
        // Worker thread.
        let value = &mut *(argument as *mut usize);
        *value *= 2;
    }

    unsafe fn mark_done(token: *mut ()) {
        (*(token as *const StdCell<bool>)).set(true);
    }

    #[test]
    fn completion_travels_over_the_pipe() {
        let poller = IoPoller::new().unwrap();
        let queue = DispatchQueue::new();
        let pool = ThreadPool::new().unwrap();
        pool.start(&poller);

        let mut value = 7usize;
        let done = StdCell::new(false);
        let mut work = Work {
            function: double,
            argument: &mut value as *mut usize as *mut (),
            token: &done as *const StdCell<bool> as *mut (),
            callback: mark_done,
        };
        unsafe { pool.post(&mut work) };

        for _ in 0..200 {
            poller.tick(100, &queue).unwrap();
            queue.drain();
            if done.get() {
                break;
            }
        }
        assert!(done.get());
        assert_eq!(value, 14);

        pool.stop();
        pool.detach(&poller);
    }

    #[test]
    fn stop_without_work_joins_cleanly() {
        let poller = IoPoller::new().unwrap();
        let pool = ThreadPool::new().unwrap();
        pool.start(&poller);
        pool.stop();
        pool.detach(&poller);
    }
}
