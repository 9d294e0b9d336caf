//! Stackful cooperative fiber runtime for Linux.
//!
//! Concurrent logic is written as plain synchronous control flow — read,
//! write, accept, connect, sleep, send, receive — and the runtime
//! multiplexes many such fibers onto a single OS thread with cooperative
//! context switching, an epoll readiness reactor, a monotonic timer, and a
//! small worker-thread pool for the few calls that cannot be made
//! non-blocking (name resolution).
//!
//! - [Fibers and synchronization primitives](fiber)
//! - [Cooperative I/O](coio)
//! - [Clock sources](clock)
//! - [Logging](log) (see <https://docs.rs/log/>)
//! - [Error handling](error)
//!
//! A program enters the runtime through [`run`]:
//!
//! ```
//! use std::time::Duration;
//!
//! let status = pixy::run(|| {
//!     pixy::fiber::start(|| {
//!         pixy::fiber::sleep(Duration::from_millis(10));
//!     });
//!     0
//! });
//! assert_eq!(status, 0);
//! ```
//!
//! Fibers are cooperative: control changes hands only at the explicit
//! suspension points listed in [`fiber`]. Everything except the worker pool
//! runs on the thread that called [`run`], so fibers share data with plain
//! `Rc` and `RefCell` — just never hold a borrow across a suspension point.

mod arch;
pub mod clock;
pub mod coio;
mod dispatch;
pub mod error;
pub mod fiber;
pub mod log;
mod poller;
mod runtime;
mod sched;
mod thread_pool;
mod timer;

pub use error::{Error, Result};
pub use runtime::run;
