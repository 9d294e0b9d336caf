//! Logging utils. See ["log" crate documentation](https://docs.rs/log/) for
//! details.
//!
//! The runtime logs to stderr, one line per record:
//!
//! ```text
//! (Pixy) <Level>: <file>:<line>: <message>
//! ```
//!
//! Example:
//! ```no_run
//! use log::info;
//!
//! pixy::log::init();
//! pixy::log::set_level(pixy::log::Level::Debug);
//! info!("hello from a fiber");
//! ```
//!
//! The current level is stored in the `log` facade's atomic max-level, so any
//! thread may change or read it without locking.

use std::fmt;

use log::{LevelFilter, Log, Metadata, Record};
use once_cell::sync::OnceCell;

/// Severity of a log line, in increasing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Information,
    Warning,
    Error,
    /// Reserved for unrecoverable runtime failures; records at this level are
    /// emitted unconditionally and are followed by a process abort.
    FatalError,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Level::Debug => "Debug",
            Level::Information => "Information",
            Level::Warning => "Warning",
            Level::Error => "Error",
            Level::FatalError => "FatalError",
        };
        f.write_str(name)
    }
}

impl From<log::Level> for Level {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Error => Level::Error,
            log::Level::Warn => Level::Warning,
            log::Level::Info => Level::Information,
            log::Level::Debug | log::Level::Trace => Level::Debug,
        }
    }
}

/// [`log::Log`] implementation writing the runtime's line format to stderr.
pub struct Logger;

impl Log for Logger {
    #[inline(always)]
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        eprintln!(
            "(Pixy) {}: {}:{}: {}",
            Level::from(record.level()),
            record.file().unwrap_or("<unknown>"),
            record.line().unwrap_or(0),
            record.args(),
        );
    }

    #[inline(always)]
    fn flush(&self) {}
}

static LOGGER: Logger = Logger;
static INSTALL: OnceCell<()> = OnceCell::new();

/// Installs the stderr logger as the `log` facade backend.
///
/// Idempotent; the first call wins. [`crate::run`] calls this, so programs
/// only need it when they log before entering the runtime.
pub fn init() {
    INSTALL.get_or_init(|| {
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(LevelFilter::Info);
        }
    });
}

/// Sets the logging level. Thread-safe.
pub fn set_level(level: Level) {
    let filter = match level {
        Level::Debug => LevelFilter::Debug,
        Level::Information => LevelFilter::Info,
        Level::Warning => LevelFilter::Warn,
        Level::Error | Level::FatalError => LevelFilter::Error,
    };
    log::set_max_level(filter);
}

/// Reads back the logging level. Thread-safe.
pub fn level() -> Level {
    match log::max_level() {
        LevelFilter::Off => Level::FatalError,
        LevelFilter::Error => Level::Error,
        LevelFilter::Warn => Level::Warning,
        LevelFilter::Info => Level::Information,
        LevelFilter::Debug | LevelFilter::Trace => Level::Debug,
    }
}

/// Logs an unrecoverable runtime failure and aborts the process.
///
/// For invariant violations (a rejected `epoll_ctl`, a failing clock), not
/// for runtime conditions: those are returned as errors.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        eprintln!(
            "(Pixy) FatalError: {}:{}: {}",
            file!(),
            line!(),
            format_args!($($arg)*),
        );
        std::process::abort();
    }};
}

pub(crate) use fatal;
