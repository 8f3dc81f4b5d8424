//! Logging utils. See ["log" crate documentation](https://docs.rs/log/) for details
//!
//! The runtime writes all of its diagnostics through the [`log`] facade.
//! This module supplies a backend that prints one structured line per
//! record to stderr: wall-clock millis, level, thread name, fiber id,
//! target and message. Replacing the backend changes no runtime semantics.
//!
//! Example:
//! ```no_run
//! use log::{info, LevelFilter};
//!
//! weft::log::init(LevelFilter::Info);
//! info!("server starting");
//! ```

use std::io::Write;

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

use crate::clock;
use crate::fiber;

/// [`Log`] trait implementation writing structured records to stderr.
pub struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

impl Log for StderrLogger {
    #[inline(always)]
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let thread = std::thread::current();
        let mut err = std::io::stderr().lock();
        // One write_all per record keeps lines whole across threads.
        let line = format!(
            "{} {:<5} {}:{} [{}] {}\n",
            clock::realtime_ms(),
            record.level(),
            thread.name().unwrap_or("?"),
            fiber::current_id(),
            record.target(),
            record.args(),
        );
        let _ = err.write_all(line.as_bytes());
    }

    #[inline(always)]
    fn flush(&self) {}
}

/// Install the stderr backend with the given level filter.
///
/// Returns an error if a logger was already installed.
pub fn try_init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}

/// Same as [`try_init`] but ignores an already-installed logger, so tests
/// and demos can call it unconditionally.
pub fn init(level: LevelFilter) {
    let _ = try_init(level);
}
