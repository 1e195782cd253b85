//! Kernel logging facility
//!
//! Routes the `log` crate to whatever console the platform provides.
//! Log levels are configured based on build configuration (debug/release).

use core::fmt;

use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Console output for formatted log lines.
pub type LogSink = fn(fmt::Arguments);

/// Global logger instance available throughout the kernel
pub static LOGGER: Logger = Logger::new();

/// Thread-safe logger writing to a single sink
pub struct Logger {
    sink: Mutex<Option<LogSink>>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    /// Creates a logger with no sink; records are dropped until one is set
    pub const fn new() -> Logger {
        Logger {
            sink: Mutex::new(None),
        }
    }

    pub fn set_sink(&self, sink: LogSink) {
        *self.sink.lock() = Some(sink);
    }
}

impl Log for Logger {
    /// Determines if a log message should be processed based on its level
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    /// Formats messages as "[LEVEL] message"
    ///
    /// The sink lock is held for the whole line so lines from different
    /// cores do not interleave.
    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let sink = self.sink.lock();
            if let Some(sink) = *sink {
                sink(format_args!("[{}] {}", record.level(), record.args()));
            }
        }
    }

    fn flush(&self) {}
}

/// Initializes the logging system
///
/// # Arguments
/// * `cpu_id` - CPU core identifier. Only core 0 will initialize the logger
/// * `sink` - where formatted lines go
///
/// # Notes
/// * Sets different log levels for debug/release builds:
///   - Debug builds: LevelFilter::Debug
///   - Release builds: LevelFilter::Info
pub fn init(cpu_id: u32, sink: LogSink) {
    if cpu_id == 0 {
        LOGGER.set_sink(sink);
        log::set_logger(&LOGGER)
            .map(|()| {
                log::set_max_level(
                    #[cfg(debug_assertions)]
                    LevelFilter::Debug,
                    #[cfg(not(debug_assertions))]
                    LevelFilter::Info,
                )
            })
            .expect("Logger initialization failed");
    }
}
