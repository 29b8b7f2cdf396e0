//! Logging backends for the `log` facade.
//!
//! For test logging see [`mod@test`].


use std::io;
use std::io::Write;

use chrono::prelude::*;
use colored::*;
use log::{Level, Log, Metadata, Record, SetLoggerError};

/// Logs timestamped, colored lines to `stdout`.
///
/// Lines carry the target and the name of the emitting thread.
pub struct Logger {
    level: Level,
}

impl Logger {
    pub fn new(level: Level) -> Self {
        Self { level }
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let thread = std::thread::current();
        let message = format!(
            "{} {:<5} {:<10} {:<12} {}",
            Local::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            record.level(),
            record.target().cyan(),
            thread.name().unwrap_or("-"),
            record.args()
        );
        let message = match record.level() {
            Level::Error => message.red(),
            Level::Warn => message.yellow(),
            Level::Info => message.normal(),
            Level::Debug => message.dimmed(),
            Level::Trace => message.white().dimmed(),
        };
        // Nb. A closed stdout must not bring the node down.
        writeln!(&mut io::stdout(), "{message}").ok();
    }

    fn flush(&self) {
        io::stdout().flush().ok();
    }
}

/// Initialize the `stdout` logger.
pub fn init(level: Level) -> Result<(), SetLoggerError> {
    set(Logger::new(level), level)
}

/// Set a logger.
pub fn set(logger: impl Log + 'static, level: Level) -> Result<(), SetLoggerError> {
    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(level.to_level_filter());

    Ok(())
}

/// Get the level set by the environment variable `RUST_LOG`, if
/// present.
pub fn env_level() -> Option<Level> {
    let level = std::env::var("RUST_LOG").ok()?;
    level.parse().ok()
}

/// Run `callback` and log how long it took at `debug` level.
pub fn benchmark<F, T>(target: &str, msg: &str, callback: F) -> T
where
    F: FnOnce() -> T,
{
    let now = std::time::Instant::now();
    let res = callback();

    log::debug!(target: target, "{msg} took {}ms", now.elapsed().as_millis());

    res
}
