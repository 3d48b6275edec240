//! Stderr logger for the daemon binary.

use chrono::prelude::*;
use log::*;

struct Logger {
    level: Level,
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let target = if !record.target().is_empty() {
                record.target()
            } else {
                record.module_path().unwrap_or_default()
            };

            eprintln!(
                "{} {:<5} [{}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                target,
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

/// Initialize logging at the given level.
pub fn init(level: Level) -> Result<(), SetLoggerError> {
    let logger = Logger { level };

    set_boxed_logger(Box::new(logger))?;
    set_max_level(level.to_level_filter());

    Ok(())
}
