//! Leveled kernel logging
//!
//! Bridges the `log` crate facade onto the kernel console so subsystems can
//! use `log::info!`/`log::warn!` with module targets. Records are prefixed
//! with the level and target; filtering happens through `log`'s max-level.
//!
//! IRQ context must not log through here (the console lock is not
//! reentrant); emergency paths write direct VGA instead.

use log::{LevelFilter, Log, Metadata, Record};

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        println!("[{:5}] {}: {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}

/// Install the kernel logger. Safe to call more than once; only the first
/// call wins (matching `log::set_logger` semantics).
pub fn init(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
