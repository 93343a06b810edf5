//! Logging
//!
//! Stderr logger behind the `log` facade. The maximum level comes from
//! the `REWIND_LOG` environment variable (`error`, `warn`, `info`,
//! `debug`, `trace`); unset or unrecognized means `warn`.

use log::{LevelFilter, Log, Metadata, Record};

struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        eprintln!(
            "[{:<5}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Install the stderr logger. A second call loses the facade's
/// installation race and changes nothing.
pub fn init() {
    let level = match std::env::var("REWIND_LOG").ok().as_deref() {
        Some("error") => LevelFilter::Error,
        Some("warn") | None => LevelFilter::Warn,
        Some("info") => LevelFilter::Info,
        Some("debug") => LevelFilter::Debug,
        Some("trace") => LevelFilter::Trace,
        Some(other) => {
            eprintln!("unknown REWIND_LOG level {:?}, using warn", other);
            LevelFilter::Warn
        }
    };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_init_is_idempotent() {
        super::init();
        super::init();
        log::warn!("logger installed");
    }
}
