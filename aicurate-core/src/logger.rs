//! Bridge from the crate's `tracing`/`log` records to a host-provided logger.
//!
//! Mobile hosts holding a [`crate::ledger::CreditLedger`] or a consultation
//! session register their platform logger once:
//!
//! ```swift
//! final class AicurateLogBridge: AicurateCore.Logger {
//!     func log(level: AicurateCore.LogLevel, message: String) {
//!         os_log("%{public}@", log: .aicurate, type: level.osLogType, message)
//!     }
//! }
//!
//! AicurateCore.setLogger(logger: AicurateLogBridge()) // once, at launch
//! ```

use std::sync::{Arc, OnceLock};

/// Receives log records from `aicurate-core`.
///
/// Implemented in the host language and registered with [`set_logger`].
#[uniffi::export(with_foreign)]
pub trait Logger: Sync + Send {
    /// Records one message at `level`.
    fn log(&self, level: LogLevel, message: String);
}

/// Severity of a forwarded record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum LogLevel {
    /// Very detailed tracing output.
    Trace,
    /// Diagnostic output (identity/payment payloads in staging).
    Debug,
    /// Progress of purchases and consultations.
    Info,
    /// Recoverable anomalies such as a clamped balance.
    Warn,
    /// Failed operations.
    Error,
}

impl From<log::Level> for LogLevel {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Error => Self::Error,
            log::Level::Warn => Self::Warn,
            log::Level::Info => Self::Info,
            log::Level::Debug => Self::Debug,
            log::Level::Trace => Self::Trace,
        }
    }
}

static HOST_LOGGER: OnceLock<Arc<dyn Logger>> = OnceLock::new();

/// Debug and trace records from dependencies (reqwest, hyper, rustls) are
/// dropped; everything at info and above is forwarded.
fn should_forward(module_path: Option<&str>, level: log::Level) -> bool {
    level <= log::Level::Info || module_path.is_some_and(|path| path.starts_with("aicurate"))
}

struct HostBridge;

impl log::Log for HostBridge {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        should_forward(Some(metadata.target()), metadata.level())
    }

    fn log(&self, record: &log::Record) {
        if !should_forward(record.module_path(), record.level()) {
            return;
        }
        match HOST_LOGGER.get() {
            Some(logger) => logger.log(record.level().into(), record.args().to_string()),
            None => eprintln!("[aicurate] {}", record.args()),
        }
    }

    fn flush(&self) {}
}

/// Registers the host logger. Only the first registration takes effect.
#[uniffi::export]
pub fn set_logger(logger: Arc<dyn Logger>) {
    if HOST_LOGGER.set(logger).is_err() {
        eprintln!("[aicurate] logger already set");
        return;
    }

    static BRIDGE: HostBridge = HostBridge;
    match log::set_logger(&BRIDGE) {
        Ok(()) => log::set_max_level(log::LevelFilter::Trace),
        Err(err) => eprintln!("[aicurate] failed to install log bridge: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(Some("aicurate_core::ledger"), log::Level::Debug => true)]
    #[test_case(Some("aicurate_core::payment::confirm"), log::Level::Trace => true)]
    #[test_case(Some("hyper::proto"), log::Level::Debug => false)]
    #[test_case(Some("reqwest::connect"), log::Level::Info => true)]
    #[test_case(None, log::Level::Warn => true)]
    #[test_case(None, log::Level::Trace => false)]
    fn test_forwarding_filter(module_path: Option<&str>, level: log::Level) -> bool {
        should_forward(module_path, level)
    }

    #[test]
    fn test_level_mapping() {
        assert_eq!(LogLevel::from(log::Level::Error), LogLevel::Error);
        assert_eq!(LogLevel::from(log::Level::Trace), LogLevel::Trace);
    }
}
