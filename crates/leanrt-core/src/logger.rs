//! Diagnostic sink shared by a runtime and everything it creates.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

/// Severity of a log message. Lower codes are more severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum Severity {
    /// An internal error has occurred. Execution is unrecoverable.
    InternalError = 0,
    /// An application error has occurred.
    Error = 1,
    /// An application error was discovered but the runtime recovered or fell back.
    Warning = 2,
    /// Informational messages.
    Info = 3,
    /// Verbose debugging messages.
    Verbose = 4,
}

impl Severity {
    /// Look up a severity by its numeric code.
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => Severity::InternalError,
            1 => Severity::Error,
            2 => Severity::Warning,
            3 => Severity::Info,
            4 => Severity::Verbose,
            _ => return None,
        })
    }

    /// Whether `self` is as severe as `threshold` or more.
    pub fn is_at_least(self, threshold: Severity) -> bool {
        self <= threshold
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::InternalError => "internal_error",
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
            Severity::Verbose => "verbose",
        };
        f.write_str(name)
    }
}

/// Callback receiving log messages.
pub type LogCallback = Arc<dyn Fn(Severity, &str) + Send + Sync>;

/// Logger forwarding runtime diagnostics to at most one callback.
///
/// Without a callback every message is dropped. `set_callback` replaces the
/// previous callback; messages logged afterwards never reach the old one.
///
/// The callback can be invoked from any thread that hits a diagnosable
/// condition, including stream worker threads, so it must be thread safe.
/// A panic raised inside the callback is caught and discarded; it never
/// propagates into the runtime operation that logged.
#[derive(Default)]
pub struct Logger {
    callback: RwLock<Option<LogCallback>>,
}

impl Logger {
    /// Create a silent logger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a logger with a callback already registered.
    pub fn with_callback<F>(callback: F) -> Self
    where
        F: Fn(Severity, &str) + Send + Sync + 'static,
    {
        let logger = Self::new();
        logger.set_callback(callback);
        logger
    }

    /// Create a logger forwarding messages at `min_severity` or above to `tracing`.
    pub fn tracing(min_severity: Severity) -> Self {
        Self::with_callback(move |severity, msg| {
            if severity.is_at_least(min_severity) {
                forward_to_tracing(severity, msg);
            }
        })
    }

    /// Replace the callback.
    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn(Severity, &str) + Send + Sync + 'static,
    {
        *self.callback.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Remove the callback; later messages are dropped.
    pub fn clear_callback(&self) {
        *self.callback.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Whether a callback is registered.
    pub fn has_callback(&self) -> bool {
        self.callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Log a message with a given severity.
    pub fn log(&self, severity: Severity, msg: &str) {
        // Clone out of the lock so the callback may replace itself.
        let callback = self
            .callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        if let Some(callback) = callback {
            let _ = catch_unwind(AssertUnwindSafe(|| callback(severity, msg)));
        }
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("has_callback", &self.has_callback())
            .finish()
    }
}

fn forward_to_tracing(severity: Severity, msg: &str) {
    match severity {
        Severity::InternalError | Severity::Error => tracing::error!(target: "leanrt", "{}", msg),
        Severity::Warning => tracing::warn!(target: "leanrt", "{}", msg),
        Severity::Info => tracing::info!(target: "leanrt", "{}", msg),
        Severity::Verbose => tracing::debug!(target: "leanrt", "{}", msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording() -> (Arc<Mutex<Vec<(Severity, String)>>>, impl Fn(Severity, &str) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |severity: Severity, msg: &str| {
            sink.lock().unwrap().push((severity, msg.to_string()));
        })
    }

    #[test]
    fn test_without_callback_is_silent() {
        let logger = Logger::new();
        assert!(!logger.has_callback());
        logger.log(Severity::Error, "dropped");
    }

    #[test]
    fn test_forwards_to_callback() {
        let (seen, callback) = recording();
        let logger = Logger::with_callback(callback);
        logger.log(Severity::Warning, "careful");
        assert_eq!(*seen.lock().unwrap(), vec![(Severity::Warning, "careful".to_string())]);
    }

    #[test]
    fn test_last_callback_wins() {
        let (old, first) = recording();
        let (new, second) = recording();
        let logger = Logger::with_callback(first);
        logger.log(Severity::Info, "one");
        logger.set_callback(second);
        logger.log(Severity::Info, "two");

        assert_eq!(old.lock().unwrap().len(), 1);
        assert_eq!(*new.lock().unwrap(), vec![(Severity::Info, "two".to_string())]);
    }

    #[test]
    fn test_clear_callback() {
        let (seen, callback) = recording();
        let logger = Logger::with_callback(callback);
        logger.clear_callback();
        logger.log(Severity::Error, "gone");
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_panicking_callback_is_swallowed() {
        let logger = Logger::with_callback(|_, _| panic!("callback failure"));
        logger.log(Severity::Error, "boom");
        logger.log(Severity::Info, "still alive");
    }

    #[test]
    fn test_callback_may_replace_itself() {
        let logger = Arc::new(Logger::new());
        let handle = Arc::clone(&logger);
        logger.set_callback(move |_, _| handle.clear_callback());
        logger.log(Severity::Info, "first");
        assert!(!logger.has_callback());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::InternalError.is_at_least(Severity::Error));
        assert!(Severity::Error.is_at_least(Severity::Error));
        assert!(!Severity::Warning.is_at_least(Severity::Error));
        assert_eq!(Severity::from_code(4), Some(Severity::Verbose));
        assert_eq!(Severity::from_code(5), None);
    }
}
