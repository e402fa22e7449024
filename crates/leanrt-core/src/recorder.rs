//! Error recorders and the reporting path shared by runtime objects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{BindingError, BlobError, LeanError, StreamError};
use crate::logger::{Logger, Severity};

/// Category of an error handed to an `ErrorRecorder`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Success = 0,
    Unspecified = 1,
    InternalError = 2,
    InvalidArgument = 3,
    InvalidConfig = 4,
    FailedAllocation = 5,
    FailedInitialization = 6,
    FailedExecution = 7,
    FailedComputation = 8,
    InvalidState = 9,
    UnsupportedState = 10,
}

impl From<&BlobError> for ErrorCode {
    fn from(err: &BlobError) -> Self {
        match err {
            BlobError::UnsupportedVersion { .. } => ErrorCode::UnsupportedState,
            BlobError::TooLarge { .. } => ErrorCode::InvalidConfig,
            _ => ErrorCode::FailedInitialization,
        }
    }
}

impl From<&BindingError> for ErrorCode {
    fn from(err: &BindingError) -> Self {
        match err {
            BindingError::UnknownTensor(_)
            | BindingError::NotAnInput(_)
            | BindingError::InvalidShape { .. }
            | BindingError::ProfileOutOfRange { .. }
            | BindingError::DeviceMemoryTooSmall { .. }
            | BindingError::SizeOverflow(_) => ErrorCode::InvalidArgument,
            BindingError::MissingAddress(_)
            | BindingError::UnresolvedShape(_)
            | BindingError::MissingDeviceMemory => ErrorCode::InvalidState,
            BindingError::WrongStrategy(_) => ErrorCode::UnsupportedState,
            BindingError::Allocation(_) => ErrorCode::FailedAllocation,
            BindingError::ShapeInference(_) => ErrorCode::FailedComputation,
        }
    }
}

impl From<&StreamError> for ErrorCode {
    fn from(err: &StreamError) -> Self {
        match err {
            StreamError::Spawn(_) => ErrorCode::FailedInitialization,
            StreamError::Closed => ErrorCode::InvalidState,
            StreamError::LaunchFailed(_) => ErrorCode::FailedExecution,
        }
    }
}

impl From<&LeanError> for ErrorCode {
    fn from(err: &LeanError) -> Self {
        match err {
            LeanError::Blob(e) => e.into(),
            LeanError::Binding(e) => e.into(),
            LeanError::Stream(e) => e.into(),
            LeanError::Kernel(_) => ErrorCode::FailedExecution,
            LeanError::Allocation(_) => ErrorCode::FailedAllocation,
            LeanError::Io(_) => ErrorCode::Unspecified,
            LeanError::Config(_) => ErrorCode::InvalidConfig,
        }
    }
}

/// Application-implemented sink for errors raised by runtime objects.
///
/// A recorder set on a runtime is passed to the engines it deserializes, and
/// an engine's recorder is passed to the contexts it creates.
pub trait ErrorRecorder: Send + Sync {
    /// Record an error. Returning `true` asks the runtime to stop; leanrt
    /// only reports checked failures, so the value is informational.
    fn report_error(&self, code: ErrorCode, desc: &str) -> bool;
}

/// Bounded in-memory `ErrorRecorder`.
#[derive(Debug)]
pub struct ErrorLog {
    entries: Mutex<Vec<(ErrorCode, String)>>,
    capacity: usize,
    overflowed: AtomicBool,
}

impl ErrorLog {
    /// Create a log keeping at most `capacity` errors.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            capacity,
            overflowed: AtomicBool::new(false),
        }
    }

    /// Number of recorded errors.
    pub fn nb_errors(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Recorded error at `index`.
    pub fn get(&self, index: usize) -> Option<(ErrorCode, String)> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index)
            .cloned()
    }

    /// Whether errors were dropped because the log was full.
    pub fn has_overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Relaxed)
    }

    /// Drop all recorded errors.
    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.overflowed.store(false, Ordering::Relaxed);
    }
}

impl Default for ErrorLog {
    fn default() -> Self {
        Self::new(64)
    }
}

impl ErrorRecorder for ErrorLog {
    fn report_error(&self, code: ErrorCode, desc: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() < self.capacity {
            entries.push((code, desc.to_string()));
        } else {
            self.overflowed.store(true, Ordering::Relaxed);
        }
        false
    }
}

/// Logger plus optional recorder, cloned into every object that reports.
#[derive(Clone)]
pub(crate) struct Reporter {
    pub(crate) logger: Arc<Logger>,
    pub(crate) recorder: Option<Arc<dyn ErrorRecorder>>,
}

impl Reporter {
    pub(crate) fn new(logger: Arc<Logger>, recorder: Option<Arc<dyn ErrorRecorder>>) -> Self {
        Self { logger, recorder }
    }

    /// Log at `Error` severity and hand the error to the recorder.
    pub(crate) fn error(&self, code: ErrorCode, msg: &str) {
        self.logger.log(Severity::Error, msg);
        if let Some(recorder) = &self.recorder {
            recorder.report_error(code, msg);
        }
    }

    pub(crate) fn warning(&self, msg: &str) {
        self.logger.log(Severity::Warning, msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_log_is_bounded() {
        let log = ErrorLog::new(2);
        log.report_error(ErrorCode::InvalidArgument, "a");
        log.report_error(ErrorCode::InvalidState, "b");
        log.report_error(ErrorCode::FailedExecution, "c");

        assert_eq!(log.nb_errors(), 2);
        assert!(log.has_overflowed());
        assert_eq!(log.get(1), Some((ErrorCode::InvalidState, "b".to_string())));
        assert_eq!(log.get(2), None);

        log.clear();
        assert_eq!(log.nb_errors(), 0);
        assert!(!log.has_overflowed());
    }

    #[test]
    fn test_binding_error_codes() {
        assert_eq!(
            ErrorCode::from(&BindingError::MissingAddress("x".into())),
            ErrorCode::InvalidState
        );
        assert_eq!(
            ErrorCode::from(&BindingError::Allocation(16)),
            ErrorCode::FailedAllocation
        );
    }

    #[test]
    fn test_reporter_logs_and_records() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let logger = Arc::new(Logger::with_callback(move |severity, msg: &str| {
            sink.lock().unwrap().push((severity, msg.to_string()));
        }));
        let log = Arc::new(ErrorLog::default());
        let reporter = Reporter::new(logger, Some(log.clone()));

        reporter.error(ErrorCode::InvalidArgument, "bad name");
        reporter.warning("slow path");

        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(log.nb_errors(), 1);
    }
}
