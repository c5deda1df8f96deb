//! Error taxonomy and the user-visible [`ErrorContext`].
//!
//! Grounded on `flux_communication::error`'s flat `thiserror` enum shape
//! (`EmptyError`, `ReadError`, `QueueError`): small `#[error("...")]`
//! variants, no nested error hierarchies.

use std::io;

/// Severity of an internal event, independent of whether it is user-visible.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Info,
    Warning,
    Error,
    Critical,
}

/// Broad classification of an error's origin.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Category {
    Connection,
    Communication,
    Configuration,
    Memory,
    System,
    Unknown,
}

/// Stable, OS-independent error code surfaced to users via [`ErrorContext`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    Success,
    IoError,
    ConnectionRefused,
    TimedOut,
    ConnectionReset,
    ConnectionAborted,
    NotConnected,
    AlreadyConnected,
    PortInUse,
    AccessDenied,
    InvalidConfiguration,
    InternalError,
}

impl ErrorCode {
    /// Maps a raw `std::io::Error` to a stable [`ErrorCode`].
    ///
    /// The mapping is fixed and testable, per the external-interfaces
    /// contract: every `io::ErrorKind` funnels into exactly one code.
    pub fn from_io_error(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => ErrorCode::ConnectionRefused,
            io::ErrorKind::TimedOut => ErrorCode::TimedOut,
            io::ErrorKind::ConnectionReset => ErrorCode::ConnectionReset,
            io::ErrorKind::ConnectionAborted => ErrorCode::ConnectionAborted,
            io::ErrorKind::NotConnected => ErrorCode::NotConnected,
            io::ErrorKind::AlreadyExists => ErrorCode::AlreadyConnected,
            io::ErrorKind::AddrInUse => ErrorCode::PortInUse,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessDenied,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => {
                ErrorCode::InvalidConfiguration
            }
            _ => ErrorCode::IoError,
        }
    }

    /// Whether an error of this code is safe to retry automatically.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::IoError
                | ErrorCode::ConnectionRefused
                | ErrorCode::TimedOut
                | ErrorCode::ConnectionReset
                | ErrorCode::ConnectionAborted
                | ErrorCode::NotConnected
        )
    }
}

/// Error context delivered to the user's `on_error` callback.
#[derive(Clone, Debug)]
pub struct ErrorContext {
    pub code: ErrorCode,
    pub message: String,
    pub client_id: Option<u64>,
}

impl ErrorContext {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), client_id: None }
    }

    pub fn with_client(mut self, id: u64) -> Self {
        self.client_id = Some(id);
        self
    }

    pub fn from_io(component: &str, operation: &str, err: &io::Error) -> Self {
        let code = ErrorCode::from_io_error(err);
        Self::new(code, format!("{component}: {operation}: {err}"))
    }
}

/// Internal error, carrying the full taxonomy from the error-handling design.
///
/// `retryable` and `retry_count` are read by the reconnect controller;
/// `category`/`component`/`operation` feed the reporting aggregator that
/// turns this into an [`ErrorContext`].
#[derive(thiserror::Error, Debug, Clone)]
#[error("[{component}/{operation}] {message}")]
pub struct UnilinkError {
    pub level: Level,
    pub category: Category,
    pub component: &'static str,
    pub operation: &'static str,
    pub message: String,
    pub os_code: Option<i32>,
    pub code: ErrorCode,
    pub retryable: bool,
    pub retry_count: u32,
}

impl UnilinkError {
    pub fn io(component: &'static str, operation: &'static str, err: &io::Error) -> Self {
        let code = ErrorCode::from_io_error(err);
        Self {
            level: Level::Error,
            category: Category::Connection,
            component,
            operation,
            message: err.to_string(),
            os_code: err.raw_os_error(),
            code,
            retryable: code.retryable(),
            retry_count: 0,
        }
    }

    pub fn configuration(component: &'static str, parameter: &'static str, why: impl Into<String>) -> Self {
        Self {
            level: Level::Error,
            category: Category::Configuration,
            component,
            operation: parameter,
            message: why.into(),
            os_code: None,
            code: ErrorCode::InvalidConfiguration,
            retryable: false,
            retry_count: 0,
        }
    }

    pub fn to_context(&self) -> ErrorContext {
        ErrorContext::new(self.code, self.message.clone())
    }
}

/// Panics in debug builds, logs via `tracing::error!` in release.
///
/// Grounded on `flux_utils::safe_panic!`: internal states that "cannot
/// happen" (e.g. an event for an unregistered token) should be loud in
/// development and merely logged in production rather than crashing a
/// long-running service.
#[macro_export]
macro_rules! safe_panic {
    ($($arg:tt)*) => {
        if cfg!(debug_assertions) {
            panic!($($arg)*)
        } else {
            tracing::error!($($arg)*)
        }
    };
}
