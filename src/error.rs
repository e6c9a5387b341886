//! Structured error type shared by every pipeline component.
//!
//! Errors carry a kind (what class of failure), the module that raised them,
//! a message, and a severity level. Level `0` failures are routine and
//! handled in place; anything at level `1` or above is logged centrally via
//! [`NdsError::report`] before being propagated or swallowed.

use thiserror::Error;
use tracing::{error, warn};

/// Classification of pipeline failures.
///
/// The kind drives recovery: connect failures are retried at the client,
/// `NotConfigured` is fatal for the call, `SourceMissing` and `ParseError`
/// map to terminal row states, ZIP kinds cause the scanner to skip an
/// archive, and `Cancelled` means a loop observed shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Session could not be established after retries.
    ConnectFailed,
    /// The target NDS has no pool entry (removed or never added).
    NotConfigured,
    /// The remote file is gone.
    SourceMissing,
    /// The archive's ZIP structures are damaged.
    CorruptZip,
    /// The archive uses ZIP features outside the supported 6.3 subset.
    UnsupportedZip,
    /// A member decoder rejected its input.
    ParseError,
    /// Shutdown was observed mid-operation.
    Cancelled,
    /// Transport or protocol failure not covered above.
    Io,
}

impl ErrorKind {
    /// Short wire/log tag for the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConnectFailed => "connect_failed",
            ErrorKind::NotConfigured => "not_configured",
            ErrorKind::SourceMissing => "source_missing",
            ErrorKind::CorruptZip => "corrupt_zip",
            ErrorKind::UnsupportedZip => "unsupported_zip",
            ErrorKind::ParseError => "parse_error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Io => "io",
        }
    }
}

/// Error raised by pipeline components.
#[derive(Debug, Error)]
#[error("ErrLevel({level}) From[{module}] {}: {message}", .kind.as_str())]
pub struct NdsError {
    pub kind: ErrorKind,
    /// Module path that raised the error, e.g. `"nds.ftp"`.
    pub module: &'static str,
    pub message: String,
    /// Severity: `0` routine, `1` logged, `2` logged as error.
    pub level: u8,
}

impl NdsError {
    pub fn new(kind: ErrorKind, module: &'static str, message: impl Into<String>) -> Self {
        Self { kind, module, message: message.into(), level: 1 }
    }

    /// Same as [`NdsError::new`] with an explicit severity.
    pub fn with_level(
        kind: ErrorKind,
        module: &'static str,
        message: impl Into<String>,
        level: u8,
    ) -> Self {
        Self { kind, module, message: message.into(), level }
    }

    pub fn connect(module: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectFailed, module, message)
    }

    pub fn not_configured(module: &'static str, nds_id: i64) -> Self {
        Self::new(ErrorKind::NotConfigured, module, format!("NDS {nds_id} is not configured"))
    }

    pub fn missing(module: &'static str, path: &str) -> Self {
        Self::with_level(ErrorKind::SourceMissing, module, format!("file not found: {path}"), 0)
    }

    pub fn corrupt_zip(module: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CorruptZip, module, message)
    }

    pub fn unsupported_zip(module: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnsupportedZip, module, message)
    }

    pub fn parse(module: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ParseError, module, message)
    }

    pub fn cancelled(module: &'static str) -> Self {
        Self::with_level(ErrorKind::Cancelled, module, "cancelled", 0)
    }

    pub fn io(module: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, module, message)
    }

    /// True when the failure means the remote file no longer exists.
    pub fn is_missing(&self) -> bool {
        self.kind == ErrorKind::SourceMissing
    }

    /// Emit the error to the central log when its level asks for it,
    /// then hand it back for propagation.
    pub fn report(self) -> Self {
        match self.level {
            0 => {}
            1 => warn!(module = self.module, kind = self.kind.as_str(), "{}", self.message),
            _ => error!(module = self.module, kind = self.kind.as_str(), "{}", self.message),
        }
        self
    }
}

impl From<std::io::Error> for NdsError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            NdsError::with_level(ErrorKind::SourceMissing, "io", err.to_string(), 0)
        } else {
            NdsError::io("io", err.to_string())
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, NdsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_kind_module_and_level() {
        let err = NdsError::connect("nds.ftp", "refused");
        let text = err.to_string();
        assert!(text.contains("ErrLevel(1)"));
        assert!(text.contains("From[nds.ftp]"));
        assert!(text.contains("connect_failed"));
        assert!(text.contains("refused"));
    }

    #[test]
    fn missing_files_are_routine() {
        let err = NdsError::missing("gateway", "/mro/a.zip");
        assert_eq!(err.level, 0);
        assert!(err.is_missing());
    }

    #[test]
    fn io_not_found_maps_to_source_missing() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = NdsError::from(io);
        assert_eq!(err.kind, ErrorKind::SourceMissing);
    }
}
