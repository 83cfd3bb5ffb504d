//! Error types and Result alias for the store.

use std::fmt;

/// Stable, ABI-style result codes returned by the engine.
///
/// Values are fixed so callers (and tests asserting on a specific
/// failure) can match on the integer, not just the variant name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    /// Success.
    Ok = 0,
    /// Generic failure with no more specific code.
    Error = 1,
    /// The operation could not acquire a lock before its deadline.
    Busy = 2,
    /// The resource is locked by another transaction in this process.
    Locked = 3,
    /// Allocation failure.
    NoMem = 4,
    /// Write attempted against a read-only store or column family.
    ReadOnly = 5,
    /// On-disk structure failed a consistency check.
    Corrupt = 6,
    /// Key, column family, or savepoint not found.
    NotFound = 7,
    /// Call violates the engine's transaction/locking protocol
    /// (e.g. nested `begin`, commit with no open transaction).
    Protocol = 8,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Ok => "ok",
            ErrorCode::Error => "error",
            ErrorCode::Busy => "busy",
            ErrorCode::Locked => "locked",
            ErrorCode::NoMem => "no memory",
            ErrorCode::ReadOnly => "read only",
            ErrorCode::Corrupt => "corrupt",
            ErrorCode::NotFound => "not found",
            ErrorCode::Protocol => "protocol violation",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An engine error: a stable code plus a human-readable message.
#[derive(Debug, Clone)]
pub struct Error {
    code: ErrorCode,
    message: String,
}

impl Error {
    pub fn new(code: ErrorCode) -> Self {
        let message = code.as_str().to_string();
        Error { code, message }
    }

    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Error {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let code = match e.kind() {
            ErrorKind::NotFound => ErrorCode::NotFound,
            ErrorKind::PermissionDenied => ErrorCode::ReadOnly,
            ErrorKind::WouldBlock => ErrorCode::Busy,
            _ => ErrorCode::Error,
        };
        Error::with_message(code, e.to_string())
    }
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_carries_code_and_message() {
        let e = Error::with_message(ErrorCode::Corrupt, "bad page 7");
        assert_eq!(e.code(), ErrorCode::Corrupt);
        assert_eq!(e.message(), "bad page 7");
        assert_eq!(format!("{}", e), "corrupt: bad page 7");
    }

    #[test]
    fn new_uses_code_description_as_message() {
        let e = Error::new(ErrorCode::Busy);
        assert_eq!(e.message(), "busy");
    }

    #[test]
    fn io_not_found_maps_to_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let e: Error = io.into();
        assert_eq!(e.code(), ErrorCode::NotFound);
    }
}
