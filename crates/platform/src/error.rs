//! Error types for Keel

use std::fmt;

/// Unified error type for all Keel operations
#[derive(Debug)]
pub enum KeelError {
    /// I/O error
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Protocol error (framing, MAC, KEX, version mismatch). Always fatal
    /// for the session that raised it.
    Protocol(String),

    /// Authentication error. The transport stays open so the client may
    /// retry within the attempt budget.
    Auth(String),

    /// Channel-level error (open refused, unsupported type, invalid
    /// request). The rest of the session continues.
    Channel(String),

    /// Resource exhaustion (handle table full, too many channels)
    Resource(String),

    /// Security error (signature verification, key material)
    Security(String),

    /// A future was cancelled or timed out
    Timeout(String),

    /// Not implemented
    NotImplemented(String),

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for KeelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeelError::Io(e) => write!(f, "IO error: {}", e),
            KeelError::Config(msg) => write!(f, "Configuration error: {}", msg),
            KeelError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            KeelError::Auth(msg) => write!(f, "Authentication error: {}", msg),
            KeelError::Channel(msg) => write!(f, "Channel error: {}", msg),
            KeelError::Resource(msg) => write!(f, "Resource error: {}", msg),
            KeelError::Security(msg) => write!(f, "Security error: {}", msg),
            KeelError::Timeout(msg) => write!(f, "Timed out: {}", msg),
            KeelError::NotImplemented(msg) => write!(f, "Not implemented: {}", msg),
            KeelError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for KeelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KeelError::Io(e) => Some(e),
            KeelError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for KeelError {
    fn from(err: std::io::Error) -> Self {
        KeelError::Io(err)
    }
}

impl KeelError {
    /// Clones the error into a shareable form.
    ///
    /// `std::io::Error` is not `Clone`, so IO errors are rebuilt from their
    /// kind and display string. Used when one failure has to complete
    /// several pending futures.
    pub fn duplicate(&self) -> KeelError {
        match self {
            KeelError::Io(e) => KeelError::Io(std::io::Error::new(e.kind(), e.to_string())),
            KeelError::Config(m) => KeelError::Config(m.clone()),
            KeelError::Protocol(m) => KeelError::Protocol(m.clone()),
            KeelError::Auth(m) => KeelError::Auth(m.clone()),
            KeelError::Channel(m) => KeelError::Channel(m.clone()),
            KeelError::Resource(m) => KeelError::Resource(m.clone()),
            KeelError::Security(m) => KeelError::Security(m.clone()),
            KeelError::Timeout(m) => KeelError::Timeout(m.clone()),
            KeelError::NotImplemented(m) => KeelError::NotImplemented(m.clone()),
            KeelError::Other(e) => KeelError::Protocol(e.to_string()),
        }
    }
}

/// Result type for Keel operations
pub type KeelResult<T> = Result<T, KeelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KeelError::Config("Invalid configuration".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: Invalid configuration"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let keel_err: KeelError = io_err.into();
        assert!(matches!(keel_err, KeelError::Io(_)));
    }

    #[test]
    fn test_duplicate_io() {
        let err = KeelError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "peer went away",
        ));
        let copy = err.duplicate();
        match copy {
            KeelError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset),
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_result_type() {
        fn example() -> KeelResult<i32> {
            Ok(42)
        }

        assert_eq!(example().unwrap(), 42);
    }
}
