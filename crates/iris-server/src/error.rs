//! Error types for the server engine.

use iris_core::ErrorCode;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that abort server startup or configuration.
///
/// These are the fatal class of the error taxonomy: they occur before or
/// while entering the run loop, and the process exits with the matching
/// wire error code. Per-connection failures never surface here; they are
/// isolated to the offending connection's teardown path.
#[derive(Debug, Error)]
pub enum ServerError {
    /// `start` was called on a server that is already running.
    #[error("server already started")]
    AlreadyStarted,

    /// A service was registered twice under the same name.
    #[error("a service named {0:?} is already registered")]
    DuplicateService(String),

    /// A routing rule names no service, or an unregistered one.
    #[error("routing rule {rule_id:?} references missing service destination")]
    ServiceMissingDest {
        /// Id of the offending rule.
        rule_id: String,
    },

    /// The main listening socket could not be bound.
    #[error("unable to bind server socket on {addr}: {source}")]
    Bind {
        /// The address that failed to bind.
        addr: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A control interface failed to start.
    #[error("unable to start control interface: {reason}")]
    ControlInterface {
        /// Why it failed.
        reason: String,
    },

    /// Reading a configuration file failed.
    #[error("unable to read configuration: {0}")]
    ConfigIo(#[from] std::io::Error),

    /// Parsing a configuration file failed.
    #[error("invalid configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

impl ServerError {
    /// The wire error code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AlreadyStarted => ErrorCode::AlreadyStarted,
            Self::DuplicateService(_) | Self::ServiceMissingDest { .. } => {
                ErrorCode::ServiceMissingDest
            }
            Self::Bind { .. } => ErrorCode::ServerSocket,
            Self::ControlInterface { .. } => ErrorCode::ControlInterface,
            Self::ConfigIo(_) | Self::ConfigParse(_) => ErrorCode::ContextCreation,
        }
    }

    /// Process exit code mirroring the wire error code.
    pub fn exit_code(&self) -> i32 {
        i32::from(self.code().as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_mirrors_error_code() {
        let err = ServerError::DuplicateService("chat".to_string());
        assert_eq!(err.exit_code(), 30);

        let err = ServerError::AlreadyStarted;
        assert_eq!(err.exit_code(), 22);
    }

    #[test]
    fn test_bind_error_display() {
        let err = ServerError::Bind {
            addr: "127.0.0.1:9000".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(err.to_string().contains("127.0.0.1:9000"));
        assert_eq!(err.code(), ErrorCode::ServerSocket);
    }
}
