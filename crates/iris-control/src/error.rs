//! Error types for the control protocol.

use iris_core::ErrorCode;
use thiserror::Error;

/// Result type for control-protocol operations.
pub type ControlResult<T> = Result<T, ControlError>;

/// Errors on the control channel.
///
/// Server-side, every variant is fatal to the offending control
/// connection (application-level command failures travel as
/// `{error: code}` envelopes instead and never surface here).
/// Client-side, the same type reports failed commands to the caller.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The RSA key could not be loaded.
    #[error("unusable encryption key: {0}")]
    WrongKey(String),

    /// Encrypting an outbound payload failed.
    #[error("encryption failed: {0}")]
    EncryptFailed(String),

    /// Decrypting an inbound payload failed.
    #[error("decryption failed: {0}")]
    DecryptFailed(String),

    /// An encrypted frame was expected but a plain one arrived.
    #[error("encrypted message expected, got plain")]
    EncryptedExpected,

    /// A plain frame was expected but an encrypted one arrived.
    #[error("plain message expected, got encrypted")]
    EncryptedUnexpected,

    /// A command id outside the valid range was supplied.
    #[error("unsupported command type, 16 bit uint required")]
    CommandType,

    /// A command payload did not hold valid JSON.
    #[error("wrong message format: {0}")]
    MessageFormat(String),

    /// The peer broke the protocol (e.g. a command before AUTH).
    #[error("control protocol violation: {0}")]
    Protocol(String),

    /// A system message id nobody defined.
    #[error("unknown system message {0}")]
    UnknownSysMsg(u16),

    /// A service path must be a relative URL.
    #[error("wrong service path {0:?}, must be a relative url")]
    ServicePath(String),

    /// The socket is not connected.
    #[error("connection not established")]
    NotConnected,

    /// The peer went away mid-exchange.
    #[error("the socket disconnected")]
    Disconnected,

    /// No response arrived within the command deadline.
    #[error("response timeout")]
    ResponseTimeout,

    /// A response carried a different command id than the request.
    #[error("response doesn't match the command sent")]
    MismatchedAnswer,

    /// The server protocol major version is newer than ours.
    #[error("server protocol is too new: {0}")]
    ProtocolTooNew(String),

    /// The server answered with an application error envelope.
    #[error("server reported error {0}")]
    Remote(u16),

    /// Transport I/O failure.
    #[error("control I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControlError {
    /// The wire error code closest to this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::WrongKey(_) => ErrorCode::EncryptWrongKey,
            Self::EncryptFailed(_) => ErrorCode::EncryptFailed,
            Self::DecryptFailed(_) => ErrorCode::DecryptFailed,
            Self::EncryptedExpected => ErrorCode::EncryptedExpected,
            Self::EncryptedUnexpected => ErrorCode::EncryptedUnexpected,
            Self::CommandType => ErrorCode::CommandType,
            Self::MessageFormat(_) => ErrorCode::MessageFormat,
            Self::Protocol(_) => ErrorCode::ControlProtocol,
            Self::UnknownSysMsg(_) => ErrorCode::UnknownSysMsg,
            Self::ServicePath(_) => ErrorCode::ServicePath,
            Self::NotConnected => ErrorCode::NotConnected,
            Self::Disconnected => ErrorCode::Disconnected,
            Self::ResponseTimeout => ErrorCode::ResponseTimeout,
            Self::MismatchedAnswer => ErrorCode::MismatchedAnswer,
            Self::ProtocolTooNew(_) => ErrorCode::ProtocolTooNew,
            Self::Remote(code) => {
                ErrorCode::from_u16(*code).unwrap_or(ErrorCode::ServerError)
            }
            Self::Io(_) => ErrorCode::Send,
        }
    }
}
