//! Error types for the wire protocol.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtoResult<T> = Result<T, ProtoError>;

/// Errors that can occur while parsing or producing WebSocket wire data.
///
/// Every variant is a protocol error in the spec taxonomy: the connection
/// that produced it is torn down, the process carries on.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// A reserved RSV bit was set on a frame.
    #[error("reserved RSV bits set: rsv1={rsv1} rsv2={rsv2} rsv3={rsv3}")]
    ReservedBits {
        /// RSV1 flag.
        rsv1: bool,
        /// RSV2 flag.
        rsv2: bool,
        /// RSV3 flag.
        rsv3: bool,
    },

    /// The frame carried a reserved opcode (0x3-0x7, 0xB-0xF).
    #[error("reserved opcode 0x{0:X}")]
    ReservedOpcode(u8),

    /// A control frame had the FIN bit clear.
    #[error("control frames must not be fragmented")]
    FragmentedControlFrame,

    /// A control frame payload exceeded 125 bytes.
    #[error("control frame payload must be 125 bytes or less, got {0}")]
    ControlFrameTooLong(usize),

    /// A continuation frame arrived with no fragmented message open.
    #[error("continuation frame without a preceding fragment")]
    StrayContinuation,

    /// A new data frame arrived while a fragmented message was still open.
    #[error("new message started while a fragmented one is incomplete")]
    FragmentOverlap,

    /// Attempt to send a continuation or reserved opcode directly.
    #[error("opcode {0} cannot be sent directly")]
    WrongOpcode(u8),

    /// The frame size cap leaves no room for payload bytes.
    #[error("max_frame_size {0} is too small to carry any payload")]
    FrameSizeTooSmall(usize),

    /// The handshake request was malformed or not acceptable.
    #[error("handshake rejected: {reason}")]
    HandshakeRejected {
        /// Why the request was turned away.
        reason: String,
    },

    /// A pong answered an outstanding ping with different bytes.
    #[error("pong payload does not match the outstanding ping")]
    PongMismatch,
}

impl ProtoError {
    /// Create a handshake rejection with the given reason.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::HandshakeRejected {
            reason: reason.into(),
        }
    }
}
