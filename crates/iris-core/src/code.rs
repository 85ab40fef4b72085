//! Numeric error codes for the control protocol.
//!
//! These values are wire-visible: a control command that fails in a
//! recoverable way is answered with `{"error": <code>}` on the same
//! connection, and control clients surface them to callers. The numeric
//! assignments are part of the protocol and must not be renumbered.
//!
//! Codes 1–99 cover transport, framing and server lifecycle failures;
//! codes from 100 up are application-level command failures.

use serde::{Deserialize, Serialize};

/// A protocol-level error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
#[repr(u16)]
pub enum ErrorCode {
    /// The configured RSA key could not be loaded or is unusable.
    EncryptWrongKey = 1,
    /// Credentials rejected, or service access denied.
    Unauthorized = 2,
    /// Operation attempted on a socket that is not connected.
    NotConnected = 3,
    /// RSA encryption of an outbound payload failed.
    EncryptFailed = 4,
    /// Writing to a peer failed.
    Send = 5,
    /// Establishing a connection failed.
    Connect = 6,
    /// A service path must be a relative URL.
    ServicePath = 7,
    /// The peer did not answer a command within the deadline.
    ResponseTimeout = 8,
    /// The socket disconnected mid-operation.
    Disconnected = 9,
    /// An encrypted frame was expected but a plain one arrived.
    EncryptedExpected = 10,
    /// A plain frame was expected but an encrypted one arrived.
    EncryptedUnexpected = 11,
    /// Unknown system message id (reserved range below 1000).
    UnknownSysMsg = 12,
    /// A response carried a different command id than the request.
    MismatchedAnswer = 13,
    /// The peer sent something the protocol cannot account for.
    ServerError = 14,
    /// The requested service is not known to this client.
    ServiceUnknown = 15,
    /// RSA decryption of an inbound payload failed.
    DecryptFailed = 16,
    /// The server speaks a newer protocol major version.
    ProtocolTooNew = 17,
    /// Invalid filesystem path for a Unix socket.
    UnixSockWrongPath = 18,
    /// A recipient entry was neither an id nor a client handle.
    WrongHandler = 19,
    /// Delivery to a WebSocket peer failed.
    SendSocket = 20,
    /// TLS/stream context creation failed.
    ContextCreation = 21,
    /// The server was started twice.
    AlreadyStarted = 22,
    /// The main listening socket could not be created.
    ServerSocket = 24,
    /// A control interface failed to start.
    ControlInterface = 25,
    /// The Unix socket path already exists.
    UnixSockExists = 26,
    /// The control listening socket could not be created.
    ControlSocket = 27,
    /// Polling the socket set failed.
    ServerPoll = 28,
    /// Accepting a WebSocket client failed.
    ServerAccept = 29,
    /// A routing rule names an unregistered service.
    ServiceMissingDest = 30,
    /// The WebSocket opening handshake failed.
    ClientHandshake = 31,
    /// A WebSocket frame was malformed.
    ClientFrame = 32,
    /// A frame payload exceeded what its type allows.
    ClientPayloadSize = 33,
    /// Attempt to send a reserved or continuation opcode directly.
    ClientWrongOpcode = 34,
    /// Command id outside the 16-bit range.
    CommandType = 35,
    /// Command arguments could not be encoded as JSON.
    CommandParameters = 36,
    /// Command payload was not valid JSON.
    MessageFormat = 37,
    /// Control protocol violation (e.g. a command before AUTH).
    ControlProtocol = 38,
    /// Unrecognized control command id.
    ControlCommandUnknown = 39,
    /// The referenced client id is not in the selected scope.
    UnknownClient = 40,
    /// Accepting a control client failed.
    ControlAccept = 41,
    /// A readiness event fired for an unregistered socket.
    UnknownSocket = 42,
    /// The client answered no pings for too long.
    ClientInactive = 43,
    /// The requested service does not exist.
    ServiceNotFound = 100,
    /// A required command parameter is missing.
    MissingParam = 101,
}

impl ErrorCode {
    /// Get the wire value of this code.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Convert from a wire value.
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            1 => Some(Self::EncryptWrongKey),
            2 => Some(Self::Unauthorized),
            3 => Some(Self::NotConnected),
            4 => Some(Self::EncryptFailed),
            5 => Some(Self::Send),
            6 => Some(Self::Connect),
            7 => Some(Self::ServicePath),
            8 => Some(Self::ResponseTimeout),
            9 => Some(Self::Disconnected),
            10 => Some(Self::EncryptedExpected),
            11 => Some(Self::EncryptedUnexpected),
            12 => Some(Self::UnknownSysMsg),
            13 => Some(Self::MismatchedAnswer),
            14 => Some(Self::ServerError),
            15 => Some(Self::ServiceUnknown),
            16 => Some(Self::DecryptFailed),
            17 => Some(Self::ProtocolTooNew),
            18 => Some(Self::UnixSockWrongPath),
            19 => Some(Self::WrongHandler),
            20 => Some(Self::SendSocket),
            21 => Some(Self::ContextCreation),
            22 => Some(Self::AlreadyStarted),
            24 => Some(Self::ServerSocket),
            25 => Some(Self::ControlInterface),
            26 => Some(Self::UnixSockExists),
            27 => Some(Self::ControlSocket),
            28 => Some(Self::ServerPoll),
            29 => Some(Self::ServerAccept),
            30 => Some(Self::ServiceMissingDest),
            31 => Some(Self::ClientHandshake),
            32 => Some(Self::ClientFrame),
            33 => Some(Self::ClientPayloadSize),
            34 => Some(Self::ClientWrongOpcode),
            35 => Some(Self::CommandType),
            36 => Some(Self::CommandParameters),
            37 => Some(Self::MessageFormat),
            38 => Some(Self::ControlProtocol),
            39 => Some(Self::ControlCommandUnknown),
            40 => Some(Self::UnknownClient),
            41 => Some(Self::ControlAccept),
            42 => Some(Self::UnknownSocket),
            43 => Some(Self::ClientInactive),
            100 => Some(Self::ServiceNotFound),
            101 => Some(Self::MissingParam),
            _ => None,
        }
    }

    /// Human-readable description of this code.
    pub fn description(self) -> &'static str {
        match self {
            Self::EncryptWrongKey => "wrong encryption key",
            Self::Unauthorized => "unauthorized",
            Self::NotConnected => "connection not established",
            Self::EncryptFailed => "encryption failed",
            Self::Send => "unable to send data",
            Self::Connect => "unable to connect",
            Self::ServicePath => "wrong service path, must be a relative url",
            Self::ResponseTimeout => "response timeout",
            Self::Disconnected => "the socket disconnected",
            Self::EncryptedExpected => "encrypted message expected, got plain",
            Self::EncryptedUnexpected => "plain message expected, got encrypted",
            Self::UnknownSysMsg => "unknown system message",
            Self::MismatchedAnswer => "response doesn't match the command sent",
            Self::ServerError => "server communication error",
            Self::ServiceUnknown => "service unknown",
            Self::DecryptFailed => "decryption failed",
            Self::ProtocolTooNew => "server protocol is too new",
            Self::UnixSockWrongPath => "wrong path for socket",
            Self::WrongHandler => "wrong handler",
            Self::SendSocket => "cannot send to websocket",
            Self::ContextCreation => "unable to create stream context",
            Self::AlreadyStarted => "server already started",
            Self::ServerSocket => "unable to create server socket",
            Self::ControlInterface => "unable to start control interface",
            Self::UnixSockExists => "unix socket already exists",
            Self::ControlSocket => "unable to create control interface socket",
            Self::ServerPoll => "error polling server sockets",
            Self::ServerAccept => "cannot accept new web client connection",
            Self::ServiceMissingDest => "missing service destination in routing rule",
            Self::ClientHandshake => "error in web client handshake",
            Self::ClientFrame => "corrupted or wrong web client frame",
            Self::ClientPayloadSize => "wrong payload size",
            Self::ClientWrongOpcode => "the specified opcode is reserved",
            Self::CommandType => "unsupported command type, 16 bit uint required",
            Self::CommandParameters => "wrong command parameters format, must encode as valid json",
            Self::MessageFormat => "wrong message format, commands must carry valid json data",
            Self::ControlProtocol => "control protocol violation",
            Self::ControlCommandUnknown => "unknown command",
            Self::UnknownClient => "unknown client",
            Self::ControlAccept => "cannot accept control client",
            Self::UnknownSocket => "unknown socket",
            Self::ClientInactive => "client inactive for too long",
            Self::ServiceNotFound => "service not found",
            Self::MissingParam => "missing required param",
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> Self {
        code.as_u16()
    }
}

impl TryFrom<u16> for ErrorCode {
    type Error = u16;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        Self::from_u16(code).ok_or(code)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.description(), self.as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_all_codes() {
        for code in 0..=200u16 {
            if let Some(decoded) = ErrorCode::from_u16(code) {
                assert_eq!(decoded.as_u16(), code);
            }
        }
    }

    #[test]
    fn test_wire_values_are_stable() {
        assert_eq!(ErrorCode::Unauthorized.as_u16(), 2);
        assert_eq!(ErrorCode::Send.as_u16(), 5);
        assert_eq!(ErrorCode::ControlProtocol.as_u16(), 38);
        assert_eq!(ErrorCode::UnknownClient.as_u16(), 40);
        assert_eq!(ErrorCode::ClientInactive.as_u16(), 43);
        assert_eq!(ErrorCode::ServiceNotFound.as_u16(), 100);
        assert_eq!(ErrorCode::MissingParam.as_u16(), 101);
    }

    #[test]
    fn test_gap_at_23() {
        // 23 was never assigned in the protocol
        assert!(ErrorCode::from_u16(23).is_none());
    }

    #[test]
    fn test_display() {
        assert_eq!(ErrorCode::Unauthorized.to_string(), "unauthorized (2)");
    }

    #[test]
    fn test_serde_as_number() {
        let json = serde_json::to_string(&ErrorCode::ServiceNotFound).unwrap();
        assert_eq!(json, "100");
        let back: ErrorCode = serde_json::from_str("100").unwrap();
        assert_eq!(back, ErrorCode::ServiceNotFound);
    }
}
