//! Control protocol for the iris WebSocket server engine.
//!
//! A parallel, non-WebSocket RPC channel that lets external processes
//! introspect and command a running server: list connected clients,
//! deliver messages, bind to a service. It listens on a Unix or TCP
//! socket next to the WebSocket listener and optionally wraps every
//! frame in an RSA chunk envelope.
//!
//! # Wire format
//!
//! ```text
//! Frame := ControlByte(1) Length(8, big-endian u64) Payload
//! ControlByte bit0 = ENCRYPTED, bit1 = COMMAND
//! If ENCRYPTED: Payload := (ChunkLen(2, big-endian u16) CipherBytes)*
//! If COMMAND:   cleartext := CommandId(2, big-endian u16) JSONBody
//! ```
//!
//! Command ids: 1000 AUTH, 1001 SELECT_SERVICE, 1002 HELO,
//! 1003 CUSTOM_CMD, 1004 LIST_CLIENTS, 1005 SEND_MESSAGE; ids below
//! 1000 are reserved for transport-internal system messages.
//!
//! # Protocol flow
//!
//! The server greets every accepted control client with an unsolicited
//! HELO carrying its version. The first client message must be AUTH;
//! anything else is a violation and the socket is dropped. After a
//! successful AUTH, commands run against the whole server or, after
//! SELECT_SERVICE, one service. Recoverable failures answer with
//! `{error: code}` on the same connection.
//!
//! # Encryption
//!
//! The envelope's directionality is part of the wire contract: the
//! server encrypts outbound *and* decrypts inbound with its private key;
//! control clients use the matching public key for both operations. See
//! [`envelope`].

pub mod auth;
pub mod client;
pub mod codec;
pub mod command;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod interface;

pub use auth::{Account, AccessPriority, Authenticator, SecretAlgo, SimpleAuthenticator};
pub use client::ControlClient;
pub use codec::{ControlFrame, DecodedControl};
pub use command::{CommandId, FLAG_COMMAND, FLAG_ENCRYPTED};
pub use connection::CustomHandler;
pub use envelope::{ClientEnvelope, ServerEnvelope};
pub use error::{ControlError, ControlResult};
pub use interface::{TcpControlInterface, UnixControlInterface};
