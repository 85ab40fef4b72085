//! RFC 6455 wire protocol for the iris WebSocket server engine.
//!
//! This crate implements the streaming-buffer side of the WebSocket
//! protocol: the opening handshake, frame encoding/decoding with masking,
//! and reassembly of fragmented messages. Everything here operates on
//! caller-owned [`bytes::BytesMut`] accumulators and returns tri-state
//! results: incomplete input is never an error, it just means "feed me
//! more bytes".
//!
//! # Layers
//!
//! - [`handshake`] parses the HTTP Upgrade request and produces the
//!   `101 Switching Protocols` response.
//! - [`frame`] encodes and decodes individual wire frames, including
//!   send-side fragmentation when a message exceeds the frame size cap.
//! - [`fragment`] reassembles fragmented data frames into complete
//!   messages and enforces the fragmentation sequencing rules.
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use iris_proto::frame::{self, Decoded};
//! use iris_proto::opcode::Opcode;
//!
//! let frames = frame::encode_message(Opcode::Text, b"hello", false, 0xFFFF).unwrap();
//! let mut buf = BytesMut::new();
//! for f in &frames {
//!     buf.extend_from_slice(f);
//! }
//!
//! match frame::decode(&mut buf).unwrap() {
//!     Decoded::Frame(f) => {
//!         assert_eq!(f.opcode, Opcode::Text);
//!         assert_eq!(&f.payload[..], b"hello");
//!     }
//!     Decoded::Incomplete => unreachable!(),
//! }
//! ```

pub mod error;
pub mod fragment;
pub mod frame;
pub mod handshake;
pub mod opcode;

pub use error::{ProtoError, ProtoResult};
pub use fragment::{FragmentBuffer, Message};
pub use frame::{decode, encode_frame, encode_message, Decoded, Frame};
pub use handshake::{HandshakeOutcome, HandshakeProcessor, Upgrade};
pub use opcode::{CloseCode, Opcode};
