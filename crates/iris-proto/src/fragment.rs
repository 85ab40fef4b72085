//! Reassembly of fragmented messages.
//!
//! A fragmented message arrives as a data frame without FIN followed by
//! continuation frames, the last of which carries FIN. The
//! [`FragmentBuffer`] accepts decoded data frames one at a time and
//! yields a complete [`Message`] when a sequence closes, enforcing the
//! sequencing rules: continuations need an open sequence, and a new
//! message may not start while one is open.
//!
//! Control frames must never be fed here; they are handled out of band
//! regardless of any open fragment sequence.

use bytes::{Bytes, BytesMut};

use crate::error::{ProtoError, ProtoResult};
use crate::frame::Frame;
use crate::opcode::Opcode;

/// A complete data message, reassembled from one or more frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The message opcode: [`Opcode::Text`] or [`Opcode::Binary`].
    pub opcode: Opcode,
    /// The full payload, concatenated across fragments.
    pub payload: Bytes,
}

impl Message {
    /// Interpret the payload as UTF-8 text, lossily.
    pub fn as_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Accumulator for an in-flight fragmented message.
#[derive(Debug, Default)]
pub struct FragmentBuffer {
    /// Payload collected so far; `None` when no sequence is open.
    buffer: Option<BytesMut>,
    /// Opcode of the frame that opened the current sequence.
    opcode: Option<Opcode>,
}

impl FragmentBuffer {
    /// Create an empty fragment buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a fragmented message is currently open.
    pub fn is_open(&self) -> bool {
        self.buffer.is_some()
    }

    /// Feed one decoded data frame.
    ///
    /// Returns `Some(message)` when the frame completes a message
    /// (an unfragmented frame, or the final continuation of an open
    /// sequence) and `None` when the sequence is still open.
    pub fn push(&mut self, frame: Frame) -> ProtoResult<Option<Message>> {
        debug_assert!(!frame.opcode.is_control(), "control frames are handled out of band");

        match (frame.fin, frame.opcode) {
            (true, Opcode::Continuation) => {
                // final fragment closes the sequence
                let mut buffer = self.buffer.take().ok_or(ProtoError::StrayContinuation)?;
                let opcode = self.opcode.take().expect("opcode set with buffer");
                buffer.extend_from_slice(&frame.payload);
                Ok(Some(Message {
                    opcode,
                    payload: buffer.freeze(),
                }))
            }
            (true, opcode) => {
                if self.buffer.is_some() {
                    return Err(ProtoError::FragmentOverlap);
                }
                Ok(Some(Message {
                    opcode,
                    payload: frame.payload,
                }))
            }
            (false, Opcode::Continuation) => {
                let buffer = self.buffer.as_mut().ok_or(ProtoError::StrayContinuation)?;
                buffer.extend_from_slice(&frame.payload);
                Ok(None)
            }
            (false, opcode) => {
                if self.buffer.is_some() {
                    return Err(ProtoError::FragmentOverlap);
                }
                let mut buffer = BytesMut::new();
                buffer.extend_from_slice(&frame.payload);
                self.buffer = Some(buffer);
                self.opcode = Some(opcode);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_frame(opcode: Opcode, fin: bool, payload: &[u8]) -> Frame {
        Frame {
            fin,
            opcode,
            masked: false,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn test_unfragmented_message_passes_through() {
        let mut buf = FragmentBuffer::new();
        let msg = buf
            .push(data_frame(Opcode::Text, true, b"hello"))
            .unwrap()
            .unwrap();
        assert_eq!(msg.opcode, Opcode::Text);
        assert_eq!(&msg.payload[..], b"hello");
        assert!(!buf.is_open());
    }

    #[test]
    fn test_three_fragment_sequence() {
        let mut buf = FragmentBuffer::new();
        assert!(buf.push(data_frame(Opcode::Text, false, b"one ")).unwrap().is_none());
        assert!(buf.is_open());
        assert!(buf
            .push(data_frame(Opcode::Continuation, false, b"two "))
            .unwrap()
            .is_none());
        let msg = buf
            .push(data_frame(Opcode::Continuation, true, b"three"))
            .unwrap()
            .unwrap();
        assert_eq!(msg.opcode, Opcode::Text);
        assert_eq!(&msg.payload[..], b"one two three");
        assert!(!buf.is_open());
    }

    #[test]
    fn test_stray_continuation_rejected() {
        let mut buf = FragmentBuffer::new();
        assert!(matches!(
            buf.push(data_frame(Opcode::Continuation, true, b"x")),
            Err(ProtoError::StrayContinuation)
        ));
        assert!(matches!(
            buf.push(data_frame(Opcode::Continuation, false, b"x")),
            Err(ProtoError::StrayContinuation)
        ));
    }

    #[test]
    fn test_overlapping_message_rejected() {
        let mut buf = FragmentBuffer::new();
        buf.push(data_frame(Opcode::Text, false, b"open")).unwrap();

        assert!(matches!(
            buf.push(data_frame(Opcode::Text, false, b"again")),
            Err(ProtoError::FragmentOverlap)
        ));
        assert!(matches!(
            buf.push(data_frame(Opcode::Binary, true, b"again")),
            Err(ProtoError::FragmentOverlap)
        ));
    }

    #[test]
    fn test_binary_sequence_keeps_opcode() {
        let mut buf = FragmentBuffer::new();
        buf.push(data_frame(Opcode::Binary, false, &[1, 2])).unwrap();
        let msg = buf
            .push(data_frame(Opcode::Continuation, true, &[3, 4]))
            .unwrap()
            .unwrap();
        assert_eq!(msg.opcode, Opcode::Binary);
        assert_eq!(&msg.payload[..], &[1, 2, 3, 4]);
    }
}
