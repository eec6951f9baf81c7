//! Byte-level framing of one message.
//!
//! ```text
//! +-----------+------------+-------------------+
//! | tag (u32) | len (u32)  | payload (len)     |
//! +-----------+------------+-------------------+
//! ```
//!
//! Both integers are big-endian. The tag is the sender's connection state at
//! the time of sending. A frame whose tag is the exit tag
//! ([`ConnectionState::ExitRequested`]) ends there: it has neither a length
//! nor a payload. Every field is handed to the transport as a whole before the
//! next one starts.

use crate::connection::ConnectionState;
use crate::error::TransportError;
use crate::transport::Transport;
use tracing::trace;

/// Tag announcing that the sender is closing.
pub(crate) const EXIT_TAG: u32 = ConnectionState::ExitRequested.wire_tag();

/// Largest payload the 32-bit length field can describe.
pub(crate) const MAX_FRAME_PAYLOAD: usize = u32::MAX as usize;

/// One unit read from the wire.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Frame {
    Data(Vec<u8>),
    Exit,
}

/// Writes one data frame tagged with `state`.
pub(crate) fn write_frame(
    transport: &dyn Transport,
    state: ConnectionState,
    payload: &[u8],
) -> Result<(), TransportError> {
    let len = u32::try_from(payload.len()).map_err(|_| TransportError::FrameTooLarge {
        len: payload.len(),
        max: MAX_FRAME_PAYLOAD,
    })?;

    transport.send_all(&state.wire_tag().to_be_bytes())?;
    transport.send_all(&len.to_be_bytes())?;
    transport.send_all(payload)?;
    trace!(len, "Frame sent");
    Ok(())
}

/// Writes the exit frame.
pub(crate) fn write_exit(transport: &dyn Transport) -> Result<(), TransportError> {
    transport.send_all(&EXIT_TAG.to_be_bytes())?;
    trace!("Exit frame sent");
    Ok(())
}

/// Reads one frame. Payloads longer than `max_payload` are refused before any
/// buffer is allocated for them.
pub(crate) fn read_frame(
    transport: &dyn Transport,
    max_payload: usize,
) -> Result<Frame, TransportError> {
    let mut word = [0u8; 4];

    transport.recv_exact(&mut word)?;
    let tag = u32::from_be_bytes(word);
    if tag == EXIT_TAG {
        trace!("Exit frame received");
        return Ok(Frame::Exit);
    }

    transport.recv_exact(&mut word)?;
    let len = u32::from_be_bytes(word) as usize;
    if len > max_payload {
        return Err(TransportError::FrameTooLarge {
            len,
            max: max_payload,
        });
    }

    let mut payload = vec![0u8; len];
    transport.recv_exact(&mut payload)?;
    trace!(tag, len, "Frame received");
    Ok(Frame::Data(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback_pair;
    use std::io::Write;

    #[test]
    fn data_frame_layout() {
        let (a, b) = loopback_pair();
        write_frame(&a, ConnectionState::Running, b"hello").unwrap();

        let mut raw = [0u8; 13];
        b.recv_exact(&mut raw).unwrap();
        assert_eq!(&raw[..4], &[0, 0, 0, 1]);
        assert_eq!(&raw[4..8], &[0, 0, 0, 5]);
        assert_eq!(&raw[8..], b"hello");
    }

    #[test]
    fn exit_frame_has_no_length() {
        let (a, b) = loopback_pair();
        write_exit(&a).unwrap();
        write_frame(&a, ConnectionState::Running, b"x").unwrap();

        assert_eq!(read_frame(&b, 1024).unwrap(), Frame::Exit);
        assert_eq!(read_frame(&b, 1024).unwrap(), Frame::Data(b"x".to_vec()));
    }

    #[test]
    fn oversized_length_is_refused() {
        let (a, b) = loopback_pair();
        write_frame(&a, ConnectionState::Running, &[7u8; 64]).unwrap();

        match read_frame(&b, 16) {
            Err(TransportError::FrameTooLarge { len, max }) => {
                assert_eq!(len, 64);
                assert_eq!(max, 16);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn unknown_tags_still_carry_a_payload() {
        let (a, b) = loopback_pair();
        let mut raw = Vec::new();
        raw.extend_from_slice(&0xdead_beef_u32.to_be_bytes());
        raw.extend_from_slice(&3u32.to_be_bytes());
        raw.extend_from_slice(b"abc");
        (&*a.stream()).write_all(&raw).unwrap();

        assert_eq!(read_frame(&b, 1024).unwrap(), Frame::Data(b"abc".to_vec()));
    }

    #[test]
    fn truncated_frame_is_peer_closed() {
        let (a, b) = loopback_pair();
        (&*a.stream()).write_all(&[0, 0, 0, 1, 0, 0, 0, 9, 1, 2]).unwrap();
        drop(a);

        assert!(matches!(
            read_frame(&b, 1024),
            Err(TransportError::PeerClosed)
        ));
    }
}
