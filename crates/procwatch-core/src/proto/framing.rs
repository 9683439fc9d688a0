//! Length-prefixed frame codec for the collector transport.
//!
//! Each frame is a 4-byte big-endian length prefix followed by the payload:
//!
//! ```text
//! +----------------------------+------------------+
//! | Length (4 bytes, BE)       | Payload          |
//! +----------------------------+------------------+
//! ```
//!
//! Frame length is validated before allocation and capped at
//! [`MAX_FRAME_SIZE`]; oversized frames are rejected with
//! [`FrameError::FrameTooLarge`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::FrameError;

/// Length of the frame header.
const HEADER_LEN: usize = 4;

/// Maximum payload size (1 MiB). Reports carry bounded log history, so this
/// is generous.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Frame codec for use with [`tokio_util::codec::Framed`].
#[derive(Debug, Clone, Default)]
pub struct FrameCodec {
    _private: (),
}

impl FrameCodec {
    /// Create a new frame codec.
    #[must_use]
    pub const fn new() -> Self {
        Self { _private: () }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge {
                size: item.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        dst.reserve(HEADER_LEN + item.len());
        #[allow(clippy::cast_possible_truncation)] // bounded by MAX_FRAME_SIZE
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&src[..HEADER_LEN]);
        let len = u32::from_be_bytes(header) as usize;

        if len > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }
        if src.len() < HEADER_LEN + len {
            // Wait for the rest of the frame.
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        codec
            .encode(Bytes::from_static(b"hello"), &mut buf)
            .unwrap();
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Bytes::from_static(b"payload"), &mut buf)
            .unwrap();

        let mut partial = buf.split_to(buf.len() - 2);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_empty_frame_is_valid() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::new(), &mut buf).unwrap();

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(frame.is_empty());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        buf.extend_from_slice(b"x");

        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"one"), &mut buf).unwrap();
        codec.encode(Bytes::from_static(b"two"), &mut buf).unwrap();

        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"one");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"two");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
}
