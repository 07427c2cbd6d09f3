//! Wire framing.
//!
//! ```text
//! +--------------------+-------------------+------------------+
//! | body length (u32)  | message id (u16)  | body             |
//! | big-endian         | big-endian        | (length bytes)   |
//! +--------------------+-------------------+------------------+
//! ```
//!
//! The length counts body bytes only, the 6 header bytes are not included.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::AppError::Incomplete;
use crate::{AppError, AppResult};

pub const LENGTH_FIELD_SIZE: usize = 4;
pub const MSG_ID_FIELD_SIZE: usize = 2;
pub const HEADER_SIZE: usize = LENGTH_FIELD_SIZE + MSG_ID_FIELD_SIZE;

/// One fully framed inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvTask {
    pub msg_id: u16,
    pub body: Bytes,
    pub len: usize,
}

impl RecvTask {
    pub fn new(msg_id: u16, body: Bytes) -> Self {
        let len = body.len();
        RecvTask { msg_id, body, len }
    }
}

/// Per-connection frame codec.
///
/// Partially received frames stay in the caller's buffer between calls, so one
/// codec instance must be used per stream.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_package_size: usize,
}

impl FrameCodec {
    pub fn new(max_package_size: usize) -> Self {
        FrameCodec { max_package_size }
    }

    /// Checks whether `buffer` starts with a complete and acceptable frame.
    pub fn check(&self, buffer: &mut BytesMut) -> AppResult<()> {
        if buffer.remaining() < HEADER_SIZE {
            return Err(Incomplete);
        }
        let mut length_field = [0u8; LENGTH_FIELD_SIZE];
        length_field.copy_from_slice(&buffer[..LENGTH_FIELD_SIZE]);
        let body_size = u32::from_be_bytes(length_field) as usize;
        if body_size > self.max_package_size {
            return Err(AppError::MalformedProtocol(format!(
                "frame of length {} is too large, max is {}",
                body_size, self.max_package_size
            )));
        }
        if buffer.remaining() < HEADER_SIZE + body_size {
            buffer.reserve(HEADER_SIZE + body_size - buffer.remaining());
            return Err(Incomplete);
        }
        Ok(())
    }

    /// Splits the next frame off `buffer`, `None` if more bytes are needed.
    pub fn parse(&self, buffer: &mut BytesMut) -> AppResult<Option<RecvTask>> {
        match self.check(buffer) {
            Ok(_) => {
                let body_size = buffer.get_u32() as usize;
                let msg_id = buffer.get_u16();
                let body = buffer.split_to(body_size).freeze();
                Ok(Some(RecvTask::new(msg_id, body)))
            }
            Err(Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn encode_frame(&self, msg_id: u16, body: &[u8], dst: &mut BytesMut) -> AppResult<()> {
        if body.len() > self.max_package_size {
            return Err(AppError::MalformedProtocol(format!(
                "outbound frame of length {} is too large, max is {}",
                body.len(),
                self.max_package_size
            )));
        }
        dst.reserve(HEADER_SIZE + body.len());
        dst.put_u32(body.len() as u32);
        dst.put_u16(msg_id);
        dst.put_slice(body);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = RecvTask;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.parse(src)
    }
}

impl<'a> Encoder<(u16, &'a [u8])> for FrameCodec {
    type Error = AppError;

    fn encode(&mut self, item: (u16, &'a [u8]), dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (msg_id, body) = item;
        self.encode_frame(msg_id, body, dst)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn codec() -> FrameCodec {
        FrameCodec::new(1024)
    }

    #[test]
    fn test_frame_layout() {
        let mut buffer = BytesMut::new();
        codec().encode_frame(100, b"hi", &mut buffer).unwrap();
        assert_eq!(&buffer[..], &[0, 0, 0, 2, 0, 100, b'h', b'i']);
    }

    #[rstest]
    #[case::empty_body(7, b"".as_slice())]
    #[case::small_body(100, b"hello".as_slice())]
    #[case::max_msg_id(u16::MAX, b"\x00\x01\x02".as_slice())]
    fn test_encode_then_decode(#[case] msg_id: u16, #[case] body: &[u8]) {
        let mut codec = codec();
        let mut buffer = BytesMut::new();
        codec.encode((msg_id, body), &mut buffer).unwrap();

        let task = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(task.msg_id, msg_id);
        assert_eq!(&task.body[..], body);
        assert_eq!(task.len, body.len());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_partial_frame_waits_for_more_bytes() {
        let mut codec = codec();
        let mut full = BytesMut::new();
        codec.encode_frame(3, b"partial body", &mut full).unwrap();

        let mut buffer = BytesMut::new();
        // header split in the middle of the length field
        buffer.extend_from_slice(&full[..3]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());
        buffer.extend_from_slice(&full[3..10]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());
        buffer.extend_from_slice(&full[10..]);

        let task = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(task.msg_id, 3);
        assert_eq!(&task.body[..], b"partial body");
    }

    #[test]
    fn test_back_to_back_frames_stay_separate() {
        let mut codec = codec();
        let mut buffer = BytesMut::new();
        codec.encode_frame(1, b"aaa", &mut buffer).unwrap();
        codec.encode_frame(2, b"bbbb", &mut buffer).unwrap();

        let first = codec.decode(&mut buffer).unwrap().unwrap();
        let second = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!((first.msg_id, &first.body[..]), (1, &b"aaa"[..]));
        assert_eq!((second.msg_id, &second.body[..]), (2, &b"bbbb"[..]));
        assert!(codec.decode(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_rejected_on_decode() {
        let mut codec = FrameCodec::new(16);
        let mut buffer = BytesMut::new();
        buffer.put_u32(1024);
        buffer.put_u16(1);

        let result = codec.decode(&mut buffer);
        assert!(matches!(result, Err(AppError::MalformedProtocol(_))));
    }

    #[test]
    fn test_oversized_frame_rejected_on_encode() {
        let codec = FrameCodec::new(16);
        let mut buffer = BytesMut::new();
        let result = codec.encode_frame(1, &[0u8; 17], &mut buffer);
        assert!(matches!(result, Err(AppError::MalformedProtocol(_))));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_truncated_stream_is_an_error_at_eof() {
        let mut codec = codec();
        let mut buffer = BytesMut::new();
        codec.encode_frame(9, b"truncated", &mut buffer).unwrap();
        buffer.truncate(buffer.len() - 2);

        assert!(codec.decode_eof(&mut buffer).is_err());
    }
}
