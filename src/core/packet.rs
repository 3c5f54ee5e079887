//! Frame header and wire layout.
//!
//! ```text
//! [SequenceId(8)] [TotalLength(8)] [ContentLength(4)] [Content(ContentLength)]
//! ```
//!
//! All fields are little-endian. Every frame of one logical message carries
//! the same sequence id and total length.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::config::FRAME_HEADER_SIZE;

/// Fixed 20-byte header preceding every frame's content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Shared by all frames of one logical message
    pub sequence_id: u64,
    /// Length of the whole logical message
    pub total_length: u64,
    /// Content bytes following this header
    pub content_length: u32,
}

impl FrameHeader {
    /// Header-only frame carrying no payload
    pub fn keep_alive(sequence_id: u64) -> Self {
        Self {
            sequence_id,
            total_length: 0,
            content_length: 0,
        }
    }

    /// Frames with no total or no content are skipped by the receiver
    pub fn is_keep_alive(&self) -> bool {
        self.total_length == 0 || self.content_length == 0
    }

    /// Append the header to `dst`
    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        dst.put_u64_le(self.sequence_id);
        dst.put_u64_le(self.total_length);
        dst.put_u32_le(self.content_length);
    }

    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut out = [0u8; FRAME_HEADER_SIZE];
        let mut cursor = &mut out[..];
        self.encode(&mut cursor);
        out
    }

    pub fn from_bytes(raw: &[u8; FRAME_HEADER_SIZE]) -> Self {
        let mut src = &raw[..];
        Self {
            sequence_id: src.get_u64_le(),
            total_length: src.get_u64_le(),
            content_length: src.get_u32_le(),
        }
    }
}

/// One wire unit: header plus its slice of the payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub content: Bytes,
}

impl Frame {
    pub fn keep_alive(sequence_id: u64) -> Self {
        Self {
            header: FrameHeader::keep_alive(sequence_id),
            content: Bytes::new(),
        }
    }

    /// Bytes this frame occupies on the wire
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.content.len()
    }

    /// Append header and content to `dst`
    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        self.header.encode(dst);
        dst.extend_from_slice(&self.content);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }
}
