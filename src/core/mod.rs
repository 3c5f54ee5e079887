//! # Core Framing Components
//!
//! Frame layout, payload splitting and message reassembly.
//!
//! ## Components
//! - **Packet**: the 20-byte frame header and wire frame
//! - **Chunking**: payload length to chunk size table
//! - **Packetizer**: frame producer and resumable reassembler
//! - **Codec**: Tokio codec over the frame format
//! - **Store**: backing storage for large incoming messages
//! - **Message**: reassembled logical messages
//!
//! ## Wire Format
//! ```text
//! [SequenceId(8)] [TotalLength(8)] [ContentLength(4)] [Content(N)]
//! ```
//!
//! ## Limits
//! - Total length above the configured maximum is rejected before allocation
//! - Content may never exceed the bytes still missing from its message

pub mod chunking;
pub mod codec;
pub mod message;
pub mod packet;
pub mod packetizer;
pub mod store;

pub use chunking::{default_sizer, fixed_sizer, ChunkSizer};
pub use codec::PacketCodec;
pub use message::{Message, MessageBody};
pub use packet::{Frame, FrameHeader};
pub use packetizer::{next_sequence_id, PackedFrames, Packetizer, Reassembler};
pub use store::{BufferHandle, BufferStore, BufferStream, FileBufferStore, MemoryBufferStore};
