//! Chunk-size selection for outgoing payloads.
//!
//! The table is a tuning knob, not part of the wire contract: a receiver
//! accepts any content length up to the remaining message length.

use std::sync::Arc;

/// Maps a payload's total length to the content size of each of its frames
pub type ChunkSizer = Arc<dyn Fn(u64) -> usize + Send + Sync>;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

/// Ascending (payload length upper bound, chunk size) pairs
const CHUNK_TABLE: &[(u64, usize)] = &[
    (16 * KIB, 1024),
    (256 * KIB, 8 * 1024),
    (MIB, 32 * 1024),
    (8 * MIB, 128 * 1024),
    (32 * MIB, 512 * 1024),
];

/// Largest chunk the default table ever selects
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Default table: 1 KiB chunks for small payloads up to 1 MiB chunks past 32 MiB
pub fn default_chunk_size(total_length: u64) -> usize {
    CHUNK_TABLE
        .iter()
        .find(|(limit, _)| total_length <= *limit)
        .map(|(_, chunk)| *chunk)
        .unwrap_or(MAX_CHUNK_SIZE)
}

/// The default table as an injectable sizer
pub fn default_sizer() -> ChunkSizer {
    Arc::new(default_chunk_size)
}

/// A sizer that always answers `chunk_size`
pub fn fixed_sizer(chunk_size: usize) -> ChunkSizer {
    Arc::new(move |_| chunk_size)
}
