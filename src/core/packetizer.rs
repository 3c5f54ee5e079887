//! # Packetizer
//!
//! Splits outgoing payloads into frames and reassembles incoming frames into
//! complete messages.
//!
//! ## Encoding
//! A payload of length `L` is cut into chunks of at most
//! `chunk_sizer(L)` bytes. Every chunk is prefixed with a header holding the
//! message's sequence id, `L`, and the chunk's own length. An empty payload
//! becomes a single header-only frame.
//!
//! ## Decoding
//! [`Reassembler::feed`] runs a two-phase cursor: it fills a 20-byte header
//! buffer, then copies up to the frame's content length into the reassembly
//! entry for that sequence id. Input may be split anywhere, down to single
//! bytes; nothing is ever re-read. An entry is emitted and dropped the moment
//! it holds `total_length` bytes. Keep-alive headers create no entry.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::config::{
    TransportConfig, FRAME_HEADER_SIZE, LARGE_MESSAGE_THRESHOLD, MAX_MESSAGE_SIZE,
    MAX_PENDING_MESSAGES,
};
use crate::core::chunking::{default_sizer, ChunkSizer};
use crate::core::message::{Message, MessageBody};
use crate::core::packet::{Frame, FrameHeader};
use crate::core::store::{BufferHandle, BufferStore, BufferStream};
use crate::error::{constants, ProtocolError, Result};

static NEXT_SEQUENCE_ID: AtomicU64 = AtomicU64::new(1);

/// Next process-wide sequence id; wraps on overflow
pub fn next_sequence_id() -> u64 {
    NEXT_SEQUENCE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Per-channel framing configuration: chunk sizing, limits and optional store
#[derive(Clone)]
pub struct Packetizer {
    chunk_sizer: ChunkSizer,
    max_message_size: u64,
    large_message_threshold: u64,
    max_pending_messages: usize,
    store: Option<Arc<dyn BufferStore>>,
}

impl Default for Packetizer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Packetizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packetizer")
            .field("max_message_size", &self.max_message_size)
            .field("large_message_threshold", &self.large_message_threshold)
            .field("max_pending_messages", &self.max_pending_messages)
            .field("has_store", &self.store.is_some())
            .finish()
    }
}

impl Packetizer {
    pub fn new() -> Self {
        Self {
            chunk_sizer: default_sizer(),
            max_message_size: MAX_MESSAGE_SIZE,
            large_message_threshold: LARGE_MESSAGE_THRESHOLD,
            max_pending_messages: MAX_PENDING_MESSAGES,
            store: None,
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            max_message_size: config.max_message_size,
            large_message_threshold: config.large_message_threshold,
            max_pending_messages: config.max_pending_messages.max(1),
            ..Self::new()
        }
    }

    /// Replace the chunk-size table
    pub fn with_chunk_sizer(mut self, sizer: ChunkSizer) -> Self {
        self.chunk_sizer = sizer;
        self
    }

    /// Reassemble messages at or above the large-message threshold into `store`
    pub fn with_store(mut self, store: Arc<dyn BufferStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_max_message_size(mut self, max: u64) -> Self {
        self.max_message_size = max;
        self
    }

    pub fn with_large_message_threshold(mut self, threshold: u64) -> Self {
        self.large_message_threshold = threshold;
        self
    }

    /// Bound the messages one connection may leave partially received
    pub fn with_max_pending_messages(mut self, max: usize) -> Self {
        self.max_pending_messages = max.max(1);
        self
    }

    pub fn store(&self) -> Option<&Arc<dyn BufferStore>> {
        self.store.as_ref()
    }

    pub fn max_message_size(&self) -> u64 {
        self.max_message_size
    }

    /// Content size used for each frame of a payload of `total_length` bytes
    pub fn chunk_size_for(&self, total_length: u64) -> usize {
        (self.chunk_sizer)(total_length).clamp(1, u32::MAX as usize)
    }

    /// Frame `payload` under a fresh sequence id
    pub fn pack(&self, payload: Bytes) -> PackedFrames {
        self.pack_with_sequence(next_sequence_id(), payload)
    }

    /// Frame `payload` under the given sequence id
    pub fn pack_with_sequence(&self, sequence_id: u64, payload: Bytes) -> PackedFrames {
        let chunk_size = self.chunk_size_for(payload.len() as u64);
        PackedFrames {
            sequence_id,
            total_length: payload.len() as u64,
            chunk_size,
            payload,
            offset: 0,
            emitted_empty: false,
        }
    }

    /// A keep-alive frame under a fresh sequence id
    pub fn keep_alive(&self) -> Frame {
        Frame::keep_alive(next_sequence_id())
    }

    /// Fresh decoder state for one connection
    pub fn reassembler(&self) -> Reassembler {
        Reassembler::new(
            self.max_message_size,
            self.large_message_threshold,
            self.store.clone(),
        )
        .with_max_pending(self.max_pending_messages)
    }
}

/// Lazily produced frames of one logical message
#[derive(Debug, Clone)]
pub struct PackedFrames {
    sequence_id: u64,
    total_length: u64,
    chunk_size: usize,
    payload: Bytes,
    offset: usize,
    emitted_empty: bool,
}

impl PackedFrames {
    pub fn sequence_id(&self) -> u64 {
        self.sequence_id
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Frames this message occupies in total
    pub fn frame_count(&self) -> usize {
        if self.payload.is_empty() {
            1
        } else {
            self.payload.len().div_ceil(self.chunk_size)
        }
    }
}

impl Iterator for PackedFrames {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        if self.payload.is_empty() {
            if self.emitted_empty {
                return None;
            }
            self.emitted_empty = true;
            return Some(Frame::keep_alive(self.sequence_id));
        }

        if self.offset >= self.payload.len() {
            return None;
        }

        let end = (self.offset + self.chunk_size).min(self.payload.len());
        let content = self.payload.slice(self.offset..end);
        self.offset = end;

        Some(Frame {
            header: FrameHeader {
                sequence_id: self.sequence_id,
                total_length: self.total_length,
                content_length: content.len() as u32,
            },
            content,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = if self.payload.is_empty() {
            usize::from(!self.emitted_empty)
        } else {
            (self.payload.len() - self.offset).div_ceil(self.chunk_size)
        };
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for PackedFrames {}

enum EntryBuffer {
    Memory(BytesMut),
    Stored {
        handle: BufferHandle,
        stream: Box<dyn BufferStream>,
    },
}

struct ReassemblyEntry {
    total_length: u64,
    received: u64,
    buffer: EntryBuffer,
}

/// Resumable frame decoder for one connection
pub struct Reassembler {
    header: [u8; FRAME_HEADER_SIZE],
    header_filled: usize,
    /// Header of the frame whose content is being copied
    current: Option<FrameHeader>,
    content_remaining: u32,
    entries: HashMap<u64, ReassemblyEntry>,
    max_message_size: u64,
    large_message_threshold: u64,
    max_pending: usize,
    store: Option<Arc<dyn BufferStore>>,
    entries_created: u64,
    entries_finalized: u64,
    keep_alives: u64,
}

impl Reassembler {
    pub fn new(
        max_message_size: u64,
        large_message_threshold: u64,
        store: Option<Arc<dyn BufferStore>>,
    ) -> Self {
        Self {
            header: [0u8; FRAME_HEADER_SIZE],
            header_filled: 0,
            current: None,
            content_remaining: 0,
            entries: HashMap::new(),
            max_message_size,
            large_message_threshold,
            max_pending: MAX_PENDING_MESSAGES,
            store,
            entries_created: 0,
            entries_finalized: 0,
            keep_alives: 0,
        }
    }

    /// Reject a new message while `max` others are still partially received
    pub fn with_max_pending(mut self, max: usize) -> Self {
        self.max_pending = max.max(1);
        self
    }

    /// Consume `data`, pushing every message it completes onto `out`.
    ///
    /// # Errors
    /// Malformed headers ([`ProtocolError::InvalidHeader`]), messages above the
    /// size limit ([`ProtocolError::OversizedPacket`]) and store failures. The
    /// connection should be dropped after an error; the cursor is not resynced.
    pub fn feed(&mut self, mut data: &[u8], out: &mut Vec<Message>) -> Result<()> {
        while !data.is_empty() {
            match self.current {
                None => {
                    let take = (FRAME_HEADER_SIZE - self.header_filled).min(data.len());
                    self.header[self.header_filled..self.header_filled + take]
                        .copy_from_slice(&data[..take]);
                    self.header_filled += take;
                    data = &data[take..];

                    if self.header_filled == FRAME_HEADER_SIZE {
                        self.header_filled = 0;
                        let header = FrameHeader::from_bytes(&self.header);
                        self.begin_frame(header)?;
                    }
                }
                Some(header) => {
                    let take = (self.content_remaining as usize).min(data.len());
                    self.append(header.sequence_id, &data[..take])?;
                    self.content_remaining -= take as u32;
                    data = &data[take..];

                    if self.content_remaining == 0 {
                        self.current = None;
                        self.complete_frame(header.sequence_id, out);
                    }
                }
            }
        }
        Ok(())
    }

    fn begin_frame(&mut self, header: FrameHeader) -> Result<()> {
        if header.is_keep_alive() {
            self.keep_alives += 1;
            trace!(sequence_id = header.sequence_id, "Keep-alive frame skipped");
            return Ok(());
        }

        if header.total_length > self.max_message_size {
            warn!(
                sequence_id = header.sequence_id,
                total_length = header.total_length,
                max = self.max_message_size,
                "Rejecting oversized message"
            );
            return Err(ProtocolError::OversizedPacket(header.total_length));
        }

        if !self.entries.contains_key(&header.sequence_id) {
            if self.entries.len() >= self.max_pending {
                warn!(
                    sequence_id = header.sequence_id,
                    pending = self.entries.len(),
                    "Rejecting message past the pending limit"
                );
                return Err(ProtocolError::InvalidHeader(
                    constants::ERR_TOO_MANY_PENDING.to_string(),
                ));
            }
            let entry = self.allocate_entry(header.total_length)?;
            self.entries.insert(header.sequence_id, entry);
            self.entries_created += 1;
        }

        if let Some(entry) = self.entries.get(&header.sequence_id) {
            if entry.total_length != header.total_length {
                return Err(ProtocolError::InvalidHeader(
                    constants::ERR_TOTAL_MISMATCH.to_string(),
                ));
            }
            if u64::from(header.content_length) > entry.total_length - entry.received {
                return Err(ProtocolError::InvalidHeader(
                    constants::ERR_CONTENT_OVERRUN.to_string(),
                ));
            }
        }

        self.current = Some(header);
        self.content_remaining = header.content_length;
        Ok(())
    }

    fn allocate_entry(&self, total_length: u64) -> Result<ReassemblyEntry> {
        let buffer = match &self.store {
            Some(store) if total_length >= self.large_message_threshold => {
                let handle = store.allocate(total_length)?;
                let stream = store.get_stream(&handle)?;
                debug!(handle = handle.id(), total_length, "Reassembling into buffer store");
                EntryBuffer::Stored { handle, stream }
            }
            // Grows with the bytes that arrive, not with the announced total
            _ => EntryBuffer::Memory(BytesMut::new()),
        };
        Ok(ReassemblyEntry {
            total_length,
            received: 0,
            buffer,
        })
    }

    fn append(&mut self, sequence_id: u64, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let entry = self
            .entries
            .get_mut(&sequence_id)
            .ok_or_else(|| ProtocolError::InvalidHeader(constants::ERR_INVALID_HEADER.into()))?;

        match &mut entry.buffer {
            EntryBuffer::Memory(buf) => buf.extend_from_slice(bytes),
            EntryBuffer::Stored { stream, .. } => stream
                .write_all(bytes)
                .map_err(|e| ProtocolError::StoreError(format!("write failed: {e}")))?,
        }
        entry.received += bytes.len() as u64;
        Ok(())
    }

    fn complete_frame(&mut self, sequence_id: u64, out: &mut Vec<Message>) {
        let done = self
            .entries
            .get(&sequence_id)
            .is_some_and(|entry| entry.received == entry.total_length);
        if !done {
            return;
        }

        if let Some(entry) = self.entries.remove(&sequence_id) {
            self.entries_finalized += 1;
            let body = match entry.buffer {
                EntryBuffer::Memory(buf) => MessageBody::Inline(buf.freeze()),
                EntryBuffer::Stored { handle, mut stream } => {
                    if let Err(e) = stream.flush() {
                        warn!(handle = handle.id(), error = %e, "Flushing stored message failed");
                    }
                    MessageBody::Stored {
                        handle,
                        len: entry.total_length,
                    }
                }
            };
            trace!(sequence_id, total_length = entry.total_length, "Message reassembled");
            out.push(Message { sequence_id, body });
        }
    }

    /// Messages partially received
    pub fn pending_entries(&self) -> usize {
        self.entries.len()
    }

    /// Bytes held in memory for partially received messages
    pub fn buffered_bytes(&self) -> usize {
        self.entries
            .values()
            .map(|entry| match &entry.buffer {
                EntryBuffer::Memory(buf) => buf.len(),
                EntryBuffer::Stored { .. } => 0,
            })
            .sum()
    }

    /// True when a header or frame content has been partly consumed
    pub fn is_mid_frame(&self) -> bool {
        self.header_filled > 0 || self.current.is_some()
    }

    pub fn entries_created(&self) -> u64 {
        self.entries_created
    }

    pub fn entries_finalized(&self) -> u64 {
        self.entries_finalized
    }

    pub fn keep_alives(&self) -> u64 {
        self.keep_alives
    }

    /// Drop all partial state, releasing stored buffers
    pub fn reset(&mut self) {
        self.header_filled = 0;
        self.current = None;
        self.content_remaining = 0;
        for (_, entry) in self.entries.drain() {
            if let (EntryBuffer::Stored { handle, .. }, Some(store)) = (entry.buffer, &self.store) {
                if let Err(e) = store.release(&handle) {
                    debug!(handle = handle.id(), error = %e, "Releasing partial buffer failed");
                }
            }
        }
    }
}

impl Drop for Reassembler {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            debug!(pending = self.entries.len(), "Discarding partial messages");
        }
        self.reset();
    }
}
