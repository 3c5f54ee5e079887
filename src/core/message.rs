//! Reassembled logical messages handed to consumers.

use std::io::Read;

use bytes::Bytes;

use crate::core::store::{BufferHandle, BufferStore};
use crate::error::{ProtocolError, Result};

/// Where a reassembled message's bytes live
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    /// Reassembled in memory
    Inline(Bytes),
    /// Reassembled into the large-buffer store; the consumer owns the handle
    Stored { handle: BufferHandle, len: u64 },
}

/// One complete logical message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub sequence_id: u64,
    pub body: MessageBody,
}

impl Message {
    pub fn inline(sequence_id: u64, bytes: Bytes) -> Self {
        Self {
            sequence_id,
            body: MessageBody::Inline(bytes),
        }
    }

    pub fn len(&self) -> u64 {
        match &self.body {
            MessageBody::Inline(bytes) => bytes.len() as u64,
            MessageBody::Stored { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// In-memory payload, `None` for stored messages
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match &self.body {
            MessageBody::Inline(bytes) => Some(bytes),
            MessageBody::Stored { .. } => None,
        }
    }

    /// Load the payload into memory, reading and releasing a stored buffer.
    pub fn into_bytes(self, store: Option<&dyn BufferStore>) -> Result<Bytes> {
        match self.body {
            MessageBody::Inline(bytes) => Ok(bytes),
            MessageBody::Stored { handle, len } => {
                let store = store.ok_or_else(|| {
                    ProtocolError::StoreError("stored message read without a store".into())
                })?;
                let capacity =
                    usize::try_from(len).map_err(|_| ProtocolError::OversizedPacket(len))?;
                let mut out = Vec::with_capacity(capacity);
                store
                    .get_stream(&handle)?
                    .take(len)
                    .read_to_end(&mut out)
                    .map_err(|e| ProtocolError::StoreError(format!("read back failed: {e}")))?;
                store.release(&handle)?;
                Ok(Bytes::from(out))
            }
        }
    }
}
