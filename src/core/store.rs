//! # Large-Buffer Store
//!
//! Backing storage for messages too large to reassemble in memory.
//!
//! The reassembler asks the store for a handle sized to the incoming message,
//! writes frame content into the handle's stream as it arrives and hands the
//! handle to the consumer once the message is complete. The consumer reads it
//! back through [`BufferStore::get_stream`] and calls
//! [`BufferStore::release`] when done.
//!
//! Two implementations are provided:
//! - [`MemoryBufferStore`]: shared in-process byte vectors
//! - [`FileBufferStore`]: one file per handle inside a directory

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{constants, ProtocolError, Result};

/// Opaque reference to an allocated buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(u64);

impl BufferHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Readable, writable, seekable view over an allocated buffer
pub trait BufferStream: Read + Write + Seek + Send {}

impl<T: Read + Write + Seek + Send> BufferStream for T {}

/// Allocator of large message buffers
pub trait BufferStore: Send + Sync + 'static {
    /// Reserve a buffer able to hold `size` bytes
    fn allocate(&self, size: u64) -> Result<BufferHandle>;

    /// Open a stream positioned at the start of the buffer
    fn get_stream(&self, handle: &BufferHandle) -> Result<Box<dyn BufferStream>>;

    /// Free the buffer. Releasing an unknown handle is an error.
    fn release(&self, handle: &BufferHandle) -> Result<()>;
}

fn unknown_handle(handle: &BufferHandle) -> ProtocolError {
    ProtocolError::StoreError(format!("{} {}", constants::ERR_UNKNOWN_HANDLE, handle.0))
}

/// In-memory store, mainly for tests and small deployments
#[derive(Debug, Default)]
pub struct MemoryBufferStore {
    next_id: AtomicU64,
    buffers: DashMap<u64, Arc<Mutex<Vec<u8>>>>,
}

impl MemoryBufferStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers currently allocated
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

impl BufferStore for MemoryBufferStore {
    fn allocate(&self, size: u64) -> Result<BufferHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let capacity = usize::try_from(size).map_err(|_| ProtocolError::OversizedPacket(size))?;
        self.buffers
            .insert(id, Arc::new(Mutex::new(Vec::with_capacity(capacity))));
        trace!(handle = id, size, "Memory buffer allocated");
        Ok(BufferHandle(id))
    }

    fn get_stream(&self, handle: &BufferHandle) -> Result<Box<dyn BufferStream>> {
        let data = self
            .buffers
            .get(&handle.0)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| unknown_handle(handle))?;
        Ok(Box::new(SharedCursor { data, position: 0 }))
    }

    fn release(&self, handle: &BufferHandle) -> Result<()> {
        self.buffers
            .remove(&handle.0)
            .map(|_| ())
            .ok_or_else(|| unknown_handle(handle))
    }
}

/// Cursor over a byte vector shared with the store
struct SharedCursor {
    data: Arc<Mutex<Vec<u8>>>,
    position: u64,
}

impl Read for SharedCursor {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.data.lock();
        let start = (self.position as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl Write for SharedCursor {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut data = self.data.lock();
        let start = self.position as usize;
        let end = start + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        self.position = end as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for SharedCursor {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.data.lock().len() as i128;
        let target = match pos {
            SeekFrom::Start(n) => n as i128,
            SeekFrom::End(n) => len + n as i128,
            SeekFrom::Current(n) => self.position as i128 + n as i128,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of buffer",
            ));
        }
        self.position = target as u64;
        Ok(self.position)
    }
}

/// File-backed store writing one file per handle
#[derive(Debug)]
pub struct FileBufferStore {
    directory: PathBuf,
    next_id: AtomicU64,
}

impl FileBufferStore {
    /// Use `directory` for buffer files, creating it if needed
    pub fn new<P: AsRef<Path>>(directory: P) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory).map_err(|e| {
            ProtocolError::StoreError(format!(
                "Failed to create store directory {}: {e}",
                directory.display()
            ))
        })?;
        debug!(directory = %directory.display(), "File buffer store ready");
        Ok(Self {
            directory,
            next_id: AtomicU64::new(0),
        })
    }

    fn path_for(&self, handle: &BufferHandle) -> PathBuf {
        self.directory.join(format!("buffer-{:016x}.bin", handle.0))
    }
}

impl BufferStore for FileBufferStore {
    fn allocate(&self, size: u64) -> Result<BufferHandle> {
        // Ids may already be taken by another store sharing the directory
        let (handle, path, file) = loop {
            let handle = BufferHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
            let path = self.path_for(&handle);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => break (handle, path, file),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    trace!(handle = handle.0, "Buffer file exists, trying next id");
                }
                Err(e) => {
                    return Err(ProtocolError::StoreError(format!(
                        "Failed to create buffer file: {e}"
                    )))
                }
            }
        };
        file.set_len(size)
            .map_err(|e| ProtocolError::StoreError(format!("Failed to size buffer file: {e}")))?;
        trace!(handle = handle.0, size, path = %path.display(), "File buffer allocated");
        Ok(handle)
    }

    fn get_stream(&self, handle: &BufferHandle) -> Result<Box<dyn BufferStream>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.path_for(handle))
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => unknown_handle(handle),
                _ => ProtocolError::StoreError(format!("Failed to open buffer file: {e}")),
            })?;
        Ok(Box::new(file))
    }

    fn release(&self, handle: &BufferHandle) -> Result<()> {
        fs::remove_file(self.path_for(handle)).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => unknown_handle(handle),
            _ => ProtocolError::StoreError(format!("Failed to remove buffer file: {e}")),
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn write_then_read(store: &dyn BufferStore) {
        let handle = store.allocate(11).unwrap();
        {
            let mut stream = store.get_stream(&handle).unwrap();
            stream.write_all(b"hello ").unwrap();
            stream.write_all(b"world").unwrap();
        }

        let mut stream = store.get_stream(&handle).unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello world");

        store.release(&handle).unwrap();
        assert!(store.get_stream(&handle).is_err());
        assert!(store.release(&handle).is_err());
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryBufferStore::new();
        write_then_read(&store);
        assert!(store.is_empty());
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBufferStore::new(dir.path().join("buffers")).unwrap();
        write_then_read(&store);
    }

    #[test]
    fn test_file_stores_sharing_a_directory_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let first = FileBufferStore::new(dir.path()).unwrap();
        let handle = first.allocate(4).unwrap();
        first.get_stream(&handle).unwrap().write_all(b"live").unwrap();

        let second = FileBufferStore::new(dir.path()).unwrap();
        let other = second.allocate(4).unwrap();
        assert_ne!(other, handle);
        second.get_stream(&other).unwrap().write_all(b"next").unwrap();

        let mut out = Vec::new();
        first.get_stream(&handle).unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"live");
    }

    #[test]
    fn test_memory_cursor_seek() {
        let store = MemoryBufferStore::new();
        let handle = store.allocate(4).unwrap();
        let mut stream = store.get_stream(&handle).unwrap();
        stream.write_all(&[1, 2, 3, 4]).unwrap();
        stream.seek(SeekFrom::Start(2)).unwrap();

        let mut tail = [0u8; 2];
        stream.read_exact(&mut tail).unwrap();
        assert_eq!(tail, [3, 4]);
        assert!(stream.seek(SeekFrom::Current(-10)).is_err());
    }
}
