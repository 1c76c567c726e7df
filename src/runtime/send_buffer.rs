//! Pooled output buffers.
//!
//! Outgoing packets are carved out of fixed-size chunks by bump
//! allocation. A finished [`SendBuffer`] is an immutable view that shares
//! ownership of its chunk's allocation, so the bytes stay valid until the
//! last in-flight write referencing them has completed, even after the
//! producing context has moved on to a fresh chunk.
//!
//! ## Chunk Lifecycle
//!
//! ```text
//! pool --pop--> SendContext (current chunk) --open/close--> SendBuffer ...
//!   ^                     |
//!   +------push-----------+  (chunk full, or context dropped)
//! ```
//!
//! A pushed chunk is only handed out again once every `SendBuffer` carved
//! from it has been dropped; until then `pop` skips it.

use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{trace, warn};

/// Capacity of one send buffer chunk in bytes.
pub const SEND_BUFFER_CHUNK_SIZE: usize = 6000;

/// Upper bound on chunks parked in the shared pool.
const MAX_POOLED_CHUNKS: usize = 256;

/// A finalized, immutable output buffer.
///
/// Cloning is cheap and shares the same bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendBuffer {
    bytes: Bytes,
}

impl SendBuffer {
    /// Wrap static bytes without touching the pool.
    pub fn from_static(bytes: &'static [u8]) -> Self {
        Self {
            bytes: Bytes::from_static(bytes),
        }
    }

    /// Copy `data` into an unpooled buffer.
    pub fn copy_from_slice(data: &[u8]) -> Self {
        Self {
            bytes: Bytes::copy_from_slice(data),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl AsRef<[u8]> for SendBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

/// Shared pool of send buffer chunks.
pub struct SendBufferManager {
    pool: Mutex<Vec<BytesMut>>,
    chunks_created: AtomicUsize,
}

impl SendBufferManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pool: Mutex::new(Vec::new()),
            chunks_created: AtomicUsize::new(0),
        })
    }

    /// Create an allocation context for one worker or task.
    pub fn context(self: &Arc<Self>) -> SendContext {
        SendContext {
            manager: Arc::clone(self),
            current: None,
        }
    }

    /// Take a reusable chunk from the pool, or create a new one.
    fn pop(&self) -> BytesMut {
        {
            let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
            // Most recently pushed first; those are the likeliest to be idle
            for i in (0..pool.len()).rev() {
                if reset_chunk(&mut pool[i]) {
                    trace!(pooled = pool.len() - 1, "Reusing send buffer chunk");
                    return pool.swap_remove(i);
                }
            }
        }

        let created = self.chunks_created.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(created, "Creating send buffer chunk");
        BytesMut::with_capacity(SEND_BUFFER_CHUNK_SIZE)
    }

    /// Park a chunk in the pool.
    fn push(&self, chunk: BytesMut) {
        let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        if pool.len() >= MAX_POOLED_CHUNKS {
            // Freed once its outstanding buffers are gone
            return;
        }
        pool.push(chunk);
    }

    /// Chunks currently parked in the pool.
    pub fn pooled_chunks(&self) -> usize {
        self.pool.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Chunks allocated over the lifetime of the manager.
    pub fn chunks_created(&self) -> usize {
        self.chunks_created.load(Ordering::Relaxed)
    }
}

/// Rewind a chunk to its full capacity.
///
/// Only succeeds when no `SendBuffer` still references the allocation.
fn reset_chunk(chunk: &mut BytesMut) -> bool {
    chunk.clear();
    chunk.try_reclaim(SEND_BUFFER_CHUNK_SIZE)
}

/// Per-worker allocation state.
///
/// Holds the chunk currently being filled. Exactly one task uses a
/// context at a time, so filling the chunk needs no lock; only chunk
/// pop/push touches the shared pool.
pub struct SendContext {
    manager: Arc<SendBufferManager>,
    current: Option<BytesMut>,
}

impl SendContext {
    /// Open a writer for up to `size` bytes.
    ///
    /// Returns `None` when `size` exceeds the chunk capacity; callers must
    /// split larger payloads.
    pub fn open(&mut self, size: usize) -> Option<SendBufferWriter<'_>> {
        if size > SEND_BUFFER_CHUNK_SIZE {
            warn!(
                size,
                max = SEND_BUFFER_CHUNK_SIZE,
                "Send buffer request exceeds chunk capacity"
            );
            return None;
        }

        let exhausted = match &self.current {
            Some(chunk) => chunk.capacity() < size,
            None => true,
        };
        if exhausted {
            if let Some(full) = self.current.take() {
                self.manager.push(full);
            }
            self.current = Some(self.manager.pop());
        }

        let chunk = self.current.as_mut()?;
        // Within capacity: never reallocates
        chunk.resize(size, 0);
        Some(SendBufferWriter {
            chunk,
            alloc_size: size,
        })
    }

    /// Bytes still available in the current chunk.
    pub fn free_size(&self) -> usize {
        self.current.as_ref().map_or(0, |chunk| chunk.capacity())
    }
}

impl Drop for SendContext {
    fn drop(&mut self) {
        if let Some(chunk) = self.current.take() {
            self.manager.push(chunk);
        }
    }
}

/// An open region of the context's current chunk.
///
/// Borrows the context mutably, so at most one writer is open per chunk.
/// Dropping the writer without closing it abandons the region.
pub struct SendBufferWriter<'a> {
    chunk: &'a mut BytesMut,
    alloc_size: usize,
}

impl SendBufferWriter<'_> {
    /// Writable region of `alloc_size` bytes.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.chunk[..]
    }

    pub fn alloc_size(&self) -> usize {
        self.alloc_size
    }

    /// Finalize the first `write_size` bytes into a [`SendBuffer`].
    ///
    /// The unused remainder goes back to the chunk for the next `open`.
    pub fn close(self, write_size: usize) -> SendBuffer {
        debug_assert!(write_size <= self.alloc_size, "write past allocation");
        self.chunk.truncate(write_size.min(self.alloc_size));
        SendBuffer {
            bytes: self.chunk.split().freeze(),
        }
    }
}

impl Drop for SendBufferWriter<'_> {
    fn drop(&mut self) {
        self.chunk.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(cx: &mut SendContext, data: &[u8]) -> SendBuffer {
        let mut writer = cx.open(data.len()).unwrap();
        writer.buffer_mut().copy_from_slice(data);
        writer.close(data.len())
    }

    #[test]
    fn test_open_close_bump_allocates() {
        let manager = SendBufferManager::new();
        let mut cx = manager.context();

        let mut writer = cx.open(100).unwrap();
        assert_eq!(writer.alloc_size(), 100);
        writer.buffer_mut()[..5].copy_from_slice(b"first");
        let first = writer.close(5);
        assert_eq!(first.as_ref(), b"first");
        assert_eq!(cx.free_size(), SEND_BUFFER_CHUNK_SIZE - 5);

        let second = fill(&mut cx, b"second");
        assert_eq!(second.as_ref(), b"second");

        // Carved right after the first buffer in the same chunk
        assert_eq!(second.as_ref().as_ptr(), first.as_ref().as_ptr().wrapping_add(5));
        assert_eq!(manager.chunks_created(), 1);
    }

    #[test]
    fn test_oversized_request_rejected() {
        let manager = SendBufferManager::new();
        let mut cx = manager.context();

        assert!(cx.open(SEND_BUFFER_CHUNK_SIZE + 1).is_none());
        assert!(cx.open(SEND_BUFFER_CHUNK_SIZE).is_some());
    }

    #[test]
    fn test_buffer_outlives_chunk_replacement() {
        let manager = SendBufferManager::new();
        let mut cx = manager.context();

        let early = fill(&mut cx, b"keep me intact");

        // Force the context onto a fresh chunk and scribble over it
        let big = vec![0xAB; SEND_BUFFER_CHUNK_SIZE];
        let late = fill(&mut cx, &big);

        assert_eq!(manager.chunks_created(), 2);
        assert_eq!(early.as_ref(), b"keep me intact");
        assert_eq!(late.len(), SEND_BUFFER_CHUNK_SIZE);
    }

    #[test]
    fn test_chunk_reused_only_after_buffers_dropped() {
        let manager = SendBufferManager::new();

        let outstanding = {
            let mut cx = manager.context();
            fill(&mut cx, b"in flight")
        };
        assert_eq!(manager.pooled_chunks(), 1);

        // Pooled chunk is still referenced, so a new one is created
        {
            let mut cx = manager.context();
            let _buf = fill(&mut cx, b"other");
        }
        assert_eq!(manager.chunks_created(), 2);

        drop(outstanding);
        {
            let mut cx = manager.context();
            let _buf = fill(&mut cx, b"reuse");
        }
        assert_eq!(manager.chunks_created(), 2);
        assert_eq!(manager.pooled_chunks(), 2);
    }

    #[test]
    fn test_abandoned_writer_returns_space() {
        let manager = SendBufferManager::new();
        let mut cx = manager.context();

        {
            let mut writer = cx.open(64).unwrap();
            writer.buffer_mut()[0] = 1;
        }
        assert_eq!(cx.free_size(), SEND_BUFFER_CHUNK_SIZE);

        let buf = fill(&mut cx, b"after");
        assert_eq!(buf.as_ref(), b"after");
    }

    #[test]
    fn test_contexts_on_many_threads() {
        use std::thread;

        let manager = SendBufferManager::new();
        let handles: Vec<_> = (0..4u8)
            .map(|t| {
                let manager = Arc::clone(&manager);
                thread::spawn(move || {
                    let mut cx = manager.context();
                    let buffers: Vec<_> = (0..200u8)
                        .map(|i| fill(&mut cx, &[t, i, t, i]))
                        .collect();
                    for (i, buf) in buffers.iter().enumerate() {
                        assert_eq!(buf.as_ref(), &[t, i as u8, t, i as u8]);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(manager.pooled_chunks() >= 1);
    }
}
