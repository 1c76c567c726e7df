//! Per-connection receive staging buffer.
//!
//! A single region with independent read and write cursors. Bytes are
//! read from the socket into the free tail and consumed from the front
//! by the framing hook.

/// Multiple of the nominal buffer size reserved per connection.
const BUFFER_COUNT: usize = 10;

/// Sliding receive buffer.
///
/// Invariant: `read_pos <= write_pos <= capacity`.
pub struct RecvBuffer {
    buffer: Vec<u8>,
    /// Nominal size of one read; compaction keeps at least this much free.
    buffer_size: usize,
    read_pos: usize,
    write_pos: usize,
}

impl RecvBuffer {
    /// Create a buffer with capacity for `BUFFER_COUNT` nominal reads.
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer: vec![0u8; buffer_size * BUFFER_COUNT],
            buffer_size,
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Reclaim consumed space.
    ///
    /// Resets both cursors when drained; otherwise moves the unread bytes
    /// to the front only once the free tail drops below one buffer size.
    pub fn clean(&mut self) {
        let data_size = self.data_size();
        if data_size == 0 {
            self.read_pos = 0;
            self.write_pos = 0;
        } else if self.free_size() < self.buffer_size {
            self.buffer.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = data_size;
        }
    }

    /// Mark `n` bytes as consumed. Fails if fewer are buffered.
    pub fn on_read(&mut self, n: usize) -> bool {
        if n > self.data_size() {
            return false;
        }
        self.read_pos += n;
        true
    }

    /// Mark `n` bytes as written into the free tail. Fails if they don't fit.
    pub fn on_write(&mut self, n: usize) -> bool {
        if n > self.free_size() {
            return false;
        }
        self.write_pos += n;
        true
    }

    /// Unread bytes.
    pub fn data(&self) -> &[u8] {
        &self.buffer[self.read_pos..self.write_pos]
    }

    /// Free tail to read into.
    pub fn free_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.write_pos..]
    }

    pub fn data_size(&self) -> usize {
        self.write_pos - self.read_pos
    }

    pub fn free_size(&self) -> usize {
        self.buffer.len() - self.write_pos
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }
}
