//! Fixed-capacity byte FIFO backing each session's socket. Data is
//! appended at the tail and read from the head; the head is compacted away
//! lazily so the readable bytes always form one contiguous slice.

use std::io;

pub struct Buffer {
    data: Vec<u8>,
    head: usize,
    capacity: usize,
}

impl Buffer {
    pub fn new(capacity: usize) -> Buffer {
        assert!(capacity > 0, "buffer capacity must be non-zero");

        Buffer {
            data: Vec::with_capacity(capacity),
            head: 0,
            capacity,
        }
    }

    /// Number of readable bytes.
    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining space before the capacity is reached.
    pub fn free_capacity(&self) -> usize {
        self.capacity - self.len()
    }

    /// The readable bytes.
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.head..]
    }

    /// Drop `count` bytes off the head.
    pub fn consume(&mut self, count: usize) {
        assert!(count <= self.len(), "consumed past the buffer head");

        self.head += count;
        if self.head == self.data.len() {
            self.data.clear();
            self.head = 0;
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.head = 0;
    }

    /// Append bytes, failing with `WriteZero` when they do not fit.
    pub fn extend(&mut self, bytes: &[u8]) -> io::Result<()> {
        if bytes.len() > self.free_capacity() {
            return Err(io::ErrorKind::WriteZero.into());
        }

        self.compact_if_needed(bytes.len());
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Read from `reader` until the buffer is full or the reader blocks.
    /// `WouldBlock` ends the ingress with the byte count. EOF after some
    /// bytes reports them (the error surfaces on the next call); EOF with
    /// nothing read is `UnexpectedEof` so callers can tell a closed peer
    /// from a spurious wakeup. Filling the buffer to capacity without the
    /// reader running dry is an overrun error.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<usize> {
        let mut total = 0;

        while self.len() < self.capacity {
            self.compact_if_needed(self.capacity - self.len());
            let tail = self.data.len();
            let room = self.capacity - self.len();
            self.data.resize(tail + room, 0);

            match reader.read(&mut self.data[tail..]) {
                Ok(0) => {
                    self.data.truncate(tail);
                    if total == 0 {
                        return Err(io::ErrorKind::UnexpectedEof.into());
                    }
                    return Ok(total);
                }
                Ok(count) => {
                    self.data.truncate(tail + count);
                    total += count;
                }
                Err(err) => {
                    self.data.truncate(tail);
                    if err.kind() == io::ErrorKind::WouldBlock {
                        return Ok(total);
                    }
                    return Err(err);
                }
            }
        }

        Err(io::Error::new(io::ErrorKind::Other, "buffer overrun"))
    }

    /// Write buffered bytes to `writer` until empty or the writer blocks.
    /// Returns the number of bytes moved; a zero-length write is an error.
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let mut total = 0;

        while !self.is_empty() {
            match writer.write(self.read_slice()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => {
                    self.consume(count);
                    total += count;
                }
                Err(err) => {
                    if err.kind() == io::ErrorKind::WouldBlock {
                        return Ok(total);
                    }
                    return Err(err);
                }
            }
        }

        Ok(total)
    }

    fn compact_if_needed(&mut self, incoming: usize) {
        if self.head > 0 && self.data.len() + incoming > self.capacity {
            self.data.drain(..self.head);
            self.head = 0;
        }
    }
}
