//! Pull-based byte source over a [`ChunkBuffer`]
//!
//! Decoders and players read the live stream through [`std::io::Read`].
//! A read blocks on the buffer in short polls until a chunk arrives or the
//! buffer reports end of stream, which surfaces as `Ok(0)`.

use bytes::{Buf, Bytes};
use std::io;
use std::time::Duration;

use crate::audio::buffer::{PopResult, SharedChunkBuffer};

/// Byte source draining one episode's chunk buffer
pub struct StreamingFeed {
    buffer: SharedChunkBuffer,
    poll_interval: Duration,
    current: Bytes,
    opened: bool,
    closed: bool,
    bytes_read: u64,
    chunks_read: u64,
}

impl StreamingFeed {
    pub fn new(buffer: SharedChunkBuffer, poll_interval: Duration) -> Self {
        Self {
            buffer,
            poll_interval,
            current: Bytes::new(),
            opened: false,
            closed: false,
            bytes_read: 0,
            chunks_read: 0,
        }
    }

    /// Prepare for reading. Cheap and idempotent; the length is never known.
    pub fn open(&mut self) -> Option<u64> {
        if !self.opened {
            self.opened = true;
            tracing::debug!("Streaming feed opened");
        }
        None
    }

    /// Abandon the in-flight chunk. Further reads report end of stream.
    pub fn close(&mut self) {
        if !self.closed {
            tracing::debug!(
                bytes = self.bytes_read,
                chunks = self.chunks_read,
                "Streaming feed closed"
            );
        }
        self.current = Bytes::new();
        self.closed = true;
    }

    pub fn is_open(&self) -> bool {
        self.opened && !self.closed
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn chunks_read(&self) -> u64 {
        self.chunks_read
    }

    /// Bytes of the in-flight chunk not yet handed out
    pub fn pending(&self) -> usize {
        self.current.len()
    }

    // Returns false once the buffer has ended and nothing is left.
    fn fill(&mut self) -> bool {
        while !self.current.has_remaining() {
            match self.buffer.pop(self.poll_interval) {
                PopResult::Chunk(chunk) => {
                    self.chunks_read += 1;
                    self.current = chunk;
                }
                PopResult::NoData => continue,
                PopResult::Ended => return false,
            }
        }
        true
    }
}

impl io::Read for StreamingFeed {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.open();

        if self.closed || buf.is_empty() {
            return Ok(0);
        }
        if !self.fill() {
            return Ok(0);
        }

        let n = buf.len().min(self.current.len());
        self.current.copy_to_slice(&mut buf[..n]);
        self.bytes_read += n as u64;
        Ok(n)
    }
}
