//! Bounded chunk buffer between the transport and playback
//!
//! The transport pushes encoded chunks from the I/O domain while a player
//! thread pops them through the feed. The buffer is deliberately small:
//! when playback falls behind, the whole backlog is discarded at once so
//! latency snaps back instead of creeping up one chunk at a time.

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::BufferConfig;

/// Result of a [`ChunkBuffer::pop`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PopResult {
    /// Head of the queue
    Chunk(Bytes),
    /// Timed out while the stream is still live
    NoData,
    /// Empty and no more data will arrive
    Ended,
}

/// What a [`ChunkBuffer::push`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Backlog threshold reached; `dropped` stale chunks were discarded first
    BacklogCleared { dropped: usize },
    /// Hard capacity reached; the oldest chunk was evicted
    Evicted,
    /// Buffer already ended; chunk dropped
    Rejected,
}

struct Inner {
    queue: VecDeque<Bytes>,
    ended: bool,
    last_backlog_log: Option<Instant>,
    suppressed_clears: u64,
}

/// Thread-safe FIFO of audio chunks with backlog dropping and an
/// end-of-stream flag
pub struct ChunkBuffer {
    inner: Mutex<Inner>,
    available: Condvar,
    capacity: usize,
    backlog_threshold: usize,
    log_window: Duration,
    pushed: AtomicU64,
    popped: AtomicU64,
    backlog_clears: AtomicU64,
    dropped: AtomicU64,
    evicted: AtomicU64,
    rejected: AtomicU64,
    backlog_warnings: AtomicU64,
    suppressed_warnings: AtomicU64,
}

impl ChunkBuffer {
    /// Create a buffer holding at most `capacity` chunks that discards its
    /// backlog once `backlog_threshold` chunks are queued
    pub fn new(capacity: usize, backlog_threshold: usize, log_window: Duration) -> Self {
        assert!(capacity > 0, "Capacity must be positive");
        assert!(
            backlog_threshold > 0 && backlog_threshold < capacity,
            "Backlog threshold must be in 1..capacity"
        );

        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                ended: false,
                last_backlog_log: None,
                suppressed_clears: 0,
            }),
            available: Condvar::new(),
            capacity,
            backlog_threshold,
            log_window,
            pushed: AtomicU64::new(0),
            popped: AtomicU64::new(0),
            backlog_clears: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            backlog_warnings: AtomicU64::new(0),
            suppressed_warnings: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &BufferConfig) -> Self {
        Self::new(
            config.capacity,
            config.backlog_threshold,
            config.backlog_log_window(),
        )
    }

    /// Queue a chunk. Never blocks.
    pub fn push(&self, chunk: Bytes) -> PushOutcome {
        let mut inner = self.inner.lock();

        if inner.ended {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return PushOutcome::Rejected;
        }

        let mut outcome = PushOutcome::Queued;

        if inner.queue.len() >= self.backlog_threshold {
            let dropped = inner.queue.len();
            inner.queue.clear();
            self.backlog_clears.fetch_add(1, Ordering::Relaxed);
            self.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
            self.log_backlog(&mut inner, dropped);
            outcome = PushOutcome::BacklogCleared { dropped };
        }

        if inner.queue.len() >= self.capacity {
            inner.queue.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
            outcome = PushOutcome::Evicted;
        }

        inner.queue.push_back(chunk);
        self.pushed.fetch_add(1, Ordering::Relaxed);
        drop(inner);

        self.available.notify_one();
        outcome
    }

    /// Wait up to `timeout` for the head chunk
    pub fn pop(&self, timeout: Duration) -> PopResult {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();

        loop {
            if let Some(chunk) = inner.queue.pop_front() {
                self.popped.fetch_add(1, Ordering::Relaxed);
                return PopResult::Chunk(chunk);
            }
            if inner.ended {
                return PopResult::Ended;
            }
            if self.available.wait_until(&mut inner, deadline).timed_out() {
                if let Some(chunk) = inner.queue.pop_front() {
                    self.popped.fetch_add(1, Ordering::Relaxed);
                    return PopResult::Chunk(chunk);
                }
                return if inner.ended {
                    PopResult::Ended
                } else {
                    PopResult::NoData
                };
            }
        }
    }

    /// Mark the stream as finished. Idempotent.
    pub fn mark_ended(&self) {
        let mut inner = self.inner.lock();
        inner.ended = true;
        drop(inner);
        self.available.notify_all();
    }

    pub fn is_ended(&self) -> bool {
        self.inner.lock().ended
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn backlog_threshold(&self) -> usize {
        self.backlog_threshold
    }

    /// Get statistics
    pub fn stats(&self) -> ChunkBufferStats {
        ChunkBufferStats {
            level: self.len(),
            capacity: self.capacity,
            pushed: self.pushed.load(Ordering::Relaxed),
            popped: self.popped.load(Ordering::Relaxed),
            backlog_clears: self.backlog_clears.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            backlog_warnings: self.backlog_warnings.load(Ordering::Relaxed),
            suppressed_warnings: self.suppressed_warnings.load(Ordering::Relaxed),
        }
    }

    // One warning per window; clears inside the window are folded into the next one.
    fn log_backlog(&self, inner: &mut Inner, dropped: usize) {
        let now = Instant::now();
        let due = inner
            .last_backlog_log
            .map_or(true, |last| now.duration_since(last) >= self.log_window);

        if due {
            tracing::warn!(
                dropped,
                suppressed = inner.suppressed_clears,
                total_dropped = self.dropped.load(Ordering::Relaxed),
                "Audio backlog detected; dropping stale chunks to stay low-latency"
            );
            inner.last_backlog_log = Some(now);
            inner.suppressed_clears = 0;
            self.backlog_warnings.fetch_add(1, Ordering::Relaxed);
        } else {
            inner.suppressed_clears += 1;
            self.suppressed_warnings.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Thread-safe handle to a chunk buffer
pub type SharedChunkBuffer = Arc<ChunkBuffer>;

/// Chunk buffer statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkBufferStats {
    pub level: usize,
    pub capacity: usize,
    pub pushed: u64,
    pub popped: u64,
    pub backlog_clears: u64,
    pub dropped: u64,
    pub evicted: u64,
    pub rejected: u64,
    /// Backlog warnings actually logged
    pub backlog_warnings: u64,
    /// Backlog clears that fell inside the log window and were not logged
    pub suppressed_warnings: u64,
}

impl ChunkBufferStats {
    /// Share of pushed chunks that never reached playback
    pub fn drop_rate(&self) -> f32 {
        if self.pushed == 0 {
            0.0
        } else {
            (self.dropped + self.evicted) as f32 / self.pushed as f32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread;

    fn chunk(n: u8) -> Bytes {
        Bytes::from(vec![n; 4])
    }

    fn buffer() -> ChunkBuffer {
        ChunkBuffer::new(12, 6, Duration::from_secs(2))
    }

    #[test]
    fn test_fifo_order() {
        let buffer = buffer();
        for n in 0..3 {
            assert_eq!(buffer.push(chunk(n)), PushOutcome::Queued);
        }

        for n in 0..3 {
            assert_eq!(buffer.pop(Duration::from_millis(10)), PopResult::Chunk(chunk(n)));
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_backlog_clears_whole_queue() {
        let buffer = buffer();
        for n in 0..6 {
            buffer.push(chunk(n));
        }
        assert_eq!(buffer.len(), 6);

        let outcome = buffer.push(chunk(99));
        assert_eq!(outcome, PushOutcome::BacklogCleared { dropped: 6 });
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.pop(Duration::ZERO), PopResult::Chunk(chunk(99)));

        let stats = buffer.stats();
        assert_eq!(stats.backlog_clears, 1);
        assert_eq!(stats.dropped, 6);
    }

    #[test]
    fn test_backlog_warning_is_rate_limited() {
        let window = Duration::from_millis(200);
        let buffer = ChunkBuffer::new(12, 2, window);

        let clear_backlog = |base: u8| {
            buffer.push(chunk(base));
            buffer.push(chunk(base + 1));
            buffer.push(chunk(base + 2))
        };

        assert!(matches!(clear_backlog(0), PushOutcome::BacklogCleared { .. }));
        buffer.push(chunk(10));
        assert_eq!(buffer.push(chunk(11)), PushOutcome::BacklogCleared { dropped: 2 });

        let stats = buffer.stats();
        assert_eq!(stats.backlog_clears, 2);
        assert_eq!(stats.backlog_warnings, 1);
        assert_eq!(stats.suppressed_warnings, 1);

        thread::sleep(window + Duration::from_millis(50));
        buffer.push(chunk(20));
        assert!(matches!(
            buffer.push(chunk(21)),
            PushOutcome::BacklogCleared { .. }
        ));

        let stats = buffer.stats();
        assert_eq!(stats.backlog_clears, 3);
        assert_eq!(stats.backlog_warnings, 2);
        assert_eq!(stats.suppressed_warnings, 1);
    }

    #[test]
    fn test_ended_empty_returns_immediately() {
        let buffer = buffer();
        buffer.mark_ended();
        buffer.mark_ended();

        let start = Instant::now();
        assert_eq!(buffer.pop(Duration::from_secs(5)), PopResult::Ended);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_ended_drains_remaining_first() {
        let buffer = buffer();
        buffer.push(chunk(1));
        buffer.mark_ended();

        assert_eq!(buffer.pop(Duration::ZERO), PopResult::Chunk(chunk(1)));
        assert_eq!(buffer.pop(Duration::ZERO), PopResult::Ended);
    }

    #[test]
    fn test_push_after_end_is_rejected() {
        let buffer = buffer();
        buffer.mark_ended();
        assert_eq!(buffer.push(chunk(1)), PushOutcome::Rejected);
        assert!(buffer.is_empty());
        assert_eq!(buffer.stats().rejected, 1);
    }

    #[test]
    fn test_pop_times_out() {
        let buffer = buffer();
        let timeout = Duration::from_millis(120);

        let start = Instant::now();
        assert_eq!(buffer.pop(timeout), PopResult::NoData);
        let elapsed = start.elapsed();
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(500));
    }

    #[test]
    fn test_pop_wakes_on_push() {
        let buffer = Arc::new(buffer());
        let producer = buffer.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            producer.push(chunk(7));
        });

        let start = Instant::now();
        assert_eq!(buffer.pop(Duration::from_secs(5)), PopResult::Chunk(chunk(7)));
        assert!(start.elapsed() < Duration::from_secs(2));
        handle.join().unwrap();
    }

    #[test]
    fn test_pop_wakes_on_mark_ended() {
        let buffer = Arc::new(buffer());
        let closer = buffer.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            closer.mark_ended();
        });

        let start = Instant::now();
        assert_eq!(buffer.pop(Duration::from_secs(5)), PopResult::Ended);
        assert!(start.elapsed() < Duration::from_secs(2));
        handle.join().unwrap();
    }

    #[test]
    fn test_drop_rate() {
        let buffer = buffer();
        for n in 0..7 {
            buffer.push(chunk(n));
        }
        let stats = buffer.stats();
        assert_eq!(stats.pushed, 7);
        assert!((stats.drop_rate() - 6.0 / 7.0).abs() < f32::EPSILON);
    }

    proptest! {
        #[test]
        fn prop_len_never_exceeds_capacity(
            capacity in 2usize..24,
            threshold_seed in 0usize..24,
            ops in proptest::collection::vec(any::<bool>(), 0..200),
        ) {
            let threshold = 1 + threshold_seed % (capacity - 1);
            let buffer = ChunkBuffer::new(capacity, threshold, Duration::from_secs(2));

            for (i, is_push) in ops.into_iter().enumerate() {
                if is_push {
                    buffer.push(Bytes::from(vec![i as u8]));
                } else {
                    let _ = buffer.pop(Duration::ZERO);
                }
                prop_assert!(buffer.len() <= capacity);
                prop_assert!(buffer.len() <= threshold);
            }
        }
    }
}
