//! Players driving a [`StreamingFeed`]
//!
//! A player owns the playback side of one episode. It runs on its own
//! thread and pulls from the feed at its own pace; the controller only
//! creates and stops it. Faults stay on the player thread and are reported
//! through [`Player::check_errors`], never back into the controller.

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::feed::StreamingFeed;
use crate::constants::PLAYER_READ_SIZE;
use crate::error::AudioError;

/// Playback side of one connection episode
pub trait Player: Send {
    /// Stop playback. Idempotent.
    fn stop(&mut self);

    /// Whether the player thread is still consuming
    fn is_running(&self) -> bool;

    /// Next fault raised on the player thread, if any
    fn check_errors(&self) -> Option<AudioError>;
}

/// Builds a player for each new episode
pub trait PlayerFactory: Send + Sync {
    fn create(&self, feed: StreamingFeed, episode: u64) -> Result<Box<dyn Player>, AudioError>;
}

type WriterFactory = dyn Fn() -> io::Result<Box<dyn Write + Send>> + Send + Sync;

/// How long `stop` waits for a write already in progress
const STOP_GRACE: Duration = Duration::from_millis(500);

/// Copies the raw encoded stream into a writer, for piping into an
/// external decoder
pub struct PipePlayer {
    running: Arc<AtomicBool>,
    // Held for every write; once `stop` holds it, nothing more reaches the sink
    write_gate: Arc<Mutex<()>>,
    bytes_written: Arc<AtomicU64>,
    error_rx: Receiver<AudioError>,
    thread_handle: Option<JoinHandle<()>>,
}

impl PipePlayer {
    /// Start copying `feed` into `writer` on a dedicated thread
    pub fn start(
        mut feed: StreamingFeed,
        mut writer: Box<dyn Write + Send>,
        episode: u64,
    ) -> Result<Self, AudioError> {
        let running = Arc::new(AtomicBool::new(true));
        let write_gate = Arc::new(Mutex::new(()));
        let bytes_written = Arc::new(AtomicU64::new(0));
        let (error_tx, error_rx) = bounded::<AudioError>(16);

        let running_for_loop = running.clone();
        let gate = write_gate.clone();
        let written = bytes_written.clone();

        let handle = thread::Builder::new()
            .name(format!("playback-episode-{}", episode))
            .spawn(move || {
                feed.open();
                let mut chunk = vec![0u8; PLAYER_READ_SIZE];

                while running_for_loop.load(Ordering::Relaxed) {
                    let n = match feed.read(&mut chunk) {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) => {
                            report(&error_tx, AudioError::StreamError(e.to_string()));
                            break;
                        }
                    };

                    let _open = gate.lock();
                    if !running_for_loop.load(Ordering::SeqCst) {
                        break;
                    }
                    if let Err(e) = writer.write_all(&chunk[..n]).and_then(|_| writer.flush()) {
                        tracing::warn!("Playback sink write failed on episode {}: {}", episode, e);
                        report(&error_tx, AudioError::SinkWrite(e.to_string()));
                        break;
                    }
                    written.fetch_add(n as u64, Ordering::Relaxed);
                }

                feed.close();
                running_for_loop.store(false, Ordering::SeqCst);
                tracing::debug!(
                    "Playback for episode {} finished after {} bytes",
                    episode,
                    written.load(Ordering::Relaxed)
                );
            })
            .map_err(|e| AudioError::PlayerSpawn(e.to_string()))?;

        Ok(Self {
            running,
            write_gate,
            bytes_written,
            error_rx,
            thread_handle: Some(handle),
        })
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }
}

fn report(tx: &Sender<AudioError>, err: AudioError) {
    let _ = tx.try_send(err);
}

impl Player for PipePlayer {
    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        // Wait out a write in flight so the next episode's bytes never
        // interleave with ours. A writer blocked past the grace period is
        // left behind rather than stalling the caller.
        let had_thread = self.thread_handle.take().is_some();
        if had_thread && self.write_gate.try_lock_for(STOP_GRACE).is_none() {
            tracing::warn!("Playback sink still blocked after stop; output may interleave");
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.try_recv().ok()
    }
}

impl Drop for PipePlayer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Creates a [`PipePlayer`] per episode, opening a fresh writer each time
pub struct PipePlayerFactory {
    open_writer: Box<WriterFactory>,
}

impl PipePlayerFactory {
    pub fn new<F>(open_writer: F) -> Self
    where
        F: Fn() -> io::Result<Box<dyn Write + Send>> + Send + Sync + 'static,
    {
        Self {
            open_writer: Box::new(open_writer),
        }
    }

    /// Raw stream on stdout
    pub fn stdout() -> Self {
        Self::new(|| Ok(Box::new(io::stdout()) as Box<dyn Write + Send>))
    }

    /// Raw stream appended to a file
    pub fn file(path: PathBuf) -> Self {
        Self::new(move || {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            Ok(Box::new(io::BufWriter::new(file)) as Box<dyn Write + Send>)
        })
    }

    /// Consume and discard the stream
    pub fn discard() -> Self {
        Self::new(|| Ok(Box::new(io::sink()) as Box<dyn Write + Send>))
    }
}

impl PlayerFactory for PipePlayerFactory {
    fn create(&self, feed: StreamingFeed, episode: u64) -> Result<Box<dyn Player>, AudioError> {
        let writer = (self.open_writer)().map_err(|e| AudioError::PlayerSpawn(e.to_string()))?;
        let player = PipePlayer::start(feed, writer, episode)?;
        Ok(Box::new(player))
    }
}
