//! Device playback of raw 16-bit little-endian PCM
//!
//! Used with the `pcm16` stream format. A decode thread turns feed bytes
//! into f32 samples in a lock-free ring; the cpal output callback drains
//! the ring and plays silence on underrun.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam::queue::ArrayQueue;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::device::get_output_device;
use crate::audio::feed::StreamingFeed;
use crate::audio::playback::{Player, PlayerFactory};
use crate::config::OutputConfig;
use crate::constants::PLAYER_READ_SIZE;
use crate::error::AudioError;

/// Ring size in seconds of audio
const RING_SECONDS: usize = 2;

/// Convert little-endian i16 bytes to f32 samples. An odd trailing byte is
/// left in `carry` for the next call.
pub fn decode_pcm16(carry: &mut Option<u8>, bytes: &[u8], out: &mut Vec<f32>) {
    let mut rest = bytes;

    if let Some(low) = carry.take() {
        match rest.split_first() {
            Some((&high, tail)) => {
                out.push(i16::from_le_bytes([low, high]) as f32 / 32768.0);
                rest = tail;
            }
            None => {
                *carry = Some(low);
                return;
            }
        }
    }

    let mut pairs = rest.chunks_exact(2);
    for pair in &mut pairs {
        out.push(i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0);
    }
    if let [last] = pairs.remainder() {
        *carry = Some(*last);
    }
}

/// Plays one episode's PCM stream on an output device
pub struct PcmPlayer {
    running: Arc<AtomicBool>,
    underruns: Arc<AtomicU64>,
    error_rx: Receiver<AudioError>,
    decode_thread: Option<JoinHandle<()>>,
    output_thread: Option<JoinHandle<()>>,
}

impl PcmPlayer {
    pub fn start(
        mut feed: StreamingFeed,
        config: &OutputConfig,
        episode: u64,
    ) -> Result<Self, AudioError> {
        let running = Arc::new(AtomicBool::new(true));
        let underruns = Arc::new(AtomicU64::new(0));
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let ring = Arc::new(ArrayQueue::<f32>::new(
            config.sample_rate as usize * config.channels as usize * RING_SECONDS,
        ));

        let stream_config = StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let device_name = config.device.clone();

        let output_thread = {
            let running = running.clone();
            let ring = ring.clone();
            let underruns = underruns.clone();
            let error_tx = error_tx.clone();

            thread::Builder::new()
                .name(format!("pcm-output-{}", episode))
                .spawn(move || {
                    run_output(device_name, stream_config, ring, running, underruns, error_tx)
                })
                .map_err(|e| AudioError::PlayerSpawn(e.to_string()))?
        };

        let decode_thread = {
            let running = running.clone();
            let ring = ring.clone();

            thread::Builder::new()
                .name(format!("pcm-decode-{}", episode))
                .spawn(move || {
                    let mut bytes = vec![0u8; PLAYER_READ_SIZE];
                    let mut samples = Vec::with_capacity(PLAYER_READ_SIZE / 2);
                    let mut carry = None;

                    while running.load(Ordering::Relaxed) {
                        let n = match feed.read(&mut bytes) {
                            Ok(0) => break,
                            Ok(n) => n,
                            Err(e) => {
                                let _ = error_tx.try_send(AudioError::StreamError(e.to_string()));
                                break;
                            }
                        };

                        samples.clear();
                        decode_pcm16(&mut carry, &bytes[..n], &mut samples);
                        for sample in samples.iter().copied() {
                            // Oldest samples go first when the device lags
                            ring.force_push(sample);
                        }
                    }

                    feed.close();
                    running.store(false, Ordering::SeqCst);
                })
                .map_err(|e| AudioError::PlayerSpawn(e.to_string()))?
        };

        Ok(Self {
            running,
            underruns,
            error_rx,
            decode_thread: Some(decode_thread),
            output_thread: Some(output_thread),
        })
    }

    /// Output callbacks that found the ring empty
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }
}

fn run_output(
    device_name: Option<String>,
    config: StreamConfig,
    ring: Arc<ArrayQueue<f32>>,
    running: Arc<AtomicBool>,
    underruns: Arc<AtomicU64>,
    error_tx: Sender<AudioError>,
) {
    let device = match get_output_device(device_name.as_deref()) {
        Ok(device) => device,
        Err(e) => {
            tracing::error!("No output device: {}", e);
            let _ = error_tx.try_send(e);
            return;
        }
    };

    let callback_errors = error_tx.clone();
    let stream = device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            let mut starved = false;
            for sample in data.iter_mut() {
                *sample = ring.pop().unwrap_or_else(|| {
                    starved = true;
                    0.0
                });
            }
            if starved {
                underruns.fetch_add(1, Ordering::Relaxed);
            }
        },
        move |err| {
            let _ = callback_errors.try_send(AudioError::StreamError(err.to_string()));
        },
        None,
    );

    match stream {
        Ok(stream) => {
            if let Err(e) = stream.play() {
                tracing::error!("Failed to start output stream: {}", e);
                let _ = error_tx.try_send(AudioError::StreamError(e.to_string()));
                return;
            }

            // Keep thread alive while running
            while running.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(10));
            }
        }
        Err(e) => {
            tracing::error!("Failed to build output stream: {}", e);
            let _ = error_tx.try_send(AudioError::StreamError(e.to_string()));
        }
    }
}

impl Player for PcmPlayer {
    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.decode_thread.take();
        self.output_thread.take();
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.try_recv().ok()
    }
}

impl Drop for PcmPlayer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Creates a [`PcmPlayer`] per episode
pub struct PcmPlayerFactory {
    config: OutputConfig,
}

impl PcmPlayerFactory {
    pub fn new(config: OutputConfig) -> Self {
        Self { config }
    }
}

impl PlayerFactory for PcmPlayerFactory {
    fn create(&self, feed: StreamingFeed, episode: u64) -> Result<Box<dyn Player>, AudioError> {
        Ok(Box::new(PcmPlayer::start(feed, &self.config, episode)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_pcm16_carries_odd_byte() {
        let mut carry = None;
        let mut out = Vec::new();

        // 0x4000 = 16384 -> 0.5, split across two calls
        decode_pcm16(&mut carry, &[0x00, 0x00, 0x00], &mut out);
        assert_eq!(out, vec![0.0]);
        assert_eq!(carry, Some(0x00));

        decode_pcm16(&mut carry, &[0x40, 0x00, 0x80], &mut out);
        assert_eq!(out, vec![0.0, 0.5, -1.0]);
        assert_eq!(carry, None);
    }

    #[test]
    fn test_decode_pcm16_empty_keeps_carry() {
        let mut carry = Some(0x12);
        let mut out = Vec::new();
        decode_pcm16(&mut carry, &[], &mut out);
        assert!(out.is_empty());
        assert_eq!(carry, Some(0x12));
    }
}
