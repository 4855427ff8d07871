//! Audio subsystem: chunk buffering, the pull feed, and players

pub mod buffer;
pub mod feed;
pub mod playback;

#[cfg(feature = "cpal-output")]
pub mod device;
#[cfg(feature = "cpal-output")]
pub mod pcm;

pub use buffer::{ChunkBuffer, PopResult, PushOutcome, SharedChunkBuffer};
pub use feed::StreamingFeed;
pub use playback::{PipePlayer, PipePlayerFactory, Player, PlayerFactory};
