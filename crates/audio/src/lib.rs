//! Audio primitives for the multitrack pipeline.
//!
//! Everything here is synchronous and CPU-bound; callers run it on worker
//! threads (`spawn_blocking`). The filter topology is modeled as an immutable
//! [`FilterGraph`] value configured before decoding starts, then driven by a
//! decoder-pull loop — there is no ambient codec state.

mod codec;
mod decode;
mod encode;
mod frame;
mod graph;
mod opus;
mod waveform;

pub use codec::{detect_sample_rate, mix, pad_with_silence, MixOutput};
pub use decode::MediaInput;
pub use encode::{Mp3Writer, WebmOpusWriter};
pub use frame::AudioFrame;
pub use graph::{FilterGraph, GraphDriver, StreamResampler};
pub use waveform::waveform_from_file;

/// Opus operates at 48 kHz; every decoded or encoded Opus stream in this
/// crate is normalized to this rate.
pub const OPUS_SAMPLE_RATE: u32 = 48_000;

/// 20 ms Opus frames at 48 kHz.
pub const OPUS_FRAME_SAMPLES: usize = 960;

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("no decodable audio frames in any source")]
    NoDecodableAudio,
    #[error("source has no audio stream metadata: {0}")]
    MissingStreamMetadata(String),
    #[error("unsupported media: {0}")]
    Unsupported(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("source fetch failed: {0}")]
    Fetch(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
