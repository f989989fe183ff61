//! Thin wrappers over libopus via `audiopus`.

use audiopus::coder;
use audiopus::{Application, Channels, SampleRate};

use crate::{AudioError, OPUS_FRAME_SAMPLES, OPUS_SAMPLE_RATE};

/// Maximum samples per channel in one Opus packet (120 ms at 48 kHz).
const MAX_PACKET_SAMPLES: usize = 5760;

pub struct OpusEncoder {
    inner: coder::Encoder,
    packet_buf: Vec<u8>,
}

impl OpusEncoder {
    pub fn new() -> Result<Self, AudioError> {
        let inner = coder::Encoder::new(SampleRate::Hz48000, Channels::Stereo, Application::Audio)
            .map_err(|e| AudioError::Encode(format!("opus encoder init: {e}")))?;
        Ok(Self {
            inner,
            packet_buf: vec![0u8; 4000],
        })
    }

    /// Encode exactly one 20 ms stereo frame (960 frames, 1920 interleaved
    /// samples). Returns the encoded packet bytes.
    pub fn encode_frame(&mut self, pcm: &[f32]) -> Result<Vec<u8>, AudioError> {
        debug_assert_eq!(pcm.len(), OPUS_FRAME_SAMPLES * 2);
        let written = self
            .inner
            .encode_float(pcm, &mut self.packet_buf[..])
            .map_err(|e| AudioError::Encode(format!("opus encode: {e}")))?;
        Ok(self.packet_buf[..written].to_vec())
    }

    pub fn sample_rate(&self) -> u32 {
        OPUS_SAMPLE_RATE
    }
}

pub struct OpusDecoder {
    inner: coder::Decoder,
    pcm_buf: Vec<f32>,
}

impl OpusDecoder {
    /// Decoding always targets 48 kHz stereo; libopus performs any up/down
    /// mixing from the stream's own layout.
    pub fn new() -> Result<Self, AudioError> {
        let inner = coder::Decoder::new(SampleRate::Hz48000, Channels::Stereo)
            .map_err(|e| AudioError::Decode(format!("opus decoder init: {e}")))?;
        Ok(Self {
            inner,
            pcm_buf: vec![0.0f32; MAX_PACKET_SAMPLES * 2],
        })
    }

    /// Decode one packet to interleaved stereo samples.
    pub fn decode_packet(&mut self, packet: &[u8]) -> Result<Vec<f32>, AudioError> {
        let per_channel = self
            .inner
            .decode_float(Some(packet), &mut self.pcm_buf[..], false)
            .map_err(|e| AudioError::Decode(format!("opus decode: {e}")))?;
        Ok(self.pcm_buf[..per_channel * 2].to_vec())
    }
}
