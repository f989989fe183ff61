//! Encoder sinks: WebM/Opus for padded tracks, MP3 (libmp3lame) for the mix.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use mp3lame_encoder::{Bitrate, Builder, FlushNoGap, InterleavedPcm, Quality};
use webm::mux::{AudioCodecId, SegmentBuilder, Writer};

use crate::frame::{f32_to_i16, AudioFrame};
use crate::opus::OpusEncoder;
use crate::{AudioError, OPUS_FRAME_SAMPLES, OPUS_SAMPLE_RATE};

/// Opus codec lookahead at 48 kHz, written to the OpusHead `pre_skip` field
/// so decoders trim the encoder delay.
const OPUS_PRESKIP_SAMPLES: u16 = 312;

const OPUS_FRAME_NS: u64 = 20_000_000;

/// OpusHead CodecPrivate: same byte layout as the Ogg ID header.
fn opus_head_codec_private(sample_rate: u32, channels: u8) -> [u8; 19] {
    let mut head = [0u8; 19];
    head[0..8].copy_from_slice(b"OpusHead");
    head[8] = 1; // version
    head[9] = channels;
    head[10..12].copy_from_slice(&OPUS_PRESKIP_SAMPLES.to_le_bytes());
    head[12..16].copy_from_slice(&sample_rate.to_le_bytes());
    head[16..18].copy_from_slice(&0i16.to_le_bytes()); // output gain
    head[18] = 0; // channel mapping family 0
    head
}

/// Streams stereo PCM into a WebM/Opus file in 20 ms packets.
pub struct WebmOpusWriter {
    segment: webm::mux::Segment<Writer<File>>,
    track: webm::mux::AudioTrack,
    encoder: OpusEncoder,
    pcm_pending: Vec<f32>,
    timestamp_ns: u64,
}

impl WebmOpusWriter {
    pub fn create(path: &Path) -> Result<Self, AudioError> {
        Self::create_with_start(path, 0)
    }

    /// Create a writer whose first block lands at `start_ns` instead of 0,
    /// the layout platforms use for tracks that joined a meeting late.
    pub fn create_with_start(path: &Path, start_ns: u64) -> Result<Self, AudioError> {
        let file = File::create(path)?;
        let writer = Writer::new(file);
        let builder = SegmentBuilder::new(writer)
            .map_err(|e| AudioError::Encode(format!("webm segment: {e:?}")))?;
        let (builder, track) = builder
            .add_audio_track(OPUS_SAMPLE_RATE, 2, AudioCodecId::Opus, None)
            .map_err(|e| AudioError::Encode(format!("webm audio track: {e:?}")))?;
        let private = opus_head_codec_private(OPUS_SAMPLE_RATE, 2);
        let builder = builder
            .set_codec_private(track, &private)
            .map_err(|e| AudioError::Encode(format!("webm codec private: {e:?}")))?;

        Ok(Self {
            segment: builder.build(),
            track,
            encoder: OpusEncoder::new()?,
            pcm_pending: Vec::with_capacity(OPUS_FRAME_SAMPLES * 4),
            timestamp_ns: start_ns,
        })
    }

    pub fn push(&mut self, frame: &AudioFrame) -> Result<(), AudioError> {
        if frame.rate != OPUS_SAMPLE_RATE {
            return Err(AudioError::Encode(format!(
                "opus writer requires {} Hz input, got {}",
                OPUS_SAMPLE_RATE, frame.rate
            )));
        }
        self.pcm_pending.extend_from_slice(&frame.samples);
        self.drain_full_frames()
    }

    fn drain_full_frames(&mut self) -> Result<(), AudioError> {
        let frame_len = OPUS_FRAME_SAMPLES * 2;
        while self.pcm_pending.len() >= frame_len {
            let pcm: Vec<f32> = self.pcm_pending.drain(..frame_len).collect();
            let packet = self.encoder.encode_frame(&pcm)?;
            self.segment
                .add_frame(self.track, &packet, self.timestamp_ns, true)
                .map_err(|e| AudioError::Encode(format!("webm add_frame: {e:?}")))?;
            self.timestamp_ns += OPUS_FRAME_NS;
        }
        Ok(())
    }

    /// Pad the final partial frame with silence, encode it, and finalize the
    /// container.
    pub fn finish(mut self) -> Result<(), AudioError> {
        if !self.pcm_pending.is_empty() {
            self.pcm_pending.resize(OPUS_FRAME_SAMPLES * 2, 0.0);
            self.drain_full_frames()?;
        }
        self.segment
            .finalize(None)
            .map_err(|e| AudioError::Encode(format!("webm finalize: {e:?}")))?;
        Ok(())
    }
}

/// Streams stereo PCM into an MP3 file and tracks the encoded duration.
pub struct Mp3Writer {
    encoder: mp3lame_encoder::Encoder,
    file: File,
    rate: u32,
    total_frames: u64,
    scratch: Vec<u8>,
}

impl Mp3Writer {
    pub fn create(path: &Path, rate: u32) -> Result<Self, AudioError> {
        let mut builder =
            Builder::new().ok_or_else(|| AudioError::Encode("lame init failed".to_string()))?;
        builder
            .set_num_channels(2)
            .map_err(|e| AudioError::Encode(format!("lame channels: {e:?}")))?;
        builder
            .set_sample_rate(rate)
            .map_err(|e| AudioError::Encode(format!("lame sample rate: {e:?}")))?;
        builder
            .set_brate(Bitrate::Kbps192)
            .map_err(|e| AudioError::Encode(format!("lame bitrate: {e:?}")))?;
        builder
            .set_quality(Quality::Good)
            .map_err(|e| AudioError::Encode(format!("lame quality: {e:?}")))?;
        let encoder = builder
            .build()
            .map_err(|e| AudioError::Encode(format!("lame build: {e:?}")))?;

        Ok(Self {
            encoder,
            file: File::create(path)?,
            rate,
            total_frames: 0,
            scratch: Vec::new(),
        })
    }

    pub fn push(&mut self, frame: &AudioFrame) -> Result<(), AudioError> {
        if frame.rate != self.rate {
            return Err(AudioError::Encode(format!(
                "mp3 writer configured for {} Hz, got {}",
                self.rate, frame.rate
            )));
        }
        let pcm = f32_to_i16(&frame.samples);
        self.scratch.clear();
        self.scratch
            .reserve(mp3lame_encoder::max_required_buffer_size(pcm.len() / 2));
        self.encoder
            .encode_to_vec(InterleavedPcm(&pcm), &mut self.scratch)
            .map_err(|e| AudioError::Encode(format!("lame encode: {e:?}")))?;
        self.file.write_all(&self.scratch)?;
        self.total_frames += frame.len_frames() as u64;
        Ok(())
    }

    /// Flush the encoder and return the encoded duration in milliseconds,
    /// rounded to two decimals.
    pub fn finish(mut self) -> Result<f64, AudioError> {
        self.scratch.clear();
        self.encoder
            .flush_to_vec::<FlushNoGap>(&mut self.scratch)
            .map_err(|e| AudioError::Encode(format!("lame flush: {e:?}")))?;
        self.file.write_all(&self.scratch)?;
        self.file.flush()?;

        let duration_ms = self.total_frames as f64 / self.rate as f64 * 1000.0;
        Ok((duration_ms * 100.0).round() / 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opus_head_layout() {
        let head = opus_head_codec_private(48_000, 2);
        assert_eq!(&head[0..8], b"OpusHead");
        assert_eq!(head[8], 1);
        assert_eq!(head[9], 2);
        assert_eq!(u16::from_le_bytes([head[10], head[11]]), OPUS_PRESKIP_SAMPLES);
        assert_eq!(u32::from_le_bytes([head[12], head[13], head[14], head[15]]), 48_000);
    }

    #[test]
    fn test_mp3_duration_accounting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mp3");
        let mut writer = Mp3Writer::create(&path, 48_000).unwrap();
        // 1.5 s of silence in three pushes.
        for _ in 0..3 {
            writer.push(&AudioFrame::silence(0.5, 48_000)).unwrap();
        }
        let duration = writer.finish().unwrap();
        assert!((duration - 1500.0).abs() < 1.0, "duration={duration}");
        assert!(path.metadata().unwrap().len() > 0);
    }

    #[test]
    fn test_webm_writer_produces_container() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.webm");
        let mut writer = WebmOpusWriter::create(&path).unwrap();
        writer.push(&AudioFrame::silence(0.1, 48_000)).unwrap();
        writer.finish().unwrap();
        let bytes = std::fs::read(&path).unwrap();
        // EBML magic.
        assert_eq!(&bytes[0..4], &[0x1A, 0x45, 0xDF, 0xA3]);
    }
}
