//! The pipeline-facing operations: sample-rate probing, padding, mixdown.

use std::path::Path;

use crate::decode::MediaInput;
use crate::encode::{Mp3Writer, WebmOpusWriter};
use crate::frame::AudioFrame;
use crate::graph::{FilterGraph, StreamResampler};
use crate::{AudioError, OPUS_SAMPLE_RATE};

const PULL_FRAMES: usize = 4096;

/// Probe each source's first decodable frame; first found rate wins.
pub fn detect_sample_rate(sources: &[String]) -> Option<u32> {
    for source in sources {
        match MediaInput::open(source) {
            Ok(input) => return Some(input.sample_rate()),
            Err(e) => {
                tracing::warn!(source = %source, error = %e, "sample rate probe failed");
            }
        }
    }
    None
}

/// Transcode `input` into a WebM/Opus file prepending `offset_s` of stereo
/// silence, streaming frame by frame. The chain is the single-input graph
/// `abuffer → adelay → aformat → opus`.
pub fn pad_with_silence(
    input: &mut MediaInput,
    output: &Path,
    offset_s: f64,
) -> Result<(), AudioError> {
    let graph = FilterGraph::pad(OPUS_SAMPLE_RATE, offset_s);
    let mut driver = graph.driver();
    let mut resampler = StreamResampler::new(input.sample_rate(), OPUS_SAMPLE_RATE)?;
    let mut writer = WebmOpusWriter::create(output)?;
    let source_rate = input.sample_rate();

    loop {
        match input.next_frame()? {
            Some(frame) => {
                if frame.rate != source_rate {
                    return Err(AudioError::Unsupported(format!(
                        "mid-stream rate change {} -> {}",
                        source_rate, frame.rate
                    )));
                }
                let resampled = resampler.process(&frame.samples)?;
                if !resampled.is_empty() {
                    driver.push(0, &AudioFrame::new(resampled, OPUS_SAMPLE_RATE))?;
                }
            }
            None => {
                let tail = resampler.flush()?;
                if !tail.is_empty() {
                    driver.push(0, &AudioFrame::new(tail, OPUS_SAMPLE_RATE))?;
                }
                driver.push_eof(0);
                break;
            }
        }
        while let Some(chunk) = driver.pull(PULL_FRAMES) {
            writer.push(&chunk)?;
        }
    }
    while let Some(chunk) = driver.pull(PULL_FRAMES) {
        writer.push(&chunk)?;
    }
    writer.finish()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MixOutput {
    /// Encoded duration in milliseconds, rounded to two decimals.
    pub duration_ms: f64,
    pub tracks_mixed: usize,
}

/// Mix `sources` into a single MP3 at `target_rate`.
///
/// Builds `N×abuffer [→ adelay] → amix(normalize=0) → aformat → sink`, pulls
/// one frame per active decoder round-robin, resamples per input, and drains
/// mixed output into the encoder as it becomes available. Sources that fail
/// to open are logged and skipped; if none open, fails with
/// `NoDecodableAudio`.
pub fn mix(
    sources: &[String],
    output: &Path,
    target_rate: u32,
    offsets_s: Option<&[f64]>,
) -> Result<MixOutput, AudioError> {
    let mut inputs: Vec<MediaInput> = Vec::new();
    let mut delays: Vec<f64> = Vec::new();
    for (idx, source) in sources.iter().enumerate() {
        match MediaInput::open(source) {
            Ok(input) => {
                inputs.push(input);
                delays.push(offsets_s.and_then(|o| o.get(idx)).copied().unwrap_or(0.0));
            }
            Err(e) => {
                tracing::warn!(source = %source, error = %e, "skipping undecodable mix source");
            }
        }
    }
    if inputs.is_empty() {
        return Err(AudioError::NoDecodableAudio);
    }

    let graph = FilterGraph::mixer(inputs.len(), target_rate).with_delays(delays);
    let mut driver = graph.driver();
    let mut resamplers: Vec<StreamResampler> = inputs
        .iter()
        .map(|input| StreamResampler::new(input.sample_rate(), target_rate))
        .collect::<Result<_, _>>()?;
    let mut active: Vec<bool> = vec![true; inputs.len()];
    let mut writer = Mp3Writer::create(output, target_rate)?;

    while active.iter().any(|&a| a) {
        for i in 0..inputs.len() {
            if !active[i] {
                continue;
            }
            match inputs[i].next_frame() {
                Ok(Some(frame)) => {
                    let resampled = resamplers[i].process(&frame.samples)?;
                    if !resampled.is_empty() {
                        driver.push(i, &AudioFrame::new(resampled, target_rate))?;
                    }
                }
                Ok(None) => {
                    let tail = resamplers[i].flush()?;
                    if !tail.is_empty() {
                        driver.push(i, &AudioFrame::new(tail, target_rate))?;
                    }
                    driver.push_eof(i);
                    active[i] = false;
                }
                Err(e) => {
                    // A mid-stream decode failure ends this input's
                    // contribution; the remaining tracks still mix.
                    tracing::warn!(input = i, error = %e, "mix input failed mid-stream");
                    driver.push_eof(i);
                    active[i] = false;
                }
            }
        }
        while let Some(mixed) = driver.pull(PULL_FRAMES) {
            writer.push(&mixed)?;
        }
    }
    while let Some(mixed) = driver.pull(PULL_FRAMES) {
        writer.push(&mixed)?;
    }

    let duration_ms = writer.finish()?;
    Ok(MixOutput {
        duration_ms,
        tracks_mixed: inputs.len(),
    })
}
