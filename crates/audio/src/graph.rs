//! Filter topology as data.
//!
//! A [`FilterGraph`] is the immutable description of an
//! `N×abuffer [→ adelay] → amix → aformat → abuffersink` chain; a
//! [`GraphDriver`] is its run state, fed by a decoder-pull loop. Inputs are
//! pushed already resampled to the graph rate ([`StreamResampler`] does the
//! per-input conversion), mirroring how the mixdown resamples per input
//! before the mixer.

use std::collections::VecDeque;

use rubato::{
    InterpolationParameters, InterpolationType, Resampler, SincFixedIn, WindowFunction,
};

use crate::frame::AudioFrame;
use crate::AudioError;

/// Immutable graph description. `delays_s[i]` is the leading silence inserted
/// on input `i` (the `adelay` node); `normalize=false` keeps `amix` as a
/// plain sum, matching `amix=normalize=0`.
#[derive(Debug, Clone)]
pub struct FilterGraph {
    inputs: usize,
    delays_s: Vec<f64>,
    rate: u32,
    normalize: bool,
}

impl FilterGraph {
    pub fn mixer(inputs: usize, rate: u32) -> Self {
        Self {
            inputs,
            delays_s: vec![0.0; inputs],
            rate,
            normalize: false,
        }
    }

    /// Single-input chain used by the padding path.
    pub fn pad(rate: u32, delay_s: f64) -> Self {
        Self {
            inputs: 1,
            delays_s: vec![delay_s.max(0.0)],
            rate,
            normalize: false,
        }
    }

    pub fn with_delays(mut self, delays_s: Vec<f64>) -> Self {
        debug_assert_eq!(delays_s.len(), self.inputs);
        self.delays_s = delays_s.into_iter().map(|d| d.max(0.0)).collect();
        self
    }

    pub fn inputs(&self) -> usize {
        self.inputs
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn driver(&self) -> GraphDriver {
        GraphDriver::new(self.clone())
    }
}

/// Run state of a configured graph.
pub struct GraphDriver {
    graph: FilterGraph,
    queues: Vec<VecDeque<f32>>,
    eof: Vec<bool>,
}

impl GraphDriver {
    fn new(graph: FilterGraph) -> Self {
        let queues = graph
            .delays_s
            .iter()
            .map(|&delay| {
                let silence_frames = (delay * graph.rate as f64).round() as usize;
                let mut q = VecDeque::with_capacity(silence_frames * 2);
                q.extend(std::iter::repeat(0.0f32).take(silence_frames * 2));
                q
            })
            .collect();
        let eof = vec![false; graph.inputs];
        Self { graph, queues, eof }
    }

    /// Push one decoded frame into input `i`. The frame must already be at
    /// the graph rate.
    pub fn push(&mut self, input: usize, frame: &AudioFrame) -> Result<(), AudioError> {
        if frame.rate != self.graph.rate {
            return Err(AudioError::Unsupported(format!(
                "input {} pushed at {} Hz into a {} Hz graph",
                input, frame.rate, self.graph.rate
            )));
        }
        self.queues[input].extend(frame.samples.iter().copied());
        Ok(())
    }

    /// Signal end of stream for input `i`; remaining queued samples still mix.
    pub fn push_eof(&mut self, input: usize) {
        self.eof[input] = true;
    }

    /// Number of mixed sample frames ready to pull without waiting on any
    /// still-active input.
    fn available_frames(&self) -> usize {
        let active: Vec<usize> = (0..self.graph.inputs)
            .filter(|&i| !self.eof[i])
            .collect();
        if active.is_empty() {
            // Drain: longest remaining queue defines the mix length.
            self.queues.iter().map(|q| q.len() / 2).max().unwrap_or(0)
        } else {
            active
                .iter()
                .map(|&i| self.queues[i].len() / 2)
                .min()
                .unwrap_or(0)
        }
    }

    /// Pull up to `max_frames` mixed sample frames, or `None` when nothing is
    /// ready. Exhausted inputs contribute silence until every input ends.
    pub fn pull(&mut self, max_frames: usize) -> Option<AudioFrame> {
        let n = self.available_frames().min(max_frames);
        if n == 0 {
            return None;
        }

        let mut mixed = vec![0.0f32; n * 2];
        for queue in self.queues.iter_mut() {
            for slot in mixed.iter_mut().take(n * 2) {
                match queue.pop_front() {
                    Some(sample) => *slot += sample,
                    None => break,
                }
            }
        }
        if self.graph.normalize && self.graph.inputs > 1 {
            let scale = 1.0 / self.graph.inputs as f32;
            for s in mixed.iter_mut() {
                *s *= scale;
            }
        }
        Some(AudioFrame::new(mixed, self.graph.rate))
    }

    pub fn finished(&self) -> bool {
        self.eof.iter().all(|&e| e) && self.queues.iter().all(|q| q.is_empty())
    }
}

const RESAMPLE_CHUNK: usize = 1024;

/// Streaming per-input resampler. Pass-through when rates already match,
/// sinc interpolation otherwise.
pub struct StreamResampler {
    from: u32,
    to: u32,
    inner: Option<SincFixedIn<f32>>,
    pending: [Vec<f32>; 2],
}

impl StreamResampler {
    pub fn new(from: u32, to: u32) -> Result<Self, AudioError> {
        let inner = if from == to {
            None
        } else {
            let params = InterpolationParameters {
                sinc_len: 256,
                f_cutoff: 0.95,
                interpolation: InterpolationType::Linear,
                oversampling_factor: 256,
                window: WindowFunction::BlackmanHarris2,
            };
            let resampler = SincFixedIn::<f32>::new(
                to as f64 / from as f64,
                2.0,
                params,
                RESAMPLE_CHUNK,
                2,
            )
            .map_err(|e| AudioError::Unsupported(format!("resampler init: {e}")))?;
            Some(resampler)
        };
        Ok(Self {
            from,
            to,
            inner,
            pending: [Vec::new(), Vec::new()],
        })
    }

    /// Feed interleaved stereo samples at the source rate; returns whatever
    /// full chunks produced at the target rate.
    pub fn process(&mut self, interleaved: &[f32]) -> Result<Vec<f32>, AudioError> {
        if self.inner.is_none() {
            return Ok(interleaved.to_vec());
        }
        for pair in interleaved.chunks_exact(2) {
            self.pending[0].push(pair[0]);
            self.pending[1].push(pair[1]);
        }
        let mut out = Vec::new();
        while self.pending[0].len() >= RESAMPLE_CHUNK {
            let left: Vec<f32> = self.pending[0].drain(..RESAMPLE_CHUNK).collect();
            let right: Vec<f32> = self.pending[1].drain(..RESAMPLE_CHUNK).collect();
            let Some(resampler) = self.inner.as_mut() else {
                break;
            };
            let chunks = resampler
                .process(&[left, right], None)
                .map_err(|e| AudioError::Decode(format!("resample: {e}")))?;
            out.extend(interleave(&chunks));
        }
        Ok(out)
    }

    /// Drain the tail: the final partial chunk is zero-padded through the
    /// resampler and trimmed back to the expected output length.
    pub fn flush(&mut self) -> Result<Vec<f32>, AudioError> {
        let Some(resampler) = self.inner.as_mut() else {
            return Ok(Vec::new());
        };
        let remaining = self.pending[0].len();
        if remaining == 0 {
            return Ok(Vec::new());
        }
        let expected = (remaining as f64 * self.to as f64 / self.from as f64).round() as usize;
        let mut left = std::mem::take(&mut self.pending[0]);
        let mut right = std::mem::take(&mut self.pending[1]);
        left.resize(RESAMPLE_CHUNK, 0.0);
        right.resize(RESAMPLE_CHUNK, 0.0);
        let chunks = resampler
            .process(&[left, right], None)
            .map_err(|e| AudioError::Decode(format!("resample flush: {e}")))?;
        let mut out = interleave(&chunks);
        out.truncate(expected * 2);
        Ok(out)
    }
}

fn interleave(channels: &[Vec<f32>]) -> Vec<f32> {
    let frames = channels[0].len();
    let mut out = Vec::with_capacity(frames * 2);
    for i in 0..frames {
        out.push(channels[0][i]);
        out.push(channels[1][i]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mix_is_a_plain_sum() {
        let graph = FilterGraph::mixer(2, 48_000);
        let mut driver = graph.driver();
        driver
            .push(0, &AudioFrame::new(vec![0.1, 0.1, 0.2, 0.2], 48_000))
            .unwrap();
        driver
            .push(1, &AudioFrame::new(vec![0.3, 0.3, 0.4, 0.4], 48_000))
            .unwrap();
        driver.push_eof(0);
        driver.push_eof(1);

        let mixed = driver.pull(1024).unwrap();
        let expected = [0.4f32, 0.4, 0.6, 0.6];
        for (got, want) in mixed.samples.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-6);
        }
        assert!(driver.finished());
    }

    #[test]
    fn test_delay_prepends_silence() {
        let graph = FilterGraph::mixer(1, 1000).with_delays(vec![0.002]);
        let mut driver = graph.driver();
        driver
            .push(0, &AudioFrame::new(vec![0.5, 0.5], 1000))
            .unwrap();
        driver.push_eof(0);
        let out = driver.pull(1024).unwrap();
        // 2 ms at 1 kHz = 2 silent frames before the payload frame.
        assert_eq!(out.samples, vec![0.0, 0.0, 0.0, 0.0, 0.5, 0.5]);
    }

    #[test]
    fn test_shorter_input_pads_with_silence() {
        let graph = FilterGraph::mixer(2, 1000);
        let mut driver = graph.driver();
        driver
            .push(0, &AudioFrame::new(vec![0.5, 0.5], 1000))
            .unwrap();
        driver
            .push(1, &AudioFrame::new(vec![0.25, 0.25, 0.25, 0.25], 1000))
            .unwrap();
        driver.push_eof(0);
        driver.push_eof(1);
        let out = driver.pull(1024).unwrap();
        assert_eq!(out.samples, vec![0.75, 0.75, 0.25, 0.25]);
    }

    #[test]
    fn test_pull_waits_for_active_inputs() {
        let graph = FilterGraph::mixer(2, 1000);
        let mut driver = graph.driver();
        driver
            .push(0, &AudioFrame::new(vec![0.5, 0.5], 1000))
            .unwrap();
        // Input 1 is still active with nothing buffered: nothing is ready.
        assert!(driver.pull(1024).is_none());
        driver.push_eof(1);
        assert!(driver.pull(1024).is_some());
    }

    #[test]
    fn test_rejects_wrong_rate_push() {
        let graph = FilterGraph::mixer(1, 48_000);
        let mut driver = graph.driver();
        let err = driver.push(0, &AudioFrame::new(vec![0.0, 0.0], 44_100));
        assert!(err.is_err());
    }

    #[test]
    fn test_resampler_passthrough_at_equal_rates() {
        let mut rs = StreamResampler::new(48_000, 48_000).unwrap();
        let out = rs.process(&[0.1, 0.2, 0.3, 0.4]).unwrap();
        assert_eq!(out, vec![0.1, 0.2, 0.3, 0.4]);
        assert!(rs.flush().unwrap().is_empty());
    }

    #[test]
    fn test_resampler_halves_rate() {
        let mut rs = StreamResampler::new(48_000, 24_000).unwrap();
        let input: Vec<f32> = (0..RESAMPLE_CHUNK * 2).map(|_| 0.25).flat_map(|s| [s, s]).collect();
        let mut produced = rs.process(&input).unwrap();
        produced.extend(rs.flush().unwrap());
        let frames = produced.len() / 2;
        let expected = RESAMPLE_CHUNK; // half of 2 chunks
        assert!((frames as i64 - expected as i64).abs() <= 32, "frames={frames}");
    }
}
