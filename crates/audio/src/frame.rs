//! Decoded PCM frames.

/// Interleaved stereo f32 PCM at a known rate. Decoders normalize channel
/// count to stereo before frames enter a filter graph.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, rate: u32) -> Self {
        Self { samples, rate }
    }

    /// Stereo silence of `duration_s` seconds.
    pub fn silence(duration_s: f64, rate: u32) -> Self {
        let frames = (duration_s * rate as f64).round() as usize;
        Self {
            samples: vec![0.0; frames * 2],
            rate,
        }
    }

    /// Number of sample frames (interleaved pairs).
    pub fn len_frames(&self) -> usize {
        self.samples.len() / 2
    }

    pub fn duration_s(&self) -> f64 {
        self.len_frames() as f64 / self.rate as f64
    }
}

/// Interleave an arbitrary channel count down (or up) to stereo: mono is
/// duplicated, extra channels are dropped.
pub fn to_stereo(samples: &[f32], channels: usize) -> Vec<f32> {
    match channels {
        2 => samples.to_vec(),
        1 => samples.iter().flat_map(|&s| [s, s]).collect(),
        n => samples
            .chunks_exact(n)
            .flat_map(|frame| [frame[0], frame[1]])
            .collect(),
    }
}

/// f32 in [-1, 1] to i16 with clamping.
pub fn f32_to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_frame_count() {
        let frame = AudioFrame::silence(0.5, 48_000);
        assert_eq!(frame.len_frames(), 24_000);
        assert!(frame.samples.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_mono_to_stereo_duplicates() {
        assert_eq!(to_stereo(&[0.1, 0.2], 1), vec![0.1, 0.1, 0.2, 0.2]);
    }

    #[test]
    fn test_multichannel_drops_extras() {
        assert_eq!(to_stereo(&[0.1, 0.2, 0.9, 0.3, 0.4, 0.9], 3), vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn test_f32_to_i16_clamps() {
        let out = f32_to_i16(&[2.0, -2.0, 0.0]);
        assert_eq!(out[0], i16::MAX);
        assert_eq!(out[1], -i16::MAX);
        assert_eq!(out[2], 0);
    }
}
