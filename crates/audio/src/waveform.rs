//! Fixed-length waveform extraction for player seek bars.

use std::path::Path;

use crate::decode::MediaInput;
use crate::AudioError;

/// Frames per intermediate peak block; one hour of 48 kHz audio reduces to
/// ~170k block peaks before bucketing, so the full decode never sits in
/// memory.
const BLOCK_FRAMES: usize = 1024;

/// Compute a `segments`-length vector of absolute sample peaks.
pub fn waveform_from_file(path: &Path, segments: usize) -> Result<Vec<f32>, AudioError> {
    let mut input = MediaInput::open(&path.to_string_lossy())?;

    let mut block_peaks: Vec<f32> = Vec::new();
    let mut current_peak = 0.0f32;
    let mut current_len = 0usize;

    while let Some(frame) = input.next_frame()? {
        for pair in frame.samples.chunks_exact(2) {
            let magnitude = pair[0].abs().max(pair[1].abs());
            current_peak = current_peak.max(magnitude);
            current_len += 1;
            if current_len == BLOCK_FRAMES {
                block_peaks.push(current_peak);
                current_peak = 0.0;
                current_len = 0;
            }
        }
    }
    if current_len > 0 {
        block_peaks.push(current_peak);
    }

    Ok(downsample_peaks(&block_peaks, segments))
}

/// Max-pool `peaks` into exactly `segments` buckets.
pub fn downsample_peaks(peaks: &[f32], segments: usize) -> Vec<f32> {
    if segments == 0 {
        return Vec::new();
    }
    let mut out = vec![0.0f32; segments];
    if peaks.is_empty() {
        return out;
    }
    for (bucket, slot) in out.iter_mut().enumerate() {
        let start = bucket * peaks.len() / segments;
        let end = (((bucket + 1) * peaks.len()) / segments).max(start + 1);
        let end = end.min(peaks.len());
        if start < peaks.len() {
            *slot = peaks[start..end]
                .iter()
                .fold(0.0f32, |acc, &p| acc.max(p));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downsample_keeps_peaks() {
        let peaks = vec![0.1, 0.9, 0.2, 0.3, 0.8, 0.1];
        let out = downsample_peaks(&peaks, 2);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], 0.9);
        assert_eq!(out[1], 0.8);
    }

    #[test]
    fn test_downsample_fewer_peaks_than_segments() {
        let out = downsample_peaks(&[0.5], 4);
        assert_eq!(out.len(), 4);
        assert_eq!(out[0], 0.5);
    }

    #[test]
    fn test_empty_input_yields_zeroes() {
        let out = downsample_peaks(&[], 3);
        assert_eq!(out, vec![0.0, 0.0, 0.0]);
    }
}
