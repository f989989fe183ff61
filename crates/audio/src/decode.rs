//! Media input: probe, stream metadata, decoded-frame iteration.
//!
//! Sources are local paths or presigned URLs; URL sources are fetched to a
//! tempfile first so demuxing can seek. Opus packets are decoded through
//! libopus (symphonia demuxes the WebM/Matroska container); everything else
//! goes through symphonia's own decoders.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL, CODEC_TYPE_OPUS};
use symphonia::core::errors::Error as SymError;
use symphonia::core::formats::{FormatOptions, FormatReader, Packet};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::TimeBase;

use crate::frame::{to_stereo, AudioFrame};
use crate::opus::OpusDecoder;
use crate::{AudioError, OPUS_SAMPLE_RATE};

enum TrackDecoder {
    Opus(OpusDecoder),
    Native(Box<dyn Decoder>),
}

pub struct MediaInput {
    source: String,
    _download: Option<tempfile::NamedTempFile>,
    format: Box<dyn FormatReader>,
    track_id: u32,
    time_base: Option<TimeBase>,
    decoder: TrackDecoder,
    start_time_s: f64,
    sample_rate: u32,
    pending: Option<AudioFrame>,
    finished: bool,
}

impl MediaInput {
    /// Open a local path or presigned URL and probe the first decodable
    /// frame. Fails with `MissingStreamMetadata` when the container exposes
    /// no audio stream, `NoDecodableAudio` when nothing decodes.
    pub fn open(source: &str) -> Result<Self, AudioError> {
        let (path, download) = if source.starts_with("http://") || source.starts_with("https://") {
            let temp = fetch_to_tempfile(source)?;
            (temp.path().to_path_buf(), Some(temp))
        } else {
            (PathBuf::from(source), None)
        };
        Self::open_path(source, &path, download)
    }

    fn open_path(
        source: &str,
        path: &Path,
        download: Option<tempfile::NamedTempFile>,
    ) -> Result<Self, AudioError> {
        let file = File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| AudioError::Unsupported(format!("{source}: {e}")))?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| AudioError::MissingStreamMetadata(source.to_string()))?;
        let track_id = track.id;
        let time_base = track.codec_params.time_base;

        let decoder = if track.codec_params.codec == CODEC_TYPE_OPUS {
            TrackDecoder::Opus(OpusDecoder::new()?)
        } else {
            let native = symphonia::default::get_codecs()
                .make(&track.codec_params, &DecoderOptions::default())
                .map_err(|e| AudioError::Unsupported(format!("{source}: {e}")))?;
            TrackDecoder::Native(native)
        };

        let mut input = Self {
            source: source.to_string(),
            _download: download,
            format,
            track_id,
            time_base,
            decoder,
            start_time_s: 0.0,
            sample_rate: 0,
            pending: None,
            finished: false,
        };
        input.probe_first_frame()?;
        Ok(input)
    }

    /// Decode until the first frame of our track, recording the stream start
    /// offset (`first packet ts × time_base`) and the decoded rate.
    fn probe_first_frame(&mut self) -> Result<(), AudioError> {
        loop {
            let packet = match self.next_track_packet() {
                Some(p) => p,
                None => return Err(AudioError::NoDecodableAudio),
            };
            let ts = packet.ts();
            match self.decode_packet(&packet) {
                Ok(Some(frame)) => {
                    if let Some(tb) = self.time_base {
                        let time = tb.calc_time(ts);
                        self.start_time_s = (time.seconds as f64 + time.frac).max(0.0);
                    }
                    self.sample_rate = frame.rate;
                    self.pending = Some(frame);
                    return Ok(());
                }
                Ok(None) => continue,
                Err(e) => {
                    tracing::debug!(source = %self.source, error = %e, "skipping undecodable packet");
                    continue;
                }
            }
        }
    }

    fn next_track_packet(&mut self) -> Option<Packet> {
        loop {
            match self.format.next_packet() {
                Ok(packet) if packet.track_id() == self.track_id => return Some(packet),
                Ok(_) => continue,
                Err(SymError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return None
                }
                Err(e) => {
                    tracing::debug!(source = %self.source, error = %e, "demux ended");
                    return None;
                }
            }
        }
    }

    fn decode_packet(&mut self, packet: &Packet) -> Result<Option<AudioFrame>, AudioError> {
        match &mut self.decoder {
            TrackDecoder::Opus(opus) => {
                let samples = opus.decode_packet(packet.buf())?;
                Ok(Some(AudioFrame::new(samples, OPUS_SAMPLE_RATE)))
            }
            TrackDecoder::Native(native) => match native.decode(packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                    buf.copy_interleaved_ref(decoded);
                    let stereo = to_stereo(buf.samples(), spec.channels.count());
                    Ok(Some(AudioFrame::new(stereo, spec.rate)))
                }
                Err(SymError::DecodeError(e)) => {
                    tracing::debug!(source = %self.source, error = %e, "decode error, packet skipped");
                    Ok(None)
                }
                Err(e) => Err(AudioError::Decode(e.to_string())),
            },
        }
    }

    /// Meeting-start offset of this stream in seconds, never negative.
    pub fn start_offset_s(&self) -> f64 {
        self.start_time_s
    }

    /// Rate of the first decoded frame.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Next decoded stereo frame, `None` at end of stream.
    pub fn next_frame(&mut self) -> Result<Option<AudioFrame>, AudioError> {
        if let Some(frame) = self.pending.take() {
            return Ok(Some(frame));
        }
        if self.finished {
            return Ok(None);
        }
        loop {
            let packet = match self.next_track_packet() {
                Some(p) => p,
                None => {
                    self.finished = true;
                    return Ok(None);
                }
            };
            match self.decode_packet(&packet)? {
                Some(frame) => return Ok(Some(frame)),
                None => continue,
            }
        }
    }
}

fn fetch_to_tempfile(url: &str) -> Result<tempfile::NamedTempFile, AudioError> {
    let mut response = reqwest::blocking::get(url)
        .map_err(|e| AudioError::Fetch(e.to_string()))?
        .error_for_status()
        .map_err(|e| AudioError::Fetch(e.to_string()))?;
    let suffix = url
        .rsplit('/')
        .next()
        .and_then(|name| name.split('?').next())
        .and_then(|name| name.rsplit_once('.').map(|(_, ext)| format!(".{ext}")))
        .unwrap_or_else(|| ".bin".to_string());
    let mut temp = tempfile::Builder::new().suffix(&suffix).tempfile()?;
    std::io::copy(&mut response, temp.as_file_mut())?;
    temp.as_file_mut().flush()?;
    Ok(temp)
}
