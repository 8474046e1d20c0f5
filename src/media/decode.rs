//! Audio open, resampling and sample collection.
//!
//! Opens a local file by content sniffing (WAV, MP3 or Ogg-Vorbis),
//! decodes it with symphonia into stereo frames, and exposes a
//! [`StereoSource`] that the collector drains. Speed changes and the
//! native-rate to 16 kHz conversion happen in one rubato pass.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;

use rayon::prelude::*;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use super::MediaError;

/// The rate every signature is computed at.
pub const TARGET_RATE: u32 = 16_000;

const SNIFF_LEN: usize = 512;
const RESAMPLE_CHUNK: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniffedFormat {
    Wav,
    Mp3,
    OggVorbis,
}

impl SniffedFormat {
    fn extension(self) -> &'static str {
        match self {
            SniffedFormat::Wav => "wav",
            SniffedFormat::Mp3 => "mp3",
            SniffedFormat::OggVorbis => "ogg",
        }
    }
}

/// Content sniffing over the leading bytes. Anything that is not WAV,
/// ID3-tagged MP3 or Ogg is rejected rather than guessed.
pub fn sniff_format(head: &[u8]) -> Option<SniffedFormat> {
    if head.len() >= 12 && &head[..4] == b"RIFF" && &head[8..12] == b"WAVE" {
        Some(SniffedFormat::Wav)
    } else if head.len() >= 3 && &head[..3] == b"ID3" {
        Some(SniffedFormat::Mp3)
    } else if head.len() >= 4 && &head[..4] == b"OggS" {
        Some(SniffedFormat::OggVorbis)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// A pull source of interleaved stereo frames. Returns the number of
/// frames written; zero signals end of stream.
pub trait StereoSource {
    fn stream(&mut self, frames: &mut [[f64; 2]]) -> usize;
}

/// In-memory source over fully decoded (and resampled) frames.
pub struct MemorySource {
    frames: Vec<[f64; 2]>,
    pos: usize,
}

impl MemorySource {
    pub fn new(frames: Vec<[f64; 2]>) -> Self {
        MemorySource { frames, pos: 0 }
    }
}

impl StereoSource for MemorySource {
    fn stream(&mut self, out: &mut [[f64; 2]]) -> usize {
        let n = out.len().min(self.frames.len() - self.pos);
        out[..n].copy_from_slice(&self.frames[self.pos..self.pos + n]);
        self.pos += n;
        n
    }
}

/// Open a local track: sniff, decode, normalize to stereo frames at the
/// file's native rate.
pub fn open_track(path: &Path) -> Result<(Vec<[f64; 2]>, u32), MediaError> {
    let mut file = File::open(path)?;
    let mut head = [0u8; SNIFF_LEN];
    let mut filled = 0;
    while filled < SNIFF_LEN {
        let n = file.read(&mut head[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    let format = sniff_format(&head[..filled])
        .ok_or_else(|| MediaError::Unsupported(format!("{}", path.display())))?;
    file.seek(SeekFrom::Start(0))?;

    let (samples, rate, channels) = decode_audio(file, format)?;
    if channels == 0 {
        return Err(MediaError::Unsupported("stream has no channels".to_string()));
    }
    // Interleaved -> stereo frames; mono is duplicated into both channels.
    let frames = samples
        .par_chunks(channels)
        .map(|frame| match frame {
            [s] => [*s as f64, *s as f64],
            [l, r, ..] => [*l as f64, *r as f64],
            [] => [0.0, 0.0],
        })
        .collect();
    Ok((frames, rate))
}

fn decode_audio(file: File, sniffed: SniffedFormat) -> Result<(Vec<f32>, u32, usize), MediaError> {
    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let mut hint = Hint::new();
    hint.with_extension(sniffed.extension());

    let probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| MediaError::Unsupported("no audio track".to_string()))?;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| MediaError::Unsupported("unknown sample rate".to_string()))?;
    let channels = track
        .codec_params
        .channels
        .map(|c| c.count())
        .ok_or_else(|| MediaError::Unsupported("unknown channel layout".to_string()))?;
    let track_id = track.id;
    let mut decoder =
        symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

    let mut samples = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(_) => break,
        };
        if packet.track_id() != track_id {
            continue;
        }
        // Skip undecodable packets instead of giving up on the track.
        let Ok(decoded) = decoder.decode(&packet) else {
            continue;
        };
        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
        buffer.copy_interleaved_ref(decoded);
        samples.extend_from_slice(buffer.samples());
    }

    Ok((samples, sample_rate, channels))
}

/// Wrap decoded frames in a source whose effective rate is 16 kHz after
/// applying `speed`: the combined conversion ratio is
/// `speed * native_rate / 16000`.
pub fn resampled_source(
    frames: Vec<[f64; 2]>,
    native_rate: u32,
    speed: f64,
) -> Result<MemorySource, MediaError> {
    let combined = speed * native_rate as f64 / TARGET_RATE as f64;
    if (combined - 1.0).abs() < 1e-9 {
        return Ok(MemorySource::new(frames));
    }

    let params = SincInterpolationParameters {
        sinc_len: 128,
        f_cutoff: 0.95,
        oversampling_factor: 64,
        interpolation: SincInterpolationType::Linear,
        window: WindowFunction::BlackmanHarris2,
    };
    let mut resampler = SincFixedIn::<f64>::new(1.0 / combined, 2.0, params, RESAMPLE_CHUNK, 2)
        .map_err(|e| MediaError::Resample(e.to_string()))?;

    let mut output = Vec::with_capacity((frames.len() as f64 / combined) as usize + RESAMPLE_CHUNK);
    let push_frames = |chunks: &[Vec<f64>], output: &mut Vec<[f64; 2]>| {
        for (&l, &r) in chunks[0].iter().zip(&chunks[1]) {
            output.push([l, r]);
        }
    };

    let mut position = 0;
    let mut input = [vec![0.0; RESAMPLE_CHUNK], vec![0.0; RESAMPLE_CHUNK]];
    while position + RESAMPLE_CHUNK <= frames.len() {
        for (i, frame) in frames[position..position + RESAMPLE_CHUNK].iter().enumerate() {
            input[0][i] = frame[0];
            input[1][i] = frame[1];
        }
        let out = resampler
            .process(&input, None)
            .map_err(|e| MediaError::Resample(e.to_string()))?;
        push_frames(&out, &mut output);
        position += RESAMPLE_CHUNK;
    }
    let remaining = frames.len() - position;
    if remaining > 0 {
        input[0].fill(0.0);
        input[1].fill(0.0);
        for (i, frame) in frames[position..].iter().enumerate() {
            input[0][i] = frame[0];
            input[1][i] = frame[1];
        }
        let out = resampler
            .process(&input, None)
            .map_err(|e| MediaError::Resample(e.to_string()))?;
        push_frames(&out, &mut output);
    }
    Ok(MemorySource::new(output))
}

fn frames_in(sample_rate: u32, d: Duration) -> usize {
    (sample_rate as u128 * d.as_nanos() / 1_000_000_000) as usize
}

/// Advance `source` past `offset` and collect `duration` worth of frames,
/// averaged to mono. A source that ends early simply yields fewer
/// samples; this never fails.
pub fn collect_sample(
    source: &mut dyn StereoSource,
    format: &StreamFormat,
    offset: Duration,
    duration: Duration,
) -> Vec<f64> {
    debug_assert_eq!(format.channels, 2, "collector consumes stereo sources");
    let mut buf = vec![[0.0f64; 2]; format.sample_rate.max(1) as usize];

    let mut rem = frames_in(format.sample_rate, offset);
    while rem > 0 {
        let want = rem.min(buf.len());
        let got = source.stream(&mut buf[..want]);
        if got == 0 {
            break;
        }
        rem -= got;
    }

    let mut rem = frames_in(format.sample_rate, duration);
    let mut mono = Vec::with_capacity(rem);
    while rem > 0 {
        let want = rem.min(buf.len());
        let got = source.stream(&mut buf[..want]);
        if got == 0 {
            break;
        }
        for frame in &buf[..got] {
            mono.push((frame[0] + frame[1]) / 2.0);
        }
        rem -= got;
    }
    mono
}
