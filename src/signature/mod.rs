//! Acoustic signature pipeline.
//!
//! Wires peak extraction and the binary container format together: a
//! `Signature` is the banded peak table that fingerprints a short audio
//! clip, `compute` produces one from mono samples and `codec` maps it to
//! and from the wire format understood by the identification service.

pub mod codec;
pub mod compute;

pub use codec::CodecError;
pub use compute::compute_signature;

/// A spectral peak detected during one FFT pass.
///
/// `bin` carries sub-bin precision: the raw FFT bin multiplied by 64 plus
/// the interpolated variation, so it ranges over `[10*64, 1015*64]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrequencyPeak {
    pub pass: u32,
    pub magnitude: u16,
    pub bin: u16,
}

pub const NUM_BANDS: usize = 5;

/// Banded peak table plus the metadata needed to reconstruct timing.
///
/// Within each band, peaks appear in non-decreasing `pass` order. Band 4
/// is reserved by the container format and never populated by the
/// extractor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signature {
    pub sample_rate: u32,
    pub num_samples: u32,
    pub peaks_by_band: [Vec<FrequencyPeak>; NUM_BANDS],
}

/// Wire codes for the closed set of supported sample rates.
pub(crate) fn rate_code(sample_rate: u32) -> Option<u32> {
    match sample_rate {
        8_000 => Some(1),
        11_025 => Some(2),
        16_000 => Some(3),
        32_000 => Some(4),
        44_100 => Some(5),
        _ => None,
    }
}

pub(crate) fn rate_from_code(code: u32) -> Option<u32> {
    match code {
        1 => Some(8_000),
        2 => Some(11_025),
        3 => Some(16_000),
        4 => Some(32_000),
        5 => Some(44_100),
        _ => None,
    }
}

/// Buckets a peak frequency into one of the four populated bands.
/// Peaks outside 250 Hz..=5.5 kHz are discarded.
pub(crate) fn band_for_hz(hz: i64) -> Option<usize> {
    match hz {
        250..=519 => Some(0),
        520..=1449 => Some(1),
        1450..=3499 => Some(2),
        3500..=5500 => Some(3),
        _ => None,
    }
}
