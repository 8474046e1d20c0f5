//! Probe identification glue.
//!
//! Ties the media layer, the signature builder and the remote client
//! together: one probe opens the track, shifts it to the probe's speed at
//! 16 kHz, collects a 12 s clip and asks the service what it is.

pub mod client;
pub mod driver;

use std::path::Path;
use std::time::Duration;

use crate::media::decode::{self, StreamFormat};
use crate::media::MediaError;
use crate::signature::{compute_signature, Signature};

pub use client::{IdentifyService, NetworkError, ShazamClient, TrackMatch};
pub use driver::TrackIdentifier;

/// Length of the clip submitted per probe.
pub const SAMPLE_WINDOW: Duration = Duration::from_secs(12);

/// One probe's coordinates: a playback speed ratio and the offset the
/// clip is collected at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IdentifyParams {
    pub ratio: f64,
    pub offset: Duration,
}

/// The outcome of one probe. `skew` normalizes the service's reported
/// time-skew into `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentifyResult {
    pub params: IdentifyParams,
    pub result: TrackMatch,
    pub skew: f64,
}

/// Run one probe against a local track file.
///
/// The decode/resample/signature stages are CPU-bound and run off the
/// async runtime.
pub async fn identify_path(
    service: &(impl IdentifyService + ?Sized),
    path: &Path,
    params: IdentifyParams,
) -> anyhow::Result<IdentifyResult> {
    let owned = path.to_path_buf();
    let sig = tokio::task::spawn_blocking(move || -> Result<Signature, MediaError> {
        let (frames, native_rate) = decode::open_track(&owned)?;
        let mut source = decode::resampled_source(frames, native_rate, params.ratio)?;
        let format = StreamFormat {
            sample_rate: decode::TARGET_RATE,
            channels: 2,
        };
        let mono = decode::collect_sample(&mut source, &format, params.offset, SAMPLE_WINDOW);
        Ok(compute_signature(decode::TARGET_RATE, &mono))
    })
    .await??;

    let result = service.identify(&sig).await?;
    let skew = normalized_skew(result.skew);
    Ok(IdentifyResult { params, result, skew })
}

fn normalized_skew(reported: f64) -> f64 {
    (10.0 * reported.abs()).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn skew_normalization() {
        assert_eq!(normalized_skew(0.0), 0.0);
        assert!((normalized_skew(0.02) - 0.2).abs() < 1e-12);
        assert!((normalized_skew(-0.05) - 0.5).abs() < 1e-12);
        assert_eq!(normalized_skew(0.3), 1.0);
        assert_eq!(normalized_skew(-2.0), 1.0);
    }

    /// Canned service capturing the signatures it is asked about.
    struct MockService {
        captured: std::sync::Mutex<Vec<Signature>>,
        response: TrackMatch,
    }

    #[async_trait::async_trait]
    impl IdentifyService for MockService {
        async fn identify(&self, sig: &Signature) -> anyhow::Result<TrackMatch> {
            self.captured.lock().unwrap().push(sig.clone());
            Ok(self.response.clone())
        }
    }

    /// Write a 16 kHz stereo s16 PCM WAV carrying gated 440 Hz bursts
    /// (the recognizer keys on onsets, so sustained tones emit nothing).
    fn write_test_wav(name: &str, seconds: u32) -> PathBuf {
        let rate = 16_000u32;
        let frames = rate * seconds;
        let data_len = frames * 4;

        let mut wav = Vec::with_capacity(44 + data_len as usize);
        wav.extend_from_slice(b"RIFF");
        wav.extend_from_slice(&(36 + data_len).to_le_bytes());
        wav.extend_from_slice(b"WAVE");
        wav.extend_from_slice(b"fmt ");
        wav.extend_from_slice(&16u32.to_le_bytes());
        wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
        wav.extend_from_slice(&2u16.to_le_bytes()); // stereo
        wav.extend_from_slice(&rate.to_le_bytes());
        wav.extend_from_slice(&(rate * 4).to_le_bytes());
        wav.extend_from_slice(&4u16.to_le_bytes());
        wav.extend_from_slice(&16u16.to_le_bytes());
        wav.extend_from_slice(b"data");
        wav.extend_from_slice(&data_len.to_le_bytes());
        for i in 0..frames {
            let s = if i % 7168 < 1024 {
                let t = i as f64 / rate as f64;
                ((2.0 * std::f64::consts::PI * 440.0 * t).sin() * 0.5 * 32767.0) as i16
            } else {
                0
            };
            wav.extend_from_slice(&s.to_le_bytes());
            wav.extend_from_slice(&s.to_le_bytes());
        }

        let path = std::env::temp_dir().join(name);
        std::fs::write(&path, wav).unwrap();
        path
    }

    #[tokio::test]
    async fn identify_path_runs_the_full_pipeline() {
        let path = write_test_wav("samplehound_pipeline_test.wav", 2);
        let service = MockService {
            captured: std::sync::Mutex::new(Vec::new()),
            response: TrackMatch {
                found: true,
                skew: 0.05,
                artist: "A".to_string(),
                title: "T".to_string(),
                ..Default::default()
            },
        };

        let params = IdentifyParams { ratio: 1.0, offset: Duration::ZERO };
        let res = identify_path(&service, &path, params).await.unwrap();
        assert!(res.result.found);
        assert_eq!(res.params, params);
        assert!((res.skew - 0.5).abs() < 1e-12, "0.05 reported skew normalizes to 0.5");

        let sigs = service.captured.lock().unwrap();
        assert_eq!(sigs.len(), 1);
        assert_eq!(sigs[0].sample_rate, decode::TARGET_RATE);
        // The 2 s source ends well before the 12 s window.
        assert_eq!(sigs[0].num_samples, 2 * decode::TARGET_RATE);
        assert!(sigs[0].peaks_by_band.iter().any(|band| !band.is_empty()));

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn identify_path_with_offset_past_the_end() {
        let path = write_test_wav("samplehound_offset_test.wav", 2);
        let service = MockService {
            captured: std::sync::Mutex::new(Vec::new()),
            response: TrackMatch::default(),
        };

        let params = IdentifyParams { ratio: 1.2, offset: Duration::from_secs(24) };
        let res = identify_path(&service, &path, params).await.unwrap();
        assert!(!res.result.found);
        assert_eq!(res.skew, 0.0);

        // Speed-shifting consumed the whole stream before the offset, so
        // the service saw a valid but empty signature.
        let sigs = service.captured.lock().unwrap();
        assert_eq!(sigs[0].num_samples, 0);
        assert!(sigs[0].peaks_by_band.iter().all(|band| band.is_empty()));

        std::fs::remove_file(&path).unwrap();
    }
}
