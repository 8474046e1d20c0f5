//! Speed-sweep search driver.
//!
//! Walks a fixed queue of (speed ratio, offset) probes against one track
//! and declares the sample identified once three probes agree on the same
//! artist and title. Ratios are ordered by vaporwave/future-funk priors:
//! the typical slowdown sits just above 1.0, so the highest-yield ratios
//! come first.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{IdentifyParams, IdentifyResult};

pub const RATIOS: [f64; 15] = [
    1.20, 1.30, 1.10, 1.25, 1.15, 1.40, 1.50, 0.90, 0.80, 1.60, 1.70, 1.80, 1.90, 2.00, 1.00,
];

pub const OFFSETS: [Duration; 3] = [
    Duration::from_secs(24),
    Duration::from_secs(48),
    Duration::from_secs(72),
];

/// Matches that must agree on (artist, title) before the search stops.
const AGREEMENT: usize = 3;

/// Per-track search state. Advanced one `handle_result` step at a time by
/// its owning loop; never errors, only runs out of probes.
pub struct TrackIdentifier {
    pub path: PathBuf,
    params: VecDeque<IdentifyParams>,
    results: Vec<IdentifyResult>,
    pub sample: Option<IdentifyResult>,
}

impl TrackIdentifier {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let params = RATIOS
            .iter()
            .flat_map(|&ratio| OFFSETS.iter().map(move |&offset| IdentifyParams { ratio, offset }))
            .collect();
        TrackIdentifier {
            path: path.as_ref().to_path_buf(),
            params,
            results: Vec::new(),
            sample: None,
        }
    }

    /// The probe to try next.
    pub fn current_params(&self) -> IdentifyParams {
        self.params[0]
    }

    /// Every match observed so far, in arrival order.
    pub fn results(&self) -> &[IdentifyResult] {
        &self.results
    }

    /// Apply one probe result and return the next probe, or `None` when
    /// the search has terminated (either with `sample` set or with the
    /// queue exhausted).
    pub fn handle_result(&mut self, r: IdentifyResult) -> Option<IdentifyParams> {
        if !r.result.found {
            // A miss rules out the whole offset triple at this ratio.
            while self.params.len() > 1 && self.params[0].ratio == r.params.ratio {
                self.params.pop_front();
            }
        } else {
            self.results.push(r.clone());
            let hits = self
                .results
                .iter()
                .filter(|prev| {
                    prev.result.artist == r.result.artist && prev.result.title == r.result.title
                })
                .count();
            if hits == AGREEMENT {
                self.sample = Some(r);
                return None;
            }
        }

        if self.params.len() == 1 {
            return None;
        }
        self.params.pop_front();
        Some(self.params[0])
    }
}
