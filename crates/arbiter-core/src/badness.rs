//! The badness scoring engine.
//!
//! Badness is a bounded per-user score, one axis per resource. Usage above
//! the threshold fraction of the quota grows the axis toward 100; usage
//! below it decays the axis toward 0. Both slopes are linear in the
//! distance from the threshold, scaled so that full overuse reaches 100
//! in `time_to_max_bad` seconds and full idleness reaches 0 in
//! `time_to_min_bad` seconds.

use serde::{Deserialize, Serialize};

/// Scoring knobs threaded in from the configuration.
#[derive(Debug, Clone)]
pub struct ScoreParams {
    /// Fraction of quota above which CPU accrues badness, in (0, 1].
    pub cpu_threshold: f64,
    /// Fraction of quota above which memory accrues badness, in (0, 1].
    pub mem_threshold: f64,
    /// Seconds of sustained usage at quota for a score to reach 100.
    pub time_to_max_bad: f64,
    /// Seconds of idleness for a maxed score to decay to 0.
    pub time_to_min_bad: f64,
    /// Cap each increment at the rate earned at usage == quota, so a
    /// fork-bomb cannot jump from 0 to penalized in one tick.
    pub cap_badness_incr: bool,
    /// Seconds between scorer runs (the tick length).
    pub refresh: f64,
}

/// Bounded per-user score, one axis per resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Badness {
    pub cpu: f64,
    pub mem: f64,
    /// Wall-clock of the last scorer run that touched this record.
    pub last_updated: i64,
}

impl Badness {
    /// Total score; 100 triggers a penalty.
    pub fn total(&self) -> f64 {
        (self.cpu + self.mem).min(100.0)
    }

    pub fn is_zero(&self) -> bool {
        self.cpu == 0.0 && self.mem == 0.0
    }

    /// Updates both axes from the usage/quota ratios of the latest event.
    pub fn update(&mut self, cpu_ratio: f64, mem_ratio: f64, params: &ScoreParams, now: i64) {
        self.cpu = score_axis(self.cpu, cpu_ratio, params.cpu_threshold, params);
        self.mem = score_axis(self.mem, mem_ratio, params.mem_threshold, params);
        self.last_updated = now;
    }

    pub fn reset(&mut self, now: i64) {
        self.cpu = 0.0;
        self.mem = 0.0;
        self.last_updated = now;
    }
}

/// Advances one axis by the rate law. Pure; the result is always in
/// [0, 100] for any finite input score in range.
pub fn score_axis(score: f64, ratio: f64, threshold: f64, params: &ScoreParams) -> f64 {
    let delta = if ratio > threshold {
        let mut up = (ratio - threshold) * (100.0 / (params.time_to_max_bad * threshold))
            * params.refresh;
        if params.cap_badness_incr {
            let at_quota = (1.0 - threshold) * (100.0 / (params.time_to_max_bad * threshold))
                * params.refresh;
            up = up.min(at_quota);
        }
        up
    } else if ratio < threshold {
        -((threshold - ratio) * (100.0 / params.time_to_min_bad) * params.refresh)
    } else {
        0.0
    };
    (score + delta).clamp(0.0, 100.0)
}
