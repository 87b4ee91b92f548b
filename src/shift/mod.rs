//! Adaptive topic-shift detection.
//!
//! A [`ShiftDetector`] keeps an exponentially weighted estimate of the
//! distance between consecutive vectors and of its variance. An observation
//! counts as a shift when it exceeds `distance + multiplier * sqrt(variance)`,
//! clamped into `[min_threshold, max_threshold]`.

pub mod history;
pub mod tracker;

use serde::{Deserialize, Serialize};

use crate::config::ShiftConfig;
use crate::error::{Error, Result};

pub use tracker::ShiftTracker;

/// How decisions are made.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShiftMode {
    /// Learned EWMA threshold.
    Adaptive,
    /// Never shifts; learned state is left untouched.
    Disabled,
    /// Fixed operator threshold; learned state is left untouched.
    Manual(f64),
}

impl ShiftMode {
    pub fn from_config(config: &ShiftConfig) -> Self {
        match (config.enabled, config.manual_threshold) {
            (false, _) => Self::Disabled,
            (true, Some(threshold)) => Self::Manual(threshold),
            (true, None) => Self::Adaptive,
        }
    }
}

/// Learned EWMA state for one partition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EwmaState {
    pub distance: f64,
    pub variance: f64,
    /// Observations folded into this state.
    pub observations: u64,
}

impl EwmaState {
    /// Cold-start state from configuration.
    pub fn initial(config: &ShiftConfig) -> Self {
        Self {
            distance: config.initial_distance,
            variance: config.initial_variance,
            observations: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ShiftDecision {
    pub shifted: bool,
    /// In `[0, 1]`; zero unless shifted.
    pub confidence: f64,
    /// Threshold the distance was compared against.
    pub threshold: f64,
    pub distance: f64,
}

/// EWMA parameters taken from [`ShiftConfig`].
#[derive(Debug, Clone, Copy)]
struct Params {
    alpha: f64,
    multiplier: f64,
    min_threshold: f64,
    max_threshold: f64,
}

#[derive(Debug, Clone)]
pub struct ShiftDetector {
    params: Params,
    mode: ShiftMode,
    state: EwmaState,
}

impl ShiftDetector {
    /// Build a detector from configuration, starting from `seed` when given
    /// and from the configured defaults otherwise.
    ///
    /// Rejects configurations that fail [`ShiftConfig::validate`], so the
    /// threshold band is always well formed.
    pub fn new(config: &ShiftConfig, seed: Option<EwmaState>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::InvalidInput(format!("{e:#}")))?;
        Ok(Self {
            params: Params {
                alpha: config.alpha,
                multiplier: config.multiplier,
                min_threshold: config.min_threshold,
                max_threshold: config.max_threshold,
            },
            mode: ShiftMode::from_config(config),
            state: seed.unwrap_or_else(|| EwmaState::initial(config)),
        })
    }

    pub fn mode(&self) -> ShiftMode {
        self.mode
    }

    /// Switch mode. The learned state carries over unchanged.
    pub fn set_mode(&mut self, mode: ShiftMode) {
        self.mode = mode;
    }

    pub fn state(&self) -> EwmaState {
        self.state
    }

    /// Current learned threshold, clamped into the configured band.
    pub fn threshold(&self) -> f64 {
        let raw = self.state.distance + self.params.multiplier * self.state.variance.max(0.0).sqrt();
        if raw.is_nan() {
            return self.params.max_threshold;
        }
        raw.clamp(self.params.min_threshold, self.params.max_threshold)
    }

    /// Decide whether `distance` is a shift, then (in adaptive mode) fold it
    /// into the running estimate.
    pub fn observe(&mut self, distance: f64) -> ShiftDecision {
        match self.mode {
            ShiftMode::Disabled => ShiftDecision {
                shifted: false,
                confidence: 0.0,
                threshold: self.threshold(),
                distance,
            },
            ShiftMode::Manual(threshold) => decide(distance, threshold),
            ShiftMode::Adaptive => {
                let decision = decide(distance, self.threshold());
                if distance.is_finite() {
                    self.update(distance);
                } else {
                    tracing::debug!(distance, "ignoring non-finite distance");
                }
                decision
            }
        }
    }

    fn update(&mut self, distance: f64) {
        let alpha = self.params.alpha;
        let mean = alpha * distance + (1.0 - alpha) * self.state.distance;
        let deviation = distance - mean;
        self.state.variance = alpha * deviation * deviation + (1.0 - alpha) * self.state.variance;
        self.state.distance = mean;
        self.state.observations += 1;
    }
}

fn decide(distance: f64, threshold: f64) -> ShiftDecision {
    let shifted = distance.is_finite() && distance > threshold;
    let confidence = if shifted && threshold > 0.0 {
        ((distance - threshold) / threshold).min(1.0)
    } else if shifted {
        1.0
    } else {
        0.0
    };
    ShiftDecision {
        shifted,
        confidence,
        threshold,
        distance,
    }
}
