use crate::learning::DurationHistory;
use serde::{Deserialize, Serialize};

/// Below this many successful samples the predictor falls back to a ratio
/// estimate instead of the normal model.
pub const MIN_DISTRIBUTION_SAMPLES: u64 = 3;
const ON_TRACK_BELOW: f64 = 0.3;
const MONITOR_UP_TO: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    OnTrack,
    Monitor,
    AtRisk,
}

impl Recommendation {
    pub fn from_probability(probability: f64) -> Self {
        if probability < ON_TRACK_BELOW {
            Recommendation::OnTrack
        } else if probability <= MONITOR_UP_TO {
            Recommendation::Monitor
        } else {
            Recommendation::AtRisk
        }
    }
}

impl std::fmt::Display for Recommendation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Recommendation::OnTrack => write!(f, "on_track"),
            Recommendation::Monitor => write!(f, "monitor"),
            Recommendation::AtRisk => write!(f, "at_risk"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionModel {
    AlreadyBreached,
    Normal,
    Deterministic,
    Ratio,
    NoData,
}

impl PredictionModel {
    pub fn as_str(self) -> &'static str {
        match self {
            PredictionModel::AlreadyBreached => "already_breached",
            PredictionModel::Normal => "normal",
            PredictionModel::Deterministic => "deterministic",
            PredictionModel::Ratio => "ratio",
            PredictionModel::NoData => "no_data",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlaInput {
    pub elapsed_secs: f64,
    pub threshold_secs: f64,
    /// Share of main-flow steps not yet completed, in [0, 1].
    pub remaining_fraction: f64,
    pub history: DurationHistory,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlaPrediction {
    pub probability: f64,
    pub predicted_duration_secs: Option<f64>,
    pub recommendation: Recommendation,
    pub model: PredictionModel,
}

impl SlaPrediction {
    fn new(probability: f64, predicted: Option<f64>, model: PredictionModel) -> Self {
        let probability = if probability.is_finite() {
            probability.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            probability,
            predicted_duration_secs: predicted,
            recommendation: Recommendation::from_probability(probability),
            model,
        }
    }
}

/// Probability that a task finishes after its SLA threshold.
///
/// With enough history the remaining time is modelled as
/// `Normal(r * mean, sqrt(r) * stdev)` and compared with the time left before
/// the threshold. Missing data never errors; it degrades to 0.0 / monitor.
pub fn predict(input: &SlaInput) -> SlaPrediction {
    let elapsed = input.elapsed_secs.max(0.0);
    let remaining = input.remaining_fraction.clamp(0.0, 1.0);
    let history = input.history;
    let projected = (history.samples > 0).then(|| elapsed + remaining * history.mean_secs);

    if input.threshold_secs <= 0.0 || elapsed >= input.threshold_secs {
        return SlaPrediction::new(1.0, projected.or(Some(elapsed)), PredictionModel::AlreadyBreached);
    }

    if history.samples >= MIN_DISTRIBUTION_SAMPLES {
        let spread = remaining.sqrt() * history.stdev_secs;
        if spread <= f64::EPSILON {
            // Elapsed is already below the threshold here.
            return SlaPrediction::new(0.0, projected, PredictionModel::Deterministic);
        }
        let available = input.threshold_secs - elapsed;
        let z = (available - remaining * history.mean_secs) / spread;
        return SlaPrediction::new(1.0 - normal_cdf(z), projected, PredictionModel::Normal);
    }

    if let Some(total) = projected {
        let ramp = (total - input.threshold_secs) / input.threshold_secs + 0.5;
        return SlaPrediction::new(ramp, projected, PredictionModel::Ratio);
    }

    SlaPrediction {
        probability: 0.0,
        predicted_duration_secs: None,
        recommendation: Recommendation::Monitor,
        model: PredictionModel::NoData,
    }
}

pub fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

/// Abramowitz and Stegun 7.1.26; absolute error below 1.5e-7.
fn erf(x: f64) -> f64 {
    const A1: f64 = 0.254_829_592;
    const A2: f64 = -0.284_496_736;
    const A3: f64 = 1.421_413_741;
    const A4: f64 = -1.453_152_027;
    const A5: f64 = 1.061_405_429;
    const P: f64 = 0.327_591_1;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + P * x);
    let poly = ((((A5 * t + A4) * t + A3) * t + A2) * t + A1) * t;
    sign * (1.0 - poly * (-x * x).exp())
}
