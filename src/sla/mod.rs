//! Deadline tracking: breach prediction for running tasks and breach
//! detection for finished ones.

pub mod predictor;
pub mod tracker;

pub use predictor::{
    normal_cdf, predict, PredictionModel, Recommendation, SlaInput, SlaPrediction,
};
pub use tracker::{SlaCheck, SlaCompliance, SlaTracker};

use crate::config::SlaConfig;
use crate::learning::DurationHistory;
use crate::shared::time::elapsed_secs;
use crate::task::{Classification, Task};
use chrono::{DateTime, Utc};

/// SLA threshold for a task; unclassified tasks use their step-count class.
pub fn threshold_for(sla: &SlaConfig, task: &Task) -> f64 {
    let classification = match task.classification {
        Classification::Unclassified => task.nominal_classification(),
        other => other,
    };
    sla.threshold_secs(classification)
}

/// Builds the predictor input for a task at `now`. Elapsed time runs from
/// `classified_at`; a task that was never classified has used none.
pub fn input_for_task(
    sla: &SlaConfig,
    task: &Task,
    history: DurationHistory,
    now: DateTime<Utc>,
) -> SlaInput {
    SlaInput {
        elapsed_secs: task
            .classified_at
            .map(|start| elapsed_secs(start, now))
            .unwrap_or(0.0),
        threshold_secs: threshold_for(sla, task),
        remaining_fraction: task.remaining_fraction(),
        history,
    }
}

pub fn predict_for_task(
    sla: &SlaConfig,
    task: &Task,
    history: DurationHistory,
    now: DateTime<Utc>,
) -> SlaPrediction {
    predict(&input_for_task(sla, task, history, now))
}
