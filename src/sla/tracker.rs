use crate::audit::{AuditEntry, AuditError, AuditLog, AuditOp, AuditOutcome};
use crate::config::SlaConfig;
use crate::shared::time::elapsed_secs;
use crate::task::Task;
use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlaCheck {
    pub duration_secs: f64,
    pub threshold_secs: f64,
    pub breached: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlaCompliance {
    pub executed: usize,
    pub breaches: usize,
    /// Share of executions inside the SLA; 1.0 when nothing ran.
    pub rate: f64,
}

/// Compares finished tasks with their classification's SLA threshold.
#[derive(Debug, Clone)]
pub struct SlaTracker {
    audit: AuditLog,
    sla: SlaConfig,
}

impl SlaTracker {
    pub fn new(audit: AuditLog, sla: SlaConfig) -> Self {
        Self { audit, sla }
    }

    /// Returns `None` for tasks that are not finished or lack the
    /// `classified_at`/`completed_at` pair.
    pub fn check(&self, task: &Task) -> Result<Option<SlaCheck>, AuditError> {
        if !task.status.sets_completed_at() {
            return Ok(None);
        }
        let (Some(classified_at), Some(completed_at)) = (task.classified_at, task.completed_at)
        else {
            return Ok(None);
        };
        let threshold_secs = super::threshold_for(&self.sla, task);
        let duration_secs = elapsed_secs(classified_at, completed_at);
        let breached = duration_secs > threshold_secs;
        if breached {
            self.audit.append(
                &AuditEntry::new(
                    AuditOp::SlaBreach,
                    task.id.as_str(),
                    task.status.logical_folder(),
                    AuditOutcome::Flagged,
                    format!(
                        "classification={} status={} duration_secs={duration_secs:.1} threshold_secs={threshold_secs:.1}",
                        task.classification, task.status
                    ),
                )
                .with_decision_source("sla_tracker"),
            )?;
        }
        Ok(Some(SlaCheck {
            duration_secs,
            threshold_secs,
            breached,
        }))
    }

    pub fn compliance(&self, now: DateTime<Utc>, hours: u32) -> Result<SlaCompliance, AuditError> {
        let since = now - Duration::hours(i64::from(hours));
        let mut executed: usize = 0;
        let mut breaches: usize = 0;
        for entry in self.audit.read_all()? {
            if !entry.timestamp().is_some_and(|ts| ts >= since && ts <= now) {
                continue;
            }
            match entry.op {
                AuditOp::TaskExecuted => executed += 1,
                AuditOp::SlaBreach => breaches += 1,
                _ => {}
            }
        }
        let rate = if executed == 0 {
            1.0
        } else {
            (executed.saturating_sub(breaches)) as f64 / executed as f64
        };
        Ok(SlaCompliance {
            executed,
            breaches,
            rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::ids::TaskId;
    use crate::task::{Classification, TaskStatus};
    use tempfile::tempdir;

    fn finished(minutes: i64) -> Task {
        let mut task = Task::new(TaskId::parse("T.md").expect("id"), "/vault/T.md");
        let start = Utc::now() - Duration::minutes(30);
        task.classification = Classification::Simple;
        task.status = TaskStatus::Done;
        task.classified_at = Some(start);
        task.completed_at = Some(start + Duration::minutes(minutes));
        task
    }

    #[test]
    fn breach_is_audited_only_past_threshold() {
        let dir = tempdir().expect("tempdir");
        let audit = AuditLog::new(dir.path().join("operations.log"));
        let tracker = SlaTracker::new(audit.clone(), SlaConfig::default());

        let ok = tracker.check(&finished(1)).expect("check").expect("result");
        assert!(!ok.breached);
        let late = tracker.check(&finished(5)).expect("check").expect("result");
        assert!(late.breached);
        assert_eq!(late.threshold_secs, 120.0);

        let breaches: Vec<_> = audit
            .read_all()
            .expect("read")
            .into_iter()
            .filter(|entry| entry.op == AuditOp::SlaBreach)
            .collect();
        assert_eq!(breaches.len(), 1);
        assert_eq!(breaches[0].outcome, AuditOutcome::Flagged);
    }

    #[test]
    fn pending_task_is_not_checked() {
        let dir = tempdir().expect("tempdir");
        let tracker = SlaTracker::new(
            AuditLog::new(dir.path().join("operations.log")),
            SlaConfig::default(),
        );
        let mut task = finished(1);
        task.status = TaskStatus::Pending;
        assert_eq!(tracker.check(&task).expect("check"), None);
    }

    #[test]
    fn compliance_counts_window_entries() {
        let dir = tempdir().expect("tempdir");
        let audit = AuditLog::new(dir.path().join("operations.log"));
        let tracker = SlaTracker::new(audit.clone(), SlaConfig::default());
        let now = Utc::now();
        for _ in 0..4 {
            audit
                .append(&AuditEntry::new(AuditOp::TaskExecuted, "T.md", "Done", AuditOutcome::Success, "x"))
                .expect("append");
        }
        audit
            .append(&AuditEntry::new(AuditOp::SlaBreach, "T.md", "Done", AuditOutcome::Flagged, "x"))
            .expect("append");
        audit
            .append(
                &AuditEntry::new(AuditOp::TaskExecuted, "Old.md", "Done", AuditOutcome::Success, "x")
                    .at(now - Duration::hours(48)),
            )
            .expect("append");

        let compliance = tracker
            .compliance(now + Duration::seconds(1), 24)
            .expect("compliance");
        assert_eq!(compliance.executed, 4);
        assert_eq!(compliance.breaches, 1);
        assert!((compliance.rate - 0.75).abs() < 1e-9);
    }
}
