use super::lease::Lease;
use super::processor::{TaskProcessor, TaskRun};
use super::recovery::recover_stale_tasks;
use super::slots::{Scheduled, SlotScheduler};
use super::worker_primitives::{should_stop, sleep_with_stop, POLL_SLICE_MS};
use super::{append_runtime_log, RuntimeError};
use crate::audit::{AuditEntry, AuditOp, AuditOutcome};
use crate::risk::RiskEngine;
use crate::shared::ids::TaskId;
use crate::shared::time::now_utc;
use crate::task::{Task, TaskStatus};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

struct TaskCompletion {
    key: TaskId,
    dispatch: u64,
    outcome: Result<TaskRun, String>,
}

struct Dispatch {
    id: u64,
    lease: Arc<Lease>,
    cancel: Arc<AtomicBool>,
    deadline: Instant,
}

/// What one pass of the scheduler did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IterationReport {
    pub classified: usize,
    pub dispatched: Vec<TaskId>,
    /// Eligible tasks left waiting for a free slot, in dispatch order.
    pub queued: Vec<TaskId>,
    pub completed: Vec<TaskRun>,
    pub timed_out: Vec<TaskId>,
    pub early_warnings: Vec<TaskId>,
    pub errors: usize,
}

impl IterationReport {
    pub fn is_idle(&self) -> bool {
        self.classified == 0
            && self.dispatched.is_empty()
            && self.completed.is_empty()
            && self.timed_out.is_empty()
            && self.early_warnings.is_empty()
            && self.errors == 0
    }

    fn absorb(&mut self, other: IterationReport) {
        self.classified += other.classified;
        self.dispatched.extend(other.dispatched);
        self.queued = other.queued;
        self.completed.extend(other.completed);
        self.timed_out.extend(other.timed_out);
        self.early_warnings.extend(other.early_warnings);
        self.errors += other.errors;
    }

    fn summary(&self) -> String {
        format!(
            "classified={} dispatched={} queued={} completed={} timed_out={} warnings={} errors={}",
            self.classified,
            self.dispatched.len(),
            self.queued.len(),
            self.completed.len(),
            self.timed_out.len(),
            self.early_warnings.len(),
            self.errors
        )
    }
}

/// Polls the vault, classifies new tasks and runs eligible ones on worker
/// threads, at most `max_parallel_tasks` at a time and never two dispatches
/// of the same task.
pub struct Scheduler {
    processor: TaskProcessor,
    slots: SlotScheduler<Task>,
    in_flight: HashMap<TaskId, Dispatch>,
    result_tx: Sender<TaskCompletion>,
    result_rx: Receiver<TaskCompletion>,
    next_dispatch: u64,
    task_timeout: Duration,
    warned: HashSet<TaskId>,
    queued_noted: HashSet<TaskId>,
    last_maintenance: Option<Instant>,
}

impl Scheduler {
    pub fn new(processor: TaskProcessor) -> Self {
        let task_timeout = Duration::from_secs(processor.settings().scheduler.task_timeout_secs);
        let (result_tx, result_rx) = mpsc::channel();
        Self {
            processor,
            slots: SlotScheduler::default(),
            in_flight: HashMap::new(),
            result_tx,
            result_rx,
            next_dispatch: 0,
            task_timeout,
            warned: HashSet::new(),
            queued_noted: HashSet::new(),
            last_maintenance: None,
        }
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn processor(&self) -> &TaskProcessor {
        &self.processor
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// One scheduling pass. Errors on individual tasks are logged and
    /// counted; only failing to list the vault aborts the pass.
    pub fn run_iteration(&mut self) -> Result<IterationReport, RuntimeError> {
        let mut report = IterationReport::default();
        self.collect_completions(&mut report);
        self.expire_overdue(&mut report);

        let now = now_utc();
        let settings = self.processor.settings().clone();
        let active = self.processor.tasks().list_active()?;
        let mut candidates = Vec::new();
        for mut task in active {
            match task.status {
                TaskStatus::Pending => {
                    if self.in_flight.contains_key(&task.id) || self.slots.is_active(&task.id) {
                        continue;
                    }
                    if !task.is_classified() {
                        match self.processor.classify_task(&mut task, now) {
                            Ok(_) => report.classified += 1,
                            Err(err) => {
                                self.log_error(&task.id, &format!("classification failed: {err}"));
                                report.errors += 1;
                                continue;
                            }
                        }
                    }
                    if self.processor.is_dispatchable(&task) {
                        candidates.push(task);
                    }
                }
                TaskStatus::InProgress if settings.features.predictive_sla => {
                    self.watch_sla(&task, &mut report);
                }
                _ => {}
            }
        }

        self.slots.drain_pending();
        if !candidates.is_empty() {
            let risk = RiskEngine::new(
                &settings,
                Some(self.processor.learning()),
                self.processor.audit(),
            );
            for ranked in risk.reorder(candidates, now)? {
                let score = ranked.score.map(|s| s.composite).unwrap_or(0.0);
                self.slots.enqueue(ranked.task.id.clone(), score, ranked.task);
            }
        }

        let available = settings
            .scheduler
            .max_parallel_tasks
            .saturating_sub(self.in_flight.len());
        for scheduled in self.slots.dequeue_runnable(available) {
            report.dispatched.push(scheduled.key.clone());
            self.dispatch(scheduled);
        }

        for (position, key) in self.slots.pending_keys().into_iter().enumerate() {
            if self.queued_noted.insert(key.clone()) {
                let entry = AuditEntry::new(
                    AuditOp::ConcurrencyQueued,
                    key.as_str(),
                    "scheduler",
                    AuditOutcome::Success,
                    format!(
                        "position={} active={} cap={}",
                        position + 1,
                        self.in_flight.len(),
                        settings.scheduler.max_parallel_tasks
                    ),
                )
                .with_decision_source("scheduler");
                if let Err(err) = self.processor.audit().append(&entry) {
                    self.log_error(&key, &err.to_string());
                    report.errors += 1;
                }
            }
            report.queued.push(key);
        }

        Ok(report)
    }

    /// Runs passes until nothing is eligible and no worker is running.
    pub fn drain(&mut self) -> Result<IterationReport, RuntimeError> {
        let mut total = IterationReport::default();
        loop {
            let report = self.run_iteration()?;
            let dispatched = !report.dispatched.is_empty();
            total.absorb(report);
            if self.in_flight.is_empty() && !dispatched {
                break;
            }
            self.wait_for_progress(&mut total)?;
        }
        Ok(total)
    }

    /// Daemon loop. Returns after `stop` is raised or the stop signal file
    /// appears, once every in-flight task has finished or timed out.
    pub fn run_loop(&mut self, stop: &AtomicBool) -> Result<(), RuntimeError> {
        let paths = self.processor.paths().clone();
        let stop_file = paths.stop_signal_path();
        let _ = fs::remove_file(&stop_file);
        self.processor.bootstrap()?;

        match recover_stale_tasks(self.processor.tasks(), self.processor.audit(), now_utc()) {
            Ok(recovered) => {
                for id in recovered {
                    append_runtime_log(&paths, "warn", "task.recovered", id.as_str());
                }
            }
            Err(err) => append_runtime_log(&paths, "error", "worker.error", &err.to_string()),
        }

        let settings = self.processor.settings().clone();
        append_runtime_log(
            &paths,
            "info",
            "scheduler.started",
            &format!(
                "interval_secs={} max_parallel_tasks={} task_timeout_secs={:.1}",
                settings.scheduler.interval_secs,
                settings.scheduler.max_parallel_tasks,
                self.task_timeout.as_secs_f64()
            ),
        );

        let interval = Duration::from_secs(settings.scheduler.interval_secs);
        while !should_stop(stop, Some(&stop_file)) {
            self.maintain_if_due();
            match self.run_iteration() {
                Ok(report) if !report.is_idle() => append_runtime_log(
                    &paths,
                    "info",
                    "scheduler.iteration",
                    &report.summary(),
                ),
                Ok(_) => {}
                Err(err) => append_runtime_log(&paths, "error", "worker.error", &err.to_string()),
            }
            if !self.idle(interval, stop, &stop_file) {
                break;
            }
        }

        append_runtime_log(
            &paths,
            "info",
            "scheduler.stopping",
            &format!("in_flight={}", self.in_flight.len()),
        );
        let mut tail = IterationReport::default();
        while !self.in_flight.is_empty() {
            self.wait_for_progress(&mut tail)?;
        }
        append_runtime_log(&paths, "info", "scheduler.stopped", &tail.summary());
        Ok(())
    }

    fn dispatch(&mut self, scheduled: Scheduled<Task>) {
        let dispatch_id = self.next_dispatch;
        self.next_dispatch += 1;
        let lease = Arc::new(Lease::new());
        let cancel = Arc::new(AtomicBool::new(false));

        let tx = self.result_tx.clone();
        let processor = self.processor.clone();
        let key = scheduled.key.clone();
        let worker_lease = Arc::clone(&lease);
        let worker_cancel = Arc::clone(&cancel);
        let _ = thread::spawn(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                processor.execute_task(scheduled.value, &worker_lease, &worker_cancel)
            }));
            let outcome = match outcome {
                Ok(Ok(run)) => Ok(run),
                Ok(Err(err)) => Err(err.to_string()),
                Err(_) => Err("worker panicked".to_string()),
            };
            let _ = tx.send(TaskCompletion {
                key,
                dispatch: dispatch_id,
                outcome,
            });
        });

        append_runtime_log(
            self.processor.paths(),
            "info",
            "task.dispatched",
            scheduled.key.as_str(),
        );
        self.queued_noted.remove(&scheduled.key);
        self.in_flight.insert(
            scheduled.key,
            Dispatch {
                id: dispatch_id,
                lease,
                cancel,
                deadline: Instant::now() + self.task_timeout,
            },
        );
    }

    fn collect_completions(&mut self, report: &mut IterationReport) {
        loop {
            match self.result_rx.try_recv() {
                Ok(completion) => self.handle_completion(completion, report),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    fn handle_completion(&mut self, completion: TaskCompletion, report: &mut IterationReport) {
        let current = self
            .in_flight
            .get(&completion.key)
            .is_some_and(|dispatch| dispatch.id == completion.dispatch);
        if !current {
            // Late result of a dispatch that already timed out.
            return;
        }
        let Some(dispatch) = self.in_flight.remove(&completion.key) else {
            return;
        };
        self.slots.complete(&completion.key);

        match completion.outcome {
            Ok(run) => {
                append_runtime_log(
                    self.processor.paths(),
                    "info",
                    "task.finished",
                    &format!("{} status={}", run.task_id, run.status),
                );
                report.completed.push(run);
            }
            Err(error) => {
                self.log_error(&completion.key, &error);
                report.errors += 1;
                if let Err(err) =
                    self.processor
                        .abandon_after_error(&completion.key, &dispatch.lease, &error)
                {
                    self.log_error(&completion.key, &err.to_string());
                }
            }
        }
    }

    /// Cancels and fails every dispatch past its deadline; the slot is freed
    /// immediately. Returns how many expired.
    fn expire_overdue(&mut self, report: &mut IterationReport) -> usize {
        let now = Instant::now();
        let overdue: Vec<TaskId> = self
            .in_flight
            .iter()
            .filter(|(_, dispatch)| dispatch.deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &overdue {
            let Some(dispatch) = self.in_flight.remove(key) else {
                continue;
            };
            dispatch.cancel.store(true, Ordering::Relaxed);
            self.slots.complete(key);
            match self
                .processor
                .expire(key, &dispatch.lease, self.task_timeout)
            {
                Ok(Some(_)) => {
                    append_runtime_log(
                        self.processor.paths(),
                        "warn",
                        "task.timeout",
                        key.as_str(),
                    );
                    report.timed_out.push(key.clone());
                }
                Ok(None) => {}
                Err(err) => {
                    self.log_error(key, &err.to_string());
                    report.errors += 1;
                }
            }
        }
        overdue.len()
    }

    /// Blocks until one dispatch completes or expires.
    fn wait_for_progress(&mut self, report: &mut IterationReport) -> Result<(), RuntimeError> {
        while !self.in_flight.is_empty() {
            match self
                .result_rx
                .recv_timeout(Duration::from_millis(POLL_SLICE_MS))
            {
                Ok(completion) => {
                    self.handle_completion(completion, report);
                    return Ok(());
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.expire_overdue(report) > 0 {
                        return Ok(());
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(RuntimeError::ChannelDisconnected)
                }
            }
        }
        Ok(())
    }

    /// Waits out the poll interval while still servicing completions and
    /// deadlines. Returns `false` when the loop should stop.
    fn idle(&mut self, total: Duration, stop: &AtomicBool, stop_file: &Path) -> bool {
        let deadline = Instant::now() + total;
        let mut report = IterationReport::default();
        loop {
            let now = Instant::now();
            if now >= deadline {
                return !should_stop(stop, Some(stop_file));
            }
            let slice = (deadline - now).min(Duration::from_millis(POLL_SLICE_MS));
            if self.in_flight.is_empty() {
                if !sleep_with_stop(stop, Some(stop_file), slice) {
                    return false;
                }
                continue;
            }
            if should_stop(stop, Some(stop_file)) {
                return false;
            }
            match self.result_rx.recv_timeout(slice) {
                Ok(completion) => self.handle_completion(completion, &mut report),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return false,
            }
            self.expire_overdue(&mut report);
        }
    }

    /// Snapshot purge and learning-window maintenance, at most once a day.
    fn maintain_if_due(&mut self) {
        if self
            .last_maintenance
            .is_some_and(|at| at.elapsed() < MAINTENANCE_INTERVAL)
        {
            return;
        }
        self.last_maintenance = Some(Instant::now());
        let paths = self.processor.paths().clone();
        match self.processor.maintenance(now_utc()) {
            Ok(summary) => append_runtime_log(
                &paths,
                "info",
                "maintenance.completed",
                &format!(
                    "snapshots_purged={} learning_types={} records_dropped={}",
                    summary.snapshots_purged.len(),
                    summary.learning.task_types,
                    summary.learning.records_dropped
                ),
            ),
            Err(err) => append_runtime_log(&paths, "error", "worker.error", &err.to_string()),
        }
    }

    fn watch_sla(&mut self, task: &Task, report: &mut IterationReport) {
        let prediction = match self.processor.predict_sla(task, now_utc()) {
            Ok(prediction) => prediction,
            Err(err) => {
                self.log_error(&task.id, &err.to_string());
                report.errors += 1;
                return;
            }
        };
        let threshold = self.processor.settings().sla.prediction_threshold;
        if prediction.probability <= threshold || self.warned.contains(&task.id) {
            return;
        }
        match self.processor.warn_sla(task, &prediction) {
            Ok(()) => {
                self.warned.insert(task.id.clone());
                report.early_warnings.push(task.id.clone());
            }
            Err(err) => {
                self.log_error(&task.id, &err.to_string());
                report.errors += 1;
            }
        }
    }

    fn log_error(&self, task_id: &TaskId, message: &str) {
        append_runtime_log(
            self.processor.paths(),
            "error",
            "worker.error",
            &format!("{task_id}: {message}"),
        );
    }
}
