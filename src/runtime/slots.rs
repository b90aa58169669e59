use crate::shared::ids::TaskId;
use std::collections::HashSet;

#[derive(Debug)]
pub struct Scheduled<T> {
    pub key: TaskId,
    pub score: f64,
    pub value: T,
}

/// Waiting dispatches ordered by risk score (highest first, FIFO among
/// equals), plus the set of task ids currently holding a slot. A task id is
/// never queued twice nor dispatched while active.
#[derive(Debug)]
pub struct SlotScheduler<T> {
    pending: Vec<(u64, Scheduled<T>)>,
    active_keys: HashSet<TaskId>,
    next_seq: u64,
}

impl<T> Default for SlotScheduler<T> {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
            active_keys: HashSet::new(),
            next_seq: 0,
        }
    }
}

impl<T> SlotScheduler<T> {
    /// Queues `value`; returns `false` when the id is already queued or active.
    pub fn enqueue(&mut self, key: TaskId, score: f64, value: T) -> bool {
        if self.is_active(&key) || self.pending.iter().any(|(_, item)| item.key == key) {
            return false;
        }
        let score = if score.is_finite() { score } else { 0.0 };
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push((seq, Scheduled { key, score, value }));
        self.pending.sort_by(|(seq_a, a), (seq_b, b)| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(seq_a.cmp(seq_b))
        });
        true
    }

    /// Takes up to `max_items` queued entries, marking their ids active.
    pub fn dequeue_runnable(&mut self, max_items: usize) -> Vec<Scheduled<T>> {
        if max_items == 0 || self.pending.is_empty() {
            return Vec::new();
        }
        let mut selected = Vec::new();
        let mut remaining = Vec::new();
        for (seq, item) in self.pending.drain(..) {
            if selected.len() < max_items && !self.active_keys.contains(&item.key) {
                self.active_keys.insert(item.key.clone());
                selected.push(item);
            } else {
                remaining.push((seq, item));
            }
        }
        self.pending = remaining;
        selected
    }

    pub fn complete(&mut self, key: &TaskId) {
        self.active_keys.remove(key);
    }

    pub fn is_active(&self, key: &TaskId) -> bool {
        self.active_keys.contains(key)
    }

    pub fn active_len(&self) -> usize {
        self.active_keys.len()
    }

    pub fn pending_keys(&self) -> Vec<TaskId> {
        self.pending.iter().map(|(_, item)| item.key.clone()).collect()
    }

    pub fn drain_pending(&mut self) -> Vec<Scheduled<T>> {
        self.pending.drain(..).map(|(_, item)| item).collect()
    }
}
