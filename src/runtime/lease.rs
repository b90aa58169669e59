use std::sync::Mutex;

/// Which party wrote a dispatch's terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseHolder {
    Worker,
    Timeout,
    Scheduler,
}

/// Per-dispatch token guarding every write to one task file.
///
/// While open, the worker may checkpoint. The first party to settle owns the
/// terminal status; writes attempted after that are dropped. All writes run
/// under the same lock, so a settle can never interleave with a checkpoint.
#[derive(Debug, Default)]
pub struct Lease {
    holder: Mutex<Option<LeaseHolder>>,
}

impl Lease {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `write` only while nobody has settled the lease.
    pub fn with_open<R>(&self, write: impl FnOnce() -> R) -> Option<R> {
        let guard = self
            .holder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.is_some() {
            return None;
        }
        Some(write())
    }

    /// Claims the lease for `holder` and runs `write`; `None` if another party
    /// settled first.
    pub fn settle<R>(&self, holder: LeaseHolder, write: impl FnOnce() -> R) -> Option<R> {
        let mut guard = self
            .holder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.is_some() {
            return None;
        }
        *guard = Some(holder);
        Some(write())
    }

    pub fn holder(&self) -> Option<LeaseHolder> {
        *self
            .holder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
