use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

pub(crate) const POLL_SLICE_MS: u64 = 100;

/// Sleeps up to `total`, waking early when `stop` is raised or the stop
/// signal file appears. Returns `false` if the caller should stop.
pub(crate) fn sleep_with_stop(stop: &AtomicBool, stop_file: Option<&Path>, total: Duration) -> bool {
    let mut remaining = total;
    while remaining > Duration::from_millis(0) {
        if should_stop(stop, stop_file) {
            return false;
        }
        let step = remaining.min(Duration::from_millis(POLL_SLICE_MS));
        thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
    !should_stop(stop, stop_file)
}

pub(crate) fn should_stop(stop: &AtomicBool, stop_file: Option<&Path>) -> bool {
    if stop.load(Ordering::Relaxed) {
        return true;
    }
    if stop_file.is_some_and(|path| path.exists()) {
        stop.store(true, Ordering::Relaxed);
        return true;
    }
    false
}
