//! Runtime flags and counters shared between the pipeline and its owner.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Window over which [`PipelineRuntime::recent_failures`] counts.
pub const FAILURE_WINDOW: Duration = Duration::from_secs(60);

/// Pause flag, AI-stage occupancy and the trailing failure window.
///
/// Outlives individual pipeline instances so a restart keeps the pause state.
#[derive(Debug)]
pub struct PipelineRuntime {
    paused: AtomicBool,
    active_ai: AtomicUsize,
    failures: Mutex<VecDeque<Instant>>,
    window: Duration,
}

impl Default for PipelineRuntime {
    fn default() -> Self {
        Self::new(FAILURE_WINDOW)
    }
}

impl PipelineRuntime {
    pub fn new(window: Duration) -> Self {
        Self {
            paused: AtomicBool::new(false),
            active_ai: AtomicUsize::new(0),
            failures: Mutex::new(VecDeque::new()),
            window,
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Number of tasks currently inside a model call.
    pub fn active_ai(&self) -> usize {
        self.active_ai.load(Ordering::SeqCst)
    }

    pub(crate) fn enter_ai(&self) -> ActiveAiGuard<'_> {
        self.active_ai.fetch_add(1, Ordering::SeqCst);
        ActiveAiGuard { runtime: self }
    }

    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut failures = self.failures.lock();
        failures.push_back(now);
        Self::prune(&mut failures, now, self.window);
    }

    pub fn recent_failures(&self) -> usize {
        let mut failures = self.failures.lock();
        Self::prune(&mut failures, Instant::now(), self.window);
        failures.len()
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    fn prune(failures: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while failures
            .front()
            .is_some_and(|t| now.duration_since(*t) > window)
        {
            failures.pop_front();
        }
    }
}

pub(crate) struct ActiveAiGuard<'a> {
    runtime: &'a PipelineRuntime,
}

impl Drop for ActiveAiGuard<'_> {
    fn drop(&mut self) {
        self.runtime.active_ai.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_window_expires() {
        let runtime = PipelineRuntime::new(Duration::from_millis(30));
        runtime.record_failure();
        runtime.record_failure();
        assert_eq!(runtime.recent_failures(), 2);
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(runtime.recent_failures(), 0);
    }

    #[test]
    fn test_active_guard() {
        let runtime = PipelineRuntime::default();
        {
            let _a = runtime.enter_ai();
            let _b = runtime.enter_ai();
            assert_eq!(runtime.active_ai(), 2);
        }
        assert_eq!(runtime.active_ai(), 0);
    }
}
