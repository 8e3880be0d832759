//! Index status tracking and the readiness latch.
//!
//! Status transitions: idle → in-progress → {ready, failed}, and ready or
//! failed → in-progress on a fresh index call. The latch is a one-shot
//! broadcast over a watch channel: latched when a run commits, reset when
//! the next run starts, releasing every waiter atomically.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexPhase {
    #[default]
    Idle,
    InProgress,
    Ready,
    Failed,
}

impl IndexPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexPhase::Idle => "idle",
            IndexPhase::InProgress => "in-progress",
            IndexPhase::Ready => "ready",
            IndexPhase::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IndexState {
    pub phase: IndexPhase,
    pub last_error: Option<String>,
    pub last_duration: Option<Duration>,
}

pub struct IndexTracker {
    state: Mutex<IndexState>,
    ready_tx: watch::Sender<bool>,
    /// Held for the whole pipeline; `try_lock` enforces at most one run.
    pub run_lock: tokio::sync::Mutex<()>,
}

impl Default for IndexTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexTracker {
    pub fn new() -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self {
            state: Mutex::new(IndexState::default()),
            ready_tx,
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> IndexState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Transition into in-progress and reset the latch so readers block
    /// until this run commits.
    pub fn begin(&self) {
        self.ready_tx.send_replace(false);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.phase = IndexPhase::InProgress;
    }

    pub fn finish_ready(&self, duration: Duration) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.phase = IndexPhase::Ready;
            state.last_error = None;
            state.last_duration = Some(duration);
        }
        self.ready_tx.send_replace(true);
    }

    pub fn finish_failed(&self, error: String, duration: Duration) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.phase = IndexPhase::Failed;
        state.last_error = Some(error);
        state.last_duration = Some(duration);
    }

    /// Wait until the latch is set, up to `limit`. Returns whether the
    /// index became (or already was) ready.
    pub async fn wait_ready(&self, limit: Duration) -> bool {
        let mut rx = self.ready_tx.subscribe();
        if *rx.borrow() {
            return true;
        }
        let result = tokio::time::timeout(limit, rx.wait_for(|ready| *ready)).await;
        matches!(result, Ok(Ok(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn latch_releases_all_waiters_at_once() {
        let tracker = Arc::new(IndexTracker::new());
        tracker.begin();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let t = tracker.clone();
            handles.push(tokio::spawn(async move {
                t.wait_ready(Duration::from_secs(5)).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        tracker.finish_ready(Duration::from_millis(1));
        for handle in handles {
            assert!(handle.await.unwrap());
        }
        // A late waiter sees the latched state immediately.
        assert!(tracker.wait_ready(Duration::from_millis(1)).await);
    }

    #[tokio::test]
    async fn wait_times_out_while_in_progress() {
        let tracker = IndexTracker::new();
        tracker.begin();
        assert!(!tracker.wait_ready(Duration::from_millis(30)).await);
        assert_eq!(tracker.snapshot().phase, IndexPhase::InProgress);
    }

    #[tokio::test]
    async fn reset_on_reindex_blocks_new_waiters() {
        let tracker = IndexTracker::new();
        tracker.begin();
        tracker.finish_ready(Duration::from_millis(5));
        assert!(tracker.wait_ready(Duration::from_millis(1)).await);

        tracker.begin();
        assert!(!tracker.wait_ready(Duration::from_millis(20)).await);
        tracker.finish_failed("scan failed: boom".into(), Duration::from_millis(2));
        let state = tracker.snapshot();
        assert_eq!(state.phase, IndexPhase::Failed);
        assert_eq!(state.last_error.as_deref(), Some("scan failed: boom"));
        assert!(!tracker.wait_ready(Duration::from_millis(20)).await);
    }

    #[test]
    fn phase_strings() {
        assert_eq!(IndexPhase::Idle.as_str(), "idle");
        assert_eq!(IndexPhase::InProgress.as_str(), "in-progress");
        assert_eq!(IndexPhase::Ready.as_str(), "ready");
        assert_eq!(IndexPhase::Failed.as_str(), "failed");
    }
}
