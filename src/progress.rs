use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Grouping,
    Parsing,
    Succeeded,
    Failed,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunPhase::Idle => "idle",
            RunPhase::Grouping => "grouping",
            RunPhase::Parsing => "parsing",
            RunPhase::Succeeded => "succeeded",
            RunPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub phase: RunPhase,
    /// 0.0 to 100.0
    pub percentage: f64,
    pub message: String,
}

impl Default for ProgressSnapshot {
    fn default() -> Self {
        Self {
            phase: RunPhase::Idle,
            percentage: 0.0,
            message: String::new(),
        }
    }
}

/// Shared counters for one run plus the channel snapshots are published on.
#[derive(Debug)]
pub struct ProgressTracker {
    total_records: AtomicUsize,
    parsed: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    total_groups: AtomicUsize,
    active_groups: AtomicUsize,
    max_active_groups: AtomicUsize,
    tx: watch::Sender<ProgressSnapshot>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ProgressSnapshot::default());
        Self {
            total_records: AtomicUsize::new(0),
            parsed: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            total_groups: AtomicUsize::new(0),
            active_groups: AtomicUsize::new(0),
            max_active_groups: AtomicUsize::new(0),
            tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.tx.subscribe()
    }

    #[allow(dead_code)]
    pub fn latest(&self) -> ProgressSnapshot {
        self.tx.borrow().clone()
    }

    pub fn publish(&self, phase: RunPhase, percentage: f64, message: impl Into<String>) {
        self.tx.send_replace(ProgressSnapshot {
            phase,
            percentage,
            message: message.into(),
        });
    }

    /// Reset the counters for a new run.
    pub fn begin(&self, records: usize, groups: usize) {
        self.total_records.store(records, Ordering::SeqCst);
        self.total_groups.store(groups, Ordering::SeqCst);
        self.parsed.store(0, Ordering::SeqCst);
        self.skipped.store(0, Ordering::SeqCst);
        self.failed.store(0, Ordering::SeqCst);
        self.active_groups.store(0, Ordering::SeqCst);
        self.max_active_groups.store(0, Ordering::SeqCst);
    }

    pub fn record_parsed(&self) {
        self.parsed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn group_started(&self) {
        let active = self.active_groups.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_groups.fetch_max(active, Ordering::SeqCst);
    }

    pub fn group_finished(&self) {
        self.active_groups.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn parsed(&self) -> usize {
        self.parsed.load(Ordering::SeqCst)
    }

    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Highest number of groups seen in flight at once during the run.
    pub fn max_active_groups(&self) -> usize {
        self.max_active_groups.load(Ordering::SeqCst)
    }

    /// Records that are finished, whether merged, skipped or failed.
    fn completed(&self) -> usize {
        self.parsed() + self.skipped() + self.failed()
    }

    fn percentage(&self) -> f64 {
        let total = self.total_records.load(Ordering::SeqCst);
        if total == 0 {
            return 100.0;
        }
        (self.completed() as f64 / total as f64 * 100.0).min(100.0)
    }

    /// Publish a parsing snapshot; `last_completed` is the count seen on the
    /// previous tick and is advanced.
    pub fn tick(&self, last_completed: &mut usize, interval: Duration) {
        let completed = self.completed();
        let delta = completed.saturating_sub(*last_completed);
        *last_completed = completed;
        let per_sec = delta as f64 / interval.as_secs_f64().max(f64::EPSILON);
        let message = format!(
            "{}/{} logs parsed ({:.0} logs/s, {} failed) - {}/{} groups active",
            completed,
            self.total_records.load(Ordering::SeqCst),
            per_sec,
            self.failed(),
            self.active_groups.load(Ordering::SeqCst),
            self.total_groups.load(Ordering::SeqCst),
        );
        self.publish(RunPhase::Parsing, self.percentage(), message);
    }

    /// Final snapshot, published after every worker has stopped so the
    /// counters are settled.
    pub fn finish(&self, phase: RunPhase) {
        let message = format!(
            "{} logs parsed, {} skipped, {} failed, {} groups",
            self.parsed(),
            self.skipped(),
            self.failed(),
            self.total_groups.load(Ordering::SeqCst),
        );
        let percentage = match phase {
            RunPhase::Succeeded if self.completed() >= self.total_records.load(Ordering::SeqCst) => {
                100.0
            }
            _ => self.percentage(),
        };
        self.publish(phase, percentage, message);
    }
}

/// Periodically publish progress until `stop` fires.
pub async fn report_progress(
    tracker: std::sync::Arc<ProgressTracker>,
    interval: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;
    let mut last_completed = 0;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                tracker.tick(&mut last_completed, interval);
            }
        }
    }
    debug!("Progress reporter stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_tick_reports_throughput_and_groups() {
        let tracker = ProgressTracker::new();
        tracker.begin(10, 3);
        tracker.group_started();
        for _ in 0..4 {
            tracker.record_parsed();
        }
        tracker.record_failed();

        let mut last = 0;
        tracker.tick(&mut last, Duration::from_secs(1));
        let snap = tracker.latest();
        assert_eq!(snap.phase, RunPhase::Parsing);
        assert_eq!(snap.percentage, 50.0);
        assert_eq!(snap.message, "5/10 logs parsed (5 logs/s, 1 failed) - 1/3 groups active");
        assert_eq!(last, 5);

        tracker.record_parsed();
        tracker.tick(&mut last, Duration::from_secs(1));
        assert!(tracker.latest().message.starts_with("6/10 logs parsed (1 logs/s"));
    }

    #[test]
    fn test_empty_run_is_complete() {
        let tracker = ProgressTracker::new();
        tracker.begin(0, 0);
        tracker.finish(RunPhase::Succeeded);
        assert_eq!(tracker.latest().percentage, 100.0);
    }

    #[test]
    fn test_max_active_groups() {
        let tracker = ProgressTracker::new();
        tracker.group_started();
        tracker.group_started();
        tracker.group_finished();
        tracker.group_started();
        assert_eq!(tracker.max_active_groups(), 2);
    }

    #[tokio::test]
    async fn test_reporter_stops_on_signal() {
        let tracker = Arc::new(ProgressTracker::new());
        tracker.begin(2, 1);
        let stop = CancellationToken::new();
        let handle = tokio::spawn(report_progress(
            tracker.clone(),
            Duration::from_millis(20),
            stop.clone(),
        ));

        tracker.record_parsed();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(tracker.latest().percentage, 50.0);

        stop.cancel();
        handle.await.unwrap();
    }
}
