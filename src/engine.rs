use crate::errors::{EngineError, ErrorReporter, TracingErrorReporter, panic_message};
use crate::history::{ChangeSet, HistoryBuilder};
use crate::parsers::{LogParser, ParseOutcome};
use crate::progress::{ProgressTracker, RunPhase, report_progress};
use crate::types::LogRecord;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_CONCURRENCY: usize = 16;
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of groups parsed at the same time.
    pub concurrency: usize,
    pub progress_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub groups: usize,
    pub parsed: usize,
    /// Records deliberately ignored by the parser.
    pub skipped: usize,
    /// Records that failed to parse or merge.
    pub failed: usize,
    /// The run was stopped by the caller before every group finished.
    pub cancelled: bool,
}

/// Parses records group by group on a bounded pool of blocking workers.
pub struct ParseEngine {
    config: EngineConfig,
    reporter: Arc<dyn ErrorReporter>,
    progress: Arc<ProgressTracker>,
}

/// Everything a group worker needs, cloned into each worker.
#[derive(Clone)]
struct GroupWorker {
    parser: Arc<dyn LogParser>,
    builder: Arc<HistoryBuilder>,
    progress: Arc<ProgressTracker>,
    reporter: Arc<dyn ErrorReporter>,
    token: CancellationToken,
}

impl ParseEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            reporter: Arc::new(TracingErrorReporter),
            progress: Arc::new(ProgressTracker::new()),
        }
    }

    #[allow(dead_code)]
    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn progress(&self) -> Arc<ProgressTracker> {
        self.progress.clone()
    }

    /// Parse `records` with `parser`, merging every change-set into `builder`.
    ///
    /// Records that fail to parse are logged and skipped. The run only fails
    /// when the builder cannot be prepared or a parser faults. Cancelling
    /// `cancel` stops admitting groups and ends the run cleanly.
    pub async fn run(
        &self,
        records: Vec<Arc<LogRecord>>,
        parser: Arc<dyn LogParser>,
        builder: Arc<HistoryBuilder>,
        cancel: CancellationToken,
    ) -> Result<RunSummary, EngineError> {
        let progress = self.progress.clone();
        let total = records.len();

        progress.publish(RunPhase::Grouping, 0.0, format!("Grouping {} logs", total));
        let groups = parser.grouping().group(&records);
        let group_count = groups.len();
        progress.begin(total, group_count);
        info!(
            "[{}] Parsing {} logs in {} groups ({}, concurrency {})",
            parser.name(),
            total,
            group_count,
            parser.grouping(),
            self.config.concurrency
        );

        if let Err(e) = builder.prepare_logs(&records, |done| {
            if done % 1000 == 0 {
                progress.publish(
                    RunPhase::Grouping,
                    0.0,
                    format!("Prepared {}/{} logs", done, total),
                );
            }
        }) {
            progress.finish(RunPhase::Failed);
            return Err(EngineError::Prepare(e));
        }
        drop(records);

        let run_token = cancel.child_token();
        let reporter_stop = cancel.child_token();
        // Dropping the run future stops workers and the reporter too.
        let _run_guard = run_token.clone().drop_guard();
        let _reporter_guard = reporter_stop.clone().drop_guard();
        let reporter = tokio::spawn(report_progress(
            progress.clone(),
            self.config.progress_interval,
            reporter_stop.clone(),
        ));

        let worker = GroupWorker {
            parser: parser.clone(),
            builder,
            progress: progress.clone(),
            reporter: self.reporter.clone(),
            token: run_token.clone(),
        };
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut workers = JoinSet::new();
        let mut first_error: Option<EngineError> = None;

        for (key, group) in groups {
            let permit = tokio::select! {
                biased;
                _ = run_token.cancelled() => {
                    debug!("[{}] Stopped admitting groups", parser.name());
                    break;
                }
                // The semaphore is never closed, so acquiring only waits.
                Ok(permit) = semaphore.clone().acquire_owned() => permit,
            };
            let worker = worker.clone();
            workers.spawn_blocking(move || {
                let _permit = permit;
                worker.process_group(&key, group)
            });
        }

        while let Some(joined) = workers.join_next().await {
            let result = joined.map_err(EngineError::from).and_then(|r| r);
            if let Err(e) = result {
                run_token.cancel();
                if first_error.is_none() {
                    first_error = Some(e);
                } else {
                    debug!("[{}] Additional group failure: {}", parser.name(), e);
                }
            }
        }

        reporter_stop.cancel();
        if let Err(e) = reporter.await {
            warn!("Progress reporter ended abnormally: {}", e);
        }

        if let Some(e) = first_error {
            progress.finish(RunPhase::Failed);
            return Err(e);
        }

        progress.finish(RunPhase::Succeeded);
        let summary = RunSummary {
            groups: group_count,
            parsed: progress.parsed(),
            skipped: progress.skipped(),
            failed: progress.failed(),
            cancelled: cancel.is_cancelled(),
        };
        info!(
            "[{}] Finished: {} parsed, {} skipped, {} failed, peak {} groups in parallel{}",
            parser.name(),
            summary.parsed,
            summary.skipped,
            summary.failed,
            progress.max_active_groups(),
            if summary.cancelled { " (cancelled)" } else { "" }
        );
        Ok(summary)
    }
}

impl GroupWorker {
    fn process_group(&self, key: &str, records: Vec<Arc<LogRecord>>) -> Result<(), EngineError> {
        self.progress.group_started();
        let result = self.process_records(key, &records);
        self.progress.group_finished();
        result
    }

    fn process_records(&self, key: &str, records: &[Arc<LogRecord>]) -> Result<(), EngineError> {
        let name = self.parser.name();
        for record in records {
            if self.token.is_cancelled() {
                debug!("[{}] Group '{}' stopped before log {}", name, key, record.index);
                break;
            }

            let mut change_set = ChangeSet::new(record);
            let parsed = catch_unwind(AssertUnwindSafe(|| {
                self.parser.parse(record, &mut change_set, &self.builder)
            }));

            match parsed {
                Ok(Ok(ParseOutcome::Merge)) => match self.builder.merge(change_set) {
                    Ok(()) => self.progress.record_parsed(),
                    Err(e) => {
                        warn!("[{}] Failed to merge log {}: {:#}", name, record.index, e);
                        self.progress.record_failed();
                    }
                },
                Ok(Ok(ParseOutcome::Skip)) => self.progress.record_skipped(),
                Ok(Err(e)) => {
                    warn!(
                        "[{}] Failed to parse log {} in group '{}': {:#}",
                        name, record.index, key, e
                    );
                    debug!("[{}] Skipped log {}:\n{}", name, record.index, record.dump());
                    self.progress.record_failed();
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    let index = record.index.to_string();
                    self.reporter.report(
                        &format!("parser panicked: {}", message),
                        &[("parser", name), ("group", key), ("record_index", index.as_str())],
                    );
                    self.token.cancel();
                    return Err(EngineError::ParserFault {
                        parser: name.to_string(),
                        record_index: record.index,
                        message,
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grouping::Grouper;
    use crate::history::{Revision, RevisionState, RevisionVerb};
    use crate::types::{LogType, ResourcePath, TaskRef};
    use anyhow::bail;
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Parser driven by the record body: `create`, `delete`, `fail`, `panic`,
    /// `skip`, `cancel`; anything else becomes an event.
    struct ScriptedParser {
        grouping: Grouper,
        delay: Duration,
        existing: Mutex<HashSet<String>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        calls: AtomicUsize,
        cancel: Option<CancellationToken>,
    }

    impl ScriptedParser {
        fn new(grouping: Grouper) -> Self {
            Self {
                grouping,
                delay: Duration::ZERO,
                existing: Mutex::new(HashSet::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                cancel: None,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn cancelling(mut self, token: CancellationToken) -> Self {
            self.cancel = Some(token);
            self
        }

        fn apply(&self, record: &LogRecord, change_set: &mut ChangeSet) -> anyhow::Result<ParseOutcome> {
            let resource = record.field("resource").unwrap_or_default();
            let path = ResourcePath::new(resource.clone());
            let verb = match record.body.as_str() {
                "fail" => bail!("scripted failure"),
                "panic" => panic!("scripted panic"),
                "skip" => return Ok(ParseOutcome::Skip),
                "cancel" => {
                    if let Some(token) = &self.cancel {
                        token.cancel();
                    }
                    change_set.add_event(path);
                    return Ok(ParseOutcome::Merge);
                }
                "create" => {
                    self.existing.lock().insert(resource);
                    RevisionVerb::Create
                }
                "delete" => {
                    if !self.existing.lock().remove(&resource) {
                        bail!("delete before create for {}", resource);
                    }
                    RevisionVerb::Delete
                }
                _ => {
                    change_set.add_event(path);
                    return Ok(ParseOutcome::Merge);
                }
            };
            change_set.add_revision(
                path,
                Revision {
                    verb,
                    state: RevisionState::Existing,
                    timestamp: record.timestamp,
                    requestor: None,
                    body: None,
                    record_index: record.index,
                },
            );
            Ok(ParseOutcome::Merge)
        }
    }

    impl LogParser for ScriptedParser {
        fn name(&self) -> &str {
            "scripted"
        }

        fn log_type(&self) -> LogType {
            LogType::K8sNode
        }

        fn dependencies(&self) -> Vec<TaskRef> {
            Vec::new()
        }

        fn grouping(&self) -> Grouper {
            self.grouping.clone()
        }

        fn parse(
            &self,
            record: &LogRecord,
            change_set: &mut ChangeSet,
            _builder: &HistoryBuilder,
        ) -> anyhow::Result<ParseOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.apply(record, change_set)
        }
    }

    #[derive(Default)]
    struct CollectingReporter {
        reports: Mutex<Vec<(String, Vec<(String, String)>)>>,
    }

    impl ErrorReporter for CollectingReporter {
        fn report(&self, error: &str, metadata: &[(&str, &str)]) {
            let metadata = metadata
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            self.reports.lock().push((error.to_string(), metadata));
        }
    }

    fn record(index: usize, node: &str, resource: &str, body: &str) -> Arc<LogRecord> {
        Arc::new(LogRecord {
            index,
            id: format!("log-{}", index),
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            fields: serde_json::json!({"node": node, "resource": resource}),
            body: body.to_string(),
        })
    }

    fn engine(concurrency: usize) -> ParseEngine {
        ParseEngine::new(EngineConfig {
            concurrency,
            progress_interval: Duration::from_millis(10),
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_create_then_delete_within_group() {
        for concurrency in [1, 2, 16] {
            let records = vec![
                record(0, "A", "pod-x", "create"),
                record(1, "A", "pod-x", "delete"),
                record(2, "B", "pod-y", "create"),
            ];
            let parser = Arc::new(ScriptedParser::new(Grouper::by_field("node")));
            let builder = Arc::new(HistoryBuilder::new());

            let summary = engine(concurrency)
                .run(records, parser, builder.clone(), CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(summary.groups, 2);
            assert_eq!(summary.parsed, 3);
            assert_eq!(summary.failed, 0);

            let history = builder.finalize();
            let verbs: Vec<RevisionVerb> = history.timelines[&ResourcePath::new("pod-x")]
                .revisions
                .iter()
                .map(|r| r.verb)
                .collect();
            assert_eq!(verbs, vec![RevisionVerb::Create, RevisionVerb::Delete]);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failed_record_does_not_stop_group() {
        let records = vec![
            record(0, "A", "r", "one"),
            record(1, "A", "r", "fail"),
            record(2, "A", "r", "three"),
            record(3, "B", "s", "four"),
        ];
        let parser = Arc::new(ScriptedParser::new(Grouper::by_field("node")));
        let builder = Arc::new(HistoryBuilder::new());
        let engine = engine(4);

        let summary = engine
            .run(records, parser, builder.clone(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.parsed, 3);
        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.failed, 1);
        assert!(!summary.cancelled);

        let history = builder.finalize();
        let merged: Vec<usize> = history.logs.iter().map(|l| l.index).collect();
        assert_eq!(merged, vec![0, 2, 3]);
        assert_eq!(history.timelines[&ResourcePath::new("r")].events.len(), 2);

        let last = engine.progress().latest();
        assert_eq!(last.phase, RunPhase::Succeeded);
        assert_eq!(last.percentage, 100.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_intentional_skip_merges_nothing() {
        let records = vec![record(0, "A", "r", "skip"), record(1, "A", "r", "event")];
        let parser = Arc::new(ScriptedParser::new(Grouper::AllDependent));
        let builder = Arc::new(HistoryBuilder::new());

        let summary = engine(2)
            .run(records, parser, builder.clone(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!((summary.parsed, summary.skipped), (1, 1));
        assert_eq!(builder.finalize().logs.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_never_exceeds_limit() {
        for (round, limit) in [1usize, 2, 3, 5, 8].into_iter().enumerate() {
            let records: Vec<_> = (0..40)
                .map(|i| record(i, &format!("n{}", (i * 7 + round) % 13), "r", "event"))
                .collect();
            let parser = Arc::new(
                ScriptedParser::new(Grouper::by_field("node")).with_delay(Duration::from_millis(2)),
            );
            let engine = engine(limit);

            let summary = engine
                .run(
                    records,
                    parser.clone(),
                    Arc::new(HistoryBuilder::new()),
                    CancellationToken::new(),
                )
                .await
                .unwrap();
            assert_eq!(summary.parsed, 40);
            assert!(engine.progress().max_active_groups() <= limit);
            assert!(parser.max_in_flight.load(Ordering::SeqCst) <= limit);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parser_panic_fails_run_and_is_reported() {
        let records = vec![
            record(0, "A", "r", "one"),
            record(1, "A", "r", "panic"),
            record(2, "A", "r", "three"),
        ];
        let parser = Arc::new(ScriptedParser::new(Grouper::by_field("node")));
        let reporter = Arc::new(CollectingReporter::default());
        let engine = engine(2).with_reporter(reporter.clone());

        let err = engine
            .run(records, parser, Arc::new(HistoryBuilder::new()), CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            EngineError::ParserFault {
                parser,
                record_index,
                message,
            } => {
                assert_eq!(parser, "scripted");
                assert_eq!(record_index, 1);
                assert_eq!(message, "scripted panic");
            }
            other => panic!("unexpected error: {}", other),
        }

        let reports = reporter.reports.lock();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].0.contains("scripted panic"));
        assert!(reports[0].1.contains(&("record_index".to_string(), "1".to_string())));
        assert_eq!(engine.progress().latest().phase, RunPhase::Failed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_prepare_failure_is_structural() {
        // Two records claiming the same position.
        let records = vec![record(0, "A", "r", "one"), record(0, "B", "r", "two")];
        let parser = Arc::new(ScriptedParser::new(Grouper::AllIndependent));

        let err = engine(2)
            .run(records, parser, Arc::new(HistoryBuilder::new()), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Prepare(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancelled_before_start() {
        let records = vec![record(0, "A", "r", "one"), record(1, "B", "r", "two")];
        let parser = Arc::new(ScriptedParser::new(Grouper::by_field("node")));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = engine(2)
            .run(records, parser, Arc::new(HistoryBuilder::new()), cancel)
            .await
            .unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.parsed, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_mid_group_finishes_current_record() {
        let cancel = CancellationToken::new();
        let records: Vec<_> = (0..6)
            .map(|i| record(i, "A", "r", if i == 2 { "cancel" } else { "event" }))
            .collect();
        let parser =
            Arc::new(ScriptedParser::new(Grouper::AllDependent).cancelling(cancel.clone()));
        let builder = Arc::new(HistoryBuilder::new());

        let summary = engine(4)
            .run(records, parser, builder.clone(), cancel)
            .await
            .unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.parsed, 3);
        assert_eq!(builder.finalize().logs.len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_empty_input() {
        let parser = Arc::new(ScriptedParser::new(Grouper::AllIndependent));
        let engine = engine(4);
        let summary = engine
            .run(Vec::new(), parser, Arc::new(HistoryBuilder::new()), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.groups, 0);
        assert_eq!(engine.progress().latest().percentage, 100.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_final_progress_reaches_full_with_many_groups() {
        for _ in 0..10 {
            let records: Vec<_> = (0..200)
                .map(|i| record(i, "A", "r", if i % 17 == 0 { "fail" } else { "event" }))
                .collect();
            let parser = Arc::new(ScriptedParser::new(Grouper::AllIndependent));
            let engine = engine(16);
            let mut rx = engine.progress().subscribe();

            engine
                .run(records, parser, Arc::new(HistoryBuilder::new()), CancellationToken::new())
                .await
                .unwrap();

            let last = rx.borrow_and_update().clone();
            assert_eq!(last.phase, RunPhase::Succeeded);
            assert_eq!(last.percentage, 100.0);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_dropped_run_stops_workers_and_reporter() {
        let records: Vec<_> = (0..100).map(|i| record(i, "A", "r", "event")).collect();
        let parser = Arc::new(
            ScriptedParser::new(Grouper::AllDependent).with_delay(Duration::from_millis(20)),
        );
        let engine = engine(4);
        let mut rx = engine.progress().subscribe();

        let run = engine.run(
            records,
            parser.clone(),
            Arc::new(HistoryBuilder::new()),
            CancellationToken::new(),
        );
        assert!(tokio::time::timeout(Duration::from_millis(100), run).await.is_err());

        // Let the in-flight record finish and the reporter notice the stop.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let calls = parser.calls.load(Ordering::SeqCst);
        rx.borrow_and_update();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(parser.calls.load(Ordering::SeqCst), calls);
        assert!(calls < 100);
        assert!(!rx.has_changed().unwrap());
    }
}
