use crate::types::{LogRecord, ResourcePath, Severity};
use anyhow::bail;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionVerb {
    Create,
    Update,
    Patch,
    Delete,
    DeleteCollection,
    Status,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionState {
    Existing,
    Deleted,
    PodPhase(String),
    Inferred,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Revision {
    pub verb: RevisionVerb,
    pub state: RevisionState,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requestor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub record_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineEvent {
    pub timestamp: DateTime<Utc>,
    pub record_index: usize,
}

/// Mutations produced by parsing one record.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    record_index: usize,
    timestamp: DateTime<Utc>,
    summary: Option<String>,
    severity: Option<Severity>,
    revisions: Vec<(ResourcePath, Revision)>,
    events: Vec<(ResourcePath, TimelineEvent)>,
}

impl ChangeSet {
    pub fn new(record: &LogRecord) -> Self {
        Self {
            record_index: record.index,
            timestamp: record.timestamp,
            summary: None,
            severity: None,
            revisions: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn set_summary(&mut self, summary: impl Into<String>) {
        self.summary = Some(summary.into());
    }

    #[allow(dead_code)]
    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    pub fn set_severity(&mut self, severity: Severity) {
        self.severity = Some(severity);
    }

    #[allow(dead_code)]
    pub fn severity(&self) -> Option<Severity> {
        self.severity
    }

    pub fn add_revision(&mut self, path: ResourcePath, revision: Revision) {
        self.revisions.push((path, revision));
    }

    #[allow(dead_code)]
    pub fn revisions(&self) -> &[(ResourcePath, Revision)] {
        &self.revisions
    }

    /// Attach this record to a resource timeline as an event.
    pub fn add_event(&mut self, path: ResourcePath) {
        if self.events.iter().any(|(p, _)| *p == path) {
            return;
        }
        let event = TimelineEvent {
            timestamp: self.timestamp,
            record_index: self.record_index,
        };
        self.events.push((path, event));
    }

    #[allow(dead_code)]
    pub fn events(&self) -> &[(ResourcePath, TimelineEvent)] {
        &self.events
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub index: usize,
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub summary: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Timeline {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub revisions: Vec<Revision>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<TimelineEvent>,
}

/// Finalized, serializable history of one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct History {
    pub timelines: BTreeMap<ResourcePath, Timeline>,
    pub logs: Vec<LogEntry>,
}

#[derive(Debug, Default)]
struct BuilderState {
    prepared: HashMap<usize, Arc<LogRecord>>,
    logs: BTreeMap<usize, LogEntry>,
    timelines: BTreeMap<ResourcePath, Timeline>,
}

/// Shared timeline store that change-sets are merged into.
/// Safe to merge into from many workers at once.
#[derive(Debug, Default)]
pub struct HistoryBuilder {
    state: Mutex<BuilderState>,
}

impl HistoryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the records of a run. `on_prepared` is called with the running
    /// count after each record.
    pub fn prepare_logs(
        &self,
        records: &[Arc<LogRecord>],
        mut on_prepared: impl FnMut(usize),
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state.prepared.reserve(records.len());
        for (done, record) in records.iter().enumerate() {
            if state.prepared.insert(record.index, record.clone()).is_some() {
                bail!("Log record index {} was prepared twice", record.index);
            }
            on_prepared(done + 1);
        }
        Ok(())
    }

    pub fn merge(&self, change_set: ChangeSet) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let record = state
            .prepared
            .get(&change_set.record_index)
            .cloned()
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Change set for unknown log record index {}",
                    change_set.record_index
                )
            })?;

        let ChangeSet {
            record_index,
            summary,
            severity,
            revisions,
            events,
            ..
        } = change_set;

        state.logs.insert(
            record_index,
            LogEntry {
                index: record_index,
                id: record.id.clone(),
                timestamp: record.timestamp,
                summary: summary.unwrap_or_else(|| record.body.clone()),
                severity: severity.unwrap_or(Severity::Unknown),
            },
        );
        for (path, revision) in revisions {
            state.timelines.entry(path).or_default().revisions.push(revision);
        }
        for (path, event) in events {
            state.timelines.entry(path).or_default().events.push(event);
        }
        Ok(())
    }

    /// Snapshot the merged state with each timeline sorted by
    /// (timestamp, record index).
    pub fn finalize(&self) -> History {
        let state = self.state.lock();
        let mut timelines = state.timelines.clone();
        for timeline in timelines.values_mut() {
            timeline
                .revisions
                .sort_by_key(|r| (r.timestamp, r.record_index));
            timeline.events.sort_by_key(|e| (e.timestamp, e.record_index));
        }
        History {
            timelines,
            logs: state.logs.values().cloned().collect(),
        }
    }
}
