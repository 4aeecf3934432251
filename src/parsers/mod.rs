pub mod audit;
pub mod containerd;
pub mod event;

use crate::binder::LogBinder;
use crate::grouping::Grouper;
use crate::history::{ChangeSet, HistoryBuilder};
use crate::types::{LogRecord, LogType, TaskRef};
use std::sync::Arc;

pub use audit::AuditLogParser;
pub use containerd::ContainerdLogParser;
pub use event::EventLogParser;

/// What the engine should do with the change-set after a successful parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    Merge,
    /// The record is deliberately ignored; nothing is merged.
    Skip,
}

/// A business parser for one log source.
///
/// `parse` is called once per record, sequentially within a group and in
/// parallel across groups, so implementations must be `Sync`.
pub trait LogParser: Send + Sync {
    fn name(&self) -> &str;

    fn log_type(&self) -> LogType;

    /// Tasks whose output must exist before this parser runs.
    fn dependencies(&self) -> Vec<TaskRef>;

    fn grouping(&self) -> Grouper;

    fn parse(
        &self,
        record: &LogRecord,
        change_set: &mut ChangeSet,
        builder: &HistoryBuilder,
    ) -> anyhow::Result<ParseOutcome>;
}

/// Every built-in parser. The binder is shared by parsers that learn
/// runtime identifiers.
pub fn all(binder: Arc<LogBinder>) -> Vec<Arc<dyn LogParser>> {
    vec![
        Arc::new(AuditLogParser::new()),
        Arc::new(ContainerdLogParser::new(binder)),
        Arc::new(EventLogParser::new()),
    ]
}

/// Runs `inner` with every record in a single group, so the whole input is
/// parsed strictly in order.
struct Sequential(Arc<dyn LogParser>);

impl LogParser for Sequential {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn log_type(&self) -> LogType {
        self.0.log_type()
    }

    fn dependencies(&self) -> Vec<TaskRef> {
        self.0.dependencies()
    }

    fn grouping(&self) -> Grouper {
        Grouper::AllDependent
    }

    fn parse(
        &self,
        record: &LogRecord,
        change_set: &mut ChangeSet,
        builder: &HistoryBuilder,
    ) -> anyhow::Result<ParseOutcome> {
        self.0.parse(record, change_set, builder)
    }
}

pub fn sequential(parser: Arc<dyn LogParser>) -> Arc<dyn LogParser> {
    Arc::new(Sequential(parser))
}

pub fn by_name(name: &str, binder: Arc<LogBinder>) -> anyhow::Result<Arc<dyn LogParser>> {
    all(binder)
        .into_iter()
        .find(|p| p.name() == name)
        .ok_or_else(|| anyhow::anyhow!("Unknown parser: {}", name))
}
