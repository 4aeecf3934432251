use super::{LogParser, ParseOutcome};
use crate::grouping::Grouper;
use crate::history::{ChangeSet, HistoryBuilder};
use crate::types::{LogRecord, LogType, ResourcePath, Severity, TaskRef};
use anyhow::anyhow;

/// Parses exported Kubernetes Event objects. Each event stands alone, so
/// every record is its own group.
#[derive(Debug, Default)]
pub struct EventLogParser;

impl EventLogParser {
    pub fn new() -> Self {
        Self
    }
}

fn involved_object_path(record: &LogRecord) -> Option<ResourcePath> {
    let kind = record.field("jsonPayload.involvedObject.kind")?.to_ascii_lowercase();
    let name = record.field("jsonPayload.involvedObject.name")?;
    let api_version = record
        .field("jsonPayload.involvedObject.apiVersion")
        .unwrap_or_else(|| "v1".to_string());
    // Core group objects carry a bare version.
    let api_version = if api_version.contains('/') {
        api_version
    } else {
        format!("core/{}", api_version)
    };
    let namespace = record.field("jsonPayload.involvedObject.namespace");
    Some(ResourcePath::from_audit(
        &api_version,
        &kind,
        namespace.as_deref().filter(|ns| !ns.is_empty()),
        &name,
        None,
    ))
}

impl LogParser for EventLogParser {
    fn name(&self) -> &str {
        "k8s-event"
    }

    fn log_type(&self) -> LogType {
        LogType::K8sEvent
    }

    fn dependencies(&self) -> Vec<TaskRef> {
        vec![TaskRef("query/k8s-event-log")]
    }

    fn grouping(&self) -> Grouper {
        Grouper::AllIndependent
    }

    fn parse(
        &self,
        record: &LogRecord,
        change_set: &mut ChangeSet,
        _builder: &HistoryBuilder,
    ) -> anyhow::Result<ParseOutcome> {
        let path = involved_object_path(record)
            .ok_or_else(|| anyhow!("event {} has no involvedObject", record.id))?;
        let reason = record.field("jsonPayload.reason").unwrap_or_default();
        let message = record
            .field("jsonPayload.message")
            .unwrap_or_else(|| record.body.clone());

        change_set.add_event(path);
        change_set.set_summary(format!("【{}】{}", reason, message));
        change_set.set_severity(match record.field("jsonPayload.type").as_deref() {
            Some("Warning") => Severity::Warning,
            Some("Normal") => Severity::Info,
            _ => Severity::Unknown,
        });
        Ok(ParseOutcome::Merge)
    }
}
