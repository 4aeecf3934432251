use super::{LogParser, ParseOutcome};
use crate::binder::{LogBinder, ResourceBinding};
use crate::grouping::Grouper;
use crate::history::{ChangeSet, HistoryBuilder};
use crate::types::{LogRecord, LogType, ResourcePath, Severity, TaskRef};
use anyhow::anyhow;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

pub const NODE_NAME_FIELD: &str = "resource.labels.node_name";

const SANDBOX_PATTERN: &str = r#"RunPodSandbox for &PodSandboxMetadata\{Name:([^,]*),Uid:[^,]*,Namespace:([^,]*),[^}]*\} returns sandbox id \\?"([0-9a-zA-Z]+)\\?""#;
const CONTAINER_PATTERN: &str = r#"CreateContainer within sandbox \\?"([0-9a-zA-Z]+)\\?" for &ContainerMetadata\{Name:([^,]*),[^}]*\} returns container id \\?"([0-9a-zA-Z]+)\\?""#;
const MSG_PATTERN: &str = r#"msg="((?:[^"\\]|\\.)*)""#;
const LEVEL_PATTERN: &str = r"level=(\w+)";

static SANDBOX_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(SANDBOX_PATTERN).expect("failed to compile sandbox regex"));
static CONTAINER_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(CONTAINER_PATTERN).expect("failed to compile container regex"));
static MSG_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(MSG_PATTERN).expect("failed to compile msg regex"));
static LEVEL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(LEVEL_PATTERN).expect("failed to compile level regex"));

/// Parses containerd logs from the node journal.
///
/// Sandbox and container declarations teach the binder which runtime ids
/// belong to which Pod; every later log naming those ids is attached to the
/// Pod or container timeline and gets a readable summary.
pub struct ContainerdLogParser {
    binder: Arc<LogBinder>,
}

impl ContainerdLogParser {
    pub fn new(binder: Arc<LogBinder>) -> Self {
        Self { binder }
    }

    fn learn(&self, node: &str, body: &str) {
        if let Some(caps) = SANDBOX_REGEX.captures(body) {
            let binding = ResourceBinding::pod(&caps[3], &caps[2], &caps[1]);
            if self.binder.add_binding(node, binding) {
                debug!("[{}] Sandbox {} belongs to {}/{}", node, &caps[3], &caps[2], &caps[1]);
            }
        } else if let Some(caps) = CONTAINER_REGEX.captures(body) {
            match self.binder.find_pod(node, &caps[1]) {
                Some(pod) => {
                    let binding = ResourceBinding::container(&caps[3], &pod, &caps[2]);
                    self.binder.add_binding(node, binding);
                }
                None => debug!(
                    "[{}] Container {} created in unknown sandbox {}",
                    node, &caps[3], &caps[1]
                ),
            }
        }
    }
}

/// The `msg="..."` part of a logfmt line, unescaped, or the whole body.
fn message_of(body: &str) -> String {
    MSG_REGEX
        .captures(body)
        .map(|caps| caps[1].replace("\\\"", "\"").replace("\\\\", "\\"))
        .unwrap_or_else(|| body.to_string())
}

fn severity_of(record: &LogRecord) -> Severity {
    if let Some(caps) = LEVEL_REGEX.captures(&record.body) {
        return Severity::from_level(&caps[1]);
    }
    record
        .field("severity")
        .map(|s| Severity::from_level(&s))
        .unwrap_or(Severity::Unknown)
}

impl LogParser for ContainerdLogParser {
    fn name(&self) -> &str {
        "containerd"
    }

    fn log_type(&self) -> LogType {
        LogType::K8sNode
    }

    fn dependencies(&self) -> Vec<TaskRef> {
        vec![TaskRef("query/k8s-node-log")]
    }

    fn grouping(&self) -> Grouper {
        Grouper::by_field(NODE_NAME_FIELD)
    }

    fn parse(
        &self,
        record: &LogRecord,
        change_set: &mut ChangeSet,
        _builder: &HistoryBuilder,
    ) -> anyhow::Result<ParseOutcome> {
        let node = record
            .field(NODE_NAME_FIELD)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| anyhow!("log {} has no node name", record.id))?;
        let body = record.body.as_str();
        if body.is_empty() {
            return Ok(ParseOutcome::Skip);
        }

        self.learn(&node, body);

        let mut summary = message_of(body);
        for binding in self.binder.get_bound_resources(&node, body) {
            summary = binding.rewrite_summary(&summary);
            change_set.add_event(binding.resource_path());
        }
        change_set.add_event(ResourcePath::node(&node));
        change_set.set_summary(summary);
        change_set.set_severity(severity_of(record));
        Ok(ParseOutcome::Merge)
    }
}
