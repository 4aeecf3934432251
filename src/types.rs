use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single ingested log entry. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct LogRecord {
    /// Position in the input sequence, unique within a run.
    pub index: usize,
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub fields: serde_json::Value,
    pub body: String,
}

impl LogRecord {
    /// Read a dotted field path such as `resource.labels.node_name`.
    /// Scalars are stringified; objects, arrays and nulls yield `None`.
    pub fn field(&self, path: &str) -> Option<String> {
        let mut current = &self.fields;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        match current {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Raw nested value at a dotted path.
    pub fn value(&self, path: &str) -> Option<&serde_json::Value> {
        let mut current = &self.fields;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current)
    }

    /// YAML dump of the record, used when a record is skipped.
    pub fn dump(&self) -> String {
        serde_yaml::to_string(&self.fields)
            .unwrap_or_else(|e| format!("<unserializable record {}: {}>", self.index, e))
    }
}

/// Identifies a resource timeline, e.g. `core/v1#pod#default#nginx`.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourcePath(String);

impl ResourcePath {
    #[allow(dead_code)]
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn pod(namespace: &str, name: &str) -> Self {
        Self(format!("core/v1#pod#{}#{}", namespace, name))
    }

    pub fn container(namespace: &str, name: &str, container: &str) -> Self {
        Self(format!("core/v1#pod#{}#{}#{}", namespace, name, container))
    }

    pub fn node(name: &str) -> Self {
        Self(format!("core/v1#node#cluster-scope#{}", name))
    }

    /// Build a path from the pieces of an audit log resource name.
    /// Cluster scoped resources use `cluster-scope` as their namespace.
    pub fn from_audit(
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
        subresource: Option<&str>,
    ) -> Self {
        let ns = namespace.unwrap_or("cluster-scope");
        match subresource {
            Some(sub) => Self(format!("{}#{}#{}#{}#{}", api_version, kind, ns, name, sub)),
            None => Self(format!("{}#{}#{}#{}", api_version, kind, ns, name)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Unknown,
    Info,
    Warning,
    Error,
    Fatal,
}

impl Severity {
    pub fn from_level(level: &str) -> Self {
        match level.to_ascii_lowercase().as_str() {
            "info" | "debug" | "trace" | "notice" | "default" => Severity::Info,
            "warn" | "warning" => Severity::Warning,
            "error" | "err" => Severity::Error,
            "fatal" | "critical" | "panic" | "emergency" | "alert" => Severity::Fatal,
            _ => Severity::Unknown,
        }
    }
}

/// The upstream log source a parser consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogType {
    K8sAudit,
    K8sNode,
    K8sEvent,
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogType::K8sAudit => f.write_str("k8s_audit"),
            LogType::K8sNode => f.write_str("k8s_node"),
            LogType::K8sEvent => f.write_str("k8s_event"),
        }
    }
}

/// Reference to another task a parser needs to have run first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskRef(pub &'static str);

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}
