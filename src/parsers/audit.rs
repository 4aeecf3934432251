use super::{LogParser, ParseOutcome};
use crate::grouping::Grouper;
use crate::history::{ChangeSet, HistoryBuilder, Revision, RevisionState, RevisionVerb};
use crate::types::{LogRecord, LogType, ResourcePath, Severity, TaskRef};
use anyhow::{Context, anyhow, bail};
use k8s_openapi::api::core::v1::Pod;

pub const RESOURCE_NAME_FIELD: &str = "protoPayload.resourceName";

/// Parses Kubernetes API server audit logs into resource revisions.
#[derive(Debug, Default)]
pub struct AuditLogParser;

impl AuditLogParser {
    pub fn new() -> Self {
        Self
    }
}

/// Pieces of an audit `resourceName` such as
/// `core/v1/namespaces/default/pods/nginx/status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditResource {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    pub subresource: Option<String>,
}

impl AuditResource {
    pub fn parse(resource_name: &str) -> anyhow::Result<Self> {
        let parts: Vec<&str> = resource_name.split('/').collect();
        if parts.len() < 4 {
            bail!("Unsupported resource name '{}'", resource_name);
        }
        let api_version = format!("{}/{}", parts[0], parts[1]);
        let (namespace, rest) = if parts[2] == "namespaces" && parts.len() >= 6 {
            (Some(parts[3].to_string()), &parts[4..])
        } else {
            (None, &parts[2..])
        };
        Ok(Self {
            api_version,
            kind: singular(rest[0]),
            namespace,
            name: rest[1].to_string(),
            subresource: rest.get(2).map(|s| s.to_string()),
        })
    }

    pub fn path(&self) -> ResourcePath {
        ResourcePath::from_audit(
            &self.api_version,
            &self.kind,
            self.namespace.as_deref(),
            &self.name,
            self.subresource.as_deref(),
        )
    }
}

fn singular(plural: &str) -> String {
    if let Some(stem) = plural.strip_suffix("ies") {
        format!("{}y", stem)
    } else if ["sses", "ches", "shes", "xes"].iter().any(|s| plural.ends_with(s)) {
        plural[..plural.len() - 2].to_string()
    } else {
        plural.strip_suffix('s').unwrap_or(plural).to_string()
    }
}

fn verb_of(method_name: &str) -> Option<RevisionVerb> {
    match method_name.rsplit('.').next()? {
        "create" => Some(RevisionVerb::Create),
        "update" => Some(RevisionVerb::Update),
        "patch" => Some(RevisionVerb::Patch),
        "delete" => Some(RevisionVerb::Delete),
        "deletecollection" => Some(RevisionVerb::DeleteCollection),
        _ => None,
    }
}

fn state_of(
    verb: RevisionVerb,
    resource: &AuditResource,
    response: Option<&serde_json::Value>,
) -> anyhow::Result<RevisionState> {
    if matches!(verb, RevisionVerb::Delete | RevisionVerb::DeleteCollection) {
        return Ok(RevisionState::Deleted);
    }
    let Some(response) = response else {
        return Ok(RevisionState::Inferred);
    };
    let is_pod = response.get("kind").and_then(|k| k.as_str()) == Some("Pod");
    if resource.kind == "pod" && is_pod {
        let pod: Pod = serde_json::from_value(response.clone())
            .with_context(|| format!("Response for {} is not a valid Pod", resource.name))?;
        if let Some(phase) = pod.status.and_then(|s| s.phase) {
            return Ok(RevisionState::PodPhase(phase));
        }
    }
    Ok(RevisionState::Existing)
}

impl LogParser for AuditLogParser {
    fn name(&self) -> &str {
        "k8s-audit"
    }

    fn log_type(&self) -> LogType {
        LogType::K8sAudit
    }

    fn dependencies(&self) -> Vec<TaskRef> {
        vec![TaskRef("query/k8s-audit-log")]
    }

    fn grouping(&self) -> Grouper {
        Grouper::by_field(RESOURCE_NAME_FIELD)
    }

    fn parse(
        &self,
        record: &LogRecord,
        change_set: &mut ChangeSet,
        _builder: &HistoryBuilder,
    ) -> anyhow::Result<ParseOutcome> {
        let method = record
            .field("protoPayload.methodName")
            .ok_or_else(|| anyhow!("audit log {} has no methodName", record.id))?;
        let Some(mut verb) = verb_of(&method) else {
            // Read-only requests do not change any resource.
            return Ok(ParseOutcome::Skip);
        };
        let resource_name = record
            .field(RESOURCE_NAME_FIELD)
            .ok_or_else(|| anyhow!("audit log {} has no resourceName", record.id))?;
        let resource = AuditResource::parse(&resource_name)?;
        let path = resource.path();

        change_set.add_event(path.clone());

        let status_code = record
            .field("protoPayload.status.code")
            .and_then(|c| c.parse::<i64>().ok())
            .unwrap_or(0);
        if status_code != 0 {
            let message = record
                .field("protoPayload.status.message")
                .unwrap_or_default();
            change_set.set_summary(format!("{} {} failed: {}", method, resource_name, message));
            change_set.set_severity(Severity::Warning);
            return Ok(ParseOutcome::Merge);
        }

        if resource.subresource.as_deref() == Some("status")
            && matches!(verb, RevisionVerb::Update | RevisionVerb::Patch)
        {
            verb = RevisionVerb::Status;
        }
        let response = record.value("protoPayload.response");
        let state = state_of(verb, &resource, response)?;
        let body = response
            .map(serde_yaml::to_string)
            .transpose()
            .context("Failed to serialize response body")?;

        // Status writes belong to the owning resource's timeline.
        let revision_path = if verb == RevisionVerb::Status {
            AuditResource {
                subresource: None,
                ..resource.clone()
            }
            .path()
        } else {
            path
        };
        change_set.add_revision(
            revision_path,
            Revision {
                verb,
                state,
                timestamp: record.timestamp,
                requestor: record.field("protoPayload.authenticationInfo.principalEmail"),
                body,
                record_index: record.index,
            },
        );
        change_set.set_summary(format!("{} {}", method, resource_name));
        change_set.set_severity(Severity::Info);
        Ok(ParseOutcome::Merge)
    }
}
