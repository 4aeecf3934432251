use crate::types::LogRecord;
use anyhow::Context;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Load GCP log entries from a JSON lines file, or a YAML sequence when the
/// extension is `.yaml`/`.yml`. Records come back ordered by timestamp, file
/// order breaking ties, and indexed by that order.
pub fn load_records(path: &Path) -> anyhow::Result<Vec<Arc<LogRecord>>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read log file {}", path.display()))?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let entries = if is_yaml {
        parse_yaml(&content)?
    } else {
        parse_json_lines(&content)?
    };
    let records = into_records(entries);
    info!("Loaded {} log records from {}", records.len(), path.display());
    Ok(records)
}

pub fn parse_json_lines(content: &str) -> anyhow::Result<Vec<serde_json::Value>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line).with_context(|| format!("Invalid JSON on line {}", n + 1))
        })
        .collect()
}

pub fn parse_yaml(content: &str) -> anyhow::Result<Vec<serde_json::Value>> {
    serde_yaml::from_str(content).context("Expected a YAML sequence of log entries")
}

fn timestamp_of(entry: &serde_json::Value) -> DateTime<Utc> {
    ["timestamp", "receiveTimestamp"]
        .iter()
        .filter_map(|key| entry.get(*key).and_then(|v| v.as_str()))
        .find_map(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn body_of(entry: &serde_json::Value) -> String {
    if let Some(text) = entry.get("textPayload").and_then(|v| v.as_str()) {
        return text.to_string();
    }
    match entry.get("jsonPayload") {
        Some(payload) => ["MESSAGE", "message"]
            .iter()
            .find_map(|key| payload.get(*key).and_then(|v| v.as_str()))
            .map(|s| s.to_string())
            .unwrap_or_else(|| payload.to_string()),
        None => String::new(),
    }
}

pub fn into_records(entries: Vec<serde_json::Value>) -> Vec<Arc<LogRecord>> {
    let mut stamped: Vec<(DateTime<Utc>, serde_json::Value)> = entries
        .into_iter()
        .map(|entry| (timestamp_of(&entry), entry))
        .collect();
    // Stable, so equal timestamps keep file order.
    stamped.sort_by_key(|(ts, _)| *ts);

    stamped
        .into_iter()
        .enumerate()
        .map(|(index, (timestamp, fields))| {
            let id = fields
                .get("insertId")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("#{}", index));
            let body = body_of(&fields);
            if body.is_empty() {
                debug!("Log {} has no payload", id);
            }
            Arc::new(LogRecord {
                index,
                id,
                timestamp,
                fields,
                body,
            })
        })
        .collect()
}
