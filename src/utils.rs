use crate::history::{History, RevisionState};
use crate::types::{ResourcePath, Severity};
use crossterm::style::{Color, Stylize};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// Generate a color for a string based on hash.
pub fn get_color(s: &str) -> Color {
    let colors = [
        Color::Red,
        Color::Green,
        Color::Blue,
        Color::Yellow,
        Color::Magenta,
        Color::Cyan,
        Color::AnsiValue(91), // Bright Red
        Color::AnsiValue(92), // Bright Green
        Color::AnsiValue(94), // Bright Blue
        Color::AnsiValue(93), // Bright Yellow
        Color::AnsiValue(95), // Bright Magenta
        Color::AnsiValue(96), // Bright Cyan
    ];
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut hasher);
    let hash = hasher.finish() as u32;
    colors[(hash % colors.len() as u32) as usize]
}

fn severity_label(severity: Severity) -> &'static str {
    match severity {
        Severity::Unknown => "-",
        Severity::Info => "I",
        Severity::Warning => "W",
        Severity::Error => "E",
        Severity::Fatal => "F",
    }
}

fn state_label(state: &RevisionState) -> String {
    match state {
        RevisionState::Existing => "existing".to_string(),
        RevisionState::Deleted => "deleted".to_string(),
        RevisionState::PodPhase(phase) => phase.clone(),
        RevisionState::Inferred => "inferred".to_string(),
    }
}

/// One line per timeline entry, grouped by resource path.
/// Colors are applied only when `color` is set.
pub fn render_timeline(history: &History, color: bool) -> Vec<String> {
    let summaries: HashMap<usize, (&str, Severity)> = history
        .logs
        .iter()
        .map(|l| (l.index, (l.summary.as_str(), l.severity)))
        .collect();

    let mut lines = Vec::new();
    for (path, timeline) in &history.timelines {
        let prefix = format_path(path, color);
        for revision in &timeline.revisions {
            lines.push(format!(
                "{} {} {:?} -> {}{}",
                prefix,
                revision.timestamp.format("%Y-%m-%dT%H:%M:%SZ"),
                revision.verb,
                state_label(&revision.state),
                revision
                    .requestor
                    .as_deref()
                    .map(|r| format!(" by {}", r))
                    .unwrap_or_default()
            ));
        }
        for event in &timeline.events {
            let (summary, severity) = summaries
                .get(&event.record_index)
                .copied()
                .unwrap_or(("", Severity::Unknown));
            lines.push(format!(
                "{} {} [{}] {}",
                prefix,
                event.timestamp.format("%Y-%m-%dT%H:%M:%SZ"),
                severity_label(severity),
                summary
            ));
        }
    }
    lines
}

fn format_path(path: &ResourcePath, color: bool) -> String {
    let prefix = format!("[{}]", path);
    if color {
        prefix.with(get_color(path.as_str())).to_string()
    } else {
        prefix
    }
}
