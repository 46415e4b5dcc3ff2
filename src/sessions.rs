//! Scan on-disk external session files for a project directory.
//!
//! The external service stores one JSONL transcript per session under a
//! directory derived from the project path (`/` replaced with `-`). We list
//! recent sessions newest-first and pull the id, timestamp, and first plain
//! user prompt out of each file.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::outbox::clamp_chars;

const TASK_PREVIEW_MAX: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: String,
    pub timestamp: String,
    /// First user prompt, truncated.
    pub task: String,
}

#[derive(Debug, Deserialize)]
struct TranscriptLine {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default, rename = "sessionId")]
    session_id: String,
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    message: Option<TranscriptMessage>,
}

#[derive(Debug, Deserialize)]
struct TranscriptMessage {
    #[serde(default)]
    content: serde_json::Value,
}

/// Default location for session transcripts.
pub fn default_sessions_root() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".claude").join("projects"))
}

/// List recent sessions for a project directory, newest first.
pub fn list_sessions(project_path: &Path, limit: usize) -> Vec<SessionInfo> {
    match default_sessions_root() {
        Some(root) => list_sessions_in(&root, project_path, limit),
        None => Vec::new(),
    }
}

pub fn list_sessions_in(root: &Path, project_path: &Path, limit: usize) -> Vec<SessionInfo> {
    let session_dir = root.join(project_dir_name(project_path));
    let entries = match fs::read_dir(&session_dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut files: Vec<(std::time::SystemTime, PathBuf)> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "jsonl"))
        .filter_map(|path| {
            let mtime = path.metadata().and_then(|m| m.modified()).ok()?;
            Some((mtime, path))
        })
        .collect();
    files.sort_by(|a, b| b.0.cmp(&a.0));

    files
        .into_iter()
        .take(limit)
        .filter_map(|(_, path)| parse_session_file(&path))
        .collect()
}

/// `/home/dev/docs` → `-home-dev-docs`.
fn project_dir_name(project_path: &Path) -> String {
    project_path.to_string_lossy().replace('/', "-")
}

/// Extract session info from the first user message carrying a plain string
/// prompt. Malformed lines are skipped, never propagated.
fn parse_session_file(path: &Path) -> Option<SessionInfo> {
    let raw = fs::read_to_string(path).ok()?;

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(parsed) = serde_json::from_str::<TranscriptLine>(line) else {
            continue;
        };
        if parsed.kind != "user" || parsed.session_id.is_empty() {
            continue;
        }

        let task = match parsed.message.map(|m| m.content) {
            Some(serde_json::Value::String(content)) => content,
            // Tool-result arrays: skip, look for the next plain prompt.
            Some(serde_json::Value::Array(_)) => continue,
            _ => String::new(),
        };

        let task = clamp_chars(task.trim().replace('\n', " ").as_str(), TASK_PREVIEW_MAX);
        return Some(SessionInfo {
            session_id: parsed.session_id,
            timestamp: parsed.timestamp,
            task: if task.is_empty() {
                "(no prompt)".to_string()
            } else {
                task
            },
        });
    }

    None
}
