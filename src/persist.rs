//! Durable snapshot of the session registry.
//!
//! One JSON document holding every project and agent field needed to
//! reconstruct external session ids after a restart. Written atomically
//! (temp file + rename) after every mutating operation and at the end of
//! every supervisor tick; a save→load cycle is lossless for all fields.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{HiveError, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedAgent {
    pub name: String,
    pub channel_id: u64,
    /// Last known external session id; empty when the agent never finished
    /// a run.
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub persona: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedProject {
    pub name: String,
    pub path: PathBuf,
    pub group_channel_id: u64,
    pub broadcast_channel_id: u64,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub agents: Vec<PersistedAgent>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub projects: Vec<PersistedProject>,
}

impl PersistedState {
    pub fn new(projects: Vec<PersistedProject>) -> Self {
        Self {
            saved_at: Some(Utc::now()),
            projects,
        }
    }
}

/// Write the snapshot atomically: serialize to `<path>.tmp`, then rename
/// over the target.
pub fn save(path: &Path, state: &PersistedState) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|source| HiveError::Persist {
                path: path.to_path_buf(),
                source,
            })?;
        }
    }

    let json = serde_json::to_string_pretty(state)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, json).map_err(|source| HiveError::Persist {
        path: tmp.clone(),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| HiveError::Persist {
        path: path.to_path_buf(),
        source,
    })?;

    tracing::debug!(
        target: "hivemind::persist",
        path = %path.display(),
        projects = state.projects.len(),
        "state saved"
    );
    Ok(())
}

/// Load a snapshot. A missing file is an empty state; a corrupt file is
/// logged and treated as empty rather than blocking startup.
pub fn load(path: &Path) -> PersistedState {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return PersistedState::default();
        }
        Err(error) => {
            tracing::warn!(
                target: "hivemind::persist",
                path = %path.display(),
                error = %error,
                "failed to read state file"
            );
            return PersistedState::default();
        }
    };

    match serde_json::from_str(&raw) {
        Ok(state) => state,
        Err(error) => {
            tracing::warn!(
                target: "hivemind::persist",
                path = %path.display(),
                error = %error,
                "state file is corrupt, starting empty"
            );
            PersistedState::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> PersistedState {
        PersistedState::new(vec![PersistedProject {
            name: "docs".into(),
            path: PathBuf::from("/home/dev/docs"),
            group_channel_id: 100,
            broadcast_channel_id: 101,
            system_prompt: "Keep it short.".into(),
            allowed_tools: vec!["Read".into(), "Write".into()],
            agents: vec![
                PersistedAgent {
                    name: "writer".into(),
                    channel_id: 110,
                    session_id: "sess-abc".into(),
                    role: "tech writer".into(),
                    persona: "qa".into(),
                },
                PersistedAgent {
                    name: "reviewer".into(),
                    channel_id: 111,
                    session_id: String::new(),
                    role: String::new(),
                    persona: String::new(),
                },
            ],
        }])
    }

    #[test]
    fn save_load_round_trip_is_lossless() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let state = sample_state();
        save(&path, &state).unwrap();
        let loaded = load(&path);

        assert_eq!(loaded.projects, state.projects);
        let agent = &loaded.projects[0].agents[0];
        assert_eq!(agent.session_id, "sess-abc");
        assert_eq!(agent.persona, "qa");
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load(&dir.path().join("nope.json"));
        assert!(loaded.projects.is_empty());
    }

    #[test]
    fn corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();
        let loaded = load(&path);
        assert!(loaded.projects.is_empty());
    }

    #[test]
    fn save_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/state.json");
        save(&path, &sample_state()).unwrap();
        assert!(path.is_file());
    }

    #[test]
    fn save_leaves_no_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        save(&path, &sample_state()).unwrap();
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn optional_fields_default_when_absent() {
        let raw = r#"{
            "projects": [{
                "name": "docs",
                "path": "/p",
                "group_channel_id": 1,
                "broadcast_channel_id": 2,
                "agents": [{"name": "w", "channel_id": 3}]
            }]
        }"#;
        let state: PersistedState = serde_json::from_str(raw).unwrap();
        assert_eq!(state.projects[0].agents[0].session_id, "");
        assert!(state.projects[0].allowed_tools.is_empty());
    }
}
