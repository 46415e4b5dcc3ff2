use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::supervisor::SupervisorPolicy;

/// Tunables for the orchestration core.
///
/// Loaded by the embedding application from wherever it keeps configuration;
/// every field has a default so `{}` deserializes to a working config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Where the durable registry snapshot is written.
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,

    /// Idle timeout for per-agent event consumers. Buffered progress is
    /// flushed when this elapses without a new event.
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,

    /// Buffered progress is flushed early once its combined length reaches
    /// this many characters.
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,

    /// Tool allow-list applied to projects created without an explicit one.
    #[serde(default = "default_allowed_tools")]
    pub default_allowed_tools: Vec<String>,

    #[serde(default)]
    pub supervisor: SupervisorPolicy,
}

fn default_state_path() -> PathBuf {
    PathBuf::from("state.json")
}

fn default_batch_interval_ms() -> u64 {
    2000
}

fn default_flush_threshold() -> usize {
    1900
}

fn default_allowed_tools() -> Vec<String> {
    [
        "Read",
        "Write",
        "Edit",
        "Bash",
        "Glob",
        "Grep",
        "ask_human",
        "post_broadcast",
        "list_peers",
    ]
    .into_iter()
    .map(ToOwned::to_owned)
    .collect()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
            batch_interval_ms: default_batch_interval_ms(),
            flush_threshold: default_flush_threshold(),
            default_allowed_tools: default_allowed_tools(),
            supervisor: SupervisorPolicy::default(),
        }
    }
}
