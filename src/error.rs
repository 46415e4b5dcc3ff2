use std::path::PathBuf;

/// Error taxonomy for the orchestration core.
///
/// `Connection` surfaces a failed session open to the caller and is never
/// retried internally; `Run` covers mid-stream failures that are recorded on
/// the session and recovered (if at all) by the supervisor's error-storm
/// policy. Lookup misses have no side effects.
#[derive(Debug, thiserror::Error)]
pub enum HiveError {
    #[error("failed to open session: {0}")]
    Connection(String),

    #[error("run failed: {0}")]
    Run(String),

    #[error("unknown project: {0}")]
    UnknownProject(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("project {0} already exists")]
    DuplicateProject(String),

    #[error("agent {0} already exists")]
    DuplicateAgent(String),

    #[error("agent {0} is not started")]
    NotStarted(String),

    #[error("failed to persist state to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, HiveError>;
