//! Boundary to the external AI session service.
//!
//! Heterogeneous stream payloads are decoded into [`StreamMessage`] exactly
//! once, at this boundary; everything downstream matches on the sum type.
//! The traits are implemented by the embedding application (or by scripted
//! fakes in tests).

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::agent::AgentEvent;
use crate::outbox::EventOutbox;
use crate::tools::AgentTools;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("stream failed: {0}")]
    Stream(String),
}

/// One decoded message from a streamed response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    /// An assistant text segment.
    TextSegment { text: String },
    /// The assistant invoked a tool.
    ToolInvocation {
        name: String,
        input: serde_json::Value,
    },
    /// Output of an earlier tool invocation. Not surfaced as an event;
    /// human-input and broadcast tools report through their own bridges.
    ToolResult { output: String },
    /// End of the run.
    TerminalResult {
        is_error: bool,
        result: String,
        cost_usd: Option<f64>,
        session_id: String,
    },
}

/// How a new session relates to prior conversation history.
///
/// `Resume` takes precedence when the caller supplies both a session id and
/// the continue flag; see [`ResumeMode::from_flags`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ResumeMode {
    #[default]
    Fresh,
    /// Reconnect to a specific external session id.
    Resume(String),
    /// Pick up the most recent session for the working directory.
    ContinueLatest,
}

impl ResumeMode {
    pub fn from_flags(resume_session: Option<String>, continue_latest: bool) -> Self {
        match resume_session {
            Some(id) if !id.is_empty() => ResumeMode::Resume(id),
            _ if continue_latest => ResumeMode::ContinueLatest,
            _ => ResumeMode::Fresh,
        }
    }
}

/// Fired by the client when the external service compacts conversation
/// context, so the session's consumer can surface it.
#[derive(Clone)]
pub struct CompactNotifier {
    outbox: Arc<EventOutbox>,
}

impl CompactNotifier {
    pub(crate) fn new(outbox: Arc<EventOutbox>) -> Self {
        Self { outbox }
    }

    pub fn notify(&self) {
        self.outbox.push(AgentEvent::Compact);
    }
}

/// Everything a client needs to open one session.
pub struct SessionOptions {
    pub cwd: PathBuf,
    pub system_prompt: String,
    pub allowed_tools: Vec<String>,
    pub resume: ResumeMode,
    pub on_compact: CompactNotifier,
    /// Per-agent tool bindings the client services `ask_human` /
    /// `post_broadcast` / `list_peers` calls through.
    pub tools: Arc<AgentTools>,
}

#[async_trait]
pub trait SessionClient: Send + Sync {
    async fn open(&self, opts: SessionOptions) -> Result<Box<dyn SessionHandle>, ClientError>;
}

/// Exclusively-owned handle to one open external session.
#[async_trait]
pub trait SessionHandle: Send {
    /// Forward one input to the session.
    async fn submit(&mut self, text: &str) -> Result<(), ClientError>;

    /// Next message of the current response; `None` once the response is
    /// drained (after a `TerminalResult`).
    async fn next_message(&mut self) -> Result<Option<StreamMessage>, ClientError>;

    /// Close the session. Must be idempotent.
    async fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::ResumeMode;

    #[test]
    fn resume_id_takes_precedence_over_continue() {
        let mode = ResumeMode::from_flags(Some("sess-1".into()), true);
        assert_eq!(mode, ResumeMode::Resume("sess-1".into()));
    }

    #[test]
    fn continue_without_id() {
        assert_eq!(
            ResumeMode::from_flags(None, true),
            ResumeMode::ContinueLatest
        );
    }

    #[test]
    fn empty_id_is_not_a_resume() {
        assert_eq!(
            ResumeMode::from_flags(Some(String::new()), false),
            ResumeMode::Fresh
        );
    }

    #[test]
    fn neither_flag_is_fresh() {
        assert_eq!(ResumeMode::from_flags(None, false), ResumeMode::Fresh);
    }
}
