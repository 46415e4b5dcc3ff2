//! Per-agent tool bindings over the approval and collab bridges.
//!
//! One `AgentTools` is built for each session at start time and handed to
//! the external client through `SessionOptions`; the client services
//! `ask_human`, `post_broadcast`, and `list_peers` tool calls through it.
//! Bridges are injected explicitly rather than reached through globals.

use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::agent::{AgentStatus, SessionState};
use crate::approval::ApprovalBridge;
use crate::collab::CollabBus;
use crate::registry::PeerDirectory;

pub struct AgentTools {
    full_name: String,
    project: String,
    state: Arc<Mutex<SessionState>>,
    approval: Arc<ApprovalBridge>,
    collab: Arc<CollabBus>,
    peers: Arc<dyn PeerDirectory>,
}

impl AgentTools {
    pub(crate) fn new(
        full_name: String,
        project: String,
        state: Arc<Mutex<SessionState>>,
        approval: Arc<ApprovalBridge>,
        collab: Arc<CollabBus>,
        peers: Arc<dyn PeerDirectory>,
    ) -> Self {
        Self {
            full_name,
            project,
            state,
            approval,
            collab,
            peers,
        }
    }

    pub fn agent(&self) -> &str {
        &self.full_name
    }

    /// Ask the human operator a question and block until they answer.
    /// The session reads as `waiting` for the duration.
    pub async fn ask_human(&self, question: &str, options: Vec<String>) -> String {
        self.state.lock().status = AgentStatus::Waiting;
        let answer = self
            .approval
            .request(&self.full_name, question, options)
            .await;
        {
            let mut state = self.state.lock();
            state.status = AgentStatus::Running;
            state.last_activity = Some(std::time::Instant::now());
        }
        answer
    }

    /// Post a message to the project's broadcast channel. Returns the peers
    /// mentioned with `@name`.
    pub async fn post_broadcast(&self, message: &str) -> Vec<String> {
        self.collab
            .post(&self.full_name, &self.project, message, self.peers.as_ref())
            .await
    }

    /// Formatted roster of the project's agents with status, role, and
    /// current task.
    pub async fn list_peers(&self) -> String {
        let peers = self.peers.peers_of(&self.project).await;
        if peers.is_empty() {
            return "No agents in this project.".to_string();
        }

        let mut out = String::from("Agents in this project:");
        for peer in peers {
            let _ = write!(out, "\n- {} [{}]", peer.name, peer.status);
            if !peer.persona.is_empty() {
                let _ = write!(out, " ({})", peer.persona);
            } else if !peer.role.is_empty() {
                let _ = write!(out, " ({})", peer.role);
            }
            if !peer.current_task.is_empty() {
                let _ = write!(out, ": {}", peer.current_task);
            }
        }
        out
    }
}
