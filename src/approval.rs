//! Bridge between blocking human-input tool calls and asynchronous answers.
//!
//! An agent's `ask_human` call registers a pending request and parks on a
//! oneshot receiver; the rendering collaborator drains the shared request
//! queue, shows the question, and eventually calls [`ApprovalBridge::resolve`].
//! The oneshot sender is removed from the pending map on the first resolve,
//! so a request is resolved at most once and later attempts report failure.
//!
//! There is no timeout: a request nobody answers blocks its agent
//! indefinitely.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::outbox::Renderer;
use crate::registry::SessionRegistry;

/// A pending human-input request, as handed to the rendering collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingApproval {
    pub request_id: String,
    /// Full name (`project/name`) of the requesting agent.
    pub agent: String,
    pub question: String,
    pub options: Vec<String>,
}

pub struct ApprovalBridge {
    pending: Mutex<HashMap<String, oneshot::Sender<String>>>,
    queue_tx: mpsc::UnboundedSender<PendingApproval>,
    queue_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<PendingApproval>>,
}

impl ApprovalBridge {
    pub fn new() -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            pending: Mutex::new(HashMap::new()),
            queue_tx,
            queue_rx: tokio::sync::Mutex::new(queue_rx),
        }
    }

    /// Register a request and block until it is resolved.
    ///
    /// Returns the answer, or an empty string if the bridge was torn down
    /// before anyone resolved it.
    pub async fn request(&self, agent: &str, question: &str, options: Vec<String>) -> String {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), tx);

        tracing::info!(
            target: "hivemind::approval",
            request = %request_id,
            agent = %agent,
            question = %question,
            "human-input request"
        );

        let _ = self.queue_tx.send(PendingApproval {
            request_id,
            agent: agent.to_string(),
            question: question.to_string(),
            options,
        });

        rx.await.unwrap_or_default()
    }

    /// Resolve a pending request. First resolve wins; unknown or
    /// already-resolved ids return `false` without side effects.
    pub fn resolve(&self, request_id: &str, answer: &str) -> bool {
        let Some(tx) = self.pending.lock().remove(request_id) else {
            tracing::warn!(
                target: "hivemind::approval",
                request = %request_id,
                "resolve for unknown request"
            );
            return false;
        };
        // The requester may have been cancelled; the request still counts
        // as resolved.
        let _ = tx.send(answer.to_string());
        tracing::info!(
            target: "hivemind::approval",
            request = %request_id,
            "request resolved"
        );
        true
    }

    /// Next request for the rendering collaborator. `None` once the bridge
    /// is dropped.
    pub async fn next_request(&self) -> Option<PendingApproval> {
        self.queue_rx.lock().await.recv().await
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Default for ApprovalBridge {
    fn default() -> Self {
        Self::new()
    }
}

/// Long-running task: route pending requests to the requesting agent's
/// channel. Requests from agents that no longer exist are auto-resolved with
/// a failure message so the requester never hangs on a dead identity.
pub async fn run_approval_consumer(
    bridge: Arc<ApprovalBridge>,
    registry: Arc<SessionRegistry>,
    renderer: Arc<dyn Renderer>,
) {
    while let Some(request) = bridge.next_request().await {
        let Some(channel_id) = registry.channel_for_agent(&request.agent).await else {
            tracing::warn!(
                target: "hivemind::approval",
                agent = %request.agent,
                "approval request from unknown agent"
            );
            bridge.resolve(&request.request_id, "Agent not found");
            continue;
        };

        if let Err(error) = renderer.present_approval(channel_id, &request).await {
            tracing::warn!(
                target: "hivemind::approval",
                request = %request.request_id,
                error = %error,
                "failed to present approval request"
            );
        }
    }
}
