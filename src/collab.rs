//! Fire-and-forget broadcast bus for inter-agent messages.
//!
//! `post` parses `@name` mentions against the sender project's current
//! roster and enqueues; a single central consumer drains the queue strictly
//! FIFO and fans each message out to the project's broadcast render surface
//! and to every other agent in the project. There is no deduplication and no
//! delivery acknowledgment.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::outbox::Renderer;
use crate::registry::{PeerDirectory, SessionRegistry};

/// An agent-originated broadcast. Ephemeral: queued, delivered, discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollabMessage {
    /// Full name (`project/name`) of the sender.
    pub from: String,
    pub project: String,
    pub text: String,
    pub mentions: Vec<String>,
}

pub struct CollabBus {
    tx: mpsc::UnboundedSender<CollabMessage>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<CollabMessage>>,
}

impl CollabBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Parse mentions against the sender project's roster and enqueue.
    /// Never blocks beyond queue insertion. Returns the parsed mentions.
    pub async fn post(
        &self,
        from: &str,
        project: &str,
        text: &str,
        directory: &dyn PeerDirectory,
    ) -> Vec<String> {
        let roster: HashSet<String> = directory
            .peers_of(project)
            .await
            .into_iter()
            .map(|peer| peer.name)
            .collect();
        let mentions = parse_mentions(text, &roster);

        tracing::debug!(
            target: "hivemind::collab",
            from = %from,
            mentions = ?mentions,
            "broadcast posted"
        );

        let _ = self.tx.send(CollabMessage {
            from: from.to_string(),
            project: project.to_string(),
            text: text.to_string(),
            mentions: mentions.clone(),
        });
        mentions
    }

    /// Next queued message, strictly FIFO. `None` once the bus is dropped.
    pub async fn next_message(&self) -> Option<CollabMessage> {
        self.rx.lock().await.recv().await
    }
}

impl Default for CollabBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract whole-token `@name` mentions that exactly match a roster entry
/// (case-sensitive). Trailing sentence punctuation is stripped, but a token
/// whose remainder is not a roster name (`@bob's`, `@bob.alice`) mentions
/// nobody.
pub fn parse_mentions(text: &str, roster: &HashSet<String>) -> Vec<String> {
    text.split_whitespace()
        .filter_map(|token| token.strip_prefix('@'))
        .map(|name| name.trim_end_matches(['.', ',', '!', '?', ';', ':']))
        .filter(|name| roster.contains(*name))
        .map(str::to_string)
        .collect()
}

/// Long-running task: drain the bus and fan each message out through the
/// registry. Messages whose project has vanished are dropped with a warning.
pub async fn run_collab_consumer(
    bus: Arc<CollabBus>,
    registry: Arc<SessionRegistry>,
    renderer: Arc<dyn Renderer>,
) {
    while let Some(message) = bus.next_message().await {
        if let Err(error) = registry.fan_out_broadcast(&message, renderer.as_ref()).await {
            tracing::warn!(
                target: "hivemind::collab",
                from = %message.from,
                error = %error,
                "failed to fan out broadcast"
            );
        }
    }
}
