//! Per-agent event outbox and the consumer loop that drains it.
//!
//! One ordered, unbounded queue per agent; one long-lived consumer task per
//! agent. Consecutive `progress` events are buffered and flushed as a single
//! newline-joined unit when a non-progress event arrives, the buffer reaches
//! the flush threshold, or the idle timeout elapses. Non-progress events
//! always flush buffered progress first, preserving causal order.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::agent::AgentEvent;
use crate::approval::PendingApproval;

/// Recent tool-call labels kept for the status line.
const TOOL_HISTORY_MAX: usize = 8;
const TOOL_HISTORY_SHOWN: usize = 5;
const TOOL_INPUT_LABEL_MAX: usize = 120;
const ERROR_TEXT_MAX: usize = 200;

/// Rendering collaborator. Implementations post to whatever surface humans
/// watch (chat channel, TUI pane, log sink); failures are logged by the
/// consumer loops and never tear them down.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Post a block of text (flushed progress, resume notices).
    async fn post_text(&self, channel_id: u64, text: &str) -> anyhow::Result<()>;

    /// Refresh the editable status line for an in-flight run.
    async fn update_status(&self, channel_id: u64, status: &str) -> anyhow::Result<()>;

    /// Replace the status line with a terminal summary.
    async fn finish_status(&self, channel_id: u64, summary: &str) -> anyhow::Result<()>;

    /// Present a blocking human-input request.
    async fn present_approval(&self, channel_id: u64, request: &PendingApproval)
        -> anyhow::Result<()>;

    /// Post an inter-agent broadcast under the sending agent's name.
    async fn post_broadcast(&self, channel_id: u64, from: &str, text: &str)
        -> anyhow::Result<()>;
}

/// Handoff point between a session's stream loop and its consumer task.
///
/// `attach` hands out the receiving end; calling it again after the previous
/// consumer died swaps in a fresh channel pair, so events queued while no
/// consumer was alive are dropped rather than replayed.
pub struct EventOutbox {
    inner: Mutex<OutboxInner>,
}

struct OutboxInner {
    tx: mpsc::UnboundedSender<AgentEvent>,
    rx: Option<mpsc::UnboundedReceiver<AgentEvent>>,
}

impl EventOutbox {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Mutex::new(OutboxInner { tx, rx: Some(rx) }),
        }
    }

    pub fn push(&self, event: AgentEvent) {
        let inner = self.inner.lock();
        if inner.tx.send(event).is_err() {
            tracing::warn!(
                target: "hivemind::outbox",
                "event dropped: consumer not attached"
            );
        }
    }

    pub fn attach(&self) -> mpsc::UnboundedReceiver<AgentEvent> {
        let mut inner = self.inner.lock();
        if let Some(rx) = inner.rx.take() {
            return rx;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.tx = tx;
        rx
    }
}

impl Default for EventOutbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity and tunables handed to one consumer task.
#[derive(Debug, Clone)]
pub struct ConsumerContext {
    /// `project/name` of the agent this consumer serves.
    pub agent: String,
    pub channel_id: u64,
    pub batch_interval: Duration,
    pub flush_threshold: usize,
}

/// Long-running task: drain one agent's outbox into the renderer.
///
/// Exits when the outbox side is dropped (agent removed or channel swapped
/// for a restart). Renderer errors are logged and skipped.
pub async fn consume_events(
    mut rx: mpsc::UnboundedReceiver<AgentEvent>,
    renderer: std::sync::Arc<dyn Renderer>,
    ctx: ConsumerContext,
) {
    let mut progress: Vec<String> = Vec::new();
    let mut tool_history: Vec<String> = Vec::new();
    let mut task_started: Option<Instant> = None;

    loop {
        let event = match timeout(ctx.batch_interval, rx.recv()).await {
            Err(_) => {
                flush_progress(&*renderer, &ctx, &mut progress).await;
                if task_started.is_some() && !tool_history.is_empty() {
                    render_status(&*renderer, &ctx, task_started, &tool_history).await;
                }
                continue;
            }
            Ok(None) => {
                flush_progress(&*renderer, &ctx, &mut progress).await;
                tracing::info!(
                    target: "hivemind::outbox",
                    agent = %ctx.agent,
                    "outbox closed, consumer exiting"
                );
                return;
            }
            Ok(Some(event)) => event,
        };

        if let AgentEvent::Progress { text } = &event {
            progress.push(text.clone());
            let total: usize = progress.iter().map(String::len).sum();
            if total >= ctx.flush_threshold {
                flush_progress(&*renderer, &ctx, &mut progress).await;
            }
            continue;
        }

        // Non-progress: flush buffered progress first to keep causal order.
        flush_progress(&*renderer, &ctx, &mut progress).await;

        match event {
            AgentEvent::Start { .. } => {
                task_started = Some(Instant::now());
                tool_history.clear();
            }
            AgentEvent::ToolUse {
                tool_name,
                input_summary,
            } => {
                tool_history.push(tool_label(&tool_name, &input_summary));
                if tool_history.len() > TOOL_HISTORY_MAX {
                    let excess = tool_history.len() - TOOL_HISTORY_MAX;
                    tool_history.drain(..excess);
                }
                render_status(&*renderer, &ctx, task_started, &tool_history).await;
            }
            AgentEvent::Complete { cost, .. } => {
                let elapsed = task_started.map(|t| t.elapsed()).unwrap_or_default();
                let cost_str = match cost {
                    Some(c) if c > 0.0 => format!(" (${c:.4})"),
                    _ => String::new(),
                };
                let line = format!("Done in {}{}", format_elapsed(elapsed), cost_str);
                if let Err(error) = renderer.finish_status(ctx.channel_id, &line).await {
                    tracing::warn!(
                        target: "hivemind::outbox",
                        agent = %ctx.agent,
                        error = %error,
                        "failed to render completion"
                    );
                }
                task_started = None;
                tool_history.clear();
            }
            AgentEvent::Error { text, .. } => {
                let elapsed = task_started.map(|t| t.elapsed()).unwrap_or_default();
                let detail = if text.is_empty() {
                    "Unknown error".to_string()
                } else {
                    clamp_chars(&text, ERROR_TEXT_MAX)
                };
                let line = format!("Error after {}: {}", format_elapsed(elapsed), detail);
                if let Err(error) = renderer.finish_status(ctx.channel_id, &line).await {
                    tracing::warn!(
                        target: "hivemind::outbox",
                        agent = %ctx.agent,
                        error = %error,
                        "failed to render error"
                    );
                }
                task_started = None;
                tool_history.clear();
            }
            AgentEvent::Compact => {
                tool_history.push("Compacting conversation history".to_string());
                render_status(&*renderer, &ctx, task_started, &tool_history).await;
            }
            AgentEvent::Resumed { text } => {
                if let Err(error) = renderer.post_text(ctx.channel_id, &text).await {
                    tracing::warn!(
                        target: "hivemind::outbox",
                        agent = %ctx.agent,
                        error = %error,
                        "failed to render resume notice"
                    );
                }
            }
            AgentEvent::Progress { .. } => unreachable!("handled above"),
        }
    }
}

async fn flush_progress(renderer: &dyn Renderer, ctx: &ConsumerContext, buffer: &mut Vec<String>) {
    if buffer.is_empty() {
        return;
    }
    let text = buffer.join("\n");
    buffer.clear();
    for chunk in split_text(&text, ctx.flush_threshold) {
        if let Err(error) = renderer.post_text(ctx.channel_id, &chunk).await {
            tracing::warn!(
                target: "hivemind::outbox",
                agent = %ctx.agent,
                error = %error,
                "failed to render progress"
            );
        }
    }
}

async fn render_status(
    renderer: &dyn Renderer,
    ctx: &ConsumerContext,
    task_started: Option<Instant>,
    tool_history: &[String],
) {
    let elapsed = task_started.map(|t| t.elapsed()).unwrap_or_default();
    let mut lines = vec![format!("Working ({})", format_elapsed(elapsed))];
    let shown = tool_history.len().saturating_sub(TOOL_HISTORY_SHOWN);
    for label in &tool_history[shown..] {
        lines.push(format!("  | {label}"));
    }
    let status = lines.join("\n");
    if let Err(error) = renderer.update_status(ctx.channel_id, &status).await {
        tracing::warn!(
            target: "hivemind::outbox",
            agent = %ctx.agent,
            error = %error,
            "failed to render status"
        );
    }
}

/// Compact one-line label for a tool call.
fn tool_label(name: &str, input_summary: &str) -> String {
    let short = clamp_chars(&collapse_whitespace(input_summary), TOOL_INPUT_LABEL_MAX);
    if short.is_empty() {
        name.to_string()
    } else {
        format!("{name} {short}")
    }
}

fn collapse_whitespace(s: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\s+").expect("static regex"));
    re.replace_all(s.trim(), " ").into_owned()
}

/// Truncate to `max` characters, appending an ellipsis when truncated.
pub(crate) fn clamp_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push('…');
    out
}

/// Split text into chunks at newline boundaries, each at most `limit` chars.
pub(crate) fn split_text(text: &str, limit: usize) -> Vec<String> {
    if text.len() <= limit {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_len = 0;
    for line in text.split('\n') {
        if current_len + line.len() + 1 > limit && !current.is_empty() {
            chunks.push(current.join("\n"));
            current.clear();
            current_len = 0;
        }
        current_len += line.len() + 1;
        current.push(line);
    }
    if !current.is_empty() {
        chunks.push(current.join("\n"));
    }
    chunks
}

pub(crate) fn format_elapsed(elapsed: Duration) -> String {
    let s = elapsed.as_secs();
    if s < 60 {
        return format!("{s}s");
    }
    let (m, s) = (s / 60, s % 60);
    if m < 60 {
        return format!("{m}m {s}s");
    }
    let (h, m) = (m / 60, m % 60);
    format!("{h}h {m}m")
}
