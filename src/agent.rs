//! One persistent AI conversation bound to a project directory.
//!
//! An `AgentSession` owns the exclusively-held external session handle, a
//! per-agent ordered event outbox, and the lifecycle state machine. Runs are
//! driven by a spawned task that locks the handle for the whole exchange, so
//! at most one run is in flight; a follow-up input queues behind the current
//! run instead of interleaving with it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::approval::ApprovalBridge;
use crate::client::{
    ClientError, CompactNotifier, ResumeMode, SessionClient, SessionHandle, SessionOptions,
    StreamMessage,
};
use crate::collab::CollabBus;
use crate::error::{HiveError, Result};
use crate::outbox::EventOutbox;
use crate::registry::PeerDirectory;
use crate::tools::AgentTools;

/// Tool-call input renderings are clamped to this many characters.
const TOOL_INPUT_MAX: usize = 300;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Idle,
    Running,
    /// Blocked on a human-approval request.
    Waiting,
    Done,
    Error,
}

impl AgentStatus {
    /// True when a delivered message should start a new run rather than be
    /// injected into an in-flight one.
    pub fn accepts_new_task(self) -> bool {
        matches!(self, AgentStatus::Idle | AgentStatus::Done | AgentStatus::Error)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Running => "running",
            AgentStatus::Waiting => "waiting",
            AgentStatus::Done => "done",
            AgentStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// An event pushed onto the agent's outbox for its consumer task.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Start { task: String },
    Progress { text: String },
    ToolUse {
        tool_name: String,
        input_summary: String,
    },
    Complete {
        text: String,
        cost: Option<f64>,
        session_id: String,
    },
    Error {
        text: String,
        cost: Option<f64>,
        session_id: String,
    },
    Resumed { text: String },
    Compact,
}

/// Mutable per-session state shared between the session, its run tasks, and
/// its tool bindings. Locked only for short synchronous sections.
#[derive(Debug, Default)]
pub(crate) struct SessionState {
    pub(crate) status: AgentStatus,
    pub(crate) session_id: String,
    pub(crate) total_cost: f64,
    pub(crate) consecutive_errors: u32,
    pub(crate) last_activity: Option<Instant>,
    pub(crate) current_task: String,
}

pub struct AgentSession {
    pub name: String,
    pub project_name: String,
    pub project_path: PathBuf,
    pub channel_id: u64,
    pub system_prompt: String,
    pub allowed_tools: Vec<String>,
    /// Free-form role instructions layered into the system prompt.
    pub role: String,
    /// Persona key; the prompt text behind it lives outside this crate.
    pub persona: String,

    state: Arc<Mutex<SessionState>>,
    outbox: Arc<EventOutbox>,
    handle: Option<Arc<AsyncMutex<Box<dyn SessionHandle>>>>,
    /// Every live run task, including inputs still queued on the handle
    /// lock. Finished entries are pruned on the next spawn.
    runs: Vec<JoinHandle<()>>,
}

impl AgentSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        project_name: impl Into<String>,
        project_path: impl Into<PathBuf>,
        channel_id: u64,
        system_prompt: impl Into<String>,
        allowed_tools: Vec<String>,
        role: impl Into<String>,
        persona: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            project_name: project_name.into(),
            project_path: project_path.into(),
            channel_id,
            system_prompt: system_prompt.into(),
            allowed_tools,
            role: role.into(),
            persona: persona.into(),
            state: Arc::new(Mutex::new(SessionState::default())),
            outbox: Arc::new(EventOutbox::new()),
            runs: Vec::new(),
            handle: None,
        }
    }

    /// Registry-wide unique key: `project/name`.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.project_name, self.name)
    }

    pub fn status(&self) -> AgentStatus {
        self.state.lock().status
    }

    pub fn session_id(&self) -> String {
        self.state.lock().session_id.clone()
    }

    pub(crate) fn set_session_id(&self, id: impl Into<String>) {
        self.state.lock().session_id = id.into();
    }

    pub fn total_cost(&self) -> f64 {
        self.state.lock().total_cost
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.state.lock().consecutive_errors
    }

    pub(crate) fn reset_errors(&self) {
        self.state.lock().consecutive_errors = 0;
    }

    pub fn current_task(&self) -> String {
        self.state.lock().current_task.clone()
    }

    /// Seconds since the session last produced an event, if it ever has.
    pub fn idle_seconds(&self) -> Option<u64> {
        self.state.lock().last_activity.map(|t| t.elapsed().as_secs())
    }

    /// Handle present ⇔ session not stopped cold.
    pub fn is_started(&self) -> bool {
        self.handle.is_some()
    }

    pub(crate) fn outbox(&self) -> &Arc<EventOutbox> {
        &self.outbox
    }

    /// Open the external session.
    ///
    /// Fails with [`HiveError::Connection`] if the handle cannot be opened;
    /// the failure is surfaced to the caller and never retried here.
    pub async fn start(
        &mut self,
        client: &dyn SessionClient,
        resume: ResumeMode,
        approval: Arc<ApprovalBridge>,
        collab: Arc<CollabBus>,
        peers: Arc<dyn PeerDirectory>,
    ) -> Result<()> {
        let tools = Arc::new(AgentTools::new(
            self.full_name(),
            self.project_name.clone(),
            Arc::clone(&self.state),
            approval,
            collab,
            peers,
        ));

        let opts = SessionOptions {
            cwd: self.project_path.clone(),
            system_prompt: self.system_prompt.clone(),
            allowed_tools: self.allowed_tools.clone(),
            resume: resume.clone(),
            on_compact: CompactNotifier::new(Arc::clone(&self.outbox)),
            tools,
        };

        let handle = client
            .open(opts)
            .await
            .map_err(|error| HiveError::Connection(error.to_string()))?;
        self.handle = Some(Arc::new(AsyncMutex::new(handle)));

        let mut state = self.state.lock();
        state.status = AgentStatus::Idle;
        match &resume {
            ResumeMode::Resume(id) => {
                state.session_id = id.clone();
                tracing::info!(
                    target: "hivemind::agent",
                    agent = %self.full_name(),
                    session = %id,
                    "resumed session"
                );
            }
            ResumeMode::ContinueLatest => {
                tracing::info!(
                    target: "hivemind::agent",
                    agent = %self.full_name(),
                    cwd = %self.project_path.display(),
                    "continuing latest session"
                );
            }
            ResumeMode::Fresh => {
                tracing::info!(
                    target: "hivemind::agent",
                    agent = %self.full_name(),
                    cwd = %self.project_path.display(),
                    "connected"
                );
            }
        }
        Ok(())
    }

    /// Start a new run: emit `start`, forward the task, stream the response.
    /// Returns immediately; the run proceeds on a spawned task.
    pub fn run_task(&mut self, task: &str) -> Result<()> {
        let handle = self
            .handle
            .clone()
            .ok_or_else(|| HiveError::NotStarted(self.full_name()))?;
        {
            let mut state = self.state.lock();
            state.status = AgentStatus::Running;
            state.current_task = task.to_string();
            state.last_activity = Some(Instant::now());
        }
        self.outbox.push(AgentEvent::Start {
            task: task.to_string(),
        });
        self.spawn_run(handle, task.to_string());
        Ok(())
    }

    /// Forward follow-up input into the active conversation. No `start`
    /// event; queues behind any in-flight run.
    pub fn send_input(&mut self, text: &str) -> Result<()> {
        let handle = self
            .handle
            .clone()
            .ok_or_else(|| HiveError::NotStarted(self.full_name()))?;
        {
            let mut state = self.state.lock();
            state.status = AgentStatus::Running;
            state.last_activity = Some(Instant::now());
        }
        self.spawn_run(handle, text.to_string());
        Ok(())
    }

    fn spawn_run(&mut self, handle: Arc<AsyncMutex<Box<dyn SessionHandle>>>, text: String) {
        let state = Arc::clone(&self.state);
        let outbox = Arc::clone(&self.outbox);
        let full_name = self.full_name();
        self.runs.retain(|run| !run.is_finished());
        self.runs.push(tokio::spawn(drive_run(
            handle, state, outbox, full_name, text,
        )));
    }

    /// Cancel every in-flight and queued run and close the handle.
    /// Idempotent.
    pub async fn stop(&mut self) {
        for run in self.runs.drain(..) {
            run.abort();
        }
        if let Some(handle) = self.handle.take() {
            handle.lock().await.close().await;
        }
        self.state.lock().status = AgentStatus::Idle;
        tracing::info!(
            target: "hivemind::agent",
            agent = %self.full_name(),
            "stopped"
        );
    }
}

async fn drive_run(
    handle: Arc<AsyncMutex<Box<dyn SessionHandle>>>,
    state: Arc<Mutex<SessionState>>,
    outbox: Arc<EventOutbox>,
    full_name: String,
    text: String,
) {
    let mut session = handle.lock().await;
    {
        // A queued input acquires the handle only after the previous run's
        // terminal result has already moved the status on.
        let mut st = state.lock();
        st.status = AgentStatus::Running;
        st.last_activity = Some(Instant::now());
    }
    if let Err(error) = stream_response(session.as_mut(), &state, &outbox, &text).await {
        {
            let mut st = state.lock();
            st.status = AgentStatus::Error;
            st.consecutive_errors += 1;
            st.last_activity = Some(Instant::now());
        }
        outbox.push(AgentEvent::Error {
            text: error.to_string(),
            cost: None,
            session_id: String::new(),
        });
        tracing::error!(
            target: "hivemind::agent",
            agent = %full_name,
            error = %error,
            "run failed"
        );
    }
}

async fn stream_response(
    session: &mut dyn SessionHandle,
    state: &Mutex<SessionState>,
    outbox: &EventOutbox,
    text: &str,
) -> std::result::Result<(), ClientError> {
    session.submit(text).await?;
    while let Some(message) = session.next_message().await? {
        process_message(message, state, outbox);
    }
    Ok(())
}

fn process_message(message: StreamMessage, state: &Mutex<SessionState>, outbox: &EventOutbox) {
    match message {
        StreamMessage::TextSegment { text } => {
            let text = text.trim();
            if text.is_empty() {
                return;
            }
            state.lock().last_activity = Some(Instant::now());
            outbox.push(AgentEvent::Progress {
                text: text.to_string(),
            });
        }
        StreamMessage::ToolInvocation { name, input } => {
            state.lock().last_activity = Some(Instant::now());
            outbox.push(AgentEvent::ToolUse {
                tool_name: name,
                input_summary: render_tool_input(&input),
            });
        }
        // Tool results flow back through the approval/collab bridges, not
        // the event stream.
        StreamMessage::ToolResult { .. } => {}
        StreamMessage::TerminalResult {
            is_error,
            result,
            cost_usd,
            session_id,
        } => {
            let mut st = state.lock();
            st.session_id = session_id.clone();
            st.total_cost += cost_usd.unwrap_or(0.0);
            st.last_activity = Some(Instant::now());
            if is_error {
                st.status = AgentStatus::Error;
                st.consecutive_errors += 1;
                drop(st);
                let text = if result.is_empty() {
                    "Unknown error".to_string()
                } else {
                    result
                };
                outbox.push(AgentEvent::Error {
                    text,
                    cost: cost_usd,
                    session_id,
                });
            } else {
                st.status = AgentStatus::Done;
                st.consecutive_errors = 0;
                drop(st);
                outbox.push(AgentEvent::Complete {
                    text: result,
                    cost: cost_usd,
                    session_id,
                });
            }
        }
    }
}

/// Human-readable rendering of a tool-call input, clamped to 300 chars.
fn render_tool_input(input: &serde_json::Value) -> String {
    let rendered = match input {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    crate::outbox::clamp_chars(&rendered, TOOL_INPUT_MAX)
}
