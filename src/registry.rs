//! Project/agent registry, command surface, and peer directory.
//!
//! The registry is the single writer for all shared orchestration state:
//! the command surface, the collab fan-out, and the supervisor all mutate
//! through it, and every mutating operation is followed by a persistence
//! write. It also owns the per-agent consumer task handles so shutdown and
//! supervisor restarts can cancel them deterministically.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::agent::{AgentEvent, AgentSession, AgentStatus};
use crate::approval::ApprovalBridge;
use crate::client::{ResumeMode, SessionClient};
use crate::collab::CollabMessage;
use crate::config::OrchestratorConfig;
use crate::error::{HiveError, Result};
use crate::outbox::{clamp_chars, consume_events, ConsumerContext, Renderer};
use crate::persist::{self, PersistedAgent, PersistedProject, PersistedState};
use crate::sessions::{self, SessionInfo};

/// Broadcast render text is clamped to this many characters.
const BROADCAST_TEXT_MAX: usize = 2000;

/// Point-in-time view of one agent, for rosters and tool listings.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub name: String,
    pub status: AgentStatus,
    pub role: String,
    pub persona: String,
    pub current_task: String,
}

/// Peer lookup seam, queried by project name at call time so rosters are
/// always current.
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    async fn peers_of(&self, project: &str) -> Vec<PeerInfo>;
}

/// A named working-directory group of agents sharing a broadcast channel.
pub struct Project {
    pub name: String,
    pub path: PathBuf,
    pub group_channel_id: u64,
    pub broadcast_channel_id: u64,
    pub system_prompt: String,
    pub allowed_tools: Vec<String>,
    pub agents: HashMap<String, AgentSession>,
}

/// Parameters for spawning one agent.
#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    pub name: String,
    pub channel_id: u64,
    pub role: String,
    pub persona: String,
    pub resume_session: Option<String>,
    pub continue_latest: bool,
    pub initial_task: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AgentSummary {
    pub name: String,
    pub status: AgentStatus,
    pub current_task: String,
    pub total_cost: f64,
    pub session_id: String,
    pub consecutive_errors: u32,
}

#[derive(Debug, Clone)]
pub struct ProjectSummary {
    pub name: String,
    pub path: PathBuf,
    pub agents: Vec<AgentSummary>,
}

struct RegistryInner {
    projects: HashMap<String, Project>,
    /// Consumer task per agent full name.
    consumers: HashMap<String, JoinHandle<()>>,
}

pub struct SessionRegistry {
    client: Arc<dyn SessionClient>,
    renderer: Arc<dyn Renderer>,
    approval: Arc<ApprovalBridge>,
    collab: Arc<crate::collab::CollabBus>,
    config: OrchestratorConfig,
    /// Self-reference handed to agents as their peer directory.
    weak: Weak<SessionRegistry>,
    inner: AsyncMutex<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(
        client: Arc<dyn SessionClient>,
        renderer: Arc<dyn Renderer>,
        approval: Arc<ApprovalBridge>,
        collab: Arc<crate::collab::CollabBus>,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            client,
            renderer,
            approval,
            collab,
            config,
            weak: weak.clone(),
            inner: AsyncMutex::new(RegistryInner {
                projects: HashMap::new(),
                consumers: HashMap::new(),
            }),
        })
    }

    /// Directory view of this registry. The upgrade only fails during
    /// teardown, when no agent should be starting anyway.
    fn directory(&self) -> Arc<dyn PeerDirectory> {
        match self.weak.upgrade() {
            Some(registry) => registry,
            None => Arc::new(EmptyDirectory),
        }
    }

    // ------------------------------------------------------------------
    // Command surface
    // ------------------------------------------------------------------

    pub async fn create_project(
        &self,
        name: &str,
        path: impl Into<PathBuf>,
        group_channel_id: u64,
        broadcast_channel_id: u64,
        system_prompt: Option<String>,
        allowed_tools: Option<Vec<String>>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.projects.contains_key(name) {
            return Err(HiveError::DuplicateProject(name.to_string()));
        }
        inner.projects.insert(
            name.to_string(),
            Project {
                name: name.to_string(),
                path: path.into(),
                group_channel_id,
                broadcast_channel_id,
                system_prompt: system_prompt.unwrap_or_default(),
                allowed_tools: allowed_tools
                    .unwrap_or_else(|| self.config.default_allowed_tools.clone()),
                agents: HashMap::new(),
            },
        );
        tracing::info!(target: "hivemind::registry", project = %name, "project created");
        self.save_locked(&inner)
    }

    pub async fn delete_project(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let mut project = inner
            .projects
            .remove(name)
            .ok_or_else(|| HiveError::UnknownProject(name.to_string()))?;

        for (_, mut agent) in project.agents.drain() {
            if let Some(consumer) = inner.consumers.remove(&agent.full_name()) {
                consumer.abort();
            }
            agent.stop().await;
        }
        tracing::info!(target: "hivemind::registry", project = %name, "project deleted");
        self.save_locked(&inner)
    }

    /// Spawn an agent into a project and start its event consumer.
    ///
    /// Exactly one of resume-session/continue-latest/neither is honored;
    /// a resume id takes precedence. A connection failure is returned to
    /// the caller with nothing inserted.
    pub async fn spawn_agent(&self, project: &str, request: SpawnRequest) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let (path, allowed_tools, prompt) = {
            let proj = inner
                .projects
                .get(project)
                .ok_or_else(|| HiveError::UnknownProject(project.to_string()))?;
            if proj.agents.contains_key(&request.name) {
                return Err(HiveError::DuplicateAgent(format!(
                    "{project}/{}",
                    request.name
                )));
            }
            let peers = peer_labels(proj, &request.name);
            (
                proj.path.clone(),
                proj.allowed_tools.clone(),
                compose_system_prompt(&proj.system_prompt, &request.role, &peers),
            )
        };

        let mut agent = AgentSession::new(
            request.name.clone(),
            project,
            path,
            request.channel_id,
            prompt,
            allowed_tools,
            request.role.clone(),
            request.persona.clone(),
        );

        let resume = ResumeMode::from_flags(request.resume_session.clone(), request.continue_latest);
        // Tool calls are only serviced during runs, so opening under the
        // registry lock cannot re-enter the directory.
        agent
            .start(
                self.client.as_ref(),
                resume,
                Arc::clone(&self.approval),
                Arc::clone(&self.collab),
                self.directory(),
            )
            .await?;

        self.spawn_consumer(&mut inner.consumers, &agent);

        if let Some(task) = &request.initial_task {
            agent.run_task(task)?;
        }

        tracing::info!(
            target: "hivemind::registry",
            agent = %agent.full_name(),
            "agent spawned"
        );
        inner
            .projects
            .get_mut(project)
            .ok_or_else(|| HiveError::UnknownProject(project.to_string()))?
            .agents
            .insert(request.name, agent);
        self.save_locked(&inner)
    }

    pub async fn assign_task(&self, project: &str, agent: &str, task: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let session = lookup_agent_mut(&mut inner.projects, project, agent)?;
        session.run_task(task)
    }

    pub async fn kill_agent(&self, project: &str, agent: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let mut session = {
            let proj = inner
                .projects
                .get_mut(project)
                .ok_or_else(|| HiveError::UnknownProject(project.to_string()))?;
            proj.agents
                .remove(agent)
                .ok_or_else(|| HiveError::UnknownAgent(format!("{project}/{agent}")))?
        };
        if let Some(consumer) = inner.consumers.remove(&session.full_name()) {
            consumer.abort();
        }
        session.stop().await;
        tracing::info!(
            target: "hivemind::registry",
            agent = %session.full_name(),
            "agent killed"
        );
        self.save_locked(&inner)
    }

    /// Send a human message to every non-stopped agent across all projects.
    /// Returns the full names reached.
    pub async fn broadcast_input(&self, text: &str) -> Vec<String> {
        let mut inner = self.inner.lock().await;
        let mut reached = Vec::new();
        for project in inner.projects.values_mut() {
            for agent in project.agents.values_mut() {
                if !agent.is_started() {
                    continue;
                }
                match agent.send_input(text) {
                    Ok(()) => reached.push(agent.full_name()),
                    Err(error) => tracing::warn!(
                        target: "hivemind::registry",
                        agent = %agent.full_name(),
                        error = %error,
                        "broadcast delivery failed"
                    ),
                }
            }
        }
        reached
    }

    /// Deliver a human message from a project's broadcast channel to every
    /// agent in that project. Idle/done/error agents get a new run; busy
    /// agents get it as follow-up input.
    pub async fn relay_human_message(
        &self,
        project: &str,
        author: &str,
        text: &str,
    ) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let proj = inner
            .projects
            .get_mut(project)
            .ok_or_else(|| HiveError::UnknownProject(project.to_string()))?;

        let line = format!("[broadcast from {author}] {text}");
        let mut delivered = 0;
        for agent in proj.agents.values_mut() {
            let outcome = if agent.status().accepts_new_task() {
                agent.run_task(&line)
            } else {
                agent.send_input(&line)
            };
            match outcome {
                Ok(()) => delivered += 1,
                Err(error) => tracing::warn!(
                    target: "hivemind::registry",
                    agent = %agent.full_name(),
                    error = %error,
                    "broadcast delivery failed"
                ),
            }
        }
        Ok(delivered)
    }

    pub async fn list_sessions(&self, project: &str, limit: usize) -> Result<Vec<SessionInfo>> {
        let inner = self.inner.lock().await;
        let proj = inner
            .projects
            .get(project)
            .ok_or_else(|| HiveError::UnknownProject(project.to_string()))?;
        Ok(sessions::list_sessions(&proj.path, limit))
    }

    pub async fn status_snapshot(&self) -> Vec<ProjectSummary> {
        let inner = self.inner.lock().await;
        let mut out: Vec<ProjectSummary> = inner
            .projects
            .values()
            .map(|project| {
                let mut agents: Vec<AgentSummary> = project
                    .agents
                    .values()
                    .map(|agent| AgentSummary {
                        name: agent.name.clone(),
                        status: agent.status(),
                        current_task: agent.current_task(),
                        total_cost: agent.total_cost(),
                        session_id: agent.session_id(),
                        consecutive_errors: agent.consecutive_errors(),
                    })
                    .collect();
                agents.sort_by(|a, b| a.name.cmp(&b.name));
                ProjectSummary {
                    name: project.name.clone(),
                    path: project.path.clone(),
                    agents,
                }
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Channel of the agent with this full name, if it exists.
    pub async fn channel_for_agent(&self, full_name: &str) -> Option<u64> {
        let (project, agent) = full_name.split_once('/')?;
        let inner = self.inner.lock().await;
        inner
            .projects
            .get(project)
            .and_then(|proj| proj.agents.get(agent))
            .map(|session| session.channel_id)
    }

    // ------------------------------------------------------------------
    // Collab fan-out
    // ------------------------------------------------------------------

    /// Fan one broadcast out to the project's render surface and to every
    /// other agent in the project. Returns the number of peer deliveries.
    pub async fn fan_out_broadcast(
        &self,
        message: &CollabMessage,
        renderer: &dyn Renderer,
    ) -> Result<usize> {
        let (broadcast_channel, sender_short, delivered) = {
            let mut inner = self.inner.lock().await;
            let proj = inner
                .projects
                .get_mut(&message.project)
                .ok_or_else(|| HiveError::UnknownProject(message.project.clone()))?;

            let sender_short = message
                .from
                .rsplit('/')
                .next()
                .unwrap_or(&message.from)
                .to_string();
            let line = format!("[broadcast from {sender_short}] {}", message.text);

            let mut delivered = 0;
            for agent in proj.agents.values_mut() {
                if agent.full_name() == message.from {
                    continue;
                }
                let outcome = if agent.status().accepts_new_task() {
                    agent.run_task(&line)
                } else {
                    agent.send_input(&line)
                };
                match outcome {
                    Ok(()) => delivered += 1,
                    Err(error) => tracing::warn!(
                        target: "hivemind::registry",
                        agent = %agent.full_name(),
                        error = %error,
                        "peer delivery failed"
                    ),
                }
            }
            (proj.broadcast_channel_id, sender_short, delivered)
        };

        let text = clamp_chars(&message.text, BROADCAST_TEXT_MAX);
        if let Err(error) = renderer
            .post_broadcast(broadcast_channel, &sender_short, &text)
            .await
        {
            tracing::warn!(
                target: "hivemind::registry",
                from = %message.from,
                error = %error,
                "failed to render broadcast"
            );
        }
        Ok(delivered)
    }

    // ------------------------------------------------------------------
    // Startup / shutdown
    // ------------------------------------------------------------------

    /// Rebuild the registry from the persisted snapshot and reopen every
    /// agent (resume by stored id, else continue-latest). Agents that fail
    /// to resume are dropped and the pruned state saved. Returns the number
    /// of agents resumed.
    pub async fn resume_agents(&self) -> usize {
        let state = persist::load(&self.config.state_path);
        let mut inner = self.inner.lock().await;
        let mut resumed = 0;

        for record in state.projects {
            let mut project = Project {
                name: record.name.clone(),
                path: record.path.clone(),
                group_channel_id: record.group_channel_id,
                broadcast_channel_id: record.broadcast_channel_id,
                system_prompt: record.system_prompt.clone(),
                allowed_tools: record.allowed_tools.clone(),
                agents: HashMap::new(),
            };

            for saved in &record.agents {
                let peers: Vec<String> = record
                    .agents
                    .iter()
                    .filter(|other| other.name != saved.name)
                    .map(|other| label_for(&other.name, &other.persona, &other.role))
                    .collect();
                let mut agent = AgentSession::new(
                    saved.name.clone(),
                    record.name.clone(),
                    record.path.clone(),
                    saved.channel_id,
                    compose_system_prompt(&record.system_prompt, &saved.role, &peers),
                    record.allowed_tools.clone(),
                    saved.role.clone(),
                    saved.persona.clone(),
                );
                agent.set_session_id(&saved.session_id);

                let resume = if saved.session_id.is_empty() {
                    ResumeMode::ContinueLatest
                } else {
                    ResumeMode::Resume(saved.session_id.clone())
                };
                let outcome = agent
                    .start(
                        self.client.as_ref(),
                        resume,
                        Arc::clone(&self.approval),
                        Arc::clone(&self.collab),
                        self.directory(),
                    )
                    .await;
                if let Err(error) = outcome {
                    tracing::warn!(
                        target: "hivemind::registry",
                        agent = %agent.full_name(),
                        error = %error,
                        "failed to resume agent, removing"
                    );
                    continue;
                }

                let label = if saved.session_id.is_empty() {
                    "continuing latest session".to_string()
                } else {
                    format!("resuming session {}", clamp_chars(&saved.session_id, 12))
                };
                agent.outbox().push(AgentEvent::Resumed {
                    text: format!("{} auto-resumed after restart ({label})", agent.name),
                });
                self.spawn_consumer(&mut inner.consumers, &agent);
                project.agents.insert(agent.name.clone(), agent);
                resumed += 1;
            }

            inner.projects.insert(project.name.clone(), project);
        }

        if let Err(error) = self.save_locked(&inner) {
            tracing::warn!(
                target: "hivemind::registry",
                error = %error,
                "failed to save state after resume"
            );
        }
        resumed
    }

    /// Cancel all tasks, stop all agents, and write a final snapshot.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        for (name, consumer) in inner.consumers.drain() {
            consumer.abort();
            tracing::debug!(target: "hivemind::registry", agent = %name, "consumer cancelled");
        }
        for project in inner.projects.values_mut() {
            for agent in project.agents.values_mut() {
                agent.stop().await;
            }
        }
        if let Err(error) = self.save_locked(&inner) {
            tracing::warn!(
                target: "hivemind::registry",
                error = %error,
                "failed to save state during shutdown"
            );
        }
        tracing::info!(target: "hivemind::registry", "shutdown complete");
    }

    // ------------------------------------------------------------------
    // Supervisor hooks
    // ------------------------------------------------------------------

    /// Restart any terminated per-agent consumer task with a fresh channel.
    /// No event replay. Returns the number restarted.
    pub async fn restart_dead_consumers(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let RegistryInner {
            projects,
            consumers,
        } = &mut *inner;

        let dead: Vec<String> = consumers
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(name, _)| name.clone())
            .collect();

        let mut restarted = 0;
        for full_name in dead {
            consumers.remove(&full_name);
            let Some(agent) = full_name
                .split_once('/')
                .and_then(|(project, name)| projects.get(project)?.agents.get(name))
            else {
                tracing::warn!(
                    target: "hivemind::registry",
                    agent = %full_name,
                    "dead consumer for unknown agent, dropping"
                );
                continue;
            };
            tracing::warn!(
                target: "hivemind::registry",
                agent = %full_name,
                "consumer task dead, restarting"
            );
            let rx = agent.outbox().attach();
            let ctx = self.consumer_ctx(agent);
            consumers.insert(
                full_name,
                tokio::spawn(consume_events(rx, Arc::clone(&self.renderer), ctx)),
            );
            restarted += 1;
        }
        restarted
    }

    /// Stop-and-restart agents stuck in an error storm (at least `threshold`
    /// consecutive failed runs with a still-open handle). The error counter
    /// resets only on successful restart; a failed restart is logged and
    /// retried on a later tick. Returns the number restarted.
    pub async fn recover_error_storms(&self, threshold: u32) -> usize {
        let mut inner = self.inner.lock().await;
        let mut restarted = 0;

        for project in inner.projects.values_mut() {
            for agent in project.agents.values_mut() {
                if agent.consecutive_errors() < threshold || !agent.is_started() {
                    continue;
                }
                tracing::warn!(
                    target: "hivemind::registry",
                    agent = %agent.full_name(),
                    errors = agent.consecutive_errors(),
                    "error storm, attempting restart"
                );
                agent.stop().await;
                let resume = if agent.session_id().is_empty() {
                    ResumeMode::ContinueLatest
                } else {
                    ResumeMode::Resume(agent.session_id())
                };
                let outcome = agent
                    .start(
                        self.client.as_ref(),
                        resume,
                        Arc::clone(&self.approval),
                        Arc::clone(&self.collab),
                        self.directory(),
                    )
                    .await;
                match outcome {
                    Ok(()) => {
                        agent.reset_errors();
                        restarted += 1;
                        tracing::info!(
                            target: "hivemind::registry",
                            agent = %agent.full_name(),
                            "agent restarted by supervisor"
                        );
                        let notice =
                            format!("{} auto-restarted after repeated errors", agent.name);
                        if let Err(error) =
                            self.renderer.post_text(agent.channel_id, &notice).await
                        {
                            tracing::warn!(
                                target: "hivemind::registry",
                                agent = %agent.full_name(),
                                error = %error,
                                "failed to announce restart"
                            );
                        }
                    }
                    Err(error) => tracing::warn!(
                        target: "hivemind::registry",
                        agent = %agent.full_name(),
                        error = %error,
                        "supervisor restart failed"
                    ),
                }
            }
        }
        restarted
    }

    /// Log (only) agents that are running but have produced nothing for
    /// longer than `stall_secs`. Returns the number flagged.
    pub async fn flag_stalled(&self, stall_secs: u64) -> usize {
        let inner = self.inner.lock().await;
        let mut flagged = 0;
        for project in inner.projects.values() {
            for agent in project.agents.values() {
                if agent.status() != AgentStatus::Running {
                    continue;
                }
                if let Some(idle) = agent.idle_seconds() {
                    if idle > stall_secs {
                        tracing::warn!(
                            target: "hivemind::registry",
                            agent = %agent.full_name(),
                            idle_seconds = idle,
                            "agent appears stuck"
                        );
                        flagged += 1;
                    }
                }
            }
        }
        flagged
    }

    /// Snapshot current state to disk.
    pub async fn save(&self) -> Result<()> {
        let inner = self.inner.lock().await;
        self.save_locked(&inner)
    }

    // ------------------------------------------------------------------
    // Internal
    // ------------------------------------------------------------------

    fn consumer_ctx(&self, agent: &AgentSession) -> ConsumerContext {
        ConsumerContext {
            agent: agent.full_name(),
            channel_id: agent.channel_id,
            batch_interval: Duration::from_millis(self.config.batch_interval_ms),
            flush_threshold: self.config.flush_threshold,
        }
    }

    fn spawn_consumer(&self, consumers: &mut HashMap<String, JoinHandle<()>>, agent: &AgentSession) {
        let rx = agent.outbox().attach();
        let ctx = self.consumer_ctx(agent);
        consumers.insert(
            agent.full_name(),
            tokio::spawn(consume_events(rx, Arc::clone(&self.renderer), ctx)),
        );
    }

    fn save_locked(&self, inner: &RegistryInner) -> Result<()> {
        let mut projects: Vec<PersistedProject> = inner
            .projects
            .values()
            .map(|project| {
                let mut agents: Vec<PersistedAgent> = project
                    .agents
                    .values()
                    .map(|agent| PersistedAgent {
                        name: agent.name.clone(),
                        channel_id: agent.channel_id,
                        session_id: agent.session_id(),
                        role: agent.role.clone(),
                        persona: agent.persona.clone(),
                    })
                    .collect();
                agents.sort_by(|a, b| a.name.cmp(&b.name));
                PersistedProject {
                    name: project.name.clone(),
                    path: project.path.clone(),
                    group_channel_id: project.group_channel_id,
                    broadcast_channel_id: project.broadcast_channel_id,
                    system_prompt: project.system_prompt.clone(),
                    allowed_tools: project.allowed_tools.clone(),
                    agents,
                }
            })
            .collect();
        projects.sort_by(|a, b| a.name.cmp(&b.name));
        persist::save(&self.config.state_path, &PersistedState::new(projects))
    }
}

#[async_trait]
impl PeerDirectory for SessionRegistry {
    async fn peers_of(&self, project: &str) -> Vec<PeerInfo> {
        let inner = self.inner.lock().await;
        let Some(proj) = inner.projects.get(project) else {
            return Vec::new();
        };
        let mut peers: Vec<PeerInfo> = proj
            .agents
            .values()
            .map(|agent| PeerInfo {
                name: agent.name.clone(),
                status: agent.status(),
                role: agent.role.clone(),
                persona: agent.persona.clone(),
                current_task: agent.current_task(),
            })
            .collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name));
        peers
    }
}

struct EmptyDirectory;

#[async_trait]
impl PeerDirectory for EmptyDirectory {
    async fn peers_of(&self, _project: &str) -> Vec<PeerInfo> {
        Vec::new()
    }
}

fn lookup_agent_mut<'a>(
    projects: &'a mut HashMap<String, Project>,
    project: &str,
    agent: &str,
) -> Result<&'a mut AgentSession> {
    projects
        .get_mut(project)
        .ok_or_else(|| HiveError::UnknownProject(project.to_string()))?
        .agents
        .get_mut(agent)
        .ok_or_else(|| HiveError::UnknownAgent(format!("{project}/{agent}")))
}

fn label_for(name: &str, persona: &str, role: &str) -> String {
    if !persona.is_empty() {
        format!("{name} ({persona})")
    } else if !role.is_empty() {
        format!("{name} ({role})")
    } else {
        name.to_string()
    }
}

fn peer_labels(project: &Project, excluding: &str) -> Vec<String> {
    let mut labels: Vec<String> = project
        .agents
        .values()
        .filter(|agent| agent.name != excluding)
        .map(|agent| label_for(&agent.name, &agent.persona, &agent.role))
        .collect();
    labels.sort();
    labels
}

/// Layer the role instructions, shared project prompt, and collaboration
/// guidelines into one system prompt.
pub(crate) fn compose_system_prompt(
    project_prompt: &str,
    role: &str,
    peers: &[String],
) -> String {
    let mut parts: Vec<String> = Vec::new();

    if !role.is_empty() {
        parts.push(format!("Your role: {role}"));
    }
    if !project_prompt.is_empty() {
        parts.push(project_prompt.to_string());
    }

    let mut collab = String::from(
        "## Collaboration\n\
         You are part of a team of agents working on this project. The \
         broadcast channel is a shared space where every message reaches \
         every agent.\n\n\
         Available tools:\n\
         - `post_broadcast`: post a message to the broadcast channel. Use \
         @agent_name to address a specific peer.\n\
         - `list_peers`: see all agents, their status, role, and current \
         tasks.\n\
         - `ask_human`: ask the human operator for approval, clarification, \
         or a decision.\n\n\
         Guidelines:\n\
         - Messages from the broadcast channel arrive prefixed with \
         [broadcast from ...]. Reply to them with `post_broadcast`; text you \
         output normally stays in your own channel.\n\
         - If you are @mentioned you must respond via `post_broadcast`. \
         Otherwise only chime in when you have something concrete to add.\n\
         - Post for milestones, blockers, questions, or handoffs.\n",
    );
    if !peers.is_empty() {
        collab.push_str(&format!("- Current peers: {}\n", peers.join(", ")));
    }
    parts.push(collab);

    parts.join("\n\n")
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use tempfile::TempDir;

    use super::*;
    use crate::agent::AgentStatus;
    use crate::approval::PendingApproval;
    use crate::client::{ClientError, SessionHandle, SessionOptions, StreamMessage};
    use crate::collab::CollabBus;

    struct MockClient {
        opens: AtomicU32,
        fail_open: AtomicBool,
        /// Next N runs end with an error terminal result.
        error_runs: Arc<AtomicU32>,
        /// Next N runs stream a segment and then end without a terminal
        /// result, leaving the agent running.
        hang_runs: Arc<AtomicU32>,
        /// While set, handles withhold every stream message, so the active
        /// run keeps the handle lock and queued inputs stay queued.
        hold: Arc<AtomicBool>,
        submits: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    impl MockClient {
        fn new() -> Self {
            Self {
                opens: AtomicU32::new(0),
                fail_open: AtomicBool::new(false),
                error_runs: Arc::new(AtomicU32::new(0)),
                hang_runs: Arc::new(AtomicU32::new(0)),
                hold: Arc::new(AtomicBool::new(false)),
                submits: Arc::new(parking_lot::Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl SessionClient for MockClient {
        async fn open(&self, _opts: SessionOptions) -> std::result::Result<Box<dyn SessionHandle>, ClientError> {
            if self.fail_open.load(Ordering::SeqCst) {
                return Err(ClientError::Connection("connection refused".into()));
            }
            let n = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Box::new(MockHandle {
                session_id: format!("sess-{n}"),
                pending: VecDeque::new(),
                error_runs: Arc::clone(&self.error_runs),
                hang_runs: Arc::clone(&self.hang_runs),
                hold: Arc::clone(&self.hold),
                submits: Arc::clone(&self.submits),
            }))
        }
    }

    struct MockHandle {
        session_id: String,
        pending: VecDeque<StreamMessage>,
        error_runs: Arc<AtomicU32>,
        hang_runs: Arc<AtomicU32>,
        hold: Arc<AtomicBool>,
        submits: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    #[async_trait]
    impl SessionHandle for MockHandle {
        async fn submit(&mut self, text: &str) -> std::result::Result<(), ClientError> {
            self.submits.lock().push(text.to_string());
            if take_one(&self.error_runs) {
                self.pending.push_back(StreamMessage::TerminalResult {
                    is_error: true,
                    result: "boom".into(),
                    cost_usd: None,
                    session_id: self.session_id.clone(),
                });
            } else if take_one(&self.hang_runs) {
                self.pending.push_back(StreamMessage::TextSegment {
                    text: "thinking".into(),
                });
            } else {
                self.pending.push_back(StreamMessage::TextSegment {
                    text: "working".into(),
                });
                self.pending.push_back(StreamMessage::TerminalResult {
                    is_error: false,
                    result: "done".into(),
                    cost_usd: Some(0.01),
                    session_id: self.session_id.clone(),
                });
            }
            Ok(())
        }

        async fn next_message(&mut self) -> std::result::Result<Option<StreamMessage>, ClientError> {
            while self.hold.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Ok(self.pending.pop_front())
        }

        async fn close(&mut self) {}
    }

    #[derive(Default)]
    struct RecordingRenderer {
        broadcasts: parking_lot::Mutex<Vec<(u64, String, String)>>,
        texts: parking_lot::Mutex<Vec<(u64, String)>>,
    }

    #[async_trait]
    impl Renderer for RecordingRenderer {
        async fn post_text(&self, channel_id: u64, text: &str) -> anyhow::Result<()> {
            self.texts.lock().push((channel_id, text.to_string()));
            Ok(())
        }

        async fn update_status(&self, _channel_id: u64, _status: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn finish_status(&self, _channel_id: u64, _summary: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn present_approval(
            &self,
            _channel_id: u64,
            _request: &PendingApproval,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn post_broadcast(
            &self,
            channel_id: u64,
            from: &str,
            text: &str,
        ) -> anyhow::Result<()> {
            self.broadcasts
                .lock()
                .push((channel_id, from.to_string(), text.to_string()));
            Ok(())
        }
    }

    struct Fixture {
        registry: Arc<SessionRegistry>,
        client: Arc<MockClient>,
        renderer: Arc<RecordingRenderer>,
        state_path: PathBuf,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let state_path = dir.path().join("state.json");
        let config = OrchestratorConfig {
            state_path: state_path.clone(),
            ..OrchestratorConfig::default()
        };
        let client = Arc::new(MockClient::new());
        let renderer = Arc::new(RecordingRenderer::default());
        let registry = SessionRegistry::new(
            client.clone(),
            renderer.clone(),
            Arc::new(ApprovalBridge::default()),
            Arc::new(CollabBus::default()),
            config,
        );
        Fixture {
            registry,
            client,
            renderer,
            state_path,
            _dir: dir,
        }
    }

    async fn setup_project(fx: &Fixture) {
        fx.registry
            .create_project("demo", "/tmp/demo", 1, 2, None, None)
            .await
            .unwrap();
    }

    async fn spawn(fx: &Fixture, name: &str, channel_id: u64) {
        fx.registry
            .spawn_agent(
                "demo",
                SpawnRequest {
                    name: name.into(),
                    channel_id,
                    ..SpawnRequest::default()
                },
            )
            .await
            .unwrap();
    }

    async fn wait_for_agent(
        registry: &Arc<SessionRegistry>,
        project: &str,
        agent: &str,
        pred: impl Fn(&AgentSummary) -> bool,
        what: &str,
    ) {
        for _ in 0..400 {
            let snapshot = registry.status_snapshot().await;
            let found = snapshot
                .iter()
                .find(|p| p.name == project)
                .and_then(|p| p.agents.iter().find(|a| a.name == agent));
            if found.map(&pred).unwrap_or(false) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("agent {project}/{agent} never reached: {what}");
    }

    #[tokio::test]
    async fn spawn_persists_and_rejects_duplicates() {
        let fx = fixture();
        setup_project(&fx).await;
        spawn(&fx, "writer", 10).await;

        let snapshot = fx.registry.status_snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].agents.len(), 1);
        assert_eq!(snapshot[0].agents[0].status, AgentStatus::Idle);

        let saved = persist::load(&fx.state_path);
        assert_eq!(saved.projects.len(), 1);
        assert_eq!(saved.projects[0].agents[0].name, "writer");

        let err = fx
            .registry
            .spawn_agent(
                "demo",
                SpawnRequest {
                    name: "writer".into(),
                    channel_id: 11,
                    ..SpawnRequest::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::DuplicateAgent(_)));
    }

    #[tokio::test]
    async fn duplicate_project_rejected() {
        let fx = fixture();
        setup_project(&fx).await;
        let err = fx
            .registry
            .create_project("demo", "/tmp/elsewhere", 3, 4, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::DuplicateProject(_)));
    }

    #[tokio::test]
    async fn spawn_into_unknown_project_fails() {
        let fx = fixture();
        let err = fx
            .registry
            .spawn_agent("ghost", SpawnRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::UnknownProject(_)));
    }

    #[tokio::test]
    async fn failed_connection_leaves_nothing_behind() {
        let fx = fixture();
        setup_project(&fx).await;
        fx.client.fail_open.store(true, Ordering::SeqCst);
        let err = fx
            .registry
            .spawn_agent(
                "demo",
                SpawnRequest {
                    name: "writer".into(),
                    ..SpawnRequest::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::Connection(_)));
        let snapshot = fx.registry.status_snapshot().await;
        assert!(snapshot[0].agents.is_empty());
    }

    #[tokio::test]
    async fn assign_task_completes_and_records_session() {
        let fx = fixture();
        setup_project(&fx).await;
        spawn(&fx, "writer", 10).await;
        fx.registry
            .assign_task("demo", "writer", "write the readme")
            .await
            .unwrap();
        wait_for_agent(
            &fx.registry,
            "demo",
            "writer",
            |a| a.status == AgentStatus::Done,
            "done",
        )
        .await;
        let snapshot = fx.registry.status_snapshot().await;
        let agent = &snapshot[0].agents[0];
        assert_eq!(agent.session_id, "sess-1");
        assert_eq!(agent.current_task, "write the readme");
        assert!((agent.total_cost - 0.01).abs() < 1e-9);
    }

    #[tokio::test]
    async fn kill_agent_removes_and_prunes_state() {
        let fx = fixture();
        setup_project(&fx).await;
        spawn(&fx, "writer", 10).await;
        spawn(&fx, "reviewer", 11).await;

        fx.registry.kill_agent("demo", "writer").await.unwrap();

        let snapshot = fx.registry.status_snapshot().await;
        assert_eq!(snapshot[0].agents.len(), 1);
        assert_eq!(snapshot[0].agents[0].name, "reviewer");

        let saved = persist::load(&fx.state_path);
        assert_eq!(saved.projects[0].agents.len(), 1);

        let err = fx.registry.kill_agent("demo", "writer").await.unwrap_err();
        assert!(matches!(err, HiveError::UnknownAgent(_)));
    }

    #[tokio::test]
    async fn kill_agent_cancels_input_queued_behind_an_active_run() {
        let fx = fixture();
        setup_project(&fx).await;
        spawn(&fx, "writer", 10).await;
        fx.client.hold.store(true, Ordering::SeqCst);
        fx.registry
            .assign_task("demo", "writer", "task")
            .await
            .unwrap();
        let reached = fx.registry.broadcast_input("ping").await;
        assert_eq!(reached, vec!["demo/writer".to_string()]);

        // Both the held run and the queued input must be cancelled, or the
        // handle lock is never released and the kill blocks on it.
        tokio::time::timeout(
            Duration::from_secs(2),
            fx.registry.kill_agent("demo", "writer"),
        )
        .await
        .expect("kill_agent completed")
        .unwrap();

        let snapshot = fx.registry.status_snapshot().await;
        assert!(snapshot[0].agents.is_empty());
    }

    #[tokio::test]
    async fn queued_input_marks_agent_running_after_prior_run_finishes() {
        let fx = fixture();
        setup_project(&fx).await;
        spawn(&fx, "writer", 10).await;
        fx.client.hold.store(true, Ordering::SeqCst);
        fx.registry
            .assign_task("demo", "writer", "task")
            .await
            .unwrap();
        assert_eq!(fx.registry.broadcast_input("ping").await.len(), 1);

        // On release the held run finishes with a terminal result; the
        // queued input then streams a segment without one.
        fx.client.hang_runs.store(1, Ordering::SeqCst);
        fx.client.hold.store(false, Ordering::SeqCst);
        for _ in 0..400 {
            if fx.client.submits.lock().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(fx.client.submits.lock().len(), 2);

        wait_for_agent(
            &fx.registry,
            "demo",
            "writer",
            |a| a.status == AgentStatus::Running,
            "running while the queued input is in flight",
        )
        .await;
    }

    #[tokio::test]
    async fn fan_out_skips_sender_and_renders_once() {
        let fx = fixture();
        setup_project(&fx).await;
        spawn(&fx, "writer", 10).await;
        spawn(&fx, "reviewer", 11).await;
        spawn(&fx, "tester", 12).await;

        let message = CollabMessage {
            from: "demo/writer".into(),
            project: "demo".into(),
            text: "draft is up".into(),
            mentions: vec![],
        };
        let delivered = fx
            .registry
            .fan_out_broadcast(&message, fx.renderer.as_ref())
            .await
            .unwrap();
        assert_eq!(delivered, 2);

        let broadcasts = fx.renderer.broadcasts.lock();
        assert_eq!(broadcasts.len(), 1);
        assert_eq!(broadcasts[0], (2, "writer".to_string(), "draft is up".to_string()));
    }

    #[tokio::test]
    async fn relay_human_message_reaches_all_agents() {
        let fx = fixture();
        setup_project(&fx).await;
        spawn(&fx, "writer", 10).await;
        spawn(&fx, "reviewer", 11).await;

        let delivered = fx
            .registry
            .relay_human_message("demo", "alex", "status update please")
            .await
            .unwrap();
        assert_eq!(delivered, 2);
    }

    #[tokio::test]
    async fn channel_lookup_by_full_name() {
        let fx = fixture();
        setup_project(&fx).await;
        spawn(&fx, "writer", 42).await;
        assert_eq!(fx.registry.channel_for_agent("demo/writer").await, Some(42));
        assert_eq!(fx.registry.channel_for_agent("demo/ghost").await, None);
        assert_eq!(fx.registry.channel_for_agent("not-a-full-name").await, None);
    }

    #[tokio::test]
    async fn peers_of_lists_project_roster() {
        let fx = fixture();
        setup_project(&fx).await;
        spawn(&fx, "writer", 10).await;
        spawn(&fx, "reviewer", 11).await;

        let peers = fx.registry.peers_of("demo").await;
        let names: Vec<&str> = peers.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["reviewer", "writer"]);
        assert!(fx.registry.peers_of("ghost").await.is_empty());
    }

    #[tokio::test]
    async fn resume_rebuilds_registry_from_disk() {
        let fx = fixture();
        setup_project(&fx).await;
        spawn(&fx, "writer", 10).await;
        fx.registry
            .assign_task("demo", "writer", "task")
            .await
            .unwrap();
        wait_for_agent(
            &fx.registry,
            "demo",
            "writer",
            |a| a.session_id == "sess-1",
            "session recorded",
        )
        .await;
        fx.registry.save().await.unwrap();
        fx.registry.shutdown().await;

        let client = Arc::new(MockClient::new());
        let renderer = Arc::new(RecordingRenderer::default());
        let config = OrchestratorConfig {
            state_path: fx.state_path.clone(),
            ..OrchestratorConfig::default()
        };
        let registry = SessionRegistry::new(
            client.clone(),
            renderer,
            Arc::new(ApprovalBridge::default()),
            Arc::new(CollabBus::default()),
            config,
        );
        assert_eq!(registry.resume_agents().await, 1);
        assert_eq!(client.opens.load(Ordering::SeqCst), 1);

        let snapshot = registry.status_snapshot().await;
        assert_eq!(snapshot[0].agents[0].session_id, "sess-1");
    }

    #[tokio::test]
    async fn resume_drops_agents_that_fail_to_reopen() {
        let fx = fixture();
        setup_project(&fx).await;
        spawn(&fx, "writer", 10).await;
        fx.registry.shutdown().await;

        let client = Arc::new(MockClient::new());
        client.fail_open.store(true, Ordering::SeqCst);
        let config = OrchestratorConfig {
            state_path: fx.state_path.clone(),
            ..OrchestratorConfig::default()
        };
        let registry = SessionRegistry::new(
            client,
            Arc::new(RecordingRenderer::default()),
            Arc::new(ApprovalBridge::default()),
            Arc::new(CollabBus::default()),
            config,
        );
        assert_eq!(registry.resume_agents().await, 0);

        // The pruned snapshot keeps the project but not the agent.
        let saved = persist::load(&fx.state_path);
        assert_eq!(saved.projects.len(), 1);
        assert!(saved.projects[0].agents.is_empty());
    }

    #[tokio::test]
    async fn error_storm_restarts_at_threshold() {
        let fx = fixture();
        setup_project(&fx).await;
        spawn(&fx, "writer", 10).await;
        fx.client.error_runs.store(3, Ordering::SeqCst);

        for n in 1..=3u32 {
            fx.registry
                .assign_task("demo", "writer", "task")
                .await
                .unwrap();
            wait_for_agent(
                &fx.registry,
                "demo",
                "writer",
                |a| a.consecutive_errors == n,
                "error counted",
            )
            .await;
        }

        assert_eq!(fx.registry.recover_error_storms(3).await, 1);
        assert_eq!(fx.client.opens.load(Ordering::SeqCst), 2);

        let snapshot = fx.registry.status_snapshot().await;
        assert_eq!(snapshot[0].agents[0].consecutive_errors, 0);
        // The restart was announced in the agent's channel.
        assert!(fx
            .renderer
            .texts
            .lock()
            .iter()
            .any(|(channel, text)| *channel == 10 && text.contains("auto-restarted")));
    }

    #[tokio::test]
    async fn error_storm_below_threshold_is_left_alone() {
        let fx = fixture();
        setup_project(&fx).await;
        spawn(&fx, "writer", 10).await;
        fx.client.error_runs.store(2, Ordering::SeqCst);

        for n in 1..=2u32 {
            fx.registry
                .assign_task("demo", "writer", "task")
                .await
                .unwrap();
            wait_for_agent(
                &fx.registry,
                "demo",
                "writer",
                |a| a.consecutive_errors == n,
                "error counted",
            )
            .await;
        }

        assert_eq!(fx.registry.recover_error_storms(3).await, 0);
        assert_eq!(fx.client.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dead_consumer_is_restarted_with_fresh_channel() {
        let fx = fixture();
        setup_project(&fx).await;
        spawn(&fx, "writer", 10).await;

        {
            let inner = fx.registry.inner.lock().await;
            inner.consumers.get("demo/writer").unwrap().abort();
        }
        for _ in 0..200 {
            let inner = fx.registry.inner.lock().await;
            if inner.consumers.get("demo/writer").unwrap().is_finished() {
                break;
            }
            drop(inner);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(fx.registry.restart_dead_consumers().await, 1);
        let inner = fx.registry.inner.lock().await;
        assert!(!inner.consumers.get("demo/writer").unwrap().is_finished());
    }

    #[tokio::test]
    async fn running_agent_with_no_output_is_flagged_stalled() {
        let fx = fixture();
        setup_project(&fx).await;
        spawn(&fx, "writer", 10).await;
        fx.client.hang_runs.store(1, Ordering::SeqCst);
        fx.registry
            .assign_task("demo", "writer", "task")
            .await
            .unwrap();
        wait_for_agent(
            &fx.registry,
            "demo",
            "writer",
            |a| a.status == AgentStatus::Running,
            "running",
        )
        .await;

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(fx.registry.flag_stalled(0).await, 1);

        // A freshly spawned idle agent is never flagged.
        spawn(&fx, "reviewer", 11).await;
        assert_eq!(fx.registry.flag_stalled(0).await, 1);
    }

    #[tokio::test]
    async fn shutdown_cancels_consumers_and_saves() {
        let fx = fixture();
        setup_project(&fx).await;
        spawn(&fx, "writer", 10).await;
        fx.registry.shutdown().await;

        let inner = fx.registry.inner.lock().await;
        assert!(inner.consumers.is_empty());
        drop(inner);
        assert!(fx.state_path.exists());
    }

    #[test]
    fn system_prompt_layers_role_project_and_peers() {
        let prompt = compose_system_prompt(
            "Ship the docs site.",
            "You are the editor.",
            &["reviewer (skeptic)".to_string(), "writer".to_string()],
        );
        assert!(prompt.starts_with("Your role: You are the editor."));
        assert!(prompt.contains("Ship the docs site."));
        assert!(prompt.contains("Current peers: reviewer (skeptic), writer"));
        assert!(prompt.contains("`post_broadcast`"));
    }

    #[test]
    fn system_prompt_omits_empty_layers() {
        let prompt = compose_system_prompt("", "", &[]);
        assert!(!prompt.contains("Your role:"));
        assert!(!prompt.contains("Current peers:"));
        assert!(prompt.contains("## Collaboration"));
    }
}
