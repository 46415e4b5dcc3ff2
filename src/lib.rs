//! Orchestration core for a swarm of AI coding agents.
//!
//! A [`registry::SessionRegistry`] owns named projects, each holding a set of
//! [`agent::AgentSession`]s bound to the project's working directory. Agents
//! stream their runs into per-agent event outboxes; consumer tasks batch
//! those events and hand them to a [`outbox::Renderer`] supplied by the
//! embedding application. Inter-agent broadcasts flow through the
//! [`collab::CollabBus`], blocking human-input requests through the
//! [`approval::ApprovalBridge`], and a [`supervisor::Supervisor`] ticks in
//! the background restarting what died.
//!
//! The crate talks to the external AI service only through the
//! [`client::SessionClient`] trait, and to humans only through
//! [`outbox::Renderer`]; both are implemented by the embedding application.

pub mod agent;
pub mod approval;
pub mod client;
pub mod collab;
pub mod config;
pub mod error;
pub mod logging;
pub mod outbox;
pub mod persist;
pub mod registry;
pub mod sessions;
pub mod supervisor;
pub mod tools;

pub use agent::{AgentEvent, AgentSession, AgentStatus};
pub use approval::{run_approval_consumer, ApprovalBridge, PendingApproval};
pub use client::{
    ClientError, CompactNotifier, ResumeMode, SessionClient, SessionHandle, SessionOptions,
    StreamMessage,
};
pub use collab::{run_collab_consumer, CollabBus, CollabMessage};
pub use config::OrchestratorConfig;
pub use error::{HiveError, Result};
pub use outbox::{ConsumerContext, EventOutbox, Renderer};
pub use registry::{
    AgentSummary, PeerDirectory, PeerInfo, ProjectSummary, SessionRegistry, SpawnRequest,
};
pub use supervisor::{Supervisor, SupervisorPolicy};
