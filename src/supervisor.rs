//! Background recovery loop.
//!
//! One periodic tick per interval: restart dead consumer tasks, restart
//! agents stuck in error storms, flag stalled runs, and write a fresh state
//! snapshot. The first tick is delayed so startup resumes settle before
//! recovery starts second-guessing them.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::registry::SessionRegistry;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorPolicy {
    /// Delay before the first tick.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Consecutive failed runs before an agent is stopped and reopened.
    #[serde(default = "default_error_storm_threshold")]
    pub error_storm_threshold: u32,

    /// A running agent silent for longer than this is flagged as stuck.
    #[serde(default = "default_stall_threshold_ms")]
    pub stall_threshold_ms: u64,
}

fn default_settle_delay_ms() -> u64 {
    10_000
}

fn default_tick_interval_ms() -> u64 {
    30_000
}

fn default_error_storm_threshold() -> u32 {
    3
}

fn default_stall_threshold_ms() -> u64 {
    300_000
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
            tick_interval_ms: default_tick_interval_ms(),
            error_storm_threshold: default_error_storm_threshold(),
            stall_threshold_ms: default_stall_threshold_ms(),
        }
    }
}

pub struct Supervisor {
    registry: Arc<SessionRegistry>,
    policy: SupervisorPolicy,
}

impl Supervisor {
    pub fn new(registry: Arc<SessionRegistry>, policy: SupervisorPolicy) -> Self {
        Self { registry, policy }
    }

    /// Tick forever. Spawn this on its own task; abort it to stop.
    pub async fn run(self) {
        tokio::time::sleep(Duration::from_millis(self.policy.settle_delay_ms)).await;
        tracing::info!(
            target: "hivemind::supervisor",
            interval_ms = self.policy.tick_interval_ms,
            "supervisor started"
        );
        loop {
            self.tick().await;
            tokio::time::sleep(Duration::from_millis(self.policy.tick_interval_ms)).await;
        }
    }

    /// One recovery pass. Each concern is independent; a failure in one is
    /// logged and never skips the others.
    pub async fn tick(&self) {
        let consumers = self.registry.restart_dead_consumers().await;
        let agents = self
            .registry
            .recover_error_storms(self.policy.error_storm_threshold)
            .await;
        let stalled = self
            .registry
            .flag_stalled(self.policy.stall_threshold_ms / 1000)
            .await;

        if let Err(error) = self.registry.save().await {
            tracing::warn!(
                target: "hivemind::supervisor",
                error = %error,
                "periodic state save failed"
            );
        }

        if consumers + agents + stalled > 0 {
            tracing::info!(
                target: "hivemind::supervisor",
                consumers_restarted = consumers,
                agents_restarted = agents,
                stalled,
                "recovery tick acted"
            );
        } else {
            tracing::debug!(target: "hivemind::supervisor", "recovery tick idle");
        }
    }
}
