// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

/// Desired capacity requested when a fleet is found with no active instances.
pub const WAKE_DESIRED_INSTANCES: u32 = 1;

pub const FLEET_ALIAS_ID_VAR: &str = "FLEET_ALIAS_ID";
pub const FLEET_ID_VAR: &str = "FLEET_ID";

pub type FleetId = String;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstanceCounts {
    pub desired: u32,
    pub active: u32,
    pub idle: u32,
    pub pending: u32,
    pub terminating: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetCapacity {
    pub fleet_id: Option<FleetId>,
    pub instance_counts: InstanceCounts,
}

impl FleetCapacity {
    pub fn active_instances(&self) -> u32 {
        self.instance_counts.active
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasResolution {
    pub alias_id: String,
    pub fleet_id: FleetId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityRequest {
    pub fleet_id: FleetId,
    pub desired_instances: u32,
}

impl CapacityRequest {
    pub fn wake(fleet_id: impl Into<FleetId>) -> Self {
        Self {
            fleet_id: fleet_id.into(),
            desired_instances: WAKE_DESIRED_INSTANCES,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WakeOutcome {
    AlreadyActive {
        active_instances: u32,
    },
    Woken {
        fleet_id: FleetId,
        desired_instances: u32,
    },
}

/// Per-invocation context handed in by whatever runtime triggered the wake.
///
/// The deadline bounds every remote call made during the invocation. Dropping
/// the `wake` future aborts whichever call is in flight.
#[derive(Debug, Clone)]
pub struct WakeContext {
    pub invocation_id: String,
    pub deadline: Option<Instant>,
}

impl WakeContext {
    pub fn new(invocation_id: impl Into<String>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            deadline: None,
        }
    }

    pub fn with_timeout(invocation_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            deadline: Some(Instant::now() + timeout),
        }
    }
}

#[derive(Debug, Error)]
pub enum WakeError {
    #[error("Failed to describe fleet capacity: {0:#}")]
    CapacityQuery(#[source] anyhow::Error),
    #[error("Failed to resolve alias: {0:#}")]
    AliasResolution(#[source] anyhow::Error),
    #[error("Failed to update fleet capacity: {0:#}")]
    CapacityUpdate(#[source] anyhow::Error),
}

impl WakeError {
    /// Fixed label naming which remote call failed.
    pub fn label(&self) -> &'static str {
        match self {
            Self::CapacityQuery(_) => "Failed to describe fleet capacity",
            Self::AliasResolution(_) => "Failed to resolve alias",
            Self::CapacityUpdate(_) => "Failed to update fleet capacity",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeConfig {
    pub alias_id: String,
    /// Restricts the capacity query to one fleet; the service listing is used when unset.
    pub fleet_id: Option<FleetId>,
}

impl WakeConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let alias_id = non_empty(lookup(FLEET_ALIAS_ID_VAR))
            .ok_or_else(|| anyhow::anyhow!("{FLEET_ALIAS_ID_VAR} must be set"))?;

        Ok(Self {
            alias_id,
            fleet_id: non_empty(lookup(FLEET_ID_VAR)),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[async_trait]
pub trait FleetOrchestrator: Send + Sync {
    async fn describe_fleet_capacity(
        &self,
        fleet_id: Option<&str>,
    ) -> anyhow::Result<Vec<FleetCapacity>>;
    async fn resolve_alias(&self, alias_id: &str) -> anyhow::Result<AliasResolution>;
    async fn update_fleet_capacity(&self, request: &CapacityRequest) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct FleetWaker {
    orchestrator: Arc<dyn FleetOrchestrator>,
    config: WakeConfig,
}

impl FleetWaker {
    pub fn new(orchestrator: Arc<dyn FleetOrchestrator>, config: WakeConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    pub async fn wake(&self, ctx: &WakeContext) -> Result<WakeOutcome, WakeError> {
        let records = within_deadline(
            ctx,
            self.orchestrator
                .describe_fleet_capacity(self.config.fleet_id.as_deref()),
        )
        .await
        .map_err(WakeError::CapacityQuery)?;

        let capacity = records.first().ok_or_else(|| {
            WakeError::CapacityQuery(anyhow::anyhow!("no fleet capacity records returned"))
        })?;

        let active_instances = capacity.active_instances();
        if active_instances > 0 {
            debug!(
                invocation_id = %ctx.invocation_id,
                fleet_id = ?capacity.fleet_id,
                active_instances,
                "fleet already has active instances"
            );
            return Ok(WakeOutcome::AlreadyActive { active_instances });
        }

        info!(
            invocation_id = %ctx.invocation_id,
            fleet_id = ?capacity.fleet_id,
            alias_id = %self.config.alias_id,
            "fleet has no active instances; waking"
        );

        let resolution = within_deadline(
            ctx,
            self.orchestrator.resolve_alias(&self.config.alias_id),
        )
        .await
        .map_err(WakeError::AliasResolution)?;

        let request = CapacityRequest::wake(resolution.fleet_id);
        within_deadline(ctx, self.orchestrator.update_fleet_capacity(&request))
            .await
            .map_err(WakeError::CapacityUpdate)?;

        info!(
            invocation_id = %ctx.invocation_id,
            fleet_id = %request.fleet_id,
            desired_instances = request.desired_instances,
            "requested fleet capacity"
        );

        Ok(WakeOutcome::Woken {
            fleet_id: request.fleet_id,
            desired_instances: request.desired_instances,
        })
    }
}

async fn within_deadline<T>(
    ctx: &WakeContext,
    call: impl Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<T> {
    let Some(deadline) = ctx.deadline else {
        return call.await;
    };

    match tokio::time::timeout_at(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!("invocation deadline exceeded")),
    }
}
