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

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_gamelift::{
    Client as GameLiftClient,
    operation::resolve_alias::ResolveAliasOutput,
    types::{Ec2InstanceCounts, FleetCapacity as SdkFleetCapacity},
};
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use fleetwake_common::{
    AliasResolution, CapacityRequest, FleetCapacity, FleetOrchestrator, FleetWaker,
    InstanceCounts, WakeConfig, WakeContext, WakeOutcome,
};
use lambda_http::run as lambda_run;
use lambda_runtime::{LambdaEvent, service_fn};
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_WAKE_TIMEOUT_SECONDS: u64 = 10;

#[derive(Clone)]
struct AppState {
    waker: FleetWaker,
    wake_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TriggerMode {
    /// Direct or scheduled invocation with an arbitrary JSON payload.
    Event,
    /// API Gateway / function URL invocation routed through axum.
    Http,
}

#[derive(Clone)]
struct GameLiftOrchestrator {
    client: GameLiftClient,
}

impl GameLiftOrchestrator {
    async fn from_env() -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Ok(endpoint) = std::env::var("GAMELIFT_ENDPOINT") {
            info!(endpoint = %endpoint, "using GameLift endpoint override");
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;
        Self {
            client: GameLiftClient::new(&config),
        }
    }
}

#[async_trait]
impl FleetOrchestrator for GameLiftOrchestrator {
    async fn describe_fleet_capacity(
        &self,
        fleet_id: Option<&str>,
    ) -> anyhow::Result<Vec<FleetCapacity>> {
        let output = self
            .client
            .describe_fleet_capacity()
            .set_fleet_ids(fleet_id.map(|id| vec![id.to_string()]))
            .send()
            .await
            .context("DescribeFleetCapacity request failed")?;

        capacities_from_sdk(output.fleet_capacity())
    }

    async fn resolve_alias(&self, alias_id: &str) -> anyhow::Result<AliasResolution> {
        let output = self
            .client
            .resolve_alias()
            .alias_id(alias_id)
            .send()
            .await
            .context("ResolveAlias request failed")?;

        alias_from_sdk(alias_id, &output)
    }

    async fn update_fleet_capacity(&self, request: &CapacityRequest) -> anyhow::Result<()> {
        let desired_instances = i32::try_from(request.desired_instances)
            .context("desired instance count out of range")?;

        self.client
            .update_fleet_capacity()
            .fleet_id(&request.fleet_id)
            .desired_instances(desired_instances)
            .send()
            .await
            .context("UpdateFleetCapacity request failed")?;
        Ok(())
    }
}

/// Only the first record drives the wake decision, so a malformed later record is skipped.
fn capacities_from_sdk(records: &[SdkFleetCapacity]) -> anyhow::Result<Vec<FleetCapacity>> {
    let Some((first, rest)) = records.split_first() else {
        return Ok(Vec::new());
    };

    let mut capacities = Vec::with_capacity(records.len());
    capacities.push(capacity_from_sdk(first)?);
    for record in rest {
        match capacity_from_sdk(record) {
            Ok(capacity) => capacities.push(capacity),
            Err(error) => {
                debug!(error = %error, "skipping unreadable fleet capacity record");
            }
        }
    }
    Ok(capacities)
}

fn capacity_from_sdk(record: &SdkFleetCapacity) -> anyhow::Result<FleetCapacity> {
    let counts = record.instance_counts().ok_or_else(|| {
        anyhow::anyhow!(
            "capacity record for fleet {:?} has no instance counts",
            record.fleet_id()
        )
    })?;

    // A missing or negative active count must not be read as an idle fleet.
    let active = counts
        .active()
        .and_then(|value| u32::try_from(value).ok())
        .ok_or_else(|| {
            anyhow::anyhow!(
                "capacity record for fleet {:?} has no active count",
                record.fleet_id()
            )
        })?;

    Ok(FleetCapacity {
        fleet_id: record.fleet_id().map(ToOwned::to_owned),
        instance_counts: InstanceCounts {
            active,
            ..instance_counts_from_sdk(counts)
        },
    })
}

fn instance_counts_from_sdk(counts: &Ec2InstanceCounts) -> InstanceCounts {
    let count = |value: Option<i32>| {
        value
            .and_then(|value| u32::try_from(value).ok())
            .unwrap_or_default()
    };

    InstanceCounts {
        desired: count(counts.desired()),
        active: count(counts.active()),
        idle: count(counts.idle()),
        pending: count(counts.pending()),
        terminating: count(counts.terminating()),
    }
}

fn alias_from_sdk(
    alias_id: &str,
    output: &ResolveAliasOutput,
) -> anyhow::Result<AliasResolution> {
    let fleet_id = output
        .fleet_id()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| anyhow::anyhow!("alias {alias_id} did not resolve to a fleet"))?;

    Ok(AliasResolution {
        alias_id: alias_id.to_string(),
        fleet_id: fleet_id.to_string(),
    })
}

#[derive(Debug, Clone, Serialize)]
struct WakeResponse {
    invocation_id: String,
    #[serde(flatten)]
    outcome: WakeOutcome,
    checked_at: DateTime<Utc>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| {
            "wakeup_service=debug,fleetwake_common=debug,tower_http=info".to_string()
        }))
        .init();

    let config = WakeConfig::from_env().context("invalid wake configuration")?;
    info!(
        alias_id = %config.alias_id,
        fleet_id = ?config.fleet_id,
        "wakeup-service configured"
    );

    let orchestrator = Arc::new(GameLiftOrchestrator::from_env().await);
    let waker = FleetWaker::new(orchestrator, config);

    if std::env::var("AWS_LAMBDA_RUNTIME_API").is_ok() {
        let trigger = parse_trigger_mode(std::env::var("WAKE_TRIGGER").ok().as_deref())?;
        info!(?trigger, "AWS Lambda runtime detected; running wakeup-service in lambda mode");

        match trigger {
            TriggerMode::Event => {
                lambda_runtime::run(service_fn(move |event: LambdaEvent<serde_json::Value>| {
                    let waker = waker.clone();
                    async move {
                        let budget = remaining_budget(
                            event.context.deadline,
                            Utc::now().timestamp_millis(),
                        );
                        invoke_event(&waker, event.context.request_id, budget).await
                    }
                }))
                .await
                .map_err(|e| anyhow::Error::msg(format!("lambda runtime error: {e}")))?;
            }
            TriggerMode::Http => {
                let app = build_router(AppState {
                    waker,
                    wake_timeout: wake_timeout_from_env(),
                });
                lambda_run(app)
                    .await
                    .map_err(|e| anyhow::Error::msg(format!("lambda runtime error: {e}")))?;
            }
        }
        return Ok(());
    }

    let app = build_router(AppState {
        waker,
        wake_timeout: wake_timeout_from_env(),
    });
    let bind_addr = parse_bind_addr("WAKE_SERVICE_BIND", "0.0.0.0:8085")?;
    info!(%bind_addr, "wakeup-service listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/wake", post(wake_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

fn parse_bind_addr(var_name: &str, default: &str) -> anyhow::Result<SocketAddr> {
    let value = std::env::var(var_name)
        .ok()
        .unwrap_or_else(|| default.to_string());
    value.parse().context(format!("invalid {var_name}"))
}

fn parse_trigger_mode(value: Option<&str>) -> anyhow::Result<TriggerMode> {
    match value.map(str::trim).filter(|value| !value.is_empty()) {
        None => Ok(TriggerMode::Event),
        Some(value) if value.eq_ignore_ascii_case("event") => Ok(TriggerMode::Event),
        Some(value) if value.eq_ignore_ascii_case("http") => Ok(TriggerMode::Http),
        Some(other) => anyhow::bail!("invalid WAKE_TRIGGER {other:?}; expected event or http"),
    }
}

fn wake_timeout_from_env() -> Duration {
    let seconds = std::env::var("WAKE_TIMEOUT_SECONDS")
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_WAKE_TIMEOUT_SECONDS)
        .max(1);
    Duration::from_secs(seconds)
}

/// Time left before the Lambda deadline (epoch millis). Zero means no deadline was supplied.
fn remaining_budget(deadline_ms: u64, now_ms: i64) -> Option<Duration> {
    if deadline_ms == 0 {
        return None;
    }
    let now_ms = u64::try_from(now_ms).unwrap_or_default();
    Some(Duration::from_millis(deadline_ms.saturating_sub(now_ms)))
}

async fn invoke_event(
    waker: &FleetWaker,
    request_id: String,
    budget: Option<Duration>,
) -> Result<String, lambda_runtime::Error> {
    let ctx = match budget {
        Some(budget) => WakeContext::with_timeout(request_id, budget),
        None => WakeContext::new(request_id),
    };

    match waker.wake(&ctx).await {
        Ok(outcome) => {
            info!(invocation_id = %ctx.invocation_id, ?outcome, "wake invocation finished");
            // Success carries an empty status; callers only inspect the error.
            Ok(String::new())
        }
        Err(error) => {
            warn!(
                invocation_id = %ctx.invocation_id,
                error = %error,
                "wake invocation failed"
            );
            Err(error.into())
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true, "service": "wakeup-service"}))
}

async fn wake_handler(State(state): State<AppState>) -> Result<Json<WakeResponse>, ApiError> {
    let ctx = WakeContext::with_timeout(Uuid::new_v4().to_string(), state.wake_timeout);
    let outcome = state
        .waker
        .wake(&ctx)
        .await
        .map_err(|e| ApiError::bad_gateway(e.to_string()))?;

    Ok(Json(WakeResponse {
        invocation_id: ctx.invocation_id,
        outcome,
        checked_at: Utc::now(),
    }))
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_gateway(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(status = %self.status, message = %self.message, "request failed");
        (
            self.status,
            Json(serde_json::json!({"error": self.message})),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeOrchestrator {
        active_instances: u32,
        fail_update: bool,
        updates: Mutex<Vec<CapacityRequest>>,
    }

    #[async_trait]
    impl FleetOrchestrator for FakeOrchestrator {
        async fn describe_fleet_capacity(
            &self,
            _fleet_id: Option<&str>,
        ) -> anyhow::Result<Vec<FleetCapacity>> {
            Ok(vec![FleetCapacity {
                fleet_id: Some("fleet-1".to_string()),
                instance_counts: InstanceCounts {
                    active: self.active_instances,
                    ..Default::default()
                },
            }])
        }

        async fn resolve_alias(&self, alias_id: &str) -> anyhow::Result<AliasResolution> {
            Ok(AliasResolution {
                alias_id: alias_id.to_string(),
                fleet_id: "fleet-2".to_string(),
            })
        }

        async fn update_fleet_capacity(&self, request: &CapacityRequest) -> anyhow::Result<()> {
            if self.fail_update {
                return Err(anyhow::anyhow!("forced update error"));
            }
            self.updates.lock().unwrap().push(request.clone());
            Ok(())
        }
    }

    fn waker(orchestrator: Arc<FakeOrchestrator>) -> FleetWaker {
        FleetWaker::new(
            orchestrator,
            WakeConfig {
                alias_id: "alias-1".to_string(),
                fleet_id: None,
            },
        )
    }

    fn app_state(orchestrator: Arc<FakeOrchestrator>) -> AppState {
        AppState {
            waker: waker(orchestrator),
            wake_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn wake_handler_reports_woken_fleet() {
        let orchestrator = Arc::new(FakeOrchestrator::default());
        let response = wake_handler(State(app_state(orchestrator.clone())))
            .await
            .unwrap()
            .0;

        assert_eq!(
            response.outcome,
            WakeOutcome::Woken {
                fleet_id: "fleet-2".to_string(),
                desired_instances: 1,
            }
        );
        assert!(!response.invocation_id.is_empty());

        let updates = orchestrator.updates.lock().unwrap();
        assert_eq!(updates.as_slice(), &[CapacityRequest::wake("fleet-2")]);
    }

    #[tokio::test]
    async fn wake_handler_skips_update_for_active_fleet() {
        let orchestrator = Arc::new(FakeOrchestrator {
            active_instances: 3,
            ..Default::default()
        });
        let response = wake_handler(State(app_state(orchestrator.clone())))
            .await
            .unwrap()
            .0;

        assert_eq!(
            response.outcome,
            WakeOutcome::AlreadyActive {
                active_instances: 3
            }
        );
        assert!(orchestrator.updates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn wake_handler_returns_bad_gateway_on_update_failure() {
        let orchestrator = Arc::new(FakeOrchestrator {
            fail_update: true,
            ..Default::default()
        });
        let err = wake_handler(State(app_state(orchestrator)))
            .await
            .unwrap_err();

        assert_eq!(err.status, StatusCode::BAD_GATEWAY);
        assert_eq!(
            err.message,
            "Failed to update fleet capacity: forced update error"
        );
    }

    #[tokio::test]
    async fn event_invocation_returns_empty_status_on_success() {
        let orchestrator = Arc::new(FakeOrchestrator::default());
        let status = invoke_event(
            &waker(orchestrator.clone()),
            "req-1".to_string(),
            Some(Duration::from_secs(5)),
        )
        .await
        .unwrap();

        assert_eq!(status, "");
        assert_eq!(orchestrator.updates.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn event_invocation_surfaces_labelled_error() {
        let orchestrator = Arc::new(FakeOrchestrator {
            fail_update: true,
            ..Default::default()
        });
        let err = invoke_event(&waker(orchestrator), "req-1".to_string(), None)
            .await
            .unwrap_err();

        assert!(err.to_string().starts_with("Failed to update fleet capacity"));
    }

    #[test]
    fn wake_response_flattens_outcome() {
        let response = WakeResponse {
            invocation_id: "inv-1".to_string(),
            outcome: WakeOutcome::AlreadyActive {
                active_instances: 2,
            },
            checked_at: Utc::now(),
        };
        let value = serde_json::to_value(&response).unwrap();

        assert_eq!(value["outcome"], "already_active");
        assert_eq!(value["active_instances"], 2);
        assert_eq!(value["invocation_id"], "inv-1");
    }

    #[test]
    fn remaining_budget_counts_down_to_deadline() {
        assert_eq!(remaining_budget(0, 1_000), None);
        assert_eq!(
            remaining_budget(5_000, 3_500),
            Some(Duration::from_millis(1_500))
        );
        assert_eq!(remaining_budget(5_000, 9_000), Some(Duration::ZERO));
    }

    #[test]
    fn trigger_mode_defaults_to_event() {
        assert_eq!(parse_trigger_mode(None).unwrap(), TriggerMode::Event);
        assert_eq!(parse_trigger_mode(Some(" ")).unwrap(), TriggerMode::Event);
        assert_eq!(parse_trigger_mode(Some("HTTP")).unwrap(), TriggerMode::Http);
        assert!(parse_trigger_mode(Some("sqs")).is_err());
    }

    #[test]
    fn sdk_capacity_maps_instance_counts() {
        let record = SdkFleetCapacity::builder()
            .fleet_id("fleet-1")
            .instance_counts(
                Ec2InstanceCounts::builder()
                    .desired(1)
                    .active(0)
                    .pending(1)
                    .build(),
            )
            .build();

        let capacity = capacity_from_sdk(&record).unwrap();
        assert_eq!(capacity.fleet_id.as_deref(), Some("fleet-1"));
        assert_eq!(capacity.active_instances(), 0);
        assert_eq!(capacity.instance_counts.desired, 1);
        assert_eq!(capacity.instance_counts.pending, 1);
    }

    #[test]
    fn sdk_capacity_without_counts_is_rejected() {
        let record = SdkFleetCapacity::builder().fleet_id("fleet-1").build();
        assert!(capacity_from_sdk(&record).is_err());
    }

    #[test]
    fn sdk_capacity_without_active_count_is_rejected() {
        let record = SdkFleetCapacity::builder()
            .fleet_id("fleet-1")
            .instance_counts(Ec2InstanceCounts::builder().desired(3).build())
            .build();

        let err = capacity_from_sdk(&record).unwrap_err();
        assert!(err.to_string().contains("no active count"));
    }

    #[test]
    fn sdk_capacity_with_negative_active_count_is_rejected() {
        let record = SdkFleetCapacity::builder()
            .fleet_id("fleet-1")
            .instance_counts(
                Ec2InstanceCounts::builder()
                    .desired(5)
                    .active(-1)
                    .build(),
            )
            .build();

        assert!(capacity_from_sdk(&record).is_err());
    }

    fn sdk_record(fleet_id: &str, active: i32) -> SdkFleetCapacity {
        SdkFleetCapacity::builder()
            .fleet_id(fleet_id)
            .instance_counts(
                Ec2InstanceCounts::builder()
                    .desired(active)
                    .active(active)
                    .build(),
            )
            .build()
    }

    #[test]
    fn unreadable_later_records_do_not_fail_the_listing() {
        let records = vec![
            sdk_record("fleet-1", 2),
            SdkFleetCapacity::builder().fleet_id("fleet-2").build(),
            sdk_record("fleet-3", 0),
        ];

        let capacities = capacities_from_sdk(&records).unwrap();
        let fleet_ids: Vec<_> = capacities
            .iter()
            .map(|capacity| capacity.fleet_id.as_deref())
            .collect();
        assert_eq!(fleet_ids, vec![Some("fleet-1"), Some("fleet-3")]);
        assert_eq!(capacities[0].active_instances(), 2);
    }

    #[test]
    fn unreadable_first_record_fails_the_listing() {
        let records = vec![
            SdkFleetCapacity::builder().fleet_id("fleet-1").build(),
            sdk_record("fleet-2", 1),
        ];

        assert!(capacities_from_sdk(&records).is_err());
    }

    #[test]
    fn empty_listing_maps_to_no_records() {
        assert!(capacities_from_sdk(&[]).unwrap().is_empty());
    }

    #[test]
    fn alias_without_fleet_id_is_rejected() {
        let output = ResolveAliasOutput::builder().build();

        let err = alias_from_sdk("alias-1", &output).unwrap_err();
        assert!(err.to_string().contains("alias-1 did not resolve to a fleet"));
    }

    #[test]
    fn alias_with_blank_fleet_id_is_rejected() {
        let output = ResolveAliasOutput::builder().fleet_id("").build();
        assert!(alias_from_sdk("alias-1", &output).is_err());
    }

    #[test]
    fn alias_maps_resolved_fleet_id() {
        let output = ResolveAliasOutput::builder().fleet_id("fleet-9").build();

        let resolution = alias_from_sdk("alias-1", &output).unwrap();
        assert_eq!(
            resolution,
            AliasResolution {
                alias_id: "alias-1".to_string(),
                fleet_id: "fleet-9".to_string(),
            }
        );
    }
}
