//! HTTP handlers for the alert engine.

use alert_engine::config::{ConfigKind, EngineConfig};
use alert_engine::dedup::DedupConfig;
use alert_engine::error::DispatchError;
use alert_engine::escalation::EscalationPolicy;
use alert_engine::stats::EngineStats;
use alert_engine::throttle::ThrottleConfig;
use alert_engine::{Decision, EngineError, InboundEvent, Incident, IncidentId};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use std::sync::Arc;

use crate::error::ApiError;
use crate::state::AppState;
use crate::types::{ActorPayload, DispatchFailurePayload, EnabledPayload, IncidentQuery};

type ApiResult<T> = Result<Json<T>, ApiError>;

pub async fn health() -> &'static str {
  "ok"
}

pub async fn ingest(State(state): State<Arc<AppState>>, Json(event): Json<InboundEvent>) -> ApiResult<Decision> {
  Ok(Json(state.engine.ingest(&event)?))
}

pub async fn get_incident(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<Incident> {
  state
    .engine
    .incident(&IncidentId(id.clone()))
    .map(Json)
    .ok_or_else(|| EngineError::NotFound(id).into())
}

/// Open incidents, optionally filtered by state.
pub async fn list_incidents(
  State(state): State<Arc<AppState>>,
  Query(query): Query<IncidentQuery>,
) -> Json<Vec<Incident>> {
  let incidents = state
    .engine
    .open_incidents()
    .into_iter()
    .filter(|inc| query.state.map_or(true, |s| inc.state == s))
    .collect();
  Json(incidents)
}

pub async fn acknowledge(
  State(state): State<Arc<AppState>>,
  Path(id): Path<String>,
  Json(body): Json<ActorPayload>,
) -> ApiResult<Incident> {
  Ok(Json(state.engine.acknowledge(&IncidentId(id), &body.actor)?))
}

pub async fn resolve(
  State(state): State<Arc<AppState>>,
  Path(id): Path<String>,
  Json(body): Json<ActorPayload>,
) -> ApiResult<Incident> {
  Ok(Json(state.engine.resolve(&IncidentId(id), &body.actor)?))
}

pub async fn cancel(
  State(state): State<Arc<AppState>>,
  Path(id): Path<String>,
  Json(body): Json<ActorPayload>,
) -> ApiResult<Incident> {
  Ok(Json(state.engine.cancel(&IncidentId(id), &body.actor)?))
}

pub async fn escalate(
  State(state): State<Arc<AppState>>,
  Path(id): Path<String>,
  Json(body): Json<ActorPayload>,
) -> ApiResult<Incident> {
  Ok(Json(state.engine.escalate_now(&IncidentId(id), &body.actor)?))
}

/// Senders report failed deliveries here after the fact.
pub async fn dispatch_failure(
  State(state): State<Arc<AppState>>,
  Path(id): Path<String>,
  Json(body): Json<DispatchFailurePayload>,
) -> ApiResult<Incident> {
  let error = DispatchError::new(body.target, body.reason);
  Ok(Json(state.engine.report_dispatch_failure(&IncidentId(id), body.level, error)?))
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Json<EngineStats> {
  Json(state.engine.stats())
}

pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<EngineConfig> {
  Json(EngineConfig::clone(&state.engine.config()))
}

pub async fn put_dedup(
  State(state): State<Arc<AppState>>,
  Json(config): Json<DedupConfig>,
) -> Result<StatusCode, ApiError> {
  state.engine.upsert_dedup(config)?;
  Ok(StatusCode::NO_CONTENT)
}

pub async fn put_throttle(
  State(state): State<Arc<AppState>>,
  Json(config): Json<ThrottleConfig>,
) -> Result<StatusCode, ApiError> {
  state.engine.upsert_throttle(config)?;
  Ok(StatusCode::NO_CONTENT)
}

pub async fn put_policy(
  State(state): State<Arc<AppState>>,
  Json(policy): Json<EscalationPolicy>,
) -> Result<StatusCode, ApiError> {
  state.engine.upsert_policy(policy)?;
  Ok(StatusCode::NO_CONTENT)
}

pub async fn set_enabled(
  State(state): State<Arc<AppState>>,
  Path((kind, id)): Path<(ConfigKind, String)>,
  Json(body): Json<EnabledPayload>,
) -> Result<StatusCode, ApiError> {
  state.engine.set_enabled(kind, &id, body.enabled)?;
  Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_config(
  State(state): State<Arc<AppState>>,
  Path((kind, id)): Path<(ConfigKind, String)>,
) -> Result<StatusCode, ApiError> {
  state.engine.remove_config(kind, &id)?;
  Ok(StatusCode::NO_CONTENT)
}
