//! Request payloads for the HTTP API.

use alert_engine::escalation::IncidentState;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct ActorPayload {
  pub actor: String,
}

#[derive(Debug, Deserialize)]
pub struct DispatchFailurePayload {
  pub level: usize,
  pub target: String,
  pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct EnabledPayload {
  pub enabled: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct IncidentQuery {
  pub state: Option<IncidentState>,
}
