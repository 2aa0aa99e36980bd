//! Seam to the external senders that deliver escalation notifications.
//!
//! The escalator hands requests off and never waits on delivery. Failures
//! come back either as an `Err` from `dispatch` or later through
//! `Engine::report_dispatch_failure`; both only append to incident history.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::DispatchError;
use crate::escalation::{EscalationTrigger, Target};
use crate::types::{Fingerprint, IncidentId, Severity};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchRequest {
  pub incident_id: IncidentId,
  pub fingerprint: Fingerprint,
  pub policy_id: String,
  pub level: usize,
  pub targets: Vec<Target>,
  pub trigger: EscalationTrigger,
  pub severity: Severity,
  pub escalation_count: u32,
  pub at: DateTime<Utc>,
}

/// Implementations must not block and must not call back into the engine
/// from inside `dispatch`.
pub trait TargetDispatcher: Send + Sync {
  fn dispatch(&self, request: &DispatchRequest) -> Result<(), DispatchError>;
}

/// Drops every request.
#[derive(Debug, Default)]
pub struct NoopDispatcher;

impl TargetDispatcher for NoopDispatcher {
  fn dispatch(&self, _request: &DispatchRequest) -> Result<(), DispatchError> {
    Ok(())
  }
}

/// Keeps requests in memory until drained; used by the replay binary and tests.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
  requests: Mutex<Vec<DispatchRequest>>,
  failing_targets: Mutex<Vec<String>>,
}

impl RecordingDispatcher {
  pub fn new() -> Self {
    Self::default()
  }

  /// Make every request naming `target_id` fail.
  pub fn fail_target(&self, target_id: &str) {
    self.failing_targets.lock().push(target_id.to_string());
  }

  pub fn drain(&self) -> Vec<DispatchRequest> {
    std::mem::take(&mut *self.requests.lock())
  }

  pub fn len(&self) -> usize {
    self.requests.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl TargetDispatcher for RecordingDispatcher {
  fn dispatch(&self, request: &DispatchRequest) -> Result<(), DispatchError> {
    self.requests.lock().push(request.clone());
    let failing = self.failing_targets.lock();
    match request.targets.iter().find(|t| failing.contains(&t.id)) {
      Some(target) => Err(DispatchError::new(target.id.clone(), "target marked as failing")),
      None => Ok(()),
    }
  }
}
