//! Incident record and its append-only history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::escalation::policy::Target;
use crate::scheduler::TimerId;
use crate::types::{Fingerprint, IncidentId, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentState {
  Pending,
  Active,
  Escalating,
  Acknowledged,
  Resolved,
  Cancelled,
  TimedOut,
  Failed,
}

impl IncidentState {
  pub fn is_terminal(self) -> bool {
    matches!(self, Self::Resolved | Self::Cancelled | Self::TimedOut | Self::Failed)
  }
}

/// Why an incident entered `Escalating`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationTrigger {
  Unacknowledged,
  Unresolved,
  SeverityUpgrade,
  RepeatedFailure,
  ThresholdBreach,
  Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryKind {
  Transition {
    from: IncidentState,
    to: IncidentState,
    #[serde(skip_serializing_if = "Option::is_none")]
    trigger: Option<EscalationTrigger>,
  },
  Dispatched {
    level: usize,
    targets: Vec<Target>,
  },
  DispatchFailed {
    level: usize,
    target: String,
    error: String,
  },
  /// Another event for the same fingerprint while the incident was open.
  Recurrence { severity: Severity },
  /// An event arrived during cooldown and did not open a new incident.
  CooldownSuppressed,
}

/// One audit log entry. Never rewritten once appended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncidentEvent {
  pub at: DateTime<Utc>,
  pub actor: String,
  #[serde(flatten)]
  pub kind: HistoryKind,
}

pub const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Clone, Serialize)]
pub struct Incident {
  pub id: IncidentId,
  pub fingerprint: Fingerprint,
  pub policy_id: String,
  pub state: IncidentState,
  pub severity: Severity,
  /// Next level to dispatch. Never decreases.
  pub current_level_index: usize,
  pub escalation_count: u32,
  /// Extra firings of the last level done so far.
  pub repeats_done: u32,
  pub occurrences: u64,
  pub dispatch_failures: u32,
  pub created_at: DateTime<Utc>,
  pub last_transition_at: DateTime<Utc>,
  /// First acknowledgment; later re-acknowledgments only appear in history.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub acknowledged_at: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub acknowledged_by: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub resolved_at: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub resolved_by: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub closed_at: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub next_escalation_at: Option<DateTime<Utc>>,
  /// Bumped on every transition; timers carrying an older value are stale.
  pub generation: u64,
  pub history: Vec<IncidentEvent>,
  #[serde(skip)]
  pub(crate) timer: Option<TimerId>,
}

impl Incident {
  pub(crate) fn open(
    id: IncidentId,
    fingerprint: Fingerprint,
    policy_id: &str,
    severity: Severity,
    at: DateTime<Utc>,
  ) -> Self {
    Self {
      id,
      fingerprint,
      policy_id: policy_id.to_string(),
      state: IncidentState::Pending,
      severity,
      current_level_index: 0,
      escalation_count: 0,
      repeats_done: 0,
      occurrences: 1,
      dispatch_failures: 0,
      created_at: at,
      last_transition_at: at,
      acknowledged_at: None,
      acknowledged_by: None,
      resolved_at: None,
      resolved_by: None,
      closed_at: None,
      next_escalation_at: None,
      generation: 0,
      history: Vec::new(),
      timer: None,
    }
  }

  pub fn is_open(&self) -> bool {
    !self.state.is_terminal()
  }

  pub(crate) fn record(&mut self, at: DateTime<Utc>, actor: &str, kind: HistoryKind) {
    self.history.push(IncidentEvent {
      at,
      actor: actor.to_string(),
      kind,
    });
  }

  /// Move to `to`, bump the generation, and log the transition.
  pub(crate) fn transition(
    &mut self,
    to: IncidentState,
    at: DateTime<Utc>,
    actor: &str,
    trigger: Option<EscalationTrigger>,
  ) {
    let from = self.state;
    self.state = to;
    self.last_transition_at = at;
    self.generation += 1;
    if to.is_terminal() {
      self.closed_at = Some(at);
      self.next_escalation_at = None;
    }
    self.record(at, actor, HistoryKind::Transition { from, to, trigger });
  }

  /// The state path recorded in history, starting from `Pending`.
  pub fn path(&self) -> Vec<IncidentState> {
    let mut path = vec![IncidentState::Pending];
    path.extend(self.history.iter().filter_map(|e| match e.kind {
      HistoryKind::Transition { to, .. } => Some(to),
      _ => None,
    }));
    path
  }
}
