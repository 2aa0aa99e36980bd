//! Core types for the alert engine (JSON contracts + internal models).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::escalation::{Incident, IncidentState};
use crate::stats::EngineStats;

// ---------------------------------------------------------------------------
// Inbound types (JSON contract: what the router sends)
// ---------------------------------------------------------------------------

/// One candidate notification event. Unknown fields are silently ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
  pub event_type: String,
  pub source_id: String,
  pub severity: String,
  #[serde(default)]
  pub issue_signature: Vec<String>,
  pub occurred_at: String,
  #[serde(default)]
  pub payload: Map<String, Value>,
  /// Channel the router picked; keys per-channel throttle scopes.
  #[serde(default)]
  pub channel: Option<String>,
  /// "firing" (default) or "resolved" when the detector reports the condition cleared.
  #[serde(default)]
  pub status: Option<String>,
}

// ---------------------------------------------------------------------------
// Severity enum (normalized)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
  Low,
  Medium,
  High,
  Critical,
}

impl Severity {
  pub fn from_str_loose(s: &str) -> Option<Self> {
    match s.to_ascii_lowercase().as_str() {
      "low" | "info" => Some(Self::Low),
      "medium" | "med" | "warning" | "warn" => Some(Self::Medium),
      "high" | "error" => Some(Self::High),
      "critical" | "crit" | "fatal" => Some(Self::Critical),
      _ => None,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Low => "low",
      Self::Medium => "medium",
      Self::High => "high",
      Self::Critical => "critical",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
  #[default]
  Firing,
  Resolved,
}

// ---------------------------------------------------------------------------
// Internal normalized types
// ---------------------------------------------------------------------------

/// Canonical internal event after normalization + validation. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationEvent {
  pub event_type: String,
  pub source_id: String,
  pub severity: Severity,
  /// Sorted, de-duplicated issue-type identifiers.
  pub issue_signature: Vec<String>,
  pub occurred_at: DateTime<Utc>,
  pub payload: Map<String, Value>,
  pub channel: Option<String>,
  pub status: EventStatus,
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// A stable hex string identifying "the same problem recurring".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IncidentId(pub String);

impl fmt::Display for IncidentId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for IncidentId {
  fn from(s: &str) -> Self {
    Self(s.to_string())
  }
}

/// Identifies one incident slot: at most one open incident per (fingerprint, policy).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SlotKey {
  pub fingerprint: Fingerprint,
  pub policy_id: String,
}

/// Identifies one throttle bucket: a throttle config plus "global" or a channel name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ScopeKey {
  pub config_id: String,
  pub scope: String,
}

impl fmt::Display for ScopeKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.config_id, self.scope)
  }
}

// ---------------------------------------------------------------------------
// Decisions (JSON contract: what we return)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressReason {
  Duplicate,
  ConditionCleared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleReason {
  Queued,
  Delayed,
  Rejected,
}

/// Outcome of `Engine::ingest` for one event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
  pub passed: bool,
  pub fingerprint: Fingerprint,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub suppressed_reason: Option<SuppressReason>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub throttled_reason: Option<ThrottleReason>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub delayed_until: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub incident_id: Option<IncidentId>,
}

impl Decision {
  pub fn passed(fingerprint: Fingerprint) -> Self {
    Self {
      passed: true,
      fingerprint,
      suppressed_reason: None,
      throttled_reason: None,
      delayed_until: None,
      incident_id: None,
    }
  }

  pub fn suppressed(fingerprint: Fingerprint, reason: SuppressReason) -> Self {
    Self {
      passed: false,
      suppressed_reason: Some(reason),
      ..Self::passed(fingerprint)
    }
  }

  pub fn throttled(fingerprint: Fingerprint, reason: ThrottleReason) -> Self {
    Self {
      passed: false,
      throttled_reason: Some(reason),
      ..Self::passed(fingerprint)
    }
  }

  pub fn with_incident(mut self, incident_id: Option<IncidentId>) -> Self {
    self.incident_id = incident_id;
    self
  }
}

/// What the scheduler did when a timer fired (`Engine::run_due`).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TimerOutcome {
  Escalated {
    incident_id: IncidentId,
    state: IncidentState,
    level: usize,
  },
  /// Timer for an incident that already moved on; nothing changed.
  Stale { incident_id: IncidentId },
  /// Firing landed outside business hours and was pushed to the next opening.
  Deferred {
    incident_id: IncidentId,
    until: DateTime<Utc>,
  },
  /// A queued or delayed event left its throttle bucket.
  Released { decision: Decision },
  CooldownExpired {
    fingerprint: Fingerprint,
    policy_id: String,
  },
  Swept { windows: usize, incidents: usize },
}

// ---------------------------------------------------------------------------
// CLI stream wrappers
// ---------------------------------------------------------------------------

/// One command line read by the `alert-engine` binary.
///
/// `at` advances the replay clock before the command runs; ingest defaults
/// to the event's `occurred_at`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
  Ingest {
    #[serde(default)]
    at: Option<String>,
    event: InboundEvent,
  },
  Acknowledge {
    #[serde(default)]
    at: Option<String>,
    incident_id: String,
    actor: String,
  },
  Resolve {
    #[serde(default)]
    at: Option<String>,
    incident_id: String,
    actor: String,
  },
  Cancel {
    #[serde(default)]
    at: Option<String>,
    incident_id: String,
    actor: String,
  },
  Escalate {
    #[serde(default)]
    at: Option<String>,
    incident_id: String,
    actor: String,
  },
  Advance { at: String },
  Stats {
    #[serde(default)]
    at: Option<String>,
  },
}

impl Command {
  /// Replay timestamp for this command, if any.
  pub fn at(&self) -> Option<&str> {
    match self {
      Self::Ingest { at, event } => at.as_deref().or(Some(event.occurred_at.as_str())),
      Self::Acknowledge { at, .. }
      | Self::Resolve { at, .. }
      | Self::Cancel { at, .. }
      | Self::Escalate { at, .. }
      | Self::Stats { at } => at.as_deref(),
      Self::Advance { at } => Some(at.as_str()),
    }
  }
}

/// One output line written by the `alert-engine` binary.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Output {
  Decision(Decision),
  Incident(Box<Incident>),
  Timer(TimerOutcome),
  Dispatch(crate::dispatch::DispatchRequest),
  Stats(Box<EngineStats>),
}

/// Structured error output for invalid input lines.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorOutput {
  pub error: bool,
  pub message: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub field: Option<String>,
}

impl ErrorOutput {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      error: true,
      message: message.into(),
      field: None,
    }
  }

  pub fn with_field(mut self, field: impl Into<String>) -> Self {
    self.field = Some(field.into());
    self
  }
}
