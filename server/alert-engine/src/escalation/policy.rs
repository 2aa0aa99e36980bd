//! Escalation policy configuration.

use serde::{Deserialize, Serialize};

use crate::config::Selector;
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
  User,
  Team,
  Schedule,
  Channel,
  Webhook,
}

/// Who gets notified at a level. Delivery is the dispatcher's concern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
  pub kind: TargetKind,
  pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationLevel {
  /// Wait before this level fires, relative to the previous firing.
  pub delay_minutes: u32,
  pub targets: Vec<Target>,
  /// Only meaningful on the last level: extra firings once the ladder is exhausted.
  #[serde(default)]
  pub repeat_count: u32,
}

/// Alternative causes that escalate ahead of the normal timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationTriggers {
  /// Escalate immediately when an event arrives with higher severity.
  pub severity_upgrade: bool,
  /// Escalate when an open incident has seen this many events.
  pub occurrence_threshold: Option<u64>,
  /// Escalate (or fail, if no level remains) after this many dispatch failures.
  pub repeated_failure_threshold: Option<u32>,
  /// Re-escalate an acknowledged incident still unresolved after this long.
  pub unresolved_reescalate_minutes: Option<u32>,
}

impl Default for EscalationTriggers {
  fn default() -> Self {
    Self {
      severity_upgrade: true,
      occurrence_threshold: None,
      repeated_failure_threshold: None,
      unresolved_reescalate_minutes: None,
    }
  }
}

fn default_enabled() -> bool {
  true
}

fn default_true() -> bool {
  true
}

fn default_max_escalations() -> u32 {
  10
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationPolicy {
  pub id: String,
  #[serde(default = "default_enabled")]
  pub enabled: bool,
  #[serde(default)]
  pub selector: Selector,
  pub levels: Vec<EscalationLevel>,
  #[serde(default = "default_true")]
  pub require_ack: bool,
  #[serde(default)]
  pub auto_resolve: bool,
  #[serde(default)]
  pub cooldown_minutes: u32,
  #[serde(default = "default_max_escalations")]
  pub max_escalations: u32,
  #[serde(default)]
  pub business_hours_only: bool,
  #[serde(default)]
  pub triggers: EscalationTriggers,
}

impl EscalationPolicy {
  pub fn validate(&self) -> Result<(), EngineError> {
    if self.id.trim().is_empty() {
      return Err(EngineError::configuration("escalation", "id", "must not be empty"));
    }
    if self.levels.is_empty() {
      return Err(EngineError::configuration(&self.id, "levels", "must have at least one level"));
    }
    for (i, level) in self.levels.iter().enumerate() {
      if level.targets.is_empty() {
        return Err(EngineError::configuration(
          &self.id,
          &format!("levels[{}].targets", i),
          "must have at least one target",
        ));
      }
      if level.targets.iter().any(|t| t.id.trim().is_empty()) {
        return Err(EngineError::configuration(
          &self.id,
          &format!("levels[{}].targets", i),
          "target id must not be empty",
        ));
      }
    }
    if self.max_escalations == 0 {
      return Err(EngineError::configuration(&self.id, "max_escalations", "must be > 0"));
    }
    if self.triggers.occurrence_threshold == Some(0) {
      return Err(EngineError::configuration(
        &self.id,
        "triggers.occurrence_threshold",
        "must be > 0",
      ));
    }
    if self.triggers.repeated_failure_threshold == Some(0) {
      return Err(EngineError::configuration(
        &self.id,
        "triggers.repeated_failure_threshold",
        "must be > 0",
      ));
    }
    Ok(())
  }

  pub fn level(&self, index: usize) -> &EscalationLevel {
    &self.levels[index.min(self.levels.len() - 1)]
  }
}
