//! Engine configuration: dedup configs, throttle configs, escalation
//! policies, and runtime tunables with sane defaults.
//!
//! Loaded from a JSON document; every object is validated before it can
//! reach the pipeline.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::business_hours::BusinessHours;
use crate::dedup::DedupConfig;
use crate::error::EngineError;
use crate::escalation::EscalationPolicy;
use crate::throttle::ThrottleConfig;
use crate::types::{NotificationEvent, Severity};

/// Longest window any dedup or throttle config may declare (30 days).
pub const MAX_WINDOW_SECONDS: u64 = 30 * 86_400;
/// Slowest refill or drain rate: one unit per `MAX_WINDOW_SECONDS`.
pub const MIN_RATE_PER_SECOND: f64 = 1.0 / MAX_WINDOW_SECONDS as f64;
/// Upper bound on a throttle scope's queue or pending reservations.
pub const MAX_QUEUE_CAPACITY: usize = 100_000;
/// Upper bound on the sweep interval (one day).
pub const MAX_SWEEP_INTERVAL_SECONDS: u64 = 86_400;
/// Upper bound on closed-incident retention (one year).
pub const MAX_RETENTION_MINUTES: u64 = 366 * 24 * 60;

/// Which events a config applies to. Empty matches everything.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Selector {
  pub event_types: Vec<String>,
  pub min_severity: Option<Severity>,
}

impl Selector {
  pub fn matches(&self, event: &NotificationEvent) -> bool {
    let type_ok = self.event_types.is_empty()
      || self
        .event_types
        .iter()
        .any(|t| t.eq_ignore_ascii_case(&event.event_type));
    let severity_ok = self.min_severity.map_or(true, |min| event.severity >= min);
    type_ok && severity_ok
  }
}

/// Tunable thresholds for the runtime itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
  /// Idle dedup windows are evicted after this many window lengths.
  pub eviction_factor: f64,
  pub sweep_interval_seconds: u64,
  /// How long closed incidents stay queryable.
  pub incident_retention_minutes: u64,
  /// Due-timer batch size above which a scheduler overrun is counted.
  pub scheduler_backlog_threshold: usize,
  /// EWMA smoothing factor (0..1) for adaptive dedup. Higher = more reactive.
  pub adaptive_alpha: f64,
}

impl Default for RuntimeConfig {
  fn default() -> Self {
    Self {
      eviction_factor: 3.0,
      sweep_interval_seconds: 60,
      incident_retention_minutes: 1440,
      scheduler_backlog_threshold: 1000,
      adaptive_alpha: 0.3,
    }
  }
}

impl RuntimeConfig {
  pub fn validate(&self) -> Result<(), EngineError> {
    if !(self.eviction_factor >= 1.0) {
      return Err(EngineError::configuration("runtime", "eviction_factor", "must be >= 1"));
    }
    if self.sweep_interval_seconds == 0 || self.sweep_interval_seconds > MAX_SWEEP_INTERVAL_SECONDS {
      return Err(EngineError::configuration(
        "runtime",
        "sweep_interval_seconds",
        "must be in 1..=86400",
      ));
    }
    if self.incident_retention_minutes > MAX_RETENTION_MINUTES {
      return Err(EngineError::configuration(
        "runtime",
        "incident_retention_minutes",
        "must be at most one year",
      ));
    }
    if self.scheduler_backlog_threshold == 0 {
      return Err(EngineError::configuration(
        "runtime",
        "scheduler_backlog_threshold",
        "must be > 0",
      ));
    }
    if !(self.adaptive_alpha > 0.0 && self.adaptive_alpha <= 1.0) {
      return Err(EngineError::configuration("runtime", "adaptive_alpha", "must be in (0, 1]"));
    }
    Ok(())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigKind {
  Dedup,
  Throttle,
  Escalation,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  pub dedup: Vec<DedupConfig>,
  pub throttle: Vec<ThrottleConfig>,
  pub escalation: Vec<EscalationPolicy>,
  pub business_hours: BusinessHours,
  pub runtime: RuntimeConfig,
}

impl EngineConfig {
  pub fn from_json(raw: &str) -> Result<Self, EngineError> {
    let config: Self = serde_json::from_str(raw)?;
    config.validate()?;
    Ok(config)
  }

  pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
    let raw = std::fs::read_to_string(path)?;
    Self::from_json(&raw)
  }

  pub fn validate(&self) -> Result<(), EngineError> {
    check_unique("dedup", self.dedup.iter().map(|c| c.id.as_str()))?;
    check_unique("throttle", self.throttle.iter().map(|c| c.id.as_str()))?;
    check_unique("escalation", self.escalation.iter().map(|p| p.id.as_str()))?;
    for c in &self.dedup {
      c.validate()?;
    }
    for c in &self.throttle {
      c.validate()?;
    }
    for p in &self.escalation {
      p.validate()?;
    }
    self.business_hours.validate()?;
    self.runtime.validate()
  }

  /// First enabled dedup config whose selector matches.
  pub fn dedup_for(&self, event: &NotificationEvent) -> Option<&DedupConfig> {
    self.dedup.iter().find(|c| c.enabled && c.selector.matches(event))
  }

  pub fn throttle_for(&self, event: &NotificationEvent) -> Option<&ThrottleConfig> {
    self.throttle.iter().find(|c| c.enabled && c.selector.matches(event))
  }

  pub fn policy_for(&self, event: &NotificationEvent) -> Option<&EscalationPolicy> {
    self.escalation.iter().find(|p| p.enabled && p.selector.matches(event))
  }

  /// Look up a policy by id, enabled or not. Open incidents keep following
  /// a policy after it is disabled.
  pub fn policy(&self, id: &str) -> Option<&EscalationPolicy> {
    self.escalation.iter().find(|p| p.id == id)
  }

  pub fn throttle(&self, id: &str) -> Option<&ThrottleConfig> {
    self.throttle.iter().find(|c| c.id == id)
  }

  pub fn upsert_dedup(&mut self, config: DedupConfig) -> Result<(), EngineError> {
    config.validate()?;
    upsert(&mut self.dedup, config, |c| &c.id);
    Ok(())
  }

  pub fn upsert_throttle(&mut self, config: ThrottleConfig) -> Result<(), EngineError> {
    config.validate()?;
    upsert(&mut self.throttle, config, |c| &c.id);
    Ok(())
  }

  pub fn upsert_policy(&mut self, policy: EscalationPolicy) -> Result<(), EngineError> {
    policy.validate()?;
    upsert(&mut self.escalation, policy, |p| &p.id);
    Ok(())
  }

  pub fn set_enabled(&mut self, kind: ConfigKind, id: &str, enabled: bool) -> Result<(), EngineError> {
    let flag = match kind {
      ConfigKind::Dedup => self.dedup.iter_mut().find(|c| c.id == id).map(|c| &mut c.enabled),
      ConfigKind::Throttle => self.throttle.iter_mut().find(|c| c.id == id).map(|c| &mut c.enabled),
      ConfigKind::Escalation => self.escalation.iter_mut().find(|p| p.id == id).map(|p| &mut p.enabled),
    };
    match flag {
      Some(flag) => {
        *flag = enabled;
        Ok(())
      }
      None => Err(EngineError::NotFound(format!("{:?} config {}", kind, id))),
    }
  }

  /// Returns false if no config of that kind had the id.
  pub fn remove(&mut self, kind: ConfigKind, id: &str) -> bool {
    fn drop_id<T>(items: &mut Vec<T>, id: &str, key: impl Fn(&T) -> &str) -> bool {
      let before = items.len();
      items.retain(|item| key(item) != id);
      items.len() != before
    }
    match kind {
      ConfigKind::Dedup => drop_id(&mut self.dedup, id, |c| c.id.as_str()),
      ConfigKind::Throttle => drop_id(&mut self.throttle, id, |c| c.id.as_str()),
      ConfigKind::Escalation => drop_id(&mut self.escalation, id, |p| p.id.as_str()),
    }
  }
}

fn check_unique<'a>(kind: &str, ids: impl Iterator<Item = &'a str>) -> Result<(), EngineError> {
  let mut seen = HashSet::new();
  for id in ids {
    if !seen.insert(id) {
      return Err(EngineError::configuration(id, "id", &format!("duplicate {} id", kind)));
    }
  }
  Ok(())
}

fn upsert<T>(items: &mut Vec<T>, item: T, key: impl Fn(&T) -> &String) {
  match items.iter().position(|existing| key(existing) == key(&item)) {
    Some(i) => items[i] = item,
    None => items.push(item),
  }
}
