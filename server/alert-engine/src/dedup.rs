//! Windowed deduplication: decides PASS or SUPPRESS per fingerprint.
//!
//! State lives in a sharded map keyed by (dedup config, fingerprint); each
//! decision runs under that key's entry lock, so concurrent events for the
//! same fingerprint are serialized while other fingerprints proceed.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::config::{Selector, MAX_WINDOW_SECONDS};
use crate::error::EngineError;
use crate::fingerprint::FingerprintPolicy;
use crate::stats::{self, DedupCounters, DedupStats};
use crate::template::Template;
use crate::types::Fingerprint;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DedupStrategy {
  /// One pass per window, anchored to the last passed event.
  Sliding,
  /// One pass per fixed epoch-aligned window.
  Tumbling,
  /// One pass per burst; a new session starts after an idle gap of one window.
  Session,
  /// Sliding, with the window scaled by the observed arrival rate.
  Adaptive {
    min_window_seconds: u64,
    max_window_seconds: u64,
    /// Arrival rate at which the effective window equals `window_seconds`.
    #[serde(default = "default_target_rate")]
    target_rate_per_minute: f64,
  },
}

fn default_target_rate() -> f64 {
  1.0
}

fn default_enabled() -> bool {
  true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupConfig {
  pub id: String,
  #[serde(default = "default_enabled")]
  pub enabled: bool,
  #[serde(default)]
  pub selector: Selector,
  pub policy: FingerprintPolicy,
  pub strategy: DedupStrategy,
  pub window_seconds: u64,
}

impl DedupConfig {
  pub fn validate(&self) -> Result<(), EngineError> {
    if self.id.trim().is_empty() {
      return Err(EngineError::configuration("dedup", "id", "must not be empty"));
    }
    if self.window_seconds == 0 || self.window_seconds > MAX_WINDOW_SECONDS {
      return Err(EngineError::configuration(
        &self.id,
        "window_seconds",
        "must be between 1 second and 30 days",
      ));
    }
    if let DedupStrategy::Adaptive {
      min_window_seconds,
      max_window_seconds,
      target_rate_per_minute,
    } = &self.strategy
    {
      if *min_window_seconds == 0 {
        return Err(EngineError::configuration(&self.id, "min_window_seconds", "must be > 0"));
      }
      if min_window_seconds > max_window_seconds || *max_window_seconds > MAX_WINDOW_SECONDS {
        return Err(EngineError::configuration(
          &self.id,
          "max_window_seconds",
          "must be >= min_window_seconds and at most 30 days",
        ));
      }
      if !(*target_rate_per_minute > 0.0) {
        return Err(EngineError::configuration(&self.id, "target_rate_per_minute", "must be > 0"));
      }
    }
    if let FingerprintPolicy::Custom { template } = &self.policy {
      Template::parse(template)
        .map_err(|e| EngineError::configuration(&self.id, "policy.template", &e.to_string()))?;
    }
    Ok(())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupVerdict {
  Pass,
  Suppress,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WindowKey {
  config_id: String,
  fingerprint: Fingerprint,
}

/// Per-fingerprint window record.
#[derive(Debug, Clone)]
pub struct DedupWindowState {
  pub window_seconds: u64,
  pub last_pass_at: Option<DateTime<Utc>>,
  /// Tumbling: index of the boundary interval that already passed.
  pub window_index: Option<i64>,
  pub last_seen_at: DateTime<Utc>,
  /// Adaptive: EWMA of arrivals per minute.
  pub observed_rate: f64,
  pub effective_window_seconds: f64,
}

impl DedupWindowState {
  fn cold(config: &DedupConfig, now: DateTime<Utc>) -> Self {
    let effective = match &config.strategy {
      DedupStrategy::Adaptive { min_window_seconds, .. } => *min_window_seconds as f64,
      _ => config.window_seconds as f64,
    };
    Self {
      window_seconds: config.window_seconds,
      last_pass_at: Some(now),
      window_index: Some(window_index(now, config.window_seconds)),
      last_seen_at: now,
      observed_rate: 0.0,
      effective_window_seconds: effective,
    }
  }

  fn idle_limit_seconds(&self, eviction_factor: f64) -> f64 {
    (self.window_seconds as f64).max(self.effective_window_seconds) * eviction_factor
  }
}

pub struct Deduplicator {
  windows: DashMap<WindowKey, DedupWindowState>,
  counters: DashMap<String, DedupCounters>,
  adaptive_alpha: f64,
}

impl Deduplicator {
  pub fn new(adaptive_alpha: f64) -> Self {
    Self {
      windows: DashMap::new(),
      counters: DashMap::new(),
      adaptive_alpha,
    }
  }

  /// Decide PASS or SUPPRESS for one event's fingerprint at `now`.
  ///
  /// A fingerprint with no prior state always passes.
  pub fn evaluate(&self, config: &DedupConfig, fingerprint: &Fingerprint, now: DateTime<Utc>) -> DedupVerdict {
    let verdict = if config.policy == FingerprintPolicy::None {
      DedupVerdict::Pass
    } else {
      let key = WindowKey {
        config_id: config.id.clone(),
        fingerprint: fingerprint.clone(),
      };
      match self.windows.entry(key) {
        Entry::Vacant(slot) => {
          slot.insert(DedupWindowState::cold(config, now));
          DedupVerdict::Pass
        }
        Entry::Occupied(mut slot) => decide(slot.get_mut(), config, now, self.adaptive_alpha),
      }
    };

    let mut counters = self.counters.entry(config.id.clone()).or_default();
    counters.received += 1;
    match verdict {
      DedupVerdict::Pass => counters.passed += 1,
      DedupVerdict::Suppress => counters.deduplicated += 1,
    }
    drop(counters);

    if verdict == DedupVerdict::Suppress {
      tracing::debug!(dedup = %config.id, fingerprint = %fingerprint, "suppressed duplicate");
    }
    verdict
  }

  /// Drop windows idle for longer than `window × eviction_factor`.
  pub fn evict_idle(&self, now: DateTime<Utc>, eviction_factor: f64) -> usize {
    let before = self.windows.len();
    self
      .windows
      .retain(|_, state| seconds_between(state.last_seen_at, now) < state.idle_limit_seconds(eviction_factor));
    before.saturating_sub(self.windows.len())
  }

  /// Forget all windows and counters of one config (reconfiguration).
  pub fn reset(&self, config_id: &str) {
    self.windows.retain(|key, _| key.config_id != config_id);
    self.counters.remove(config_id);
  }

  pub fn window_count(&self) -> usize {
    self.windows.len()
  }

  pub fn stats(&self, config_id: &str) -> DedupStats {
    self
      .counters
      .get(config_id)
      .map(|c| c.snapshot(config_id))
      .unwrap_or_else(|| DedupCounters::default().snapshot(config_id))
  }
}

fn decide(state: &mut DedupWindowState, config: &DedupConfig, now: DateTime<Utc>, alpha: f64) -> DedupVerdict {
  state.window_seconds = config.window_seconds;
  let window = config.window_seconds as f64;

  let verdict = match &config.strategy {
    DedupStrategy::Sliding => sliding(state.last_pass_at, now, window),
    DedupStrategy::Tumbling => {
      let idx = window_index(now, config.window_seconds);
      if state.window_index == Some(idx) {
        DedupVerdict::Suppress
      } else {
        state.window_index = Some(idx);
        DedupVerdict::Pass
      }
    }
    DedupStrategy::Session => {
      if seconds_between(state.last_seen_at, now) >= window {
        DedupVerdict::Pass
      } else {
        DedupVerdict::Suppress
      }
    }
    DedupStrategy::Adaptive {
      min_window_seconds,
      max_window_seconds,
      target_rate_per_minute,
    } => {
      // Instantaneous rate from the inter-arrival gap, capped at one per second.
      let gap_minutes = seconds_between(state.last_seen_at, now).max(1.0) / 60.0;
      state.observed_rate = stats::ewma(state.observed_rate, 1.0 / gap_minutes, alpha);
      state.effective_window_seconds = (window * state.observed_rate / target_rate_per_minute)
        .clamp(*min_window_seconds as f64, *max_window_seconds as f64);
      sliding(state.last_pass_at, now, state.effective_window_seconds)
    }
  };

  if now > state.last_seen_at {
    state.last_seen_at = now;
  }
  if verdict == DedupVerdict::Pass {
    state.last_pass_at = Some(now);
  }
  verdict
}

fn sliding(last_pass_at: Option<DateTime<Utc>>, now: DateTime<Utc>, window: f64) -> DedupVerdict {
  match last_pass_at {
    Some(last) if seconds_between(last, now) < window => DedupVerdict::Suppress,
    _ => DedupVerdict::Pass,
  }
}

/// Index of the epoch-aligned interval of `window_seconds` containing `at`.
pub fn window_index(at: DateTime<Utc>, window_seconds: u64) -> i64 {
  at.timestamp().div_euclid(window_seconds.max(1) as i64)
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
  (to - from).num_milliseconds() as f64 / 1000.0
}
