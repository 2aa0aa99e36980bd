//! Streaming counters, EWMA helper, and read-only stats snapshots.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Exponentially weighted moving average. Higher `alpha` = more reactive.
pub fn ewma(previous: f64, sample: f64, alpha: f64) -> f64 {
  alpha * sample + (1.0 - alpha) * previous
}

/// Mean of `sum` over `count`, `None` when nothing was counted.
pub fn mean(sum: f64, count: u64) -> Option<f64> {
  if count == 0 {
    None
  } else {
    Some(((sum / count as f64) * 100.0).round() / 100.0)
  }
}

// ---------------------------------------------------------------------------
// Per-config counters (mutated under the owning map's entry lock)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct DedupCounters {
  pub received: u64,
  pub deduplicated: u64,
  pub passed: u64,
}

impl DedupCounters {
  pub fn snapshot(&self, config_id: &str) -> DedupStats {
    let dedup_rate = if self.received == 0 {
      0.0
    } else {
      ((self.deduplicated as f64 / self.received as f64) * 1000.0).round() / 1000.0
    };
    DedupStats {
      config_id: config_id.to_string(),
      total_received: self.received,
      total_deduplicated: self.deduplicated,
      total_passed: self.passed,
      dedup_rate,
    }
  }
}

#[derive(Debug, Clone, Default)]
pub struct ThrottleCounters {
  pub received: u64,
  pub throttled: u64,
  pub passed: u64,
  pub rejected: u64,
  pub evicted: u64,
}

#[derive(Debug, Clone, Default)]
pub struct EscalationCounters {
  pub total: u64,
  pub acknowledged: u64,
  pub resolved: u64,
  pub cancelled: u64,
  pub timed_out: u64,
  pub failed: u64,
  pub ack_seconds_sum: f64,
  pub resolve_seconds_sum: f64,
}

// ---------------------------------------------------------------------------
// Engine-wide counters (lock-free)
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct EngineCounters {
  pub received: AtomicU64,
  pub invalid: AtomicU64,
  pub fingerprint_fallbacks: AtomicU64,
  pub dispatch_failures: AtomicU64,
  pub timers_fired: AtomicU64,
}

impl EngineCounters {
  pub fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  pub fn get(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
  }
}

// ---------------------------------------------------------------------------
// Snapshots (JSON contract)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DedupStats {
  pub config_id: String,
  pub total_received: u64,
  pub total_deduplicated: u64,
  pub total_passed: u64,
  pub dedup_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThrottleStats {
  pub config_id: String,
  pub total_received: u64,
  pub total_throttled: u64,
  pub total_passed: u64,
  pub total_rejected: u64,
  pub total_evicted: u64,
  pub current_window_count: u64,
  pub queued: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EscalationStats {
  pub policy_id: String,
  pub total_incidents: u64,
  pub active: u64,
  pub acknowledged: u64,
  pub resolved: u64,
  pub cancelled: u64,
  pub timed_out: u64,
  pub failed: u64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub avg_time_to_acknowledge_seconds: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub avg_time_to_resolve_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerStats {
  pub pending_timers: usize,
  pub overruns: u64,
  pub max_lag_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStats {
  pub config_version: u64,
  pub total_received: u64,
  pub total_invalid: u64,
  pub fingerprint_fallbacks: u64,
  pub dispatch_failures: u64,
  pub timers_fired: u64,
  pub scheduler: SchedulerStats,
  pub dedup: Vec<DedupStats>,
  pub throttle: Vec<ThrottleStats>,
  pub escalation: Vec<EscalationStats>,
}
