//! Rate limiting for events that passed dedup.
//!
//! One bucket per scope (a throttle config plus "global" or a channel name).
//! Each decision runs under the bucket's entry lock. Buckets live for the
//! life of the process and are reset only when their config is replaced.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use crate::config::{Selector, MAX_QUEUE_CAPACITY, MAX_WINDOW_SECONDS, MIN_RATE_PER_SECOND};
use crate::dedup::window_index;
use crate::error::EngineError;
use crate::scheduler::{Scheduler, TimerMessage};
use crate::stats::{ThrottleCounters, ThrottleStats};
use crate::types::{Fingerprint, NotificationEvent, ScopeKey};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ThrottleAlgorithm {
  TokenBucket { capacity: u32, refill_per_second: f64 },
  SlidingWindow { max_requests: u32, window_seconds: u64 },
  FixedWindow { max_requests: u32, window_seconds: u64 },
  LeakyBucket { capacity: u32, drain_per_second: f64 },
}

/// What happens to an event once the algorithm signals over-limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnThrottle {
  #[default]
  Drop,
  Queue,
  Delay,
  RaiseError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleScope {
  #[default]
  Global,
  PerChannel,
}

fn default_enabled() -> bool {
  true
}

fn default_queue_capacity() -> usize {
  100
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleConfig {
  pub id: String,
  #[serde(default = "default_enabled")]
  pub enabled: bool,
  #[serde(default)]
  pub selector: Selector,
  pub algorithm: ThrottleAlgorithm,
  #[serde(default)]
  pub on_throttle: OnThrottle,
  #[serde(default)]
  pub scope: ThrottleScope,
  /// Bound on queued (or pending delayed) events per scope.
  #[serde(default = "default_queue_capacity")]
  pub queue_capacity: usize,
}

impl ThrottleConfig {
  pub fn validate(&self) -> Result<(), EngineError> {
    if self.id.trim().is_empty() {
      return Err(EngineError::configuration("throttle", "id", "must not be empty"));
    }
    let (amount, field, rate) = match &self.algorithm {
      ThrottleAlgorithm::TokenBucket {
        capacity,
        refill_per_second,
      } => (*capacity as u64, "capacity", Some(("refill_per_second", *refill_per_second))),
      ThrottleAlgorithm::LeakyBucket {
        capacity,
        drain_per_second,
      } => (*capacity as u64, "capacity", Some(("drain_per_second", *drain_per_second))),
      ThrottleAlgorithm::SlidingWindow {
        max_requests,
        window_seconds,
      }
      | ThrottleAlgorithm::FixedWindow {
        max_requests,
        window_seconds,
      } => {
        if *window_seconds == 0 || *window_seconds > MAX_WINDOW_SECONDS {
          return Err(EngineError::configuration(
            &self.id,
            "window_seconds",
            "must be between 1 second and 30 days",
          ));
        }
        (*max_requests as u64, "max_requests", None)
      }
    };
    if amount == 0 {
      return Err(EngineError::configuration(&self.id, field, "must be > 0"));
    }
    if let Some((name, rate)) = rate {
      if !(rate >= MIN_RATE_PER_SECOND) || !rate.is_finite() {
        return Err(EngineError::configuration(
          &self.id,
          name,
          "must be a finite rate of at least one per 30 days",
        ));
      }
    }
    if self.queue_capacity == 0 && matches!(self.on_throttle, OnThrottle::Queue | OnThrottle::Delay) {
      return Err(EngineError::configuration(&self.id, "queue_capacity", "must be > 0"));
    }
    if self.queue_capacity > MAX_QUEUE_CAPACITY {
      return Err(EngineError::configuration(&self.id, "queue_capacity", "must be at most 100000"));
    }
    Ok(())
  }

  pub fn scope_key(&self, event: &NotificationEvent) -> ScopeKey {
    let scope = match self.scope {
      ThrottleScope::Global => "global".to_string(),
      ThrottleScope::PerChannel => event.channel.clone().unwrap_or_else(|| "default".to_string()),
    };
    ScopeKey {
      config_id: self.id.clone(),
      scope,
    }
  }

  fn is_leaky(&self) -> bool {
    matches!(self.algorithm, ThrottleAlgorithm::LeakyBucket { .. })
  }
}

/// An event held back by a throttle bucket, released later by the scheduler.
#[derive(Debug, Clone)]
pub struct PendingEvent {
  pub event: NotificationEvent,
  pub fingerprint: Fingerprint,
  pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ThrottleDecision {
  Pass,
  Queued,
  Delayed(DateTime<Utc>),
  Rejected,
}

// ---------------------------------------------------------------------------
// Limiter state per algorithm
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Limiter {
  /// `tokens` may go negative: each unit below zero is a delayed reservation.
  TokenBucket {
    capacity: f64,
    rate: f64,
    tokens: f64,
    last_refill: DateTime<Utc>,
  },
  /// Sorted hit times; entries after `now` are delayed reservations.
  /// The window is half-open: (now - window, now].
  SlidingWindow {
    max: u32,
    window: Duration,
    hits: VecDeque<DateTime<Utc>>,
  },
  /// Counts per epoch-aligned window index; future indexes are reservations.
  FixedWindow {
    max: u32,
    window_seconds: u64,
    counts: BTreeMap<i64, u32>,
  },
  /// Drains one slot every `interval`; `next_slot` is when the next one frees.
  LeakyBucket {
    interval: Duration,
    next_slot: DateTime<Utc>,
  },
}

impl Limiter {
  fn new(algorithm: &ThrottleAlgorithm, now: DateTime<Utc>) -> Self {
    match algorithm {
      ThrottleAlgorithm::TokenBucket {
        capacity,
        refill_per_second,
      } => Self::TokenBucket {
        capacity: *capacity as f64,
        rate: *refill_per_second,
        tokens: *capacity as f64,
        last_refill: now,
      },
      ThrottleAlgorithm::SlidingWindow {
        max_requests,
        window_seconds,
      } => Self::SlidingWindow {
        max: *max_requests,
        window: Duration::seconds(*window_seconds as i64),
        hits: VecDeque::new(),
      },
      ThrottleAlgorithm::FixedWindow {
        max_requests,
        window_seconds,
      } => Self::FixedWindow {
        max: *max_requests,
        window_seconds: *window_seconds,
        counts: BTreeMap::new(),
      },
      ThrottleAlgorithm::LeakyBucket { drain_per_second, .. } => Self::LeakyBucket {
        interval: seconds_f64(1.0 / drain_per_second),
        next_slot: now,
      },
    }
  }

  fn refresh(&mut self, now: DateTime<Utc>) {
    match self {
      Self::TokenBucket {
        capacity,
        rate,
        tokens,
        last_refill,
      } => {
        if now > *last_refill {
          let elapsed = (now - *last_refill).num_milliseconds() as f64 / 1000.0;
          *tokens = (*tokens + elapsed * *rate).min(*capacity);
          *last_refill = now;
        }
      }
      Self::SlidingWindow { window, hits, .. } => {
        let cutoff = now - *window;
        while hits.front().is_some_and(|&h| h <= cutoff) {
          hits.pop_front();
        }
      }
      Self::FixedWindow {
        window_seconds, counts, ..
      } => {
        let current = window_index(now, *window_seconds);
        counts.retain(|&idx, _| idx >= current);
      }
      Self::LeakyBucket { .. } => {}
    }
  }

  /// Take one unit of capacity now, if available.
  fn try_acquire(&mut self, now: DateTime<Utc>) -> bool {
    self.refresh(now);
    match self {
      Self::TokenBucket { tokens, .. } => {
        if *tokens >= 1.0 {
          *tokens -= 1.0;
          true
        } else {
          false
        }
      }
      Self::SlidingWindow { max, hits, .. } => {
        if hits.len() < *max as usize {
          let pos = hits.partition_point(|&h| h <= now);
          hits.insert(pos, now);
          true
        } else {
          false
        }
      }
      Self::FixedWindow {
        max,
        window_seconds,
        counts,
      } => {
        let count = counts.entry(window_index(now, *window_seconds)).or_insert(0);
        if *count < *max {
          *count += 1;
          true
        } else {
          false
        }
      }
      Self::LeakyBucket { interval, next_slot } => {
        if now >= *next_slot {
          *next_slot = now + *interval;
          true
        } else {
          false
        }
      }
    }
  }

  /// Reserve the earliest future unit of capacity and return when it is usable.
  fn reserve(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
    self.refresh(now);
    match self {
      Self::TokenBucket { rate, tokens, .. } => {
        *tokens -= 1.0;
        if *tokens >= 0.0 {
          now
        } else {
          now + seconds_f64(-*tokens / *rate)
        }
      }
      Self::SlidingWindow { max, window, hits } => {
        let max = *max as usize;
        let at = if hits.len() < max {
          now
        } else {
          hits[hits.len() - max] + *window
        };
        let pos = hits.partition_point(|&h| h <= at);
        hits.insert(pos, at);
        at
      }
      Self::FixedWindow {
        max,
        window_seconds,
        counts,
      } => {
        let mut idx = window_index(now, *window_seconds);
        loop {
          let count = counts.entry(idx).or_insert(0);
          if *count < *max {
            *count += 1;
            break;
          }
          idx += 1;
        }
        window_start(idx, *window_seconds).max(now)
      }
      Self::LeakyBucket { interval, next_slot } => {
        let at = (*next_slot).max(now);
        *next_slot = at + *interval;
        at
      }
    }
  }

  /// Earliest time one more unit of capacity will be free.
  fn next_available(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
    self.refresh(now);
    match self {
      Self::TokenBucket { rate, tokens, .. } => {
        if *tokens >= 1.0 {
          now
        } else {
          now + seconds_f64((1.0 - *tokens) / *rate)
        }
      }
      Self::SlidingWindow { max, window, hits } => {
        let max = *max as usize;
        if hits.len() < max {
          now
        } else {
          hits[hits.len() - max] + *window
        }
      }
      Self::FixedWindow {
        max,
        window_seconds,
        counts,
      } => {
        let mut idx = window_index(now, *window_seconds);
        while counts.get(&idx).is_some_and(|c| *c >= *max) {
          idx += 1;
        }
        window_start(idx, *window_seconds).max(now)
      }
      Self::LeakyBucket { next_slot, .. } => (*next_slot).max(now),
    }
  }

  /// Capacity used in the current window (consumed tokens for token bucket).
  fn window_count(&mut self, now: DateTime<Utc>) -> u64 {
    self.refresh(now);
    match self {
      Self::TokenBucket { capacity, tokens, .. } => (*capacity - tokens.floor()).max(0.0) as u64,
      Self::SlidingWindow { hits, .. } => hits.iter().filter(|&&h| h <= now).count() as u64,
      Self::FixedWindow {
        window_seconds, counts, ..
      } => counts.get(&window_index(now, *window_seconds)).copied().unwrap_or(0) as u64,
      Self::LeakyBucket { .. } => 0,
    }
  }
}

fn throttled(scope: &ScopeKey, now: DateTime<Utc>, retry_after: DateTime<Utc>) -> EngineError {
  let wait_ms = (retry_after - now).num_milliseconds().max(0) as u64;
  EngineError::Throttled {
    scope: scope.to_string(),
    retry_after,
    retry_after_seconds: wait_ms.div_ceil(1000).max(1),
  }
}

fn seconds_f64(secs: f64) -> Duration {
  Duration::milliseconds((secs * 1000.0).ceil() as i64)
}

fn window_start(idx: i64, window_seconds: u64) -> DateTime<Utc> {
  DateTime::from_timestamp(idx * window_seconds as i64, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Per-scope mutable record.
#[derive(Debug, Clone)]
pub struct ThrottleBucketState {
  limiter: Limiter,
  queue: VecDeque<PendingEvent>,
  pending_delayed: usize,
  flush_at: Option<DateTime<Utc>>,
  counters: ThrottleCounters,
}

impl ThrottleBucketState {
  fn new(config: &ThrottleConfig, now: DateTime<Utc>) -> Self {
    Self {
      limiter: Limiter::new(&config.algorithm, now),
      queue: VecDeque::new(),
      pending_delayed: 0,
      flush_at: None,
      counters: ThrottleCounters::default(),
    }
  }

  /// Arm a single flush timer for the next time capacity frees.
  fn ensure_flush(&mut self, scope: &ScopeKey, now: DateTime<Utc>, scheduler: &Scheduler) {
    if self.queue.is_empty() || self.flush_at.is_some() {
      return;
    }
    let at = self.limiter.next_available(now);
    scheduler.schedule(at, TimerMessage::FlushQueue { scope: scope.clone() });
    self.flush_at = Some(at);
  }
}

pub struct Throttler {
  buckets: DashMap<ScopeKey, ThrottleBucketState>,
}

impl Default for Throttler {
  fn default() -> Self {
    Self::new()
  }
}

impl Throttler {
  pub fn new() -> Self {
    Self {
      buckets: DashMap::new(),
    }
  }

  /// Decide PASS, QUEUED, DELAYED(at) or REJECTED for an event that passed dedup.
  ///
  /// Under `raise_error` an over-limit event is returned as `EngineError::Throttled`.
  pub fn evaluate(
    &self,
    config: &ThrottleConfig,
    pending: PendingEvent,
    now: DateTime<Utc>,
    scheduler: &Scheduler,
  ) -> Result<ThrottleDecision, EngineError> {
    let scope = config.scope_key(&pending.event);
    let mut bucket = self
      .buckets
      .entry(scope.clone())
      .or_insert_with(|| ThrottleBucketState::new(config, now));
    bucket.counters.received += 1;

    // Queued events go first; a new arrival never overtakes them.
    let queue_first = !bucket.queue.is_empty();
    if !queue_first && bucket.limiter.try_acquire(now) {
      bucket.counters.passed += 1;
      return Ok(ThrottleDecision::Pass);
    }

    let decision = if config.is_leaky() {
      let capacity = match config.algorithm {
        ThrottleAlgorithm::LeakyBucket { capacity, .. } => capacity as usize,
        _ => 0,
      };
      if bucket.queue.len() < capacity {
        bucket.queue.push_back(pending);
        bucket.ensure_flush(&scope, now, scheduler);
        ThrottleDecision::Queued
      } else if config.on_throttle == OnThrottle::RaiseError {
        bucket.counters.throttled += 1;
        return Err(throttled(&scope, now, bucket.limiter.next_available(now)));
      } else {
        ThrottleDecision::Rejected
      }
    } else {
      match config.on_throttle {
        OnThrottle::Drop => ThrottleDecision::Rejected,
        OnThrottle::Queue => {
          if bucket.queue.len() >= config.queue_capacity {
            if let Some(evicted) = bucket.queue.pop_front() {
              bucket.counters.evicted += 1;
              tracing::warn!(
                scope = %scope,
                fingerprint = %evicted.fingerprint,
                "throttle queue full, evicted oldest event"
              );
            }
          }
          bucket.queue.push_back(pending);
          bucket.ensure_flush(&scope, now, scheduler);
          ThrottleDecision::Queued
        }
        OnThrottle::Delay => {
          if bucket.pending_delayed >= config.queue_capacity {
            ThrottleDecision::Rejected
          } else {
            let at = bucket.limiter.reserve(now);
            bucket.pending_delayed += 1;
            scheduler.schedule(
              at,
              TimerMessage::ReleaseDelayed {
                scope: scope.clone(),
                event: Box::new(pending),
              },
            );
            ThrottleDecision::Delayed(at)
          }
        }
        OnThrottle::RaiseError => {
          bucket.counters.throttled += 1;
          return Err(throttled(&scope, now, bucket.limiter.next_available(now)));
        }
      }
    };

    bucket.counters.throttled += 1;
    if decision == ThrottleDecision::Rejected {
      bucket.counters.rejected += 1;
    }
    tracing::debug!(scope = %scope, decision = ?decision, "throttled event");
    Ok(decision)
  }

  /// Release queued events as capacity allows; re-arms itself while the queue is non-empty.
  pub fn flush(&self, scope: &ScopeKey, now: DateTime<Utc>, scheduler: &Scheduler) -> Vec<PendingEvent> {
    let mut released = Vec::new();
    let Some(mut bucket) = self.buckets.get_mut(scope) else {
      return released;
    };
    bucket.flush_at = None;
    while !bucket.queue.is_empty() && bucket.limiter.try_acquire(now) {
      if let Some(p) = bucket.queue.pop_front() {
        released.push(p);
      }
    }
    bucket.counters.passed += released.len() as u64;
    bucket.ensure_flush(scope, now, scheduler);
    released
  }

  /// Account for a delayed event reaching its release time.
  pub fn release_delayed(&self, scope: &ScopeKey) {
    if let Some(mut bucket) = self.buckets.get_mut(scope) {
      bucket.pending_delayed = bucket.pending_delayed.saturating_sub(1);
      bucket.counters.passed += 1;
    }
  }

  /// Drop all buckets of one config (reconfiguration).
  pub fn reset(&self, config_id: &str) {
    self.buckets.retain(|key, _| key.config_id != config_id);
  }

  pub fn stats(&self, config_id: &str, now: DateTime<Utc>) -> ThrottleStats {
    let mut stats = ThrottleStats {
      config_id: config_id.to_string(),
      total_received: 0,
      total_throttled: 0,
      total_passed: 0,
      total_rejected: 0,
      total_evicted: 0,
      current_window_count: 0,
      queued: 0,
    };
    for mut bucket in self.buckets.iter_mut().filter(|b| b.key().config_id == config_id) {
      let c = bucket.counters.clone();
      stats.total_received += c.received;
      stats.total_throttled += c.throttled;
      stats.total_passed += c.passed;
      stats.total_rejected += c.rejected;
      stats.total_evicted += c.evicted;
      stats.current_window_count += bucket.limiter.window_count(now);
      stats.queued += (bucket.queue.len() + bucket.pending_delayed) as u64;
    }
    stats
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::{EventStatus, Severity};
  use chrono::TimeZone;

  fn t(sec: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap() + Duration::seconds(sec)
  }

  fn config(algorithm: ThrottleAlgorithm, on_throttle: OnThrottle) -> ThrottleConfig {
    ThrottleConfig {
      id: "t1".into(),
      enabled: true,
      selector: Selector::default(),
      algorithm,
      on_throttle,
      scope: ThrottleScope::Global,
      queue_capacity: 2,
    }
  }

  fn pending(channel: Option<&str>) -> PendingEvent {
    PendingEvent {
      event: NotificationEvent {
        event_type: "anomaly".into(),
        source_id: "s1".into(),
        severity: Severity::High,
        issue_signature: vec![],
        occurred_at: t(0),
        payload: Default::default(),
        channel: channel.map(str::to_string),
        status: EventStatus::Firing,
      },
      fingerprint: Fingerprint("fp".into()),
      enqueued_at: t(0),
    }
  }

  fn run(th: &Throttler, c: &ThrottleConfig, s: &Scheduler, at: i64) -> ThrottleDecision {
    th.evaluate(c, pending(None), t(at), s).unwrap()
  }

  #[test]
  fn fixed_window_drops_over_limit() {
    let th = Throttler::new();
    let s = Scheduler::new(100);
    let c = config(
      ThrottleAlgorithm::FixedWindow {
        max_requests: 3,
        window_seconds: 60,
      },
      OnThrottle::Drop,
    );
    let decisions: Vec<_> = (0..5).map(|i| run(&th, &c, &s, i)).collect();
    assert_eq!(
      decisions,
      vec![
        ThrottleDecision::Pass,
        ThrottleDecision::Pass,
        ThrottleDecision::Pass,
        ThrottleDecision::Rejected,
        ThrottleDecision::Rejected,
      ]
    );
    // Next window starts fresh.
    assert_eq!(run(&th, &c, &s, 60), ThrottleDecision::Pass);
    let stats = th.stats("t1", t(60));
    assert_eq!(stats.total_rejected, 2);
    assert_eq!(stats.current_window_count, 1);
  }

  #[test]
  fn token_bucket_allows_burst_up_to_capacity_then_refills() {
    let th = Throttler::new();
    let s = Scheduler::new(100);
    let c = config(
      ThrottleAlgorithm::TokenBucket {
        capacity: 3,
        refill_per_second: 1.0,
      },
      OnThrottle::Drop,
    );
    for _ in 0..3 {
      assert_eq!(run(&th, &c, &s, 0), ThrottleDecision::Pass);
    }
    assert_eq!(run(&th, &c, &s, 0), ThrottleDecision::Rejected);
    assert_eq!(run(&th, &c, &s, 1), ThrottleDecision::Pass);
    assert_eq!(run(&th, &c, &s, 1), ThrottleDecision::Rejected);
  }

  #[test]
  fn sliding_window_counts_trailing_events() {
    let th = Throttler::new();
    let s = Scheduler::new(100);
    let c = config(
      ThrottleAlgorithm::SlidingWindow {
        max_requests: 2,
        window_seconds: 10,
      },
      OnThrottle::Drop,
    );
    assert_eq!(run(&th, &c, &s, 0), ThrottleDecision::Pass);
    assert_eq!(run(&th, &c, &s, 5), ThrottleDecision::Pass);
    assert_eq!(run(&th, &c, &s, 9), ThrottleDecision::Rejected);
    // Hit at t=0 leaves the window at t=10.
    assert_eq!(run(&th, &c, &s, 10), ThrottleDecision::Pass);
  }

  #[test]
  fn queue_policy_buffers_and_flushes_fifo() {
    let th = Throttler::new();
    let s = Scheduler::new(100);
    let c = config(
      ThrottleAlgorithm::TokenBucket {
        capacity: 1,
        refill_per_second: 1.0,
      },
      OnThrottle::Queue,
    );
    assert_eq!(run(&th, &c, &s, 0), ThrottleDecision::Pass);
    assert_eq!(run(&th, &c, &s, 0), ThrottleDecision::Queued);
    assert_eq!(run(&th, &c, &s, 0), ThrottleDecision::Queued);
    // Over queue_capacity (2): oldest evicted, still queued.
    assert_eq!(run(&th, &c, &s, 0), ThrottleDecision::Queued);
    assert_eq!(th.stats("t1", t(0)).total_evicted, 1);

    // Exactly one flush timer is armed.
    assert_eq!(s.len(), 1);
    let firing = s.pop_next(t(1)).unwrap();
    let TimerMessage::FlushQueue { scope } = firing.message else {
      panic!("expected flush");
    };
    assert_eq!(th.flush(&scope, t(1), &s).len(), 1);
    // One left; flush re-armed for the next token.
    assert_eq!(s.len(), 1);
    assert_eq!(th.flush(&scope, t(2), &s).len(), 1);
    assert!(s.is_empty());
  }

  #[test]
  fn delay_policy_reserves_future_slots() {
    let th = Throttler::new();
    let s = Scheduler::new(100);
    let c = config(
      ThrottleAlgorithm::FixedWindow {
        max_requests: 1,
        window_seconds: 60,
      },
      OnThrottle::Delay,
    );
    assert_eq!(run(&th, &c, &s, 0), ThrottleDecision::Pass);
    assert_eq!(run(&th, &c, &s, 1), ThrottleDecision::Delayed(t(60)));
    assert_eq!(run(&th, &c, &s, 2), ThrottleDecision::Delayed(t(120)));
    // queue_capacity bounds pending delayed events.
    assert_eq!(run(&th, &c, &s, 3), ThrottleDecision::Rejected);
    assert_eq!(s.len(), 2);
  }

  #[test]
  fn raise_error_surfaces_throttled() {
    let th = Throttler::new();
    let s = Scheduler::new(100);
    let c = config(
      ThrottleAlgorithm::FixedWindow {
        max_requests: 1,
        window_seconds: 60,
      },
      OnThrottle::RaiseError,
    );
    run(&th, &c, &s, 0);
    let err = th.evaluate(&c, pending(None), t(5), &s).unwrap_err();
    match err {
      EngineError::Throttled {
        retry_after,
        retry_after_seconds,
        ..
      } => {
        assert_eq!(retry_after, t(60));
        assert_eq!(retry_after_seconds, 55);
      }
      other => panic!("unexpected error {other}"),
    }
  }

  #[test]
  fn leaky_bucket_smooths_and_rejects_overflow() {
    let th = Throttler::new();
    let s = Scheduler::new(100);
    let c = config(
      ThrottleAlgorithm::LeakyBucket {
        capacity: 2,
        drain_per_second: 0.5,
      },
      OnThrottle::Drop,
    );
    assert_eq!(run(&th, &c, &s, 0), ThrottleDecision::Pass);
    assert_eq!(run(&th, &c, &s, 0), ThrottleDecision::Queued);
    assert_eq!(run(&th, &c, &s, 0), ThrottleDecision::Queued);
    assert_eq!(run(&th, &c, &s, 0), ThrottleDecision::Rejected);
    assert_eq!(s.next_due(), Some(t(2)));
  }

  #[test]
  fn per_channel_scopes_are_independent() {
    let th = Throttler::new();
    let s = Scheduler::new(100);
    let mut c = config(
      ThrottleAlgorithm::FixedWindow {
        max_requests: 1,
        window_seconds: 60,
      },
      OnThrottle::Drop,
    );
    c.scope = ThrottleScope::PerChannel;
    assert_eq!(th.evaluate(&c, pending(Some("slack")), t(0), &s).unwrap(), ThrottleDecision::Pass);
    assert_eq!(th.evaluate(&c, pending(Some("email")), t(0), &s).unwrap(), ThrottleDecision::Pass);
    assert_eq!(th.evaluate(&c, pending(Some("slack")), t(1), &s).unwrap(), ThrottleDecision::Rejected);
  }

  #[test]
  fn zero_capacity_is_rejected_by_validation() {
    let c = config(
      ThrottleAlgorithm::TokenBucket {
        capacity: 0,
        refill_per_second: 1.0,
      },
      OnThrottle::Drop,
    );
    assert!(c.validate().is_err());
  }

  #[test]
  fn windows_and_rates_that_overflow_timestamps_are_rejected() {
    let huge_window = config(
      ThrottleAlgorithm::SlidingWindow {
        max_requests: 1,
        window_seconds: 100_000_000_000_000_000,
      },
      OnThrottle::Drop,
    );
    assert!(huge_window.validate().is_err());

    let huge_fixed = config(
      ThrottleAlgorithm::FixedWindow {
        max_requests: 1,
        window_seconds: MAX_WINDOW_SECONDS + 1,
      },
      OnThrottle::Drop,
    );
    assert!(huge_fixed.validate().is_err());

    let trickle = config(
      ThrottleAlgorithm::TokenBucket {
        capacity: 1,
        refill_per_second: 1e-300,
      },
      OnThrottle::Delay,
    );
    assert!(trickle.validate().is_err());

    let slow_drain = config(
      ThrottleAlgorithm::LeakyBucket {
        capacity: 1,
        drain_per_second: 1e-12,
      },
      OnThrottle::Drop,
    );
    assert!(slow_drain.validate().is_err());

    let mut deep_queue = config(
      ThrottleAlgorithm::TokenBucket {
        capacity: 1,
        refill_per_second: 1.0,
      },
      OnThrottle::Queue,
    );
    deep_queue.queue_capacity = MAX_QUEUE_CAPACITY + 1;
    assert!(deep_queue.validate().is_err());
  }

  #[test]
  fn slowest_allowed_rate_still_schedules_within_range() {
    let th = Throttler::new();
    let s = Scheduler::new(100);
    let c = config(
      ThrottleAlgorithm::TokenBucket {
        capacity: 1,
        refill_per_second: MIN_RATE_PER_SECOND,
      },
      OnThrottle::Delay,
    );
    assert!(c.validate().is_ok());
    assert_eq!(th.evaluate(&c, pending(None), t(0), &s).unwrap(), ThrottleDecision::Pass);
    match th.evaluate(&c, pending(None), t(0), &s).unwrap() {
      ThrottleDecision::Delayed(at) => assert!(at > t(29 * 86_400)),
      other => panic!("expected delayed, got {:?}", other),
    }
  }
}
