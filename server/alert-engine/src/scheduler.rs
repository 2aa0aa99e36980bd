//! Process-wide timer queue.
//!
//! Timers are messages keyed by incident, slot, or bucket id. Firing never
//! mutates state directly: the engine pops due messages in (due time, id)
//! order and hands each to the component that owns the key, which checks
//! the captured generation before acting. Cancellation is best-effort.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::stats::SchedulerStats;
use crate::throttle::PendingEvent;
use crate::types::{IncidentId, ScopeKey, SlotKey};

pub type TimerId = u64;

#[derive(Debug, Clone)]
pub enum TimerMessage {
  /// Advance an incident's escalation unless it moved past `generation`.
  Escalate { incident_id: IncidentId, generation: u64 },
  /// A closed incident's cooldown ended; the slot may open a new incident.
  CooldownExpired { slot: SlotKey },
  /// Drain queued events from a throttle bucket as capacity frees.
  FlushQueue { scope: ScopeKey },
  /// Release one event deferred by the `delay` throttle policy.
  ReleaseDelayed { scope: ScopeKey, event: Box<PendingEvent> },
  /// Evict idle dedup windows and expired archived incidents.
  Sweep,
}

#[derive(Debug, Clone)]
pub struct Firing {
  pub id: TimerId,
  pub due_at: DateTime<Utc>,
  pub message: TimerMessage,
}

#[derive(Debug, Default)]
struct Queue {
  by_due: BTreeMap<(DateTime<Utc>, TimerId), TimerMessage>,
  due_of: HashMap<TimerId, DateTime<Utc>>,
}

#[derive(Debug)]
pub struct Scheduler {
  queue: Mutex<Queue>,
  next_id: AtomicU64,
  backlog_threshold: usize,
  overruns: AtomicU64,
  max_lag_ms: AtomicU64,
}

impl Scheduler {
  pub fn new(backlog_threshold: usize) -> Self {
    Self {
      queue: Mutex::new(Queue::default()),
      next_id: AtomicU64::new(1),
      backlog_threshold,
      overruns: AtomicU64::new(0),
      max_lag_ms: AtomicU64::new(0),
    }
  }

  pub fn schedule(&self, at: DateTime<Utc>, message: TimerMessage) -> TimerId {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let mut q = self.queue.lock();
    q.by_due.insert((at, id), message);
    q.due_of.insert(id, at);
    id
  }

  /// Remove a pending timer. Returns false if it already fired or never existed.
  pub fn cancel(&self, id: TimerId) -> bool {
    let mut q = self.queue.lock();
    match q.due_of.remove(&id) {
      Some(at) => q.by_due.remove(&(at, id)).is_some(),
      None => false,
    }
  }

  /// Pop the earliest timer due at or before `now`. Timers scheduled by a
  /// firing become visible to the next call, so chains drain in order.
  pub fn pop_next(&self, now: DateTime<Utc>) -> Option<Firing> {
    let mut q = self.queue.lock();
    let entry = q.by_due.first_entry()?;
    let (at, id) = *entry.key();
    if at > now {
      return None;
    }
    let message = entry.remove();
    q.due_of.remove(&id);
    drop(q);

    let lag_ms = (now - at).num_milliseconds().max(0) as u64;
    self.max_lag_ms.fetch_max(lag_ms, Ordering::Relaxed);
    Some(Firing {
      id,
      due_at: at,
      message,
    })
  }

  /// Record how many firings one clock reading drained. Above the backlog
  /// threshold it counts as an overrun; nothing is ever dropped.
  pub fn record_batch(&self, fired: usize) {
    if fired > self.backlog_threshold {
      self.overruns.fetch_add(1, Ordering::Relaxed);
      tracing::warn!(
        due = fired,
        threshold = self.backlog_threshold,
        "scheduler overrun: timer backlog exceeds threshold"
      );
    }
  }

  pub fn next_due(&self) -> Option<DateTime<Utc>> {
    self.queue.lock().by_due.keys().next().map(|(at, _)| *at)
  }

  pub fn len(&self) -> usize {
    self.queue.lock().by_due.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn stats(&self) -> SchedulerStats {
    SchedulerStats {
      pending_timers: self.len(),
      overruns: self.overruns.load(Ordering::Relaxed),
      max_lag_seconds: self.max_lag_ms.load(Ordering::Relaxed) as f64 / 1000.0,
    }
  }
}
