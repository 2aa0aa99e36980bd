//! Escalation state machine.
//!
//! One slot per (fingerprint, policy) holds at most one open incident plus
//! the cooldown left by the last closed one. Every mutation happens under
//! that slot's map entry lock; timers carry the incident generation at
//! schedule time and are ignored once the incident has moved on.
//!
//! Lock order is slot, then index/archive/counters. Callers never hold an
//! index or archive guard while locking a slot.

mod incident;
mod policy;

pub use incident::{EscalationTrigger, HistoryKind, Incident, IncidentEvent, IncidentState, SYSTEM_ACTOR};
pub use policy::{EscalationLevel, EscalationPolicy, EscalationTriggers, Target, TargetKind};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::EngineConfig;
use crate::dispatch::DispatchRequest;
use crate::error::{DispatchError, EngineError};
use crate::scheduler::{Scheduler, TimerId, TimerMessage};
use crate::stats::{mean, EscalationCounters, EscalationStats};
use crate::types::{EventStatus, Fingerprint, IncidentId, NotificationEvent, SlotKey, TimerOutcome};

/// Everything an escalation step needs from the engine for one call.
pub struct EscalationCtx<'a> {
  pub config: &'a EngineConfig,
  pub scheduler: &'a Scheduler,
  pub now: DateTime<Utc>,
}

impl EscalationCtx<'_> {
  fn policy(&self, id: &str) -> Option<&EscalationPolicy> {
    self.config.policy(id)
  }
}

#[derive(Debug, Default)]
struct IncidentSlot {
  open: Option<Incident>,
  cooldown_until: Option<DateTime<Utc>>,
  cooldown_timer: Option<TimerId>,
  last_closed: Option<IncidentId>,
}

/// Result of feeding one passed event to the escalator.
#[derive(Debug, Default)]
pub struct Observation {
  /// Open incident the event belongs to, or the closed one whose cooldown absorbed it.
  pub incident_id: Option<IncidentId>,
  pub dispatches: Vec<DispatchRequest>,
}

/// Result of an operator action or dispatch failure report.
#[derive(Debug)]
pub struct Applied {
  pub incident: Incident,
  pub dispatches: Vec<DispatchRequest>,
}

/// Result of an escalation timer firing.
#[derive(Debug)]
pub struct Fired {
  pub outcome: TimerOutcome,
  pub dispatches: Vec<DispatchRequest>,
}

enum Next {
  Continue,
  Close(IncidentState),
}

#[derive(Debug, Default)]
pub struct Escalator {
  slots: DashMap<SlotKey, IncidentSlot>,
  index: DashMap<IncidentId, SlotKey>,
  archive: DashMap<IncidentId, Incident>,
  counters: DashMap<String, EscalationCounters>,
  seq: AtomicU64,
}

impl Escalator {
  pub fn new() -> Self {
    Self::default()
  }

  /// Feed a passed event matched to `policy`: open, update, or auto-resolve an incident.
  pub fn observe(
    &self,
    policy: &EscalationPolicy,
    event: &NotificationEvent,
    fingerprint: &Fingerprint,
    ctx: &EscalationCtx,
  ) -> Observation {
    let key = SlotKey {
      fingerprint: fingerprint.clone(),
      policy_id: policy.id.clone(),
    };

    if event.status == EventStatus::Resolved {
      return self.observe_cleared(&key, policy, ctx);
    }

    let mut slot = self.slots.entry(key.clone()).or_default();
    let slot = &mut *slot;

    if let Some(inc) = slot.open.as_mut() {
      let id = inc.id.clone();
      inc.occurrences += 1;
      inc.record(ctx.now, SYSTEM_ACTOR, HistoryKind::Recurrence { severity: event.severity });

      let upgraded = event.severity > inc.severity;
      if upgraded {
        inc.severity = event.severity;
      }

      let escalating = matches!(inc.state, IncidentState::Active | IncidentState::Escalating);
      let trigger = if !escalating {
        None
      } else if upgraded && policy.triggers.severity_upgrade {
        Some(EscalationTrigger::SeverityUpgrade)
      } else if policy.triggers.occurrence_threshold == Some(inc.occurrences) {
        Some(EscalationTrigger::ThresholdBreach)
      } else {
        None
      };

      let mut dispatches = Vec::new();
      if let Some(trigger) = trigger {
        tracing::info!(incident = %id, trigger = ?trigger, "escalating ahead of timer");
        let (request, next) = advance(inc, policy, trigger, SYSTEM_ACTOR, ctx);
        dispatches.extend(request);
        if let Next::Close(state) = next {
          self.close(&key, slot, state, SYSTEM_ACTOR, Some(policy), ctx);
        }
      }
      return Observation {
        incident_id: Some(id),
        dispatches,
      };
    }

    if slot.cooldown_until.is_some_and(|until| until > ctx.now) {
      let closed = slot.last_closed.clone();
      if let Some(id) = &closed {
        if let Some(mut archived) = self.archive.get_mut(id) {
          archived.record(ctx.now, SYSTEM_ACTOR, HistoryKind::CooldownSuppressed);
        }
      }
      tracing::debug!(fingerprint = %key.fingerprint, policy = %key.policy_id, "event absorbed by cooldown");
      return Observation {
        incident_id: closed,
        dispatches: Vec::new(),
      };
    }

    let id = self.next_id(&key, ctx.now);
    let mut inc = Incident::open(id.clone(), fingerprint.clone(), &policy.id, event.severity, ctx.now);
    inc.transition(IncidentState::Active, ctx.now, SYSTEM_ACTOR, None);
    arm(&mut inc, policy.level(0).delay_minutes, ctx);

    self.counters.entry(policy.id.clone()).or_default().total += 1;
    self.index.insert(id.clone(), key.clone());
    slot.open = Some(inc);
    tracing::info!(incident = %id, fingerprint = %fingerprint, policy = %policy.id, "incident opened");

    Observation {
      incident_id: Some(id),
      dispatches: Vec::new(),
    }
  }

  fn observe_cleared(&self, key: &SlotKey, policy: &EscalationPolicy, ctx: &EscalationCtx) -> Observation {
    let Some(mut slot) = self.slots.get_mut(key) else {
      return Observation::default();
    };
    let slot = &mut *slot;
    let Some(id) = slot.open.as_ref().map(|inc| inc.id.clone()) else {
      return Observation::default();
    };
    if policy.auto_resolve {
      tracing::info!(incident = %id, "condition cleared, auto-resolving");
      self.close(key, slot, IncidentState::Resolved, SYSTEM_ACTOR, Some(policy), ctx);
    }
    Observation {
      incident_id: Some(id),
      dispatches: Vec::new(),
    }
  }

  /// Handle an `Escalate` timer. Stale generations change nothing.
  pub fn on_timer(&self, incident_id: &IncidentId, generation: u64, ctx: &EscalationCtx) -> Fired {
    let stale = || Fired {
      outcome: TimerOutcome::Stale {
        incident_id: incident_id.clone(),
      },
      dispatches: Vec::new(),
    };

    let Some(key) = self.locate(incident_id) else {
      return stale();
    };
    let Some(mut slot) = self.slots.get_mut(&key) else {
      return stale();
    };
    let slot = &mut *slot;
    let Some(inc) = slot.open.as_mut() else {
      return stale();
    };
    if inc.id != *incident_id || inc.generation != generation {
      return stale();
    }
    inc.timer = None;

    let Some(policy) = ctx.policy(&key.policy_id) else {
      tracing::warn!(incident = %incident_id, policy = %key.policy_id, "policy removed, cancelling incident");
      self.close(&key, slot, IncidentState::Cancelled, SYSTEM_ACTOR, None, ctx);
      return Fired {
        outcome: self.escalated_outcome(incident_id, slot, 0),
        dispatches: Vec::new(),
      };
    };

    if policy.business_hours_only && !ctx.config.business_hours.is_open(ctx.now) {
      let until = ctx.config.business_hours.next_open(ctx.now);
      inc.next_escalation_at = Some(until);
      inc.timer = Some(ctx.scheduler.schedule(
        until,
        TimerMessage::Escalate {
          incident_id: incident_id.clone(),
          generation,
        },
      ));
      tracing::debug!(incident = %incident_id, until = %until, "escalation deferred to business hours");
      return Fired {
        outcome: TimerOutcome::Deferred {
          incident_id: incident_id.clone(),
          until,
        },
        dispatches: Vec::new(),
      };
    }

    let trigger = match inc.state {
      IncidentState::Acknowledged => EscalationTrigger::Unresolved,
      IncidentState::Active | IncidentState::Escalating => EscalationTrigger::Unacknowledged,
      _ => return stale(),
    };
    let level = inc.current_level_index.min(policy.levels.len() - 1);
    let (request, next) = advance(inc, policy, trigger, SYSTEM_ACTOR, ctx);
    if let Next::Close(state) = next {
      self.close(&key, slot, state, SYSTEM_ACTOR, Some(policy), ctx);
    }
    Fired {
      outcome: self.escalated_outcome(incident_id, slot, level),
      dispatches: request.into_iter().collect(),
    }
  }

  fn escalated_outcome(&self, incident_id: &IncidentId, slot: &IncidentSlot, level: usize) -> TimerOutcome {
    let state = match &slot.open {
      Some(inc) if inc.id == *incident_id => inc.state,
      _ => self
        .archive
        .get(incident_id)
        .map(|inc| inc.value().state)
        .unwrap_or(IncidentState::Cancelled),
    };
    TimerOutcome::Escalated {
      incident_id: incident_id.clone(),
      state,
      level,
    }
  }

  pub fn acknowledge(&self, incident_id: &IncidentId, actor: &str, ctx: &EscalationCtx) -> Result<Applied, EngineError> {
    self.apply(incident_id, ctx, |_, _, slot, policy| {
      let Some(inc) = slot.open.as_mut() else {
        return Vec::new();
      };
      if inc.state == IncidentState::Acknowledged {
        return Vec::new();
      }
      if let Some(timer) = inc.timer.take() {
        ctx.scheduler.cancel(timer);
      }
      inc.next_escalation_at = None;
      inc.transition(IncidentState::Acknowledged, ctx.now, actor, None);

      // Re-acknowledging after a re-escalation keeps the first ack time and
      // counts the incident once.
      if inc.acknowledged_at.is_none() {
        inc.acknowledged_at = Some(ctx.now);
        inc.acknowledged_by = Some(actor.to_string());
        let mut c = self.counters.entry(inc.policy_id.clone()).or_default();
        c.acknowledged += 1;
        c.ack_seconds_sum += seconds(ctx.now - inc.created_at);
      }
      if let Some(minutes) = policy.and_then(|p| p.triggers.unresolved_reescalate_minutes) {
        arm(inc, minutes, ctx);
      }
      tracing::info!(incident = %inc.id, actor, "incident acknowledged");
      Vec::new()
    })
  }

  pub fn resolve(&self, incident_id: &IncidentId, actor: &str, ctx: &EscalationCtx) -> Result<Applied, EngineError> {
    self.apply(incident_id, ctx, |this, key, slot, policy| {
      this.close(key, slot, IncidentState::Resolved, actor, policy, ctx);
      Vec::new()
    })
  }

  pub fn cancel(&self, incident_id: &IncidentId, actor: &str, ctx: &EscalationCtx) -> Result<Applied, EngineError> {
    self.apply(incident_id, ctx, |this, key, slot, policy| {
      this.close(key, slot, IncidentState::Cancelled, actor, policy, ctx);
      Vec::new()
    })
  }

  /// Operator-forced escalation to the next level.
  pub fn escalate(&self, incident_id: &IncidentId, actor: &str, ctx: &EscalationCtx) -> Result<Applied, EngineError> {
    self.apply(incident_id, ctx, |this, key, slot, policy| {
      let (Some(inc), Some(policy)) = (slot.open.as_mut(), policy) else {
        return Vec::new();
      };
      let (request, next) = advance(inc, policy, EscalationTrigger::Manual, actor, ctx);
      if let Next::Close(state) = next {
        this.close(key, slot, state, SYSTEM_ACTOR, Some(policy), ctx);
      }
      request.into_iter().collect()
    })
  }

  /// Record a failed hand-off. Past the policy's failure threshold the
  /// incident escalates, or fails if no level is left.
  pub fn record_dispatch_failure(
    &self,
    incident_id: &IncidentId,
    level: usize,
    error: &DispatchError,
    ctx: &EscalationCtx,
  ) -> Result<Applied, EngineError> {
    let failed = HistoryKind::DispatchFailed {
      level,
      target: error.target.clone(),
      error: error.reason.clone(),
    };

    if self.locate(incident_id).is_none() {
      let Some(mut archived) = self.archive.get_mut(incident_id) else {
        return Err(EngineError::NotFound(incident_id.to_string()));
      };
      archived.record(ctx.now, SYSTEM_ACTOR, failed);
      return Ok(Applied {
        incident: archived.value().clone(),
        dispatches: Vec::new(),
      });
    }

    self.apply(incident_id, ctx, |this, key, slot, policy| {
      let Some(inc) = slot.open.as_mut() else {
        return Vec::new();
      };
      inc.record(ctx.now, SYSTEM_ACTOR, failed);
      inc.dispatch_failures += 1;

      let Some(policy) = policy else {
        return Vec::new();
      };
      let Some(threshold) = policy.triggers.repeated_failure_threshold else {
        return Vec::new();
      };
      if inc.dispatch_failures < threshold {
        return Vec::new();
      }
      inc.dispatch_failures = 0;

      if inc.current_level_index >= policy.levels.len() {
        tracing::warn!(incident = %inc.id, "dispatch keeps failing with no level left");
        this.close(key, slot, IncidentState::Failed, SYSTEM_ACTOR, Some(policy), ctx);
        return Vec::new();
      }
      let (request, next) = advance(inc, policy, EscalationTrigger::RepeatedFailure, SYSTEM_ACTOR, ctx);
      if let Next::Close(state) = next {
        this.close(key, slot, state, SYSTEM_ACTOR, Some(policy), ctx);
      }
      request.into_iter().collect()
    })
  }

  /// Lift a slot's cooldown once its timer is due. `None` if the cooldown was
  /// replaced by a later close or the slot is gone.
  pub fn on_cooldown_expired(&self, key: &SlotKey, now: DateTime<Utc>) -> Option<TimerOutcome> {
    let mut slot = self.slots.get_mut(key)?;
    match slot.cooldown_until {
      Some(until) if until <= now => {
        slot.cooldown_until = None;
        slot.cooldown_timer = None;
        Some(TimerOutcome::CooldownExpired {
          fingerprint: key.fingerprint.clone(),
          policy_id: key.policy_id.clone(),
        })
      }
      _ => None,
    }
  }

  /// Drop archived incidents past retention and slots with nothing left to
  /// track. A slot stays until its cooldown timer has fired.
  pub fn sweep(&self, now: DateTime<Utc>, retention: Duration) -> usize {
    let before = self.archive.len();
    self
      .archive
      .retain(|_, inc| inc.closed_at.map_or(true, |closed| closed + retention > now));
    let removed = before.saturating_sub(self.archive.len());
    self
      .slots
      .retain(|_, slot| slot.open.is_some() || slot.cooldown_until.is_some());
    removed
  }

  pub fn incident(&self, incident_id: &IncidentId) -> Option<Incident> {
    if let Some(key) = self.locate(incident_id) {
      if let Some(slot) = self.slots.get(&key) {
        if let Some(inc) = slot.open.as_ref().filter(|inc| inc.id == *incident_id) {
          return Some(inc.clone());
        }
      }
    }
    self.archive.get(incident_id).map(|inc| inc.value().clone())
  }

  /// Open incidents, oldest first.
  pub fn open_incidents(&self) -> Vec<Incident> {
    let mut open: Vec<Incident> = self.slots.iter().filter_map(|slot| slot.open.clone()).collect();
    open.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    open
  }

  pub fn slot_key(&self, incident_id: &IncidentId) -> Option<SlotKey> {
    self.locate(incident_id)
  }

  pub fn stats(&self, policy_id: &str) -> EscalationStats {
    let counters = self
      .counters
      .get(policy_id)
      .map(|c| c.value().clone())
      .unwrap_or_default();
    let active = self
      .slots
      .iter()
      .filter(|slot| {
        slot
          .open
          .as_ref()
          .is_some_and(|inc| inc.policy_id == policy_id && inc.state != IncidentState::Acknowledged)
      })
      .count() as u64;

    EscalationStats {
      policy_id: policy_id.to_string(),
      total_incidents: counters.total,
      active,
      acknowledged: counters.acknowledged,
      resolved: counters.resolved,
      cancelled: counters.cancelled,
      timed_out: counters.timed_out,
      failed: counters.failed,
      avg_time_to_acknowledge_seconds: mean(counters.ack_seconds_sum, counters.acknowledged),
      avg_time_to_resolve_seconds: mean(counters.resolve_seconds_sum, counters.resolved),
    }
  }

  fn locate(&self, incident_id: &IncidentId) -> Option<SlotKey> {
    self.index.get(incident_id).map(|key| key.value().clone())
  }

  /// Run `f` on the slot owning an open incident, then snapshot it. Closed
  /// incidents are returned unchanged so operator actions stay idempotent.
  fn apply<F>(&self, incident_id: &IncidentId, ctx: &EscalationCtx, f: F) -> Result<Applied, EngineError>
  where
    F: FnOnce(&Self, &SlotKey, &mut IncidentSlot, Option<&EscalationPolicy>) -> Vec<DispatchRequest>,
  {
    if let Some(key) = self.locate(incident_id) {
      if let Some(mut slot) = self.slots.get_mut(&key) {
        let slot = &mut *slot;
        if slot.open.as_ref().is_some_and(|inc| inc.id == *incident_id) {
          let dispatches = f(self, &key, slot, ctx.policy(&key.policy_id));
          let incident = match &slot.open {
            Some(inc) if inc.id == *incident_id => Some(inc.clone()),
            _ => self.archive.get(incident_id).map(|inc| inc.value().clone()),
          };
          if let Some(incident) = incident {
            return Ok(Applied { incident, dispatches });
          }
        }
      }
    }

    match self.archive.get(incident_id) {
      Some(inc) => Ok(Applied {
        incident: inc.value().clone(),
        dispatches: Vec::new(),
      }),
      None => Err(EngineError::NotFound(incident_id.to_string())),
    }
  }

  /// Close the slot's open incident, archive it, and start the cooldown.
  fn close(
    &self,
    key: &SlotKey,
    slot: &mut IncidentSlot,
    to: IncidentState,
    actor: &str,
    policy: Option<&EscalationPolicy>,
    ctx: &EscalationCtx,
  ) {
    let Some(mut inc) = slot.open.take() else {
      return;
    };
    if let Some(timer) = inc.timer.take() {
      ctx.scheduler.cancel(timer);
    }
    if to == IncidentState::Resolved {
      inc.resolved_at = Some(ctx.now);
      inc.resolved_by = Some(actor.to_string());
    }
    inc.transition(to, ctx.now, actor, None);

    {
      let mut c = self.counters.entry(key.policy_id.clone()).or_default();
      match to {
        IncidentState::Resolved => {
          c.resolved += 1;
          c.resolve_seconds_sum += seconds(ctx.now - inc.created_at);
        }
        IncidentState::Cancelled => c.cancelled += 1,
        IncidentState::TimedOut => c.timed_out += 1,
        IncidentState::Failed => c.failed += 1,
        _ => {}
      }
    }

    let cooldown = policy.map_or(0, |p| p.cooldown_minutes);
    if cooldown > 0 {
      if let Some(timer) = slot.cooldown_timer.take() {
        ctx.scheduler.cancel(timer);
      }
      let until = ctx.now + Duration::minutes(i64::from(cooldown));
      slot.cooldown_until = Some(until);
      slot.cooldown_timer = Some(
        ctx
          .scheduler
          .schedule(until, TimerMessage::CooldownExpired { slot: key.clone() }),
      );
    }

    tracing::info!(incident = %inc.id, state = ?to, actor, "incident closed");
    slot.last_closed = Some(inc.id.clone());
    self.index.remove(&inc.id);
    self.archive.insert(inc.id.clone(), inc);
  }

  fn next_id(&self, key: &SlotKey, at: DateTime<Utc>) -> IncidentId {
    let seq = self.seq.fetch_add(1, Ordering::Relaxed);
    let mut hasher = blake3::Hasher::new();
    hasher.update(key.fingerprint.0.as_bytes());
    hasher.update(b"|");
    hasher.update(key.policy_id.as_bytes());
    hasher.update(b"|");
    hasher.update(at.to_rfc3339().as_bytes());
    hasher.update(b"|");
    hasher.update(seq.to_string().as_bytes());
    let hex = hasher.finalize().to_hex();
    IncidentId(format!("inc-{}", &hex[..16]))
  }
}

/// Dispatch the current level and move the incident along its ladder.
///
/// Only the last level repeats. `max_escalations` caps total firings; once
/// it is reached, or the ladder and its repeats run out, the incident closes.
fn advance(
  inc: &mut Incident,
  policy: &EscalationPolicy,
  trigger: EscalationTrigger,
  actor: &str,
  ctx: &EscalationCtx,
) -> (Option<DispatchRequest>, Next) {
  let last = policy.levels.len() - 1;
  let past_end = inc.current_level_index > last;
  if past_end && trigger != EscalationTrigger::Manual {
    if inc.repeats_done >= policy.levels[last].repeat_count {
      return (None, Next::Close(exhausted_state(policy)));
    }
    inc.repeats_done += 1;
  }

  let level = inc.current_level_index.min(last);
  if let Some(timer) = inc.timer.take() {
    ctx.scheduler.cancel(timer);
  }
  inc.transition(IncidentState::Escalating, ctx.now, actor, Some(trigger));

  let targets = policy.levels[level].targets.clone();
  inc.record(
    ctx.now,
    actor,
    HistoryKind::Dispatched {
      level,
      targets: targets.clone(),
    },
  );
  inc.escalation_count += 1;
  if !past_end {
    inc.current_level_index += 1;
  }

  let request = DispatchRequest {
    incident_id: inc.id.clone(),
    fingerprint: inc.fingerprint.clone(),
    policy_id: inc.policy_id.clone(),
    level,
    targets,
    trigger,
    severity: inc.severity,
    escalation_count: inc.escalation_count,
    at: ctx.now,
  };

  let next = if inc.escalation_count >= policy.max_escalations {
    Next::Close(exhausted_state(policy))
  } else if inc.current_level_index <= last {
    arm(inc, policy.levels[inc.current_level_index].delay_minutes, ctx);
    Next::Continue
  } else if inc.repeats_done < policy.levels[last].repeat_count {
    arm(inc, policy.levels[last].delay_minutes, ctx);
    Next::Continue
  } else {
    Next::Close(exhausted_state(policy))
  };
  (Some(request), next)
}

fn exhausted_state(policy: &EscalationPolicy) -> IncidentState {
  if policy.require_ack {
    IncidentState::TimedOut
  } else {
    IncidentState::Resolved
  }
}

/// Schedule the next escalation `delay_minutes` from now, replacing any pending one.
fn arm(inc: &mut Incident, delay_minutes: u32, ctx: &EscalationCtx) {
  if let Some(timer) = inc.timer.take() {
    ctx.scheduler.cancel(timer);
  }
  let due = ctx.now + Duration::minutes(i64::from(delay_minutes));
  inc.next_escalation_at = Some(due);
  inc.timer = Some(ctx.scheduler.schedule(
    due,
    TimerMessage::Escalate {
      incident_id: inc.id.clone(),
      generation: inc.generation,
    },
  ));
}

fn seconds(d: Duration) -> f64 {
  d.num_milliseconds() as f64 / 1000.0
}
