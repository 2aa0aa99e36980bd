//! Core engine: composes the pipeline and routes timer firings.
//!
//! Fingerprint -> Deduplicate -> Throttle -> Escalate. Every call takes one
//! snapshot of the configuration and one reading of the clock, so a
//! decision never mixes two config versions or two instants.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigKind, EngineConfig};
use crate::dedup::{DedupConfig, DedupVerdict, Deduplicator};
use crate::dispatch::{DispatchRequest, NoopDispatcher, TargetDispatcher};
use crate::error::{DispatchError, EngineError};
use crate::escalation::{EscalationCtx, EscalationPolicy, Escalator, Incident};
use crate::fingerprint::{self, FingerprintPolicy};
use crate::normalize;
use crate::scheduler::{Firing, Scheduler, TimerMessage};
use crate::stats::{EngineCounters, EngineStats};
use crate::throttle::{PendingEvent, ThrottleConfig, ThrottleDecision, Throttler};
use crate::types::*;

/// The decision engine. Shared by reference across workers; all state is
/// behind sharded per-key locks.
pub struct Engine {
  config: RwLock<Arc<EngineConfig>>,
  version: AtomicU64,
  clock: Arc<dyn Clock>,
  scheduler: Scheduler,
  dedup: Deduplicator,
  throttle: Throttler,
  escalator: Escalator,
  dispatcher: Arc<dyn TargetDispatcher>,
  counters: EngineCounters,
}

impl Engine {
  pub fn new(
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    dispatcher: Arc<dyn TargetDispatcher>,
  ) -> Result<Self, EngineError> {
    config.validate()?;
    Ok(Self::build(config, clock, dispatcher))
  }

  /// No configs, wall clock, and a dispatcher that drops everything.
  pub fn with_defaults() -> Self {
    Self::build(EngineConfig::default(), Arc::new(SystemClock), Arc::new(NoopDispatcher))
  }

  fn build(config: EngineConfig, clock: Arc<dyn Clock>, dispatcher: Arc<dyn TargetDispatcher>) -> Self {
    let scheduler = Scheduler::new(config.runtime.scheduler_backlog_threshold);
    let sweep_at = clock.now() + Duration::seconds(config.runtime.sweep_interval_seconds as i64);
    scheduler.schedule(sweep_at, TimerMessage::Sweep);
    Self {
      dedup: Deduplicator::new(config.runtime.adaptive_alpha),
      config: RwLock::new(Arc::new(config)),
      version: AtomicU64::new(1),
      clock,
      scheduler,
      throttle: Throttler::new(),
      escalator: Escalator::new(),
      dispatcher,
      counters: EngineCounters::default(),
    }
  }

  pub fn config(&self) -> Arc<EngineConfig> {
    Arc::clone(&self.config.read())
  }

  pub fn config_version(&self) -> u64 {
    self.version.load(Ordering::Relaxed)
  }

  pub fn now(&self) -> DateTime<Utc> {
    self.clock.now()
  }

  // -------------------------------------------------------------------------
  // Pipeline
  // -------------------------------------------------------------------------

  /// Validate and decide one inbound event.
  pub fn ingest(&self, raw: &InboundEvent) -> Result<Decision, EngineError> {
    EngineCounters::incr(&self.counters.received);
    let event = match normalize::normalize(raw) {
      Ok(event) => event,
      Err(e) => {
        EngineCounters::incr(&self.counters.invalid);
        return Err(e);
      }
    };
    self.decide(event)
  }

  /// Decide an already-normalized event.
  pub fn ingest_event(&self, event: NotificationEvent) -> Result<Decision, EngineError> {
    EngineCounters::incr(&self.counters.received);
    self.decide(event)
  }

  fn decide(&self, event: NotificationEvent) -> Result<Decision, EngineError> {
    let config = self.config();
    let now = self.clock.now();
    let dedup = config.dedup_for(&event);
    let fingerprint = self.fingerprint(&event, dedup);

    if event.status == EventStatus::Resolved {
      let incident_id = self.escalate(&config, &event, &fingerprint, now);
      return Ok(Decision::suppressed(fingerprint, SuppressReason::ConditionCleared).with_incident(incident_id));
    }

    if let Some(dedup) = dedup {
      if self.dedup.evaluate(dedup, &fingerprint, now) == DedupVerdict::Suppress {
        return Ok(Decision::suppressed(fingerprint, SuppressReason::Duplicate));
      }
    }

    if let Some(throttle) = config.throttle_for(&event) {
      let pending = PendingEvent {
        event: event.clone(),
        fingerprint: fingerprint.clone(),
        enqueued_at: now,
      };
      match self.throttle.evaluate(throttle, pending, now, &self.scheduler)? {
        ThrottleDecision::Pass => {}
        ThrottleDecision::Queued => {
          return Ok(Decision::throttled(fingerprint, ThrottleReason::Queued));
        }
        ThrottleDecision::Delayed(at) => {
          let mut decision = Decision::throttled(fingerprint, ThrottleReason::Delayed);
          decision.delayed_until = Some(at);
          return Ok(decision);
        }
        ThrottleDecision::Rejected => {
          return Ok(Decision::throttled(fingerprint, ThrottleReason::Rejected));
        }
      }
    }

    let incident_id = self.escalate(&config, &event, &fingerprint, now);
    Ok(Decision::passed(fingerprint).with_incident(incident_id))
  }

  fn fingerprint(&self, event: &NotificationEvent, dedup: Option<&DedupConfig>) -> Fingerprint {
    let (fp, fallback) = match dedup {
      Some(c) => fingerprint::compute_or_fallback(event, &c.policy),
      None => fingerprint::compute_or_fallback(event, &FingerprintPolicy::Basic),
    };
    if fallback.is_some() {
      EngineCounters::incr(&self.counters.fingerprint_fallbacks);
    }
    fp
  }

  fn escalate(
    &self,
    config: &EngineConfig,
    event: &NotificationEvent,
    fingerprint: &Fingerprint,
    now: DateTime<Utc>,
  ) -> Option<IncidentId> {
    let policy = config.policy_for(event)?;
    let ctx = self.ctx(config, now);
    let observed = self.escalator.observe(policy, event, fingerprint, &ctx);
    self.dispatch_all(config, now, observed.dispatches);
    observed.incident_id
  }

  fn ctx<'a>(&'a self, config: &'a EngineConfig, now: DateTime<Utc>) -> EscalationCtx<'a> {
    EscalationCtx {
      config,
      scheduler: &self.scheduler,
      now,
    }
  }

  /// Hand requests to the dispatcher. A failure is recorded on the incident,
  /// which may escalate further; those follow-ups are dispatched in turn.
  fn dispatch_all(&self, config: &EngineConfig, now: DateTime<Utc>, requests: Vec<DispatchRequest>) {
    let mut pending: VecDeque<DispatchRequest> = requests.into();
    while let Some(request) = pending.pop_front() {
      let Err(error) = self.dispatcher.dispatch(&request) else {
        continue;
      };
      EngineCounters::incr(&self.counters.dispatch_failures);
      tracing::warn!(incident = %request.incident_id, level = request.level, error = %error, "dispatch failed");
      let ctx = self.ctx(config, now);
      match self
        .escalator
        .record_dispatch_failure(&request.incident_id, request.level, &error, &ctx)
      {
        Ok(applied) => pending.extend(applied.dispatches),
        Err(e) => tracing::warn!(incident = %request.incident_id, error = %e, "could not record dispatch failure"),
      }
    }
  }

  // -------------------------------------------------------------------------
  // Timers
  // -------------------------------------------------------------------------

  /// Process every timer due at the current clock reading, earliest first.
  ///
  /// Each firing runs at its own due time, so a chain of timers that all
  /// fall due before this reading (an escalation level arming the next)
  /// plays out on the same timeline it would have under a steady ticker.
  pub fn run_due(&self) -> Vec<TimerOutcome> {
    let reading = self.clock.now();
    let mut outcomes = Vec::new();
    let mut fired = 0;
    while let Some(firing) = self.scheduler.pop_next(reading) {
      fired += 1;
      EngineCounters::incr(&self.counters.timers_fired);
      outcomes.extend(self.fire(firing, reading));
    }
    self.scheduler.record_batch(fired);
    outcomes
  }

  fn fire(&self, firing: Firing, reading: DateTime<Utc>) -> Vec<TimerOutcome> {
    let config = self.config();
    let at = firing.due_at;
    match firing.message {
      TimerMessage::Escalate {
        incident_id,
        generation,
      } => {
        let ctx = self.ctx(&config, at);
        let fired = self.escalator.on_timer(&incident_id, generation, &ctx);
        self.dispatch_all(&config, at, fired.dispatches);
        vec![fired.outcome]
      }
      TimerMessage::CooldownExpired { slot } => self.escalator.on_cooldown_expired(&slot, at).into_iter().collect(),
      TimerMessage::FlushQueue { scope } => self
        .throttle
        .flush(&scope, at, &self.scheduler)
        .into_iter()
        .map(|pending| self.release(&config, pending, at))
        .collect(),
      TimerMessage::ReleaseDelayed { scope, event } => {
        self.throttle.release_delayed(&scope);
        vec![self.release(&config, *event, at)]
      }
      // Housekeeping runs once per reading, however long the gap.
      TimerMessage::Sweep => {
        let windows = self.dedup.evict_idle(reading, config.runtime.eviction_factor);
        let retention = Duration::minutes(config.runtime.incident_retention_minutes as i64);
        let incidents = self.escalator.sweep(reading, retention);
        let next = reading + Duration::seconds(config.runtime.sweep_interval_seconds as i64);
        self.scheduler.schedule(next, TimerMessage::Sweep);
        if windows + incidents > 0 {
          tracing::debug!(windows, incidents, "swept idle state");
        }
        vec![TimerOutcome::Swept { windows, incidents }]
      }
    }
  }

  /// A throttled event left its bucket: continue the pipeline from escalation.
  fn release(&self, config: &EngineConfig, pending: PendingEvent, now: DateTime<Utc>) -> TimerOutcome {
    let incident_id = self.escalate(config, &pending.event, &pending.fingerprint, now);
    TimerOutcome::Released {
      decision: Decision::passed(pending.fingerprint).with_incident(incident_id),
    }
  }

  pub fn next_timer_due(&self) -> Option<DateTime<Utc>> {
    self.scheduler.next_due()
  }

  // -------------------------------------------------------------------------
  // Operator actions (idempotent on closed incidents)
  // -------------------------------------------------------------------------

  pub fn acknowledge(&self, incident_id: &IncidentId, actor: &str) -> Result<Incident, EngineError> {
    self.operate(|ctx| self.escalator.acknowledge(incident_id, actor, ctx))
  }

  pub fn resolve(&self, incident_id: &IncidentId, actor: &str) -> Result<Incident, EngineError> {
    self.operate(|ctx| self.escalator.resolve(incident_id, actor, ctx))
  }

  pub fn cancel(&self, incident_id: &IncidentId, actor: &str) -> Result<Incident, EngineError> {
    self.operate(|ctx| self.escalator.cancel(incident_id, actor, ctx))
  }

  /// Force the next escalation level now.
  pub fn escalate_now(&self, incident_id: &IncidentId, actor: &str) -> Result<Incident, EngineError> {
    self.operate(|ctx| self.escalator.escalate(incident_id, actor, ctx))
  }

  /// Side channel for dispatchers that learn about failures after returning.
  pub fn report_dispatch_failure(
    &self,
    incident_id: &IncidentId,
    level: usize,
    error: DispatchError,
  ) -> Result<Incident, EngineError> {
    EngineCounters::incr(&self.counters.dispatch_failures);
    self.operate(|ctx| self.escalator.record_dispatch_failure(incident_id, level, &error, ctx))
  }

  fn operate<F>(&self, f: F) -> Result<Incident, EngineError>
  where
    F: FnOnce(&EscalationCtx) -> Result<crate::escalation::Applied, EngineError>,
  {
    let config = self.config();
    let now = self.clock.now();
    let applied = f(&self.ctx(&config, now))?;
    self.dispatch_all(&config, now, applied.dispatches);
    Ok(applied.incident)
  }

  pub fn incident(&self, incident_id: &IncidentId) -> Option<Incident> {
    self.escalator.incident(incident_id)
  }

  pub fn open_incidents(&self) -> Vec<Incident> {
    self.escalator.open_incidents()
  }

  // -------------------------------------------------------------------------
  // Configuration (validated before it is swapped in)
  // -------------------------------------------------------------------------

  fn update<F>(&self, f: F) -> Result<(), EngineError>
  where
    F: FnOnce(&mut EngineConfig) -> Result<(), EngineError>,
  {
    let mut guard = self.config.write();
    let mut next = EngineConfig::clone(&guard);
    f(&mut next)?;
    next.validate()?;
    *guard = Arc::new(next);
    let version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
    tracing::info!(version, "configuration updated");
    Ok(())
  }

  /// Insert or replace a dedup config; its windows restart cold.
  pub fn upsert_dedup(&self, config: DedupConfig) -> Result<(), EngineError> {
    let id = config.id.clone();
    self.update(|c| c.upsert_dedup(config))?;
    self.dedup.reset(&id);
    Ok(())
  }

  /// Insert or replace a throttle config; its buckets restart empty.
  pub fn upsert_throttle(&self, config: ThrottleConfig) -> Result<(), EngineError> {
    let id = config.id.clone();
    self.update(|c| c.upsert_throttle(config))?;
    self.throttle.reset(&id);
    Ok(())
  }

  /// Insert or replace a policy. Open incidents follow the new levels from
  /// their next timer on.
  pub fn upsert_policy(&self, policy: EscalationPolicy) -> Result<(), EngineError> {
    self.update(|c| c.upsert_policy(policy))
  }

  pub fn set_enabled(&self, kind: ConfigKind, id: &str, enabled: bool) -> Result<(), EngineError> {
    self.update(|c| c.set_enabled(kind, id, enabled))
  }

  pub fn remove_config(&self, kind: ConfigKind, id: &str) -> Result<(), EngineError> {
    self.update(|c| {
      if c.remove(kind, id) {
        Ok(())
      } else {
        Err(EngineError::NotFound(format!("{:?} config {}", kind, id)))
      }
    })?;
    match kind {
      ConfigKind::Dedup => self.dedup.reset(id),
      ConfigKind::Throttle => self.throttle.reset(id),
      ConfigKind::Escalation => {}
    }
    Ok(())
  }

  // -------------------------------------------------------------------------
  // Stats
  // -------------------------------------------------------------------------

  pub fn stats(&self) -> EngineStats {
    let config = self.config();
    let now = self.clock.now();
    EngineStats {
      config_version: self.config_version(),
      total_received: EngineCounters::get(&self.counters.received),
      total_invalid: EngineCounters::get(&self.counters.invalid),
      fingerprint_fallbacks: EngineCounters::get(&self.counters.fingerprint_fallbacks),
      dispatch_failures: EngineCounters::get(&self.counters.dispatch_failures),
      timers_fired: EngineCounters::get(&self.counters.timers_fired),
      scheduler: self.scheduler.stats(),
      dedup: config.dedup.iter().map(|c| self.dedup.stats(&c.id)).collect(),
      throttle: config.throttle.iter().map(|c| self.throttle.stats(&c.id, now)).collect(),
      escalation: config.escalation.iter().map(|p| self.escalator.stats(&p.id)).collect(),
    }
  }
}
