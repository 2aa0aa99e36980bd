//! Binary entrypoint: replay JSON-line commands against a simulated clock.
//!
//! Each input line is a Command (`ingest`, `acknowledge`, `resolve`,
//! `cancel`, `escalate`, `advance`, `stats`). Before a command runs, the
//! clock moves to its `at` and every timer due by then fires. Output lines
//! are Decisions, Incidents, Timer outcomes, Dispatch requests, Stats, or
//! an ErrorOutput for input that could not be processed.
//!
//! Set ALERT_ENGINE_CONFIG to a JSON config file; logs go to stderr
//! (RUST_LOG controls the level).

use alert_engine::normalize::parse_timestamp;
use alert_engine::types::{Command, ErrorOutput, Output, TimerOutcome};
use alert_engine::{Engine, EngineConfig, EngineError, IncidentId, ManualClock, RecordingDispatcher};
use chrono::Utc;
use serde::Serialize;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
    .with_writer(io::stderr)
    .init();

  let config = match std::env::var("ALERT_ENGINE_CONFIG") {
    Ok(path) => match EngineConfig::load(&path) {
      Ok(c) => c,
      Err(e) => {
        tracing::error!(path = %path, error = %e, "invalid configuration");
        std::process::exit(2);
      }
    },
    Err(_) => EngineConfig::default(),
  };

  let stdin = io::stdin();
  let stdout = io::stdout();
  let mut out = io::BufWriter::new(stdout.lock());
  let dispatcher = Arc::new(RecordingDispatcher::new());
  let mut replay: Option<(Engine, Arc<ManualClock>)> = None;

  for line in stdin.lock().lines() {
    let line = match line {
      Ok(l) => l,
      Err(e) => {
        tracing::error!(error = %e, "read error");
        std::process::exit(1);
      }
    };

    // Skip blank lines.
    let trimmed = line.trim();
    if trimmed.is_empty() {
      continue;
    }

    let command: Command = match serde_json::from_str(trimmed) {
      Ok(v) => v,
      Err(e) => {
        emit(&mut out, &ErrorOutput::new(format!("json parse: {}", e)));
        continue;
      }
    };

    let at = match command.at().map(|raw| parse_timestamp("at", raw)).transpose() {
      Ok(at) => at,
      Err(e) => {
        emit(&mut out, &error_output(&e));
        continue;
      }
    };

    // The replay clock starts at the first command's timestamp.
    if replay.is_none() {
      let clock = Arc::new(ManualClock::new(at.unwrap_or_else(Utc::now)));
      match Engine::new(config.clone(), clock.clone(), dispatcher.clone()) {
        Ok(engine) => replay = Some((engine, clock)),
        Err(e) => {
          tracing::error!(error = %e, "engine init failed");
          std::process::exit(2);
        }
      }
    }
    let Some((engine, clock)) = replay.as_ref() else {
      continue;
    };

    if let Some(at) = at {
      clock.set(at);
    }
    for outcome in engine.run_due() {
      if !matches!(outcome, TimerOutcome::Swept { windows: 0, incidents: 0 }) {
        emit(&mut out, &Output::Timer(outcome));
      }
    }
    drain_dispatches(&mut out, &dispatcher);

    let result = match command {
      Command::Ingest { event, .. } => engine.ingest(&event).map(|d| Some(Output::Decision(d))),
      Command::Acknowledge { incident_id, actor, .. } => engine
        .acknowledge(&IncidentId(incident_id), &actor)
        .map(|i| Some(Output::Incident(Box::new(i)))),
      Command::Resolve { incident_id, actor, .. } => engine
        .resolve(&IncidentId(incident_id), &actor)
        .map(|i| Some(Output::Incident(Box::new(i)))),
      Command::Cancel { incident_id, actor, .. } => engine
        .cancel(&IncidentId(incident_id), &actor)
        .map(|i| Some(Output::Incident(Box::new(i)))),
      Command::Escalate { incident_id, actor, .. } => engine
        .escalate_now(&IncidentId(incident_id), &actor)
        .map(|i| Some(Output::Incident(Box::new(i)))),
      Command::Advance { .. } => Ok(None),
      Command::Stats { .. } => Ok(Some(Output::Stats(Box::new(engine.stats())))),
    };

    match result {
      Ok(Some(output)) => emit(&mut out, &output),
      Ok(None) => {}
      Err(e) => emit(&mut out, &error_output(&e)),
    }
    drain_dispatches(&mut out, &dispatcher);
  }

  let _ = out.flush();
}

fn drain_dispatches(out: &mut impl Write, dispatcher: &RecordingDispatcher) {
  for request in dispatcher.drain() {
    emit(out, &Output::Dispatch(request));
  }
}

fn error_output(e: &EngineError) -> ErrorOutput {
  match e {
    EngineError::Validation { field, reason } => ErrorOutput::new(reason.clone()).with_field(field.clone()),
    _ => ErrorOutput::new(e.to_string()),
  }
}

fn emit<T: Serialize>(out: &mut impl Write, value: &T) {
  let _ = serde_json::to_writer(&mut *out, value);
  let _ = writeln!(out);
}
