//! Shared application state and the scheduler ticker.

use alert_engine::types::TimerOutcome;
use alert_engine::Engine;
use std::sync::Arc;
use std::time::Duration;

pub struct AppState {
  pub engine: Engine,
}

/// Fire due engine timers every `period` until the runtime shuts down.
pub fn spawn_ticker(state: Arc<AppState>, period: Duration) -> tokio::task::JoinHandle<()> {
  tokio::spawn(async move {
    let mut interval = tokio::time::interval(period);
    loop {
      interval.tick().await;
      for outcome in state.engine.run_due() {
        match outcome {
          TimerOutcome::Swept { .. } => {}
          other => tracing::debug!(outcome = ?other, "timer fired"),
        }
      }
    }
  })
}
