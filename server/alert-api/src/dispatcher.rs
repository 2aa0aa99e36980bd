//! Hands escalation requests to the senders over an in-process channel.

use alert_engine::error::DispatchError;
use alert_engine::{DispatchRequest, TargetDispatcher};
use tokio::sync::mpsc;

pub struct ChannelDispatcher {
  tx: mpsc::UnboundedSender<DispatchRequest>,
}

impl ChannelDispatcher {
  pub fn new() -> (Self, mpsc::UnboundedReceiver<DispatchRequest>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Self { tx }, rx)
  }
}

impl TargetDispatcher for ChannelDispatcher {
  fn dispatch(&self, request: &DispatchRequest) -> Result<(), DispatchError> {
    self.tx.send(request.clone()).map_err(|_| {
      let target = request.targets.first().map(|t| t.id.clone()).unwrap_or_default();
      DispatchError::new(target, "dispatch channel closed")
    })
  }
}

/// Consume dispatch requests. Delivery belongs to the channel senders; until
/// one is attached, each request is logged.
pub fn spawn_delivery_log(mut rx: mpsc::UnboundedReceiver<DispatchRequest>) -> tokio::task::JoinHandle<()> {
  tokio::spawn(async move {
    while let Some(request) = rx.recv().await {
      let targets: Vec<&str> = request.targets.iter().map(|t| t.id.as_str()).collect();
      tracing::info!(
        incident = %request.incident_id,
        level = request.level,
        trigger = ?request.trigger,
        targets = ?targets,
        "escalation dispatched"
      );
    }
  })
}
