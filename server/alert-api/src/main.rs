//! Binary entrypoint for the alert engine HTTP API.

use alert_engine::{Engine, EngineConfig, SystemClock};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use alert_api::{router, spawn_delivery_log, spawn_ticker, AppState, ChannelDispatcher};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let config = match std::env::var("ALERT_ENGINE_CONFIG") {
    Ok(path) => EngineConfig::load(&path)?,
    Err(_) => EngineConfig::default(),
  };
  let port: u16 = std::env::var("PORT").unwrap_or_else(|_| "5005".into()).parse()?;

  let (dispatcher, requests) = ChannelDispatcher::new();
  let engine = Engine::new(config, Arc::new(SystemClock), Arc::new(dispatcher))?;
  let state = Arc::new(AppState { engine });

  spawn_delivery_log(requests);
  spawn_ticker(state.clone(), Duration::from_secs(1));

  let app = router(state);
  let addr = SocketAddr::from(([127, 0, 0, 1], port));
  tracing::info!(%addr, "alert-api listening");

  let listener = tokio::net::TcpListener::bind(addr).await?;
  axum::serve(listener, app).await?;

  Ok(())
}
