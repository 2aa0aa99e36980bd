//! Structured error types for the alert engine.

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
  #[error("validation: {field}: {reason}")]
  Validation { field: String, reason: String },

  #[error("configuration: {id}: {field}: {reason}")]
  Configuration {
    id: String,
    field: String,
    reason: String,
  },

  #[error("throttled: scope {scope}, retry after {retry_after}")]
  Throttled {
    scope: String,
    retry_after: DateTime<Utc>,
    /// Whole seconds from the decision's clock reading to `retry_after`, at least 1.
    retry_after_seconds: u64,
  },

  #[error("incident not found: {0}")]
  NotFound(String),

  #[error("json: {0}")]
  Json(#[from] serde_json::Error),

  #[error("io: {0}")]
  Io(#[from] std::io::Error),
}

impl EngineError {
  pub fn validation(field: &str, reason: &str) -> Self {
    Self::Validation {
      field: field.to_string(),
      reason: reason.to_string(),
    }
  }

  pub fn configuration(id: &str, field: &str, reason: &str) -> Self {
    Self::Configuration {
      id: id.to_string(),
      field: field.to_string(),
      reason: reason.to_string(),
    }
  }
}

/// A custom fingerprint template could not be parsed or evaluated.
///
/// Never fatal at runtime: the engine falls back to `basic` fingerprinting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FingerprintError {
  #[error("template syntax: {0}")]
  Syntax(String),

  #[error("unknown template field: {0}")]
  UnknownField(String),

  #[error("payload path not found: {0}")]
  MissingPath(String),
}

/// A target dispatcher failed to hand off a notification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("dispatch to {target}: {reason}")]
pub struct DispatchError {
  pub target: String,
  pub reason: String,
}

impl DispatchError {
  pub fn new(target: impl Into<String>, reason: impl Into<String>) -> Self {
    Self {
      target: target.into(),
      reason: reason.into(),
    }
  }
}
