//! Stable fingerprint computation for grouping events into "the same problem".

use serde::{Deserialize, Serialize};

use crate::error::FingerprintError;
use crate::template::Template;
use crate::types::{Fingerprint, NotificationEvent};

/// Which event attributes identify a recurring problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FingerprintPolicy {
  /// Every event is distinct; disables dedup.
  None,
  Basic,
  Severity,
  IssueBased,
  Strict,
  Custom { template: String },
}

impl FingerprintPolicy {
  pub fn name(&self) -> &'static str {
    match self {
      Self::None => "none",
      Self::Basic => "basic",
      Self::Severity => "severity",
      Self::IssueBased => "issue_based",
      Self::Strict => "strict",
      Self::Custom { .. } => "custom",
    }
  }
}

/// Compute the fingerprint of an event under a policy.
///
/// Deterministic for identical inputs, except `None` which yields a fresh
/// random value on each call. Uses blake3 for a fast, deterministic hash.
pub fn compute(event: &NotificationEvent, policy: &FingerprintPolicy) -> Result<Fingerprint, FingerprintError> {
  let mut hasher = blake3::Hasher::new();
  hasher.update(policy.name().as_bytes());

  match policy {
    FingerprintPolicy::None => {
      return Ok(Fingerprint(uuid::Uuid::new_v4().simple().to_string()));
    }
    FingerprintPolicy::Basic => {
      feed_identity(&mut hasher, event);
    }
    FingerprintPolicy::Severity => {
      feed_identity(&mut hasher, event);
      feed(&mut hasher, event.severity.as_str());
    }
    FingerprintPolicy::IssueBased => {
      feed_identity(&mut hasher, event);
      feed_signature(&mut hasher, event);
    }
    FingerprintPolicy::Strict => {
      feed_identity(&mut hasher, event);
      feed(&mut hasher, event.severity.as_str());
      feed_signature(&mut hasher, event);
      // serde_json maps are key-sorted, so this is already canonical.
      feed(&mut hasher, &serde_json::Value::Object(event.payload.clone()).to_string());
    }
    FingerprintPolicy::Custom { template } => {
      let rendered = Template::parse(template)?.render(event)?;
      feed(&mut hasher, &rendered);
    }
  }

  Ok(finish(hasher))
}

/// Compute a fingerprint, falling back to `basic` when a custom template fails.
///
/// The returned error (if any) is the reason the fallback happened.
pub fn compute_or_fallback(
  event: &NotificationEvent,
  policy: &FingerprintPolicy,
) -> (Fingerprint, Option<FingerprintError>) {
  match compute(event, policy) {
    Ok(fp) => (fp, None),
    Err(e) => {
      tracing::warn!(
        policy = policy.name(),
        event_type = %event.event_type,
        source_id = %event.source_id,
        error = %e,
        "fingerprint evaluation failed, falling back to basic"
      );
      let mut hasher = blake3::Hasher::new();
      hasher.update(FingerprintPolicy::Basic.name().as_bytes());
      feed_identity(&mut hasher, event);
      (finish(hasher), Some(e))
    }
  }
}

fn feed(hasher: &mut blake3::Hasher, part: &str) {
  hasher.update(b"|");
  hasher.update(part.as_bytes());
}

fn feed_identity(hasher: &mut blake3::Hasher, event: &NotificationEvent) {
  feed(hasher, &event.event_type);
  feed(hasher, &event.source_id);
}

fn feed_signature(hasher: &mut blake3::Hasher, event: &NotificationEvent) {
  // Signature is sorted during normalization; length-prefix keeps sets unambiguous.
  feed(hasher, &event.issue_signature.len().to_string());
  for issue in &event.issue_signature {
    feed(hasher, issue);
  }
}

fn finish(hasher: blake3::Hasher) -> Fingerprint {
  // First 16 bytes (32 hex chars): compact but collision-resistant.
  let hex = hasher.finalize().to_hex();
  Fingerprint(hex[..32].to_string())
}
