//! Normalize inbound events into canonical internal NotificationEvent models.

use chrono::{DateTime, Utc};

use crate::error::EngineError;
use crate::types::*;

/// Parse and normalize an InboundEvent into a canonical NotificationEvent.
pub fn normalize(raw: &InboundEvent) -> Result<NotificationEvent, EngineError> {
  let occurred_at = parse_timestamp("occurred_at", &raw.occurred_at)?;

  let severity = Severity::from_str_loose(&raw.severity)
    .ok_or_else(|| EngineError::validation("severity", "expected critical|high|medium|low"))?;

  let event_type = raw.event_type.trim();
  if event_type.is_empty() {
    return Err(EngineError::validation("event_type", "must not be empty"));
  }
  let source_id = raw.source_id.trim();
  if source_id.is_empty() {
    return Err(EngineError::validation("source_id", "must not be empty"));
  }

  let status = match raw.status.as_deref().map(|s| s.to_ascii_lowercase()) {
    None => EventStatus::Firing,
    Some(s) => match s.as_str() {
      "firing" | "open" | "triggered" => EventStatus::Firing,
      "resolved" | "cleared" | "ok" => EventStatus::Resolved,
      _ => return Err(EngineError::validation("status", "expected firing|resolved")),
    },
  };

  Ok(NotificationEvent {
    event_type: event_type.to_ascii_lowercase(),
    source_id: source_id.to_string(),
    severity,
    issue_signature: normalize_signature(&raw.issue_signature),
    occurred_at,
    payload: raw.payload.clone(),
    channel: raw
      .channel
      .as_deref()
      .map(str::trim)
      .filter(|c| !c.is_empty())
      .map(str::to_ascii_lowercase),
    status,
  })
}

/// Parse an RFC3339 timestamp, naming the offending field on failure.
pub fn parse_timestamp(field: &str, raw: &str) -> Result<DateTime<Utc>, EngineError> {
  DateTime::parse_from_rfc3339(raw)
    .map(|ts| ts.with_timezone(&Utc))
    .map_err(|e| EngineError::validation(field, &format!("invalid RFC3339: {}", e)))
}

/// Issue signatures are sets: trim, drop blanks, sort, de-duplicate.
fn normalize_signature(raw: &[String]) -> Vec<String> {
  let mut out: Vec<String> = raw
    .iter()
    .map(|s| s.trim().to_ascii_lowercase())
    .filter(|s| !s.is_empty())
    .collect();
  out.sort();
  out.dedup();
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  fn raw() -> InboundEvent {
    InboundEvent {
      event_type: "Quality_Drop".into(),
      source_id: "orders-table".into(),
      severity: "critical".into(),
      issue_signature: vec!["null_rate".into(), " Freshness ".into(), "null_rate".into(), "".into()],
      occurred_at: "2025-01-15T10:30:00Z".into(),
      payload: Default::default(),
      channel: Some(" Slack ".into()),
      status: None,
    }
  }

  #[test]
  fn normalize_valid_event() {
    let event = normalize(&raw()).unwrap();
    assert_eq!(event.event_type, "quality_drop");
    assert_eq!(event.severity, Severity::Critical);
    assert_eq!(event.issue_signature, vec!["freshness", "null_rate"]);
    assert_eq!(event.channel.as_deref(), Some("slack"));
    assert_eq!(event.status, EventStatus::Firing);
  }

  #[test]
  fn normalize_rejects_empty_source() {
    let mut r = raw();
    r.source_id = "  ".into();
    let err = normalize(&r).unwrap_err();
    assert!(err.to_string().contains("source_id"));
  }

  #[test]
  fn normalize_rejects_bad_timestamp() {
    let mut r = raw();
    r.occurred_at = "yesterday".into();
    let err = normalize(&r).unwrap_err();
    assert!(err.to_string().contains("occurred_at"));
  }

  #[test]
  fn normalize_rejects_unknown_severity() {
    let mut r = raw();
    r.severity = "apocalyptic".into();
    assert!(normalize(&r).is_err());
  }

  #[test]
  fn resolved_status_is_recognized() {
    let mut r = raw();
    r.status = Some("Resolved".into());
    assert_eq!(normalize(&r).unwrap().status, EventStatus::Resolved);
  }
}
