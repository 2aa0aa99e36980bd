//! Fingerprint templates for the `custom` dedup policy.
//!
//! Syntax: literal text with `{field}` placeholders. Fields are `event_type`,
//! `source_id`, `severity`, `issue_signature`, `channel`, or a dotted
//! `payload.` path. `{{` and `}}` escape literal braces.

use serde_json::Value;

use crate::error::FingerprintError;
use crate::types::NotificationEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Field {
  EventType,
  SourceId,
  Severity,
  IssueSignature,
  Channel,
  Payload(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
  Literal(String),
  Field(Field),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
  parts: Vec<Part>,
}

impl Template {
  pub fn parse(src: &str) -> Result<Self, FingerprintError> {
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut chars = src.chars().peekable();

    while let Some(ch) = chars.next() {
      match ch {
        '{' if chars.peek() == Some(&'{') => {
          chars.next();
          literal.push('{');
        }
        '}' if chars.peek() == Some(&'}') => {
          chars.next();
          literal.push('}');
        }
        '{' => {
          let mut name = String::new();
          loop {
            match chars.next() {
              Some('}') => break,
              Some('{') | None => {
                return Err(FingerprintError::Syntax(format!("unclosed placeholder in {:?}", src)))
              }
              Some(c) => name.push(c),
            }
          }
          if !literal.is_empty() {
            parts.push(Part::Literal(std::mem::take(&mut literal)));
          }
          parts.push(Part::Field(parse_field(name.trim())?));
        }
        '}' => {
          return Err(FingerprintError::Syntax(format!("stray '}}' in {:?}", src)));
        }
        c => literal.push(c),
      }
    }
    if !literal.is_empty() {
      parts.push(Part::Literal(literal));
    }
    if !parts.iter().any(|p| matches!(p, Part::Field(_))) {
      return Err(FingerprintError::Syntax("template has no placeholders".into()));
    }
    Ok(Self { parts })
  }

  pub fn render(&self, event: &NotificationEvent) -> Result<String, FingerprintError> {
    let mut out = String::new();
    for part in &self.parts {
      match part {
        Part::Literal(s) => out.push_str(s),
        Part::Field(Field::EventType) => out.push_str(&event.event_type),
        Part::Field(Field::SourceId) => out.push_str(&event.source_id),
        Part::Field(Field::Severity) => out.push_str(event.severity.as_str()),
        Part::Field(Field::IssueSignature) => out.push_str(&event.issue_signature.join(",")),
        Part::Field(Field::Channel) => out.push_str(event.channel.as_deref().unwrap_or("")),
        Part::Field(Field::Payload(path)) => {
          let mut cur: Option<&Value> = None;
          for (i, key) in path.iter().enumerate() {
            cur = if i == 0 {
              event.payload.get(key)
            } else {
              cur.and_then(|v| v.get(key))
            };
          }
          match cur {
            Some(Value::String(s)) => out.push_str(s),
            Some(Value::Null) | None => {
              return Err(FingerprintError::MissingPath(format!("payload.{}", path.join("."))))
            }
            Some(other) => out.push_str(&other.to_string()),
          }
        }
      }
    }
    Ok(out)
  }
}

fn parse_field(name: &str) -> Result<Field, FingerprintError> {
  match name {
    "event_type" => Ok(Field::EventType),
    "source_id" => Ok(Field::SourceId),
    "severity" => Ok(Field::Severity),
    "issue_signature" => Ok(Field::IssueSignature),
    "channel" => Ok(Field::Channel),
    _ => match name.strip_prefix("payload.") {
      Some(path) if !path.is_empty() && path.split('.').all(|seg| !seg.is_empty()) => {
        Ok(Field::Payload(path.split('.').map(str::to_string).collect()))
      }
      _ => Err(FingerprintError::UnknownField(name.to_string())),
    },
  }
}
