//! Business-hours calendar used to defer escalation timers.

use chrono::{DateTime, Datelike, Days, FixedOffset, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusinessHours {
  /// Offset of the business-hours timezone from UTC, in minutes.
  pub utc_offset_minutes: i32,
  pub start_hour: u32,
  /// Exclusive.
  pub end_hour: u32,
  pub days: Vec<Weekday>,
}

impl Default for BusinessHours {
  fn default() -> Self {
    Self {
      utc_offset_minutes: 0,
      start_hour: 9,
      end_hour: 17,
      days: vec![Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri],
    }
  }
}

impl BusinessHours {
  pub fn validate(&self) -> Result<(), EngineError> {
    if self.start_hour >= self.end_hour || self.end_hour > 24 {
      return Err(EngineError::configuration(
        "business_hours",
        "start_hour",
        "expected 0 <= start_hour < end_hour <= 24",
      ));
    }
    if self.days.is_empty() {
      return Err(EngineError::configuration("business_hours", "days", "must not be empty"));
    }
    if self.offset().is_none() {
      return Err(EngineError::configuration(
        "business_hours",
        "utc_offset_minutes",
        "out of range",
      ));
    }
    Ok(())
  }

  fn offset(&self) -> Option<FixedOffset> {
    FixedOffset::east_opt(self.utc_offset_minutes * 60)
  }

  pub fn is_open(&self, at: DateTime<Utc>) -> bool {
    self.next_open(at) == at
  }

  /// `at` itself when inside business hours, else the start of the next opening.
  pub fn next_open(&self, at: DateTime<Utc>) -> DateTime<Utc> {
    let Some(tz) = self.offset() else {
      return at;
    };
    let local = at.with_timezone(&tz);
    let hour = local.hour();

    for day in 0..=7u64 {
      let Some(date) = local.date_naive().checked_add_days(Days::new(day)) else {
        break;
      };
      if !self.days.contains(&date.weekday()) {
        continue;
      }
      if day == 0 && hour >= self.end_hour {
        continue;
      }
      if day == 0 && hour >= self.start_hour {
        return at;
      }
      let Some(start) = NaiveTime::from_hms_opt(self.start_hour, 0, 0) else {
        return at;
      };
      if let Some(open) = tz.from_local_datetime(&date.and_time(start)).single() {
        return open.with_timezone(&Utc);
      }
    }
    at
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn utc(d: u32, h: u32, m: u32) -> DateTime<Utc> {
    // 2025-01-13 is a Monday.
    Utc.with_ymd_and_hms(2025, 1, d, h, m, 0).unwrap()
  }

  #[test]
  fn inside_hours_is_open() {
    let bh = BusinessHours::default();
    assert!(bh.is_open(utc(13, 10, 30)));
    assert_eq!(bh.next_open(utc(13, 10, 30)), utc(13, 10, 30));
  }

  #[test]
  fn before_opening_waits_for_same_day() {
    let bh = BusinessHours::default();
    assert_eq!(bh.next_open(utc(13, 7, 0)), utc(13, 9, 0));
  }

  #[test]
  fn after_closing_waits_for_next_business_day() {
    let bh = BusinessHours::default();
    assert_eq!(bh.next_open(utc(13, 17, 0)), utc(14, 9, 0));
    // Friday evening rolls over the weekend.
    assert_eq!(bh.next_open(utc(17, 20, 0)), utc(20, 9, 0));
  }

  #[test]
  fn offset_shifts_the_calendar() {
    let bh = BusinessHours {
      utc_offset_minutes: 120,
      ..BusinessHours::default()
    };
    // 08:00 UTC is 10:00 local.
    assert!(bh.is_open(utc(13, 8, 0)));
    // 06:30 UTC is 08:30 local; opens at 07:00 UTC.
    assert_eq!(bh.next_open(utc(13, 6, 30)), utc(13, 7, 0));
  }

  #[test]
  fn inverted_hours_are_rejected() {
    let bh = BusinessHours {
      start_hour: 18,
      end_hour: 9,
      ..BusinessHours::default()
    };
    assert!(bh.validate().is_err());
  }
}
