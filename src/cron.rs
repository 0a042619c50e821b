//! Fixed-interval expressions such as `30s`, `5m`, `1h` or `1h30m`.
//!
//! This is not a cron engine: there are no calendar fields and no timezones.

use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use thiserror::Error;

static SHAPE: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^(?:\d+(?:ms|s|m|h|d))+$").expect("interval shape pattern compiles"));
static SEGMENT: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"(\d+)(ms|s|m|h|d)").expect("interval segment pattern compiles"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
  #[error("interval expression is empty")]
  Empty,
  #[error("invalid interval expression '{0}', expected e.g. 30s, 5m, 1h30m")]
  Malformed(String),
  #[error("interval must be greater than zero")]
  Zero,
  #[error("interval expression '{0}' is too large")]
  Overflow(String),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CronParser;

impl CronParser {
  pub fn new() -> Self {
    Self
  }

  pub fn parse_interval(&self, expr: &str) -> Result<Duration, CronError> {
    parse_interval(expr)
  }

  /// Next firing time of a schedule whose previous firing (or start) was
  /// `from`. `None` if the result is not representable.
  pub fn next_execute_time(&self, from: DateTime<Utc>, interval: Duration) -> Option<DateTime<Utc>> {
    from.checked_add_signed(chrono::Duration::from_std(interval).ok()?)
  }
}

pub fn parse_interval(expr: &str) -> Result<Duration, CronError> {
  let expr = expr.trim();
  if expr.is_empty() {
    return Err(CronError::Empty);
  }
  if !SHAPE.is_match(expr) {
    return Err(CronError::Malformed(expr.to_string()));
  }

  let overflow = || CronError::Overflow(expr.to_string());
  let mut total = Duration::ZERO;
  for caps in SEGMENT.captures_iter(expr) {
    let magnitude: u64 = caps[1].parse().map_err(|_| overflow())?;
    let unit_ms: u64 = match &caps[2] {
      "ms" => 1,
      "s" => 1_000,
      "m" => 60_000,
      "h" => 3_600_000,
      _ => 86_400_000,
    };
    let segment = magnitude.checked_mul(unit_ms).map(Duration::from_millis).ok_or_else(overflow)?;
    total = total.checked_add(segment).ok_or_else(overflow)?;
  }

  if total.is_zero() {
    return Err(CronError::Zero);
  }
  Ok(total)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_single_units() {
    assert_eq!(parse_interval("30s"), Ok(Duration::from_secs(30)));
    assert_eq!(parse_interval("5m"), Ok(Duration::from_secs(300)));
    assert_eq!(parse_interval("1h"), Ok(Duration::from_secs(3600)));
    assert_eq!(parse_interval("250ms"), Ok(Duration::from_millis(250)));
    assert_eq!(parse_interval("2d"), Ok(Duration::from_secs(2 * 86_400)));
  }

  #[test]
  fn parses_compound_expressions() {
    assert_eq!(parse_interval("1h30m"), Ok(Duration::from_secs(5_400)));
    assert_eq!(parse_interval(" 1m30s "), Ok(Duration::from_secs(90)));
  }

  #[test]
  fn rejects_zero() {
    assert_eq!(parse_interval("0s"), Err(CronError::Zero));
    assert_eq!(parse_interval("0h0m"), Err(CronError::Zero));
  }

  #[test]
  fn rejects_malformed_input() {
    assert_eq!(parse_interval(""), Err(CronError::Empty));
    for bad in ["30", "s", "-5m", "5 m", "1.5h", "10y", "0 2 * * *", "5mm"] {
      assert!(matches!(parse_interval(bad), Err(CronError::Malformed(_))), "{bad} should be rejected");
    }
  }

  #[test]
  fn rejects_overflow() {
    assert!(matches!(parse_interval("99999999999999999999s"), Err(CronError::Overflow(_))));
    assert!(matches!(parse_interval("18446744073709551615d"), Err(CronError::Overflow(_))));
  }

  #[test]
  fn next_execute_time_is_one_interval_away() {
    let from = Utc::now();
    let next = CronParser::new().next_execute_time(from, Duration::from_secs(60)).unwrap();
    assert_eq!(next, from + chrono::Duration::seconds(60));
    assert!(CronParser::new().next_execute_time(DateTime::<Utc>::MAX_UTC, Duration::from_secs(1)).is_none());
  }
}
