use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cron::CronParser;

/// Arbitrary key/value data passed through verbatim to the callback.
pub type Payload = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
  Delay,
  Interval,
}

/// The durable record written to the log for every accepted submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
  pub id: Uuid,
  pub kind: TaskKind,
  pub execute_at: DateTime<Utc>,
  pub callback_target: String,
  #[serde(default)]
  pub payload: Payload,
  #[serde(default)]
  pub retry_count: u32,
  pub created_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub interval_ms: Option<u64>,
  /// Id of the first occurrence of an interval series, shared by all of its
  /// successors. Cancelling this id stops the whole series.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub series_id: Option<Uuid>,
}

impl ScheduledTask {
  pub fn new(
    kind: TaskKind,
    execute_at: DateTime<Utc>,
    callback_target: String,
    payload: Payload,
    interval: Option<Duration>,
  ) -> Self {
    let id = Uuid::new_v4();
    Self {
      id,
      kind,
      execute_at,
      callback_target,
      payload,
      retry_count: 0,
      created_at: Utc::now(),
      interval_ms: interval.map(|i| u64::try_from(i.as_millis()).unwrap_or(u64::MAX)),
      series_id: interval.map(|_| id),
    }
  }

  pub fn interval(&self) -> Option<Duration> {
    self.interval_ms.map(Duration::from_millis)
  }

  pub fn entry(&self) -> WheelEntry {
    WheelEntry {
      id: self.id,
      execute_at: self.execute_at,
      callback_target: self.callback_target.clone(),
      payload: self.payload.clone(),
      interval: self.interval(),
      series_id: self.series_id,
      rounds_remaining: 0,
    }
  }

  pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(self)
  }

  pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
    serde_json::from_slice(bytes)
  }
}

/// What the wheel keeps for a pending task. Never persisted on its own.
#[derive(Debug, Clone, PartialEq)]
pub struct WheelEntry {
  pub id: Uuid,
  pub execute_at: DateTime<Utc>,
  pub callback_target: String,
  pub payload: Payload,
  pub interval: Option<Duration>,
  pub series_id: Option<Uuid>,
  pub(crate) rounds_remaining: u32,
}

impl WheelEntry {
  pub fn rounds_remaining(&self) -> u32 {
    self.rounds_remaining
  }

  /// Time left until `execute_at`, clamped to zero for overdue tasks.
  pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
    (self.execute_at - now).to_std().unwrap_or(Duration::ZERO)
  }

  /// The next occurrence of an interval task. `None` for one-shot tasks.
  ///
  /// Keeps the cadence unless the next slot is already in the past,
  /// in which case it restarts from `now`.
  pub fn successor(&self, now: DateTime<Utc>) -> Option<ScheduledTask> {
    let interval = self.interval?;
    let parser = CronParser::new();
    let mut execute_at = parser.next_execute_time(self.execute_at, interval)?;
    if execute_at <= now {
      execute_at = parser.next_execute_time(now, interval)?;
    }
    let mut next = ScheduledTask::new(
      TaskKind::Interval,
      execute_at,
      self.callback_target.clone(),
      self.payload.clone(),
      Some(interval),
    );
    next.series_id = Some(self.series_id.unwrap_or(self.id));
    Some(next)
  }
}

/// JSON body POSTed to the callback target.
#[derive(Debug, Serialize, Deserialize)]
pub struct CallbackBody {
  pub task_id: Uuid,
  pub execute_at: DateTime<Utc>,
  pub payload: Payload,
}

impl From<&WheelEntry> for CallbackBody {
  fn from(entry: &WheelEntry) -> Self {
    Self {
      task_id: entry.id,
      execute_at: entry.execute_at,
      payload: entry.payload.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn payload() -> Payload {
    json!({"order_id": "ORD-123", "amount": 42}).as_object().cloned().unwrap()
  }

  #[test]
  fn record_survives_the_log_encoding() {
    let task = ScheduledTask::new(TaskKind::Delay, Utc::now(), "http://x/y".into(), payload(), None);
    let decoded = ScheduledTask::decode(&task.encode().unwrap()).unwrap();
    assert_eq!(decoded, task);
    assert_eq!(decoded.retry_count, 0);
  }

  #[test]
  fn overdue_tasks_have_no_remaining_delay() {
    let now = Utc::now();
    let mut task = ScheduledTask::new(TaskKind::Delay, now, "http://x/y".into(), Payload::new(), None);
    task.execute_at = now - chrono::Duration::seconds(30);
    assert_eq!(task.entry().remaining(now), Duration::ZERO);
    task.execute_at = now + chrono::Duration::seconds(30);
    assert_eq!(task.entry().remaining(now), Duration::from_secs(30));
  }

  #[test]
  fn successor_gets_a_fresh_id_and_keeps_cadence() {
    let now = Utc::now();
    let task = ScheduledTask::new(
      TaskKind::Interval,
      now + chrono::Duration::seconds(5),
      "http://x/y".into(),
      payload(),
      Some(Duration::from_secs(30)),
    );
    let next = task.entry().successor(now).unwrap();
    assert_ne!(next.id, task.id);
    assert_eq!(task.series_id, Some(task.id));
    assert_eq!(next.series_id, Some(task.id));
    assert_eq!(next.entry().successor(now).unwrap().series_id, Some(task.id));
    assert_eq!(next.execute_at, task.execute_at + chrono::Duration::seconds(30));
    assert_eq!(next.payload, task.payload);
    assert_eq!(next.kind, TaskKind::Interval);
  }

  #[test]
  fn late_successor_restarts_from_now() {
    let now = Utc::now();
    let mut task = ScheduledTask::new(TaskKind::Interval, now, "http://x/y".into(), Payload::new(), Some(Duration::from_secs(10)));
    task.execute_at = now - chrono::Duration::minutes(5);
    let next = task.entry().successor(now).unwrap();
    assert_eq!(next.execute_at, now + chrono::Duration::seconds(10));
  }

  #[test]
  fn one_shot_tasks_have_no_successor() {
    let task = ScheduledTask::new(TaskKind::Delay, Utc::now(), "http://x/y".into(), Payload::new(), None);
    assert!(task.series_id.is_none());
    assert!(task.entry().successor(Utc::now()).is_none());
  }
}
