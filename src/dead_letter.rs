//! Where tasks go when delivery gives up on them.

use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tracing::error;
use uuid::Uuid;

use crate::models::{Payload, WheelEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
  /// The target answered with a permanent (4xx) error.
  Rejected,
  /// Every attempt failed with a retryable error.
  Exhausted,
}

impl FailureReason {
  pub fn as_str(&self) -> &'static str {
    match self {
      FailureReason::Rejected => "rejected",
      FailureReason::Exhausted => "exhausted",
    }
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
  pub task_id: Uuid,
  pub callback_target: String,
  pub execute_at: DateTime<Utc>,
  pub payload: Payload,
  pub reason: FailureReason,
  pub attempts: u32,
  /// Attempts after the first.
  pub retry_count: u32,
  pub last_error: String,
  pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
  pub fn new(entry: &WheelEntry, reason: FailureReason, attempts: u32, last_error: String) -> Self {
    Self {
      task_id: entry.id,
      callback_target: entry.callback_target.clone(),
      execute_at: entry.execute_at,
      payload: entry.payload.clone(),
      reason,
      attempts,
      retry_count: attempts.saturating_sub(1),
      last_error,
      failed_at: Utc::now(),
    }
  }
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
  async fn record(&self, letter: &DeadLetter) -> Result<()>;
}

/// Keeps dead letters only in the service log.
pub struct LogSink;

#[async_trait]
impl DeadLetterSink for LogSink {
  async fn record(&self, letter: &DeadLetter) -> Result<()> {
    error!(
      task_id = %letter.task_id,
      target = %letter.callback_target,
      reason = letter.reason.as_str(),
      attempts = letter.attempts,
      retry_count = letter.retry_count,
      last_error = %letter.last_error,
      payload = %serde_json::Value::Object(letter.payload.clone()),
      "dead letter"
    );
    Ok(())
  }
}

/// Stores dead letters in Postgres for later inspection and replay.
pub struct PgSink {
  pool: PgPool,
}

impl PgSink {
  pub fn new(pool: PgPool) -> Self {
    Self { pool }
  }
}

#[async_trait]
impl DeadLetterSink for PgSink {
  async fn record(&self, letter: &DeadLetter) -> Result<()> {
    sqlx::query(
      "INSERT INTO dead_letters (task_id, callback_target, execute_at, payload, reason, attempts, retry_count, last_error, failed_at)
       VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
      .bind(letter.task_id)
      .bind(&letter.callback_target)
      .bind(letter.execute_at)
      .bind(serde_json::Value::Object(letter.payload.clone()))
      .bind(letter.reason.as_str())
      .bind(i32::try_from(letter.attempts).unwrap_or(i32::MAX))
      .bind(i32::try_from(letter.retry_count).unwrap_or(i32::MAX))
      .bind(&letter.last_error)
      .bind(letter.failed_at)
      .execute(&self.pool)
      .await?;
    Ok(())
  }
}

/// Collects dead letters in memory.
#[derive(Default)]
pub struct MemorySink {
  letters: Mutex<Vec<DeadLetter>>,
}

impl MemorySink {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn letters(&self) -> Vec<DeadLetter> {
    self.letters.lock().map(|l| l.clone()).unwrap_or_default()
  }
}

#[async_trait]
impl DeadLetterSink for MemorySink {
  async fn record(&self, letter: &DeadLetter) -> Result<()> {
    self
      .letters
      .lock()
      .map_err(|_| anyhow::anyhow!("dead letter store poisoned"))?
      .push(letter.clone());
    Ok(())
  }
}
