//! Callback delivery for fired tasks.
//!
//! Every fired task gets up to `max_retries + 1` attempts. Attempts are spaced
//! by `base * 2^(n-1)` and each one has its own timeout. 2xx is success, 4xx
//! ends delivery at once, anything else is retried. Tasks that end without a
//! success go to the dead-letter sink.
//!
//! Delivery is at-least-once: a target may see the same `X-Task-ID` more than
//! once and has to treat repeats as no-ops.

use std::iter;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use tokio::time::timeout;
use tokio_retry::RetryIf;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ExecutorConfig;
use crate::dead_letter::{DeadLetter, DeadLetterSink, FailureReason};
use crate::error::DeliveryError;
use crate::models::{CallbackBody, WheelEntry};

pub const TASK_ID_HEADER: &str = "X-Task-ID";

#[async_trait]
pub trait CallbackTransport: Send + Sync {
  /// POSTs `body` to `target`, returning the response status. `Err` means no
  /// response was received.
  async fn post(&self, target: &str, task_id: Uuid, body: &[u8]) -> Result<u16, String>;
}

pub struct HttpTransport {
  client: reqwest::Client,
}

impl HttpTransport {
  pub fn new(timeout: Duration) -> reqwest::Result<Self> {
    Ok(Self { client: reqwest::Client::builder().timeout(timeout).build()? })
  }
}

#[async_trait]
impl CallbackTransport for HttpTransport {
  async fn post(&self, target: &str, task_id: Uuid, body: &[u8]) -> Result<u16, String> {
    let response = self
      .client
      .post(target)
      .header(CONTENT_TYPE, "application/json")
      .header(TASK_ID_HEADER, task_id.to_string())
      .body(body.to_vec())
      .send()
      .await
      .map_err(|e| e.to_string())?;
    Ok(response.status().as_u16())
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
  Delivered { attempts: u32 },
  Rejected { attempts: u32, error: DeliveryError },
  Exhausted { attempts: u32, error: DeliveryError },
}

impl DeliveryOutcome {
  pub fn attempts(&self) -> u32 {
    match self {
      DeliveryOutcome::Delivered { attempts }
      | DeliveryOutcome::Rejected { attempts, .. }
      | DeliveryOutcome::Exhausted { attempts, .. } => *attempts,
    }
  }

  pub fn is_delivered(&self) -> bool {
    matches!(self, DeliveryOutcome::Delivered { .. })
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
  pub attempts: u64,
  pub delivered: u64,
  pub rejected: u64,
  pub exhausted: u64,
}

#[derive(Debug, Default)]
struct Counters {
  attempts: AtomicU64,
  delivered: AtomicU64,
  rejected: AtomicU64,
  exhausted: AtomicU64,
}

/// Maps a callback response status onto the delivery rules.
pub fn classify(status: u16) -> Result<(), DeliveryError> {
  match status {
    200..=299 => Ok(()),
    400..=499 => Err(DeliveryError::Terminal(status)),
    other => Err(DeliveryError::Transient(format!("HTTP {other}"))),
  }
}

pub struct TaskExecutor {
  config: ExecutorConfig,
  transport: Arc<dyn CallbackTransport>,
  dead_letters: Arc<dyn DeadLetterSink>,
  counters: Counters,
}

impl TaskExecutor {
  pub fn new(
    config: ExecutorConfig,
    transport: Arc<dyn CallbackTransport>,
    dead_letters: Arc<dyn DeadLetterSink>,
  ) -> Self {
    Self { config, transport, dead_letters, counters: Counters::default() }
  }

  pub fn stats(&self) -> DeliveryStats {
    DeliveryStats {
      attempts: self.counters.attempts.load(Ordering::Relaxed),
      delivered: self.counters.delivered.load(Ordering::Relaxed),
      rejected: self.counters.rejected.load(Ordering::Relaxed),
      exhausted: self.counters.exhausted.load(Ordering::Relaxed),
    }
  }

  /// Pauses between attempts: base, 2x base, 4x base, ...
  pub fn backoff(&self) -> impl Iterator<Item = Duration> {
    iter::successors(Some(self.config.retry_base_delay), |delay| delay.checked_mul(2))
      .take(self.config.max_retries as usize)
  }

  /// Runs one full delivery cycle for a fired task.
  pub async fn execute(&self, entry: &WheelEntry) -> DeliveryOutcome {
    info!(task_id = %entry.id, target = %entry.callback_target, "executing task");

    let attempts = AtomicU32::new(0);
    let result = match serde_json::to_vec(&CallbackBody::from(entry)) {
      Ok(body) => {
        let body = body.as_slice();
        let attempts = &attempts;
        RetryIf::spawn(
          self.backoff(),
          move || self.attempt(entry, body, attempts),
          |error: &DeliveryError| error.is_retryable(),
        )
          .await
      }
      Err(e) => Err(DeliveryError::Encode(e.to_string())),
    };
    let attempts = attempts.into_inner();

    let error = match result {
      Ok(()) => {
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        info!(task_id = %entry.id, attempts, "task delivered");
        return DeliveryOutcome::Delivered { attempts };
      }
      Err(error) => error,
    };

    let (reason, outcome) = if error.is_retryable() {
      self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
      error!(task_id = %entry.id, attempts, error = %error, "retries exhausted, task failed");
      (FailureReason::Exhausted, DeliveryOutcome::Exhausted { attempts, error: error.clone() })
    } else {
      self.counters.rejected.fetch_add(1, Ordering::Relaxed);
      error!(task_id = %entry.id, attempts, error = %error, "task failed without retry");
      (FailureReason::Rejected, DeliveryOutcome::Rejected { attempts, error: error.clone() })
    };

    let letter = DeadLetter::new(entry, reason, attempts, error.to_string());
    if let Err(e) = self.dead_letters.record(&letter).await {
      error!(
        task_id = %entry.id,
        target = %entry.callback_target,
        execute_at = %entry.execute_at,
        payload = %serde_json::Value::Object(entry.payload.clone()),
        last_error = %letter.last_error,
        error = %e,
        "could not write dead letter"
      );
    }
    outcome
  }

  async fn attempt(&self, entry: &WheelEntry, body: &[u8], attempts: &AtomicU32) -> Result<(), DeliveryError> {
    let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
    self.counters.attempts.fetch_add(1, Ordering::Relaxed);

    let limit = self.config.callback_timeout;
    let result = match timeout(limit, self.transport.post(&entry.callback_target, entry.id, body)).await {
      Err(_) => Err(DeliveryError::Timeout(limit)),
      Ok(Err(e)) => Err(DeliveryError::Transient(e)),
      Ok(Ok(status)) => classify(status),
    };

    match &result {
      Ok(()) => debug!(task_id = %entry.id, attempt, "callback accepted"),
      Err(e) => warn!(
        task_id = %entry.id,
        attempt,
        max_attempts = self.config.max_retries + 1,
        error = %e,
        "callback attempt failed"
      ),
    }
    result
  }
}
