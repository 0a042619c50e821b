use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the submission side of the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
  /// The request can never succeed as written (bad delay, target or interval).
  #[error("validation failed: {0}")]
  Validation(String),

  /// The durable log did not acknowledge the write; the task does not exist.
  #[error("durable log write failed: {0}")]
  Durability(#[from] LogError),

  /// The wheel refused an entry after it was durably logged.
  #[error("scheduling failed for task {id}: {source}")]
  Scheduling {
    id: Uuid,
    #[source]
    source: WheelError,
  },

  #[error("task not found: {0}")]
  NotFound(Uuid),

  #[error("record codec error: {0}")]
  Codec(#[from] serde_json::Error),
}

/// Errors raised by the timing wheel itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WheelError {
  #[error("delay spans {ticks} ticks, beyond what the wheel can count")]
  DelayOutOfRange { ticks: u128 },

  #[error("task {0} is already pending")]
  Duplicate(Uuid),
}

/// Failure of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
  /// 5xx, unexpected status, or a network-level failure.
  #[error("transient delivery failure: {0}")]
  Transient(String),

  /// 4xx: the target permanently rejected the request.
  #[error("callback rejected with status {0}")]
  Terminal(u16),

  #[error("callback attempt timed out after {0:?}")]
  Timeout(std::time::Duration),

  /// The callback body could not be built; retrying would not help.
  #[error("callback body could not be encoded: {0}")]
  Encode(String),
}

impl DeliveryError {
  pub fn is_retryable(&self) -> bool {
    matches!(self, DeliveryError::Transient(_) | DeliveryError::Timeout(_))
  }
}

/// Errors from a durable log backend.
#[derive(Debug, Error)]
pub enum LogError {
  #[error("broker error: {0}")]
  Broker(#[from] lapin::Error),

  #[error("broker negatively acknowledged the record")]
  NotConfirmed,

  /// Published with `mandatory` but no queue was bound to take it.
  #[error("no queue is bound to topic '{0}'; the record was returned")]
  Unroutable(String),

  #[error("log unavailable: {0}")]
  Unavailable(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
