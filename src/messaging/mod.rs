//! Durable, replayable log the scheduler writes every accepted task to.
//!
//! `append` must not resolve until the record is crash-safe. `subscribe`
//! joins a consumer group: each record goes to exactly one member of the
//! group, and records that a member never acknowledged are handed to another
//! member once it goes away.

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::LogError;

pub mod memory;
pub mod rabbit;

pub use memory::MemoryLog;
pub use rabbit::RabbitLog;

pub type RecordStream = BoxStream<'static, Result<LogRecord, LogError>>;

#[async_trait]
pub trait DurableLog: Send + Sync {
  async fn append(&self, topic: &str, record: &[u8]) -> Result<(), LogError>;

  async fn subscribe(&self, topic: &str, group: &str) -> Result<RecordStream, LogError>;
}

#[async_trait]
pub trait Acknowledge: Send + Sync {
  async fn ack(&self) -> Result<(), LogError>;
}

/// A record delivered to a group member. Unacknowledged records are
/// redelivered after the member goes away.
pub struct LogRecord {
  data: Vec<u8>,
  redelivered: bool,
  acker: Box<dyn Acknowledge>,
}

impl LogRecord {
  pub fn new(data: Vec<u8>, redelivered: bool, acker: impl Acknowledge + 'static) -> Self {
    Self { data, redelivered, acker: Box::new(acker) }
  }

  pub fn data(&self) -> &[u8] {
    &self.data
  }

  pub fn redelivered(&self) -> bool {
    self.redelivered
  }

  pub async fn ack(self) -> Result<(), LogError> {
    self.acker.ack().await
  }
}

impl fmt::Debug for LogRecord {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LogRecord")
      .field("bytes", &self.data.len())
      .field("redelivered", &self.redelivered)
      .finish()
  }
}
