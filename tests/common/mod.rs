#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use dtsched::config::{ExecutorConfig, SchedulerConfig, WheelConfig};
use dtsched::dead_letter::MemorySink;
use dtsched::executor::{CallbackTransport, TaskExecutor};
use dtsched::messaging::MemoryLog;
use dtsched::models::Payload;
use dtsched::scheduler::TaskScheduler;

pub const TOPIC: &str = "scheduled_tasks";
pub const GROUP: &str = "schedulers";

#[derive(Debug, Clone)]
pub struct Call {
  pub target: String,
  pub task_id: Uuid,
  pub body: Value,
  pub at: Instant,
}

/// Answers every callback with the next scripted status, then 200.
#[derive(Default)]
pub struct RecordingTransport {
  calls: Mutex<Vec<Call>>,
  statuses: Mutex<VecDeque<u16>>,
  fallback: Mutex<Option<u16>>,
}

impl RecordingTransport {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn answering(status: u16) -> Arc<Self> {
    let transport = Self::default();
    *transport.fallback.lock().unwrap() = Some(status);
    Arc::new(transport)
  }

  pub fn calls(&self) -> Vec<Call> {
    self.calls.lock().unwrap().clone()
  }

  pub fn calls_for(&self, task_id: Uuid) -> usize {
    self.calls.lock().unwrap().iter().filter(|c| c.task_id == task_id).count()
  }
}

#[async_trait]
impl CallbackTransport for RecordingTransport {
  async fn post(&self, target: &str, task_id: Uuid, body: &[u8]) -> Result<u16, String> {
    let body = serde_json::from_slice(body).map_err(|e| e.to_string())?;
    self.calls.lock().unwrap().push(Call { target: target.to_string(), task_id, body, at: Instant::now() });
    let scripted = self.statuses.lock().unwrap().pop_front();
    let fallback = *self.fallback.lock().unwrap();
    Ok(scripted.or(fallback).unwrap_or(200))
  }
}

pub fn scheduler_config(tick: Duration) -> SchedulerConfig {
  SchedulerConfig {
    wheel: WheelConfig { slot_count: 60, tick_interval: tick },
    recovery_idle: Duration::from_millis(100),
    ..SchedulerConfig::default()
  }
}

pub fn executor_config() -> ExecutorConfig {
  ExecutorConfig {
    callback_timeout: Duration::from_secs(5),
    max_retries: 3,
    retry_base_delay: Duration::from_secs(1),
  }
}

pub struct Fixture {
  pub scheduler: Arc<TaskScheduler>,
  pub log: MemoryLog,
  pub transport: Arc<RecordingTransport>,
  pub dead_letters: Arc<MemorySink>,
}

impl Fixture {
  pub fn new() -> Self {
    Self::with(MemoryLog::new(), RecordingTransport::new(), Duration::from_secs(1))
  }

  pub fn on_log(log: MemoryLog) -> Self {
    Self::with(log, RecordingTransport::new(), Duration::from_secs(1))
  }

  pub fn with(log: MemoryLog, transport: Arc<RecordingTransport>, tick: Duration) -> Self {
    let dead_letters = Arc::new(MemorySink::new());
    let executor = Arc::new(TaskExecutor::new(executor_config(), transport.clone(), dead_letters.clone()));
    let scheduler = Arc::new(TaskScheduler::new(scheduler_config(tick), Arc::new(log.clone()), executor));
    Self { scheduler, log, transport, dead_letters }
  }

  pub fn start(&self) -> JoinHandle<()> {
    let scheduler = self.scheduler.clone();
    tokio::spawn(async move { scheduler.start().await })
  }

  pub async fn shutdown(self, ticking: JoinHandle<()>) {
    self.scheduler.stop();
    ticking.await.unwrap();
  }
}

pub fn payload(order_id: &str) -> Payload {
  json!({ "order_id": order_id, "action": "cancel_unpaid" }).as_object().cloned().unwrap()
}

/// Lets background consumers catch up without moving far on a paused clock.
pub async fn settle() {
  tokio::time::sleep(Duration::from_millis(10)).await;
}
