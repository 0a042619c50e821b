//! Durable submission path and tick loop.
//!
//! Every task is appended to the durable log and acknowledged by it before it
//! enters the wheel, so a task the caller was told about always survives a
//! crash. Its log record stays unacknowledged until the task reaches a
//! terminal state (or is cancelled); a restarted scheduler therefore gets every
//! unfinished task back from the log and reschedules it from its `execute_at`.
//!
//! The scheduler also consumes the log as a member of a consumer group, so its
//! own records come back to it. The ledger ties the two paths together: it
//! holds the unacknowledged record per task id and keeps one live wheel entry
//! per id no matter how often the record is delivered. When the subscription
//! ends (broker restart, channel closed) the scheduler joins the group again
//! and swaps the records it held for the copies the new subscription delivers.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::cron::CronParser;
use crate::error::{LogError, Result, SchedulerError, WheelError};
use crate::executor::{DeliveryOutcome, DeliveryStats, TaskExecutor};
use crate::messaging::{DurableLog, LogRecord, RecordStream};
use crate::models::{Payload, ScheduledTask, TaskKind, WheelEntry};
use crate::wheel::TimingWheel;

const RESUBSCRIBE_MAX_DELAY: Duration = Duration::from_secs(10);

/// Wall-clock time read off tokio's clock, so `execute_at` and the wheel's
/// tick count agree even when tokio time is paused or skewed.
#[derive(Debug, Clone, Copy)]
struct Clock {
  wall: DateTime<Utc>,
  mono: Instant,
}

impl Clock {
  fn new() -> Self {
    Self { wall: Utc::now(), mono: Instant::now() }
  }

  fn now(&self) -> DateTime<Utc> {
    chrono::Duration::from_std(self.mono.elapsed())
      .ok()
      .and_then(|elapsed| self.wall.checked_add_signed(elapsed))
      .unwrap_or_else(Utc::now)
  }
}

/// An unacknowledged record plus the subscription it arrived on.
struct Held {
  epoch: u64,
  record: LogRecord,
}

enum Ledger {
  /// In the wheel. Holds the log record once it has been delivered to us.
  Scheduled(Option<Held>),
  /// Fired and handed to the executor.
  InFlight(Option<Held>),
  /// Finished or cancelled. Kept for `settled_ttl` so late copies of its
  /// record are acknowledged rather than scheduled again.
  Settled,
}

struct State {
  wheel: TimingWheel,
  ledger: HashMap<Uuid, Ledger>,
  /// Interval series id to the id of its live occurrence.
  series: HashMap<Uuid, Uuid>,
  /// Cancelled series, kept for `settled_ttl` like settled ids.
  stopped: HashMap<Uuid, Instant>,
  settled: VecDeque<(Instant, Uuid)>,
  last_tick: Option<Instant>,
}

impl State {
  /// Inserts `entry` so it fires on the first tick at or after `execute_at`.
  fn schedule(&mut self, entry: WheelEntry, now: DateTime<Utc>) -> std::result::Result<(), WheelError> {
    let remaining = entry.remaining(now);
    // the wheel counts from the last tick, not from now
    let since_tick = self.last_tick.map_or(Duration::ZERO, |at| at.elapsed());
    let occurrence = entry.series_id.map(|series| (series, entry.id));
    self.wheel.add_task(entry, remaining.saturating_add(since_tick))?;
    if let Some((series, id)) = occurrence {
      self.series.insert(series, id);
    }
    Ok(())
  }

  fn is_stopped(&self, series: Option<Uuid>) -> bool {
    series.is_some_and(|series| self.stopped.contains_key(&series))
  }

  fn settle(&mut self, id: Uuid) -> Option<LogRecord> {
    let held = match self.ledger.insert(id, Ledger::Settled) {
      Some(Ledger::Scheduled(held) | Ledger::InFlight(held)) => held,
      _ => None,
    };
    self.settled.push_back((Instant::now(), id));
    held.map(|held| held.record)
  }

  /// Resolves `id` as either a series id or the id of a series' live
  /// occurrence.
  fn series_of(&self, id: Uuid) -> Option<Uuid> {
    if self.series.contains_key(&id) {
      return Some(id);
    }
    self.series.iter().find_map(|(series, live)| (*live == id).then_some(*series))
  }

  fn expire_settled(&mut self, ttl: Duration) {
    while let Some((at, id)) = self.settled.front().copied() {
      if at.elapsed() < ttl {
        break;
      }
      self.settled.pop_front();
      if matches!(self.ledger.get(&id), Some(Ledger::Settled)) {
        self.ledger.remove(&id);
      }
    }
    if !self.stopped.is_empty() {
      self.stopped.retain(|_, at| at.elapsed() < ttl);
    }
  }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SchedulerStats {
  pub pending_tasks: usize,
  pub delivery: DeliveryStats,
}

struct Shared {
  state: Mutex<State>,
  log: Arc<dyn DurableLog>,
  executor: Arc<TaskExecutor>,
  config: SchedulerConfig,
  clock: Clock,
  tick: Duration,
  max_delay: Duration,
  epoch: AtomicU64,
  deliveries: Arc<Semaphore>,
  delivery_permits: u32,
}

pub struct TaskScheduler {
  shared: Arc<Shared>,
  shutdown: watch::Sender<bool>,
  consumer: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TaskScheduler {
  pub fn new(config: SchedulerConfig, log: Arc<dyn DurableLog>, executor: Arc<TaskExecutor>) -> Self {
    let wheel = TimingWheel::new(config.wheel.slot_count, config.wheel.tick_interval);
    let tick = wheel.tick_interval();
    let max_delay = wheel.max_delay();
    let delivery_permits = u32::try_from(config.max_concurrent_deliveries.max(1)).unwrap_or(u32::MAX);
    let (shutdown, _) = watch::channel(false);

    Self {
      shared: Arc::new(Shared {
        state: Mutex::new(State {
          wheel,
          ledger: HashMap::new(),
          series: HashMap::new(),
          stopped: HashMap::new(),
          settled: VecDeque::new(),
          last_tick: None,
        }),
        log,
        executor,
        config,
        clock: Clock::new(),
        tick,
        max_delay,
        epoch: AtomicU64::new(0),
        deliveries: Arc::new(Semaphore::new(delivery_permits as usize)),
        delivery_permits,
      }),
      shutdown,
      consumer: std::sync::Mutex::new(None),
    }
  }

  /// Schedules a one-shot callback `delay` from now.
  pub async fn add_delay_task(&self, delay: Duration, callback_target: String, payload: Payload) -> Result<ScheduledTask> {
    if delay.is_zero() {
      return Err(SchedulerError::Validation("delay must be positive".into()));
    }
    let task = self.shared.build(TaskKind::Delay, delay, callback_target, payload, None)?;
    self.shared.submit(&task).await?;
    info!(task_id = %task.id, execute_at = %task.execute_at, delay = ?delay, "delay task scheduled");
    Ok(task)
  }

  /// Schedules a callback every `expr` (e.g. `30s`, `5m`), first firing one
  /// interval from now. The returned id names the whole series.
  pub async fn add_interval_task(&self, expr: &str, callback_target: String, payload: Payload) -> Result<ScheduledTask> {
    let interval = CronParser::new()
      .parse_interval(expr)
      .map_err(|e| SchedulerError::Validation(e.to_string()))?;
    let task = self.shared.build(TaskKind::Interval, interval, callback_target, payload, Some(interval))?;
    self.shared.submit(&task).await?;
    info!(task_id = %task.id, execute_at = %task.execute_at, interval = ?interval, "interval task scheduled");
    Ok(task)
  }

  /// Stops a pending task, or a whole interval series when `id` is the
  /// series id or one of its occurrences. Returns the id of the occurrence
  /// that was stopped.
  pub async fn cancel_task(&self, id: Uuid) -> Result<Uuid> {
    let (live, record) = {
      let mut state = self.shared.state.lock().await;
      let series = state.series_of(id);
      let live = series.and_then(|series| state.series.get(&series).copied()).unwrap_or(id);
      let removed = state.wheel.remove(&live).is_some();
      if !removed && series.is_none() {
        return Err(SchedulerError::NotFound(id));
      }
      if let Some(series) = series {
        // an occurrence being delivered right now finishes without a successor
        state.series.remove(&series);
        state.stopped.insert(series, Instant::now());
      }
      let record = if removed { state.settle(live) } else { None };
      (live, record)
    };
    if let Some(record) = record {
      if let Err(e) = record.ack().await {
        warn!(task_id = %live, error = %e, "could not acknowledge cancelled task; it may come back after a restart");
      }
    }
    info!(task_id = %id, occurrence = %live, "task cancelled");
    Ok(live)
  }

  /// Joins the log's consumer group and reinserts every unfinished task it
  /// hands over, stopping once the log has been idle for `recovery_idle`.
  /// Consumption continues in the background afterwards. Call before `start`.
  pub async fn recover(&self) -> Result<usize> {
    let config = &self.shared.config;
    let mut records = self.shared.log.subscribe(&config.topic, &config.group).await?;
    let epoch = self.shared.next_epoch();

    let mut recovered = 0;
    loop {
      match timeout(config.recovery_idle, records.next()).await {
        Ok(Some(Ok(record))) => {
          if self.shared.ingest(record, epoch).await {
            recovered += 1;
          }
        }
        Ok(Some(Err(e))) => return Err(SchedulerError::Durability(e)),
        Ok(None) => {
          warn!("durable log closed the subscription during recovery");
          break;
        }
        Err(_) => break,
      }
    }
    info!(recovered, pending = self.get_task_count().await, "recovery complete");

    let shared = Arc::clone(&self.shared);
    let handle = tokio::spawn(async move { shared.consume(records, epoch).await });
    let previous = match self.consumer.lock() {
      Ok(mut slot) => slot.replace(handle),
      Err(poisoned) => poisoned.into_inner().replace(handle),
    };
    if let Some(previous) = previous {
      previous.abort();
    }
    Ok(recovered)
  }

  /// Runs the tick loop until `stop` is called, then waits for in-flight
  /// deliveries to finish.
  pub async fn start(&self) {
    let mut shutdown = self.shutdown.subscribe();
    if *shutdown.borrow() {
      return;
    }

    let tick = self.shared.tick;
    let started = Instant::now();
    self.shared.state.lock().await.last_tick = Some(started);
    let mut ticker = interval_at(started + tick, tick);
    info!(slots = self.shared.config.wheel.slot_count, tick = ?tick, "tick loop started");

    loop {
      tokio::select! {
        at = ticker.tick() => self.shared.advance(at).await,
        changed = shutdown.changed() => {
          if changed.is_err() || *shutdown.borrow() {
            break;
          }
        }
      }
    }

    info!("tick loop stopped, waiting for in-flight deliveries");
    if let Ok(permits) = self.shared.deliveries.acquire_many(self.shared.delivery_permits).await {
      drop(permits);
    }
    info!("scheduler stopped");
  }

  /// Stops ticking. Deliveries already running are left to finish.
  pub fn stop(&self) {
    self.shutdown.send_replace(true);
  }

  pub async fn get_task_count(&self) -> usize {
    self.shared.state.lock().await.wheel.size()
  }

  pub async fn stats(&self) -> SchedulerStats {
    SchedulerStats {
      pending_tasks: self.get_task_count().await,
      delivery: self.shared.executor.stats(),
    }
  }
}

impl Drop for TaskScheduler {
  fn drop(&mut self) {
    let handle = match self.consumer.get_mut() {
      Ok(slot) => slot.take(),
      Err(poisoned) => poisoned.into_inner().take(),
    };
    if let Some(handle) = handle {
      handle.abort();
    }
  }
}

impl Shared {
  fn build(
    &self,
    kind: TaskKind,
    delay: Duration,
    callback_target: String,
    payload: Payload,
    interval: Option<Duration>,
  ) -> Result<ScheduledTask> {
    validate_target(&callback_target)?;
    if delay > self.max_delay {
      return Err(SchedulerError::Validation(format!(
        "delay {delay:?} exceeds the longest supported delay of {:?}",
        self.max_delay
      )));
    }
    let execute_at = CronParser::new()
      .next_execute_time(self.clock.now(), delay)
      .ok_or_else(|| SchedulerError::Validation(format!("delay {delay:?} is out of range")))?;
    Ok(ScheduledTask::new(kind, execute_at, callback_target, payload, interval))
  }

  fn next_epoch(&self) -> u64 {
    self.epoch.fetch_add(1, Ordering::Relaxed) + 1
  }

  /// Log first, wheel second. A failed append leaves the wheel untouched.
  /// Returns `false` when the task belongs to a series that was cancelled
  /// while it was being written.
  async fn submit(&self, task: &ScheduledTask) -> Result<bool> {
    let record = task.encode()?;
    self.log.append(&self.config.topic, &record).await.map_err(|e| {
      error!(task_id = %task.id, error = %e, "durable log rejected task");
      SchedulerError::Durability(e)
    })?;

    let mut state = self.state.lock().await;
    if state.is_stopped(task.series_id) {
      // its record is acknowledged when the log hands it back
      state.settle(task.id);
      return Ok(false);
    }
    if state.ledger.contains_key(&task.id) {
      // the log already handed the record back and it was scheduled from there
      return Ok(true);
    }
    if let Err(source) = state.schedule(task.entry(), self.clock.now()) {
      error!(task_id = %task.id, error = %source, "logged task could not enter the wheel; it will be recovered on restart");
      return Err(SchedulerError::Scheduling { id: task.id, source });
    }
    state.ledger.insert(task.id, Ledger::Scheduled(None));
    Ok(true)
  }

  /// Takes one record from the log. Returns whether it added a wheel entry.
  async fn ingest(&self, record: LogRecord, epoch: u64) -> bool {
    let task = match ScheduledTask::decode(record.data()) {
      Ok(task) => task,
      Err(e) => {
        error!(error = %e, bytes = record.data().len(), "discarding undecodable log record");
        if let Err(e) = record.ack().await {
          warn!(error = %e, "could not acknowledge undecodable record");
        }
        return false;
      }
    };

    let mut state = self.state.lock().await;
    let stopped = state.is_stopped(task.series_id);
    let surplus = match state.ledger.get_mut(&task.id) {
      Some(Ledger::Settled) => record,
      Some(Ledger::Scheduled(held) | Ledger::InFlight(held)) => {
        if held.as_ref().is_some_and(|current| current.epoch >= epoch) {
          record
        } else {
          // a record held from an ended subscription can no longer be acknowledged
          *held = Some(Held { epoch, record });
          return false;
        }
      }
      None if stopped => record,
      None => {
        return match state.schedule(task.entry(), self.clock.now()) {
          Ok(()) => {
            debug!(
              task_id = %task.id,
              execute_at = %task.execute_at,
              redelivered = record.redelivered(),
              "task restored from log"
            );
            state.ledger.insert(task.id, Ledger::Scheduled(Some(Held { epoch, record })));
            true
          }
          Err(e) => {
            error!(task_id = %task.id, error = %e, "task from log could not enter the wheel");
            false
          }
        };
      }
    };
    drop(state);

    // finished already, or another copy of a record we hold
    debug!(task_id = %task.id, "acknowledging surplus record");
    if let Err(e) = surplus.ack().await {
      warn!(task_id = %task.id, error = %e, "could not acknowledge surplus record");
    }
    false
  }

  async fn consume(self: Arc<Self>, mut records: RecordStream, mut epoch: u64) {
    loop {
      while let Some(next) = records.next().await {
        match next {
          Ok(record) => {
            self.ingest(record, epoch).await;
          }
          Err(e) => error!(error = %e, "durable log subscription error"),
        }
      }
      drop(records);
      warn!(epoch, "durable log subscription ended, joining the group again");
      records = match self.resubscribe().await {
        Ok(records) => records,
        Err(e) => {
          error!(error = %e, "could not rejoin the durable log; unfinished tasks are recovered on restart");
          return;
        }
      };
      epoch = self.next_epoch();
      info!(epoch, "durable log subscription restored");
    }
  }

  async fn resubscribe(&self) -> std::result::Result<RecordStream, LogError> {
    let backoff = ExponentialBackoff::from_millis(2).factor(50).max_delay(RESUBSCRIBE_MAX_DELAY);
    Retry::spawn(backoff, move || async move {
      self.log.subscribe(&self.config.topic, &self.config.group).await.inspect_err(|e| {
        warn!(error = %e, "durable log subscribe failed, retrying");
      })
    })
    .await
  }

  async fn advance(self: &Arc<Self>, at: Instant) {
    let due = {
      let mut state = self.state.lock().await;
      state.last_tick = Some(at);
      let due = state.wheel.tick();
      for entry in &due {
        if let Some(slot) = state.ledger.get_mut(&entry.id) {
          if let Ledger::Scheduled(held) = slot {
            *slot = Ledger::InFlight(held.take());
          }
        }
      }
      state.expire_settled(self.config.settled_ttl);
      due
    };

    if !due.is_empty() {
      debug!(count = due.len(), "tasks due");
    }
    for entry in due {
      self.dispatch(entry);
    }
  }

  fn dispatch(self: &Arc<Self>, entry: WheelEntry) {
    let shared = Arc::clone(self);
    // take a permit up front when one is free so `start` can drain it
    let ready = self.deliveries.clone().try_acquire_owned().ok();
    tokio::spawn(async move {
      let permit = match ready {
        Some(permit) => Ok(permit),
        None => shared.deliveries.clone().acquire_owned().await,
      };
      let Ok(_permit) = permit else {
        warn!(task_id = %entry.id, "delivery pool closed; task left for recovery");
        return;
      };
      let outcome = shared.executor.execute(&entry).await;
      shared.finish(entry, outcome).await;
    });
  }

  async fn finish(&self, entry: WheelEntry, outcome: DeliveryOutcome) {
    debug!(task_id = %entry.id, attempts = outcome.attempts(), delivered = outcome.is_delivered(), "task finished");

    let cancelled = self.state.lock().await.is_stopped(entry.series_id);
    // the successor must be durable before the finished record is released
    match entry.successor(self.clock.now()) {
      Some(next) if !cancelled => match self.submit(&next).await {
        Ok(true) => info!(task_id = %entry.id, next_task_id = %next.id, execute_at = %next.execute_at, "interval task rescheduled"),
        Ok(false) => info!(task_id = %entry.id, "interval series cancelled while rescheduling"),
        Err(e) => {
          error!(task_id = %entry.id, error = %e, "could not reschedule interval task; leaving it unacknowledged");
          return;
        }
      },
      Some(_) => info!(task_id = %entry.id, "interval series cancelled; not rescheduled"),
      None => {}
    }

    let record = {
      let mut state = self.state.lock().await;
      if let Some(series) = entry.series_id {
        if state.series.get(&series) == Some(&entry.id) {
          state.series.remove(&series);
        }
      }
      state.settle(entry.id)
    };
    if let Some(record) = record {
      if let Err(e) = record.ack().await {
        warn!(task_id = %entry.id, error = %e, "could not acknowledge finished task; it may be delivered again");
      }
    }
  }
}

fn validate_target(target: &str) -> Result<()> {
  let target = target.trim();
  if target.is_empty() {
    return Err(SchedulerError::Validation("callback_target is required".into()));
  }
  let url = reqwest::Url::parse(target)
    .map_err(|e| SchedulerError::Validation(format!("callback_target is not a valid URL: {e}")))?;
  match url.scheme() {
    "http" | "https" => Ok(()),
    other => Err(SchedulerError::Validation(format!("unsupported callback scheme '{other}'"))),
  }
}
