use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::cron::parse_interval;

#[derive(Debug, Clone)]
pub struct Config {
  pub server_port: u16,
  /// Without a broker the service falls back to the in-memory log.
  pub rabbitmq_url: Option<String>,
  /// Without a database dead letters are only logged.
  pub database_url: Option<String>,
  pub demo_mode: bool,
  pub scheduler: SchedulerConfig,
  pub executor: ExecutorConfig,
}

#[derive(Debug, Clone)]
pub struct WheelConfig {
  pub slot_count: usize,
  pub tick_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
  pub wheel: WheelConfig,
  pub topic: String,
  pub group: String,
  /// Recovery ends once the log has been quiet this long.
  pub recovery_idle: Duration,
  pub max_concurrent_deliveries: usize,
  /// How long to remember a finished task whose log record has not arrived yet.
  pub settled_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
  pub callback_timeout: Duration,
  pub max_retries: u32,
  /// First backoff; each later one doubles it.
  pub retry_base_delay: Duration,
}

impl Default for WheelConfig {
  fn default() -> Self {
    Self {
      slot_count: 3600,
      tick_interval: Duration::from_secs(1),
    }
  }
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      wheel: WheelConfig::default(),
      topic: "scheduled_tasks".into(),
      group: "schedulers".into(),
      recovery_idle: Duration::from_millis(500),
      max_concurrent_deliveries: 256,
      settled_ttl: Duration::from_secs(3600),
    }
  }
}

impl Default for ExecutorConfig {
  fn default() -> Self {
    Self {
      callback_timeout: Duration::from_secs(30),
      max_retries: 3,
      retry_base_delay: Duration::from_secs(1),
    }
  }
}

impl Config {
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| env::var(key).ok())
  }

  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
    let scheduler_defaults = SchedulerConfig::default();
    let executor_defaults = ExecutorConfig::default();
    let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    let config = Self {
      server_port: number(&lookup, "SERVER_PORT", 8081)?,
      rabbitmq_url: non_empty("RABBITMQ_URL"),
      database_url: non_empty("DATABASE_URL"),
      demo_mode: lookup("DEMO_MODE").is_some_and(|v| v == "true" || v == "1"),
      scheduler: SchedulerConfig {
        wheel: WheelConfig {
          slot_count: number(&lookup, "WHEEL_SLOTS", scheduler_defaults.wheel.slot_count)?,
          tick_interval: duration(&lookup, "TICK_INTERVAL", scheduler_defaults.wheel.tick_interval)?,
        },
        topic: non_empty("LOG_TOPIC").unwrap_or(scheduler_defaults.topic),
        group: non_empty("LOG_GROUP").unwrap_or(scheduler_defaults.group),
        recovery_idle: duration(&lookup, "RECOVERY_IDLE", scheduler_defaults.recovery_idle)?,
        max_concurrent_deliveries: number(
          &lookup,
          "MAX_CONCURRENT_DELIVERIES",
          scheduler_defaults.max_concurrent_deliveries,
        )?,
        settled_ttl: duration(&lookup, "SETTLED_TTL", scheduler_defaults.settled_ttl)?,
      },
      executor: ExecutorConfig {
        callback_timeout: duration(&lookup, "CALLBACK_TIMEOUT", executor_defaults.callback_timeout)?,
        max_retries: number(&lookup, "MAX_RETRIES", executor_defaults.max_retries)?,
        retry_base_delay: duration(&lookup, "RETRY_BASE_DELAY", executor_defaults.retry_base_delay)?,
      },
    };

    if config.scheduler.wheel.slot_count == 0 {
      bail!("WHEEL_SLOTS must be at least 1");
    }
    if config.scheduler.max_concurrent_deliveries == 0 {
      bail!("MAX_CONCURRENT_DELIVERIES must be at least 1");
    }
    Ok(config)
  }
}

fn number<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
  T: FromStr,
  T::Err: Display,
{
  match lookup(key) {
    Some(raw) => raw.trim().parse().map_err(|e| anyhow::anyhow!("{key}: {e}")),
    None => Ok(default),
  }
}

fn duration(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Result<Duration> {
  match lookup(key) {
    Some(raw) => parse_interval(&raw).with_context(|| format!("{key} is not a valid interval")),
    None => Ok(default),
  }
}
