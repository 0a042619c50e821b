use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{error, info, warn};

use dtsched::config::Config;
use dtsched::database::setup_database;
use dtsched::dead_letter::{DeadLetterSink, LogSink, PgSink};
use dtsched::executor::{HttpTransport, TaskExecutor};
use dtsched::messaging::{DurableLog, MemoryLog, RabbitLog};
use dtsched::routes::routes;
use dtsched::scheduler::TaskScheduler;

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();
  let config = Config::from_env()?;

  let log: Arc<dyn DurableLog> = match &config.rabbitmq_url {
    Some(url) => Arc::new(RabbitLog::connect(url).await?),
    None => {
      warn!("RABBITMQ_URL is not set, using the in-memory log; tasks will not survive a restart");
      Arc::new(MemoryLog::new())
    }
  };

  let dead_letters: Arc<dyn DeadLetterSink> = match &config.database_url {
    Some(url) => Arc::new(PgSink::new(setup_database(url).await?)),
    None => {
      info!("DATABASE_URL is not set, dead letters are only logged");
      Arc::new(LogSink)
    }
  };

  let transport = HttpTransport::new(config.executor.callback_timeout).context("failed to build the HTTP client")?;
  let executor = Arc::new(TaskExecutor::new(config.executor.clone(), Arc::new(transport), dead_letters));
  let scheduler = Arc::new(TaskScheduler::new(config.scheduler.clone(), log, executor));

  let recovered = scheduler.recover().await.context("failed to recover tasks from the durable log")?;
  info!(recovered, "scheduler ready");

  let ticking = {
    let scheduler = scheduler.clone();
    tokio::spawn(async move { scheduler.start().await })
  };

  if config.demo_mode {
    tokio::spawn(demo_tasks(scheduler.clone()));
  }

  let (addr, server) = warp::serve(routes(scheduler.clone()))
    .try_bind_with_graceful_shutdown(([0, 0, 0, 0], config.server_port), async {
      if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
      }
    })
    .with_context(|| format!("failed to bind port {}", config.server_port))?;
  info!(%addr, "listening");
  server.await;

  info!("shutting down");
  scheduler.stop();
  if let Err(e) = ticking.await {
    error!(error = %e, "tick loop panicked");
  }
  Ok(())
}

async fn demo_tasks(scheduler: Arc<TaskScheduler>) {
  tokio::time::sleep(Duration::from_secs(2)).await;
  info!("demo mode: scheduling sample tasks");

  for (name, secs) in [("demo-task-1", 10), ("demo-task-2", 30)] {
    let payload = json!({ "task_name": name, "message": format!("runs after {secs}s") });
    let payload = payload.as_object().cloned().unwrap_or_default();
    match scheduler.add_delay_task(Duration::from_secs(secs), "http://httpbin.org/post".into(), payload).await {
      Ok(task) => info!(task_id = %task.id, delay_secs = secs, "demo task scheduled"),
      Err(e) => error!(error = %e, "demo task failed"),
    }
  }
}
