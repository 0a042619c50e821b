use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;
use warp::http::StatusCode;
use warp::{Filter, Reply};

use crate::error::SchedulerError;
use crate::models::{Payload, ScheduledTask};
use crate::routes::{error_reply, with_scheduler};
use crate::scheduler::TaskScheduler;

#[derive(Debug, Deserialize)]
pub struct NewDelayTask {
  pub delay_seconds: Option<i64>,
  #[serde(alias = "callback_url")]
  pub callback_target: Option<String>,
  #[serde(default, alias = "data")]
  pub payload: Option<Payload>,
}

#[derive(Debug, Deserialize)]
pub struct NewIntervalTask {
  pub interval: Option<String>,
  #[serde(alias = "callback_url")]
  pub callback_target: Option<String>,
  #[serde(default, alias = "data")]
  pub payload: Option<Payload>,
}

#[derive(Debug, Serialize)]
pub struct TaskResponse {
  pub success: bool,
  pub task_id: Uuid,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub execute_at: Option<DateTime<Utc>>,
  pub status: &'static str,
}

impl TaskResponse {
  fn scheduled(task: &ScheduledTask) -> Self {
    Self {
      success: true,
      task_id: task.id,
      execute_at: Some(task.execute_at),
      status: "scheduled",
    }
  }
}

pub fn delay_route(
  scheduler: Arc<TaskScheduler>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("tasks" / "delay")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_scheduler(scheduler))
    .and_then(handle_delay_task)
}

pub fn interval_route(
  scheduler: Arc<TaskScheduler>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("tasks" / "interval")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_scheduler(scheduler))
    .and_then(handle_interval_task)
}

pub fn cancel_route(
  scheduler: Arc<TaskScheduler>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("tasks" / Uuid)
    .and(warp::delete())
    .and(with_scheduler(scheduler))
    .and_then(handle_cancel_task)
}

async fn handle_delay_task(
  request: NewDelayTask,
  scheduler: Arc<TaskScheduler>,
) -> Result<warp::reply::Response, Infallible> {
  let delay = match request.delay_seconds {
    Some(secs) if secs > 0 => Duration::from_secs(secs.unsigned_abs()),
    Some(_) => return Ok(validation_failed("delay_seconds must be a positive integer")),
    None => return Ok(validation_failed("delay_seconds is required")),
  };
  let Some(callback_target) = request.callback_target else {
    return Ok(validation_failed("callback_target is required"));
  };

  let result = scheduler
    .add_delay_task(delay, callback_target, request.payload.unwrap_or_default())
    .await;
  Ok(match result {
    Ok(task) => warp::reply::json(&TaskResponse::scheduled(&task)).into_response(),
    Err(e) => scheduler_error(e),
  })
}

async fn handle_interval_task(
  request: NewIntervalTask,
  scheduler: Arc<TaskScheduler>,
) -> Result<warp::reply::Response, Infallible> {
  let Some(interval) = request.interval else {
    return Ok(validation_failed("interval is required"));
  };
  let Some(callback_target) = request.callback_target else {
    return Ok(validation_failed("callback_target is required"));
  };

  let result = scheduler
    .add_interval_task(&interval, callback_target, request.payload.unwrap_or_default())
    .await;
  Ok(match result {
    Ok(task) => warp::reply::json(&TaskResponse::scheduled(&task)).into_response(),
    Err(e) => scheduler_error(e),
  })
}

async fn handle_cancel_task(id: Uuid, scheduler: Arc<TaskScheduler>) -> Result<warp::reply::Response, Infallible> {
  Ok(match scheduler.cancel_task(id).await {
    Ok(_) => {
      let response = TaskResponse {
        success: true,
        task_id: id,
        execute_at: None,
        status: "cancelled",
      };
      warp::reply::json(&response).into_response()
    }
    Err(e) => scheduler_error(e),
  })
}

fn validation_failed(message: &str) -> warp::reply::Response {
  warn!("rejected task submission: {}", message);
  error_reply(StatusCode::BAD_REQUEST, message)
}

fn scheduler_error(e: SchedulerError) -> warp::reply::Response {
  let status = match &e {
    SchedulerError::Validation(_) => StatusCode::BAD_REQUEST,
    SchedulerError::NotFound(_) => StatusCode::NOT_FOUND,
    SchedulerError::Durability(_) => StatusCode::SERVICE_UNAVAILABLE,
    SchedulerError::Scheduling { .. } | SchedulerError::Codec(_) => StatusCode::INTERNAL_SERVER_ERROR,
  };
  if status.is_server_error() {
    error!(error = %e, "task request failed");
  } else {
    info!(error = %e, "task request refused");
  }
  error_reply(status, &e.to_string())
}
