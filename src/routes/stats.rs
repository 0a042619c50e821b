use std::convert::Infallible;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use warp::Filter;

use crate::executor::DeliveryStats;
use crate::routes::with_scheduler;
use crate::scheduler::TaskScheduler;

#[derive(Debug, Serialize)]
pub struct StatsResponse {
  pub pending_tasks: usize,
  pub timestamp: DateTime<Utc>,
  pub delivery: DeliveryStats,
}

pub fn stats_route(
  scheduler: Arc<TaskScheduler>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("stats")
    .and(warp::get())
    .and(with_scheduler(scheduler))
    .and_then(handle_stats)
}

pub fn health_route() -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("health").and(warp::get()).map(|| "OK")
}

async fn handle_stats(scheduler: Arc<TaskScheduler>) -> Result<impl warp::Reply, Infallible> {
  let stats = scheduler.stats().await;
  Ok(warp::reply::json(&StatsResponse {
    pending_tasks: stats.pending_tasks,
    timestamp: Utc::now(),
    delivery: stats.delivery,
  }))
}
