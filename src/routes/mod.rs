use std::convert::Infallible;
use std::sync::Arc;

use serde_json::json;
use tracing::warn;
use warp::http::StatusCode;
use warp::{Filter, Reply};

use crate::scheduler::TaskScheduler;

pub mod stats;
pub mod tasks;

pub fn routes(
  scheduler: Arc<TaskScheduler>,
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
  tasks::delay_route(scheduler.clone())
    .or(tasks::interval_route(scheduler.clone()))
    .or(tasks::cancel_route(scheduler.clone()))
    .or(stats::stats_route(scheduler))
    .or(stats::health_route())
    .recover(handle_rejection)
}

pub(crate) fn with_scheduler(
  scheduler: Arc<TaskScheduler>,
) -> impl Filter<Extract = (Arc<TaskScheduler>,), Error = Infallible> + Clone {
  warp::any().map(move || scheduler.clone())
}

pub(crate) fn error_reply(status: StatusCode, message: &str) -> warp::reply::Response {
  warp::reply::with_status(warp::reply::json(&json!({ "success": false, "error": message })), status).into_response()
}

async fn handle_rejection(rejection: warp::Rejection) -> Result<warp::reply::Response, Infallible> {
  if rejection.is_not_found() {
    return Ok(error_reply(StatusCode::NOT_FOUND, "not found"));
  }
  if let Some(e) = rejection.find::<warp::filters::body::BodyDeserializeError>() {
    warn!(error = %e, "malformed request body");
    return Ok(error_reply(StatusCode::BAD_REQUEST, &format!("invalid request body: {e}")));
  }
  if rejection.find::<warp::reject::UnsupportedMediaType>().is_some() {
    return Ok(error_reply(StatusCode::UNSUPPORTED_MEDIA_TYPE, "expected a JSON body"));
  }
  if rejection.find::<warp::reject::PayloadTooLarge>().is_some() {
    return Ok(error_reply(StatusCode::PAYLOAD_TOO_LARGE, "request body too large"));
  }
  if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
    return Ok(error_reply(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"));
  }
  warn!(?rejection, "unhandled rejection");
  Ok(error_reply(StatusCode::INTERNAL_SERVER_ERROR, "internal error"))
}
