mod common;

use serde_json::{json, Value};
use tokio_test::assert_ok;
use uuid::Uuid;
use warp::http::StatusCode;

use common::{Fixture, TOPIC};
use dtsched::routes::routes;

fn body(res: &warp::http::Response<warp::hyper::body::Bytes>) -> Value {
  assert_ok!(serde_json::from_slice(res.body()))
}

#[tokio::test]
async fn schedules_a_delay_task() {
  let fx = Fixture::new();
  let api = routes(fx.scheduler.clone());

  let res = warp::test::request()
    .method("POST")
    .path("/tasks/delay")
    .json(&json!({
      "delay_seconds": 30,
      "callback_target": "http://orders/timeout",
      "payload": { "order_id": "ORD-123" }
    }))
    .reply(&api)
    .await;

  assert_eq!(res.status(), StatusCode::OK);
  let body = body(&res);
  assert_eq!(body["success"], true);
  assert_eq!(body["status"], "scheduled");
  assert!(Uuid::parse_str(body["task_id"].as_str().unwrap()).is_ok());
  assert!(body["execute_at"].is_string());
  assert_eq!(fx.scheduler.get_task_count().await, 1);
  assert_eq!(fx.log.record_count(TOPIC), 1);
}

#[tokio::test]
async fn accepts_callback_url_and_data_aliases() {
  let fx = Fixture::new();
  let api = routes(fx.scheduler.clone());

  let res = warp::test::request()
    .method("POST")
    .path("/tasks/delay")
    .json(&json!({ "delay_seconds": 5, "callback_url": "https://hooks.example.com/x", "data": { "k": "v" } }))
    .reply(&api)
    .await;

  assert_eq!(res.status(), StatusCode::OK);
  assert_eq!(fx.scheduler.get_task_count().await, 1);
}

#[tokio::test]
async fn rejects_invalid_delay_requests() {
  let fx = Fixture::new();
  let api = routes(fx.scheduler.clone());

  for request in [
    json!({ "delay_seconds": 0, "callback_target": "http://a/b" }),
    json!({ "delay_seconds": -5, "callback_target": "http://a/b" }),
    json!({ "callback_target": "http://a/b" }),
    json!({ "delay_seconds": 5 }),
    json!({ "delay_seconds": 5, "callback_target": "mailto:ops@example.com" }),
  ] {
    let res = warp::test::request().method("POST").path("/tasks/delay").json(&request).reply(&api).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST, "{request}");
    let body = body(&res);
    assert_eq!(body["success"], false);
    assert!(body["error"].is_string());
  }
  assert_eq!(fx.scheduler.get_task_count().await, 0);
}

#[tokio::test]
async fn malformed_json_is_a_bad_request() {
  let fx = Fixture::new();
  let api = routes(fx.scheduler.clone());

  let res = warp::test::request()
    .method("POST")
    .path("/tasks/delay")
    .header("content-type", "application/json")
    .body("{ delay_seconds: ")
    .reply(&api)
    .await;

  assert_eq!(res.status(), StatusCode::BAD_REQUEST);
  assert_eq!(body(&res)["success"], false);
}

#[tokio::test]
async fn log_outage_is_service_unavailable() {
  let fx = Fixture::new();
  fx.log.fail_appends(true);
  let api = routes(fx.scheduler.clone());

  let res = warp::test::request()
    .method("POST")
    .path("/tasks/delay")
    .json(&json!({ "delay_seconds": 5, "callback_target": "http://a/b" }))
    .reply(&api)
    .await;

  assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
  assert_eq!(body(&res)["success"], false);
  assert_eq!(fx.scheduler.get_task_count().await, 0);
}

#[tokio::test]
async fn schedules_an_interval_task() {
  let fx = Fixture::new();
  let api = routes(fx.scheduler.clone());

  let res = warp::test::request()
    .method("POST")
    .path("/tasks/interval")
    .json(&json!({ "interval": "5m", "callback_target": "http://reports/daily" }))
    .reply(&api)
    .await;
  assert_eq!(res.status(), StatusCode::OK);
  assert_eq!(body(&res)["status"], "scheduled");

  let res = warp::test::request()
    .method("POST")
    .path("/tasks/interval")
    .json(&json!({ "interval": "0 * * * *", "callback_target": "http://reports/daily" }))
    .reply(&api)
    .await;
  assert_eq!(res.status(), StatusCode::BAD_REQUEST);
  assert_eq!(fx.scheduler.get_task_count().await, 1);
}

#[tokio::test]
async fn cancels_pending_tasks() {
  let fx = Fixture::new();
  let api = routes(fx.scheduler.clone());
  let task = fx
    .scheduler
    .add_delay_task(std::time::Duration::from_secs(60), "http://a/b".into(), Default::default())
    .await
    .unwrap();

  let res = warp::test::request().method("DELETE").path(&format!("/tasks/{}", task.id)).reply(&api).await;
  assert_eq!(res.status(), StatusCode::OK);
  let cancelled = body(&res);
  assert_eq!(cancelled["status"], "cancelled");
  assert_eq!(cancelled["task_id"], task.id.to_string());
  assert_eq!(fx.scheduler.get_task_count().await, 0);

  let res = warp::test::request().method("DELETE").path(&format!("/tasks/{}", task.id)).reply(&api).await;
  assert_eq!(res.status(), StatusCode::NOT_FOUND);
  assert_eq!(body(&res)["success"], false);
}

#[tokio::test]
async fn reports_stats_and_health() {
  let fx = Fixture::new();
  let api = routes(fx.scheduler.clone());
  fx.scheduler
    .add_delay_task(std::time::Duration::from_secs(60), "http://a/b".into(), Default::default())
    .await
    .unwrap();

  let res = warp::test::request().method("GET").path("/stats").reply(&api).await;
  assert_eq!(res.status(), StatusCode::OK);
  let stats = body(&res);
  assert_eq!(stats["pending_tasks"], 1);
  assert!(stats["timestamp"].is_string());
  assert_eq!(stats["delivery"]["attempts"], 0);
  assert_eq!(stats["delivery"]["delivered"], 0);

  let res = warp::test::request().method("GET").path("/health").reply(&api).await;
  assert_eq!(res.status(), StatusCode::OK);
  assert_eq!(res.body().as_ref(), b"OK");
}

#[tokio::test]
async fn unknown_paths_are_not_found() {
  let fx = Fixture::new();
  let api = routes(fx.scheduler.clone());

  let res = warp::test::request().method("GET").path("/tasks/nope").reply(&api).await;
  assert_eq!(res.status(), StatusCode::NOT_FOUND);
}
