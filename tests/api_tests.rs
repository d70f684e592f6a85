use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
    response::Response,
};
use http_body_util::BodyExt;

use order_dispatch::{
    api::{RemovedBot, router},
    bots::{Bot, BotId, BotStatus},
    clock::VirtualClock,
    config::DispatcherConfig,
    dispatcher::{IntegrityReport, StatusSnapshot},
    orders::{Order, OrderId, OrderStatus, Priority},
    state::AppState,
};
use serde_json::{Value, json};
use tower::ServiceExt;

fn test_app(config: DispatcherConfig) -> (Router, Arc<VirtualClock>) {
    let clock = Arc::new(VirtualClock::new());
    let state = AppState::with_clock(config, clock.clone());
    (router(state), clock)
}

async fn body_json<T: serde::de::DeserializeOwned>(res: Response) -> T {
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn post_order(app: &Router, priority: &str) -> Response {
    app.clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/orders")
                .header("content-type", "application/json")
                .body(Body::from(json!({ "priority": priority }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap()
}

async fn call(app: &Router, method: &str, uri: &str) -> Response {
    app.clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn create_order_returns_pending_order() {
    let (app, _clock) = test_app(DispatcherConfig::default());

    let res = post_order(&app, "NORMAL").await;
    assert_eq!(res.status(), StatusCode::CREATED);
    let order: Order = body_json(res).await;
    assert_eq!(order.id, OrderId(1));
    assert_eq!(order.priority, Priority::Normal);
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.assigned_bot, None);
}

#[tokio::test]
async fn create_order_accepts_lower_case_tag() {
    let (app, _clock) = test_app(DispatcherConfig::default());
    let res = post_order(&app, "vip").await;
    assert_eq!(res.status(), StatusCode::CREATED);
    let order: Order = body_json(res).await;
    assert_eq!(order.priority, Priority::Vip);
}

#[tokio::test]
async fn create_order_rejects_unknown_priority() {
    let (app, _clock) = test_app(DispatcherConfig::default());

    let res = post_order(&app, "PLATINUM").await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let v: Value = body_json(res).await;
    assert!(v["error"].as_str().unwrap().contains("unsupported priority"));

    // nothing reached the dispatcher
    let snap: StatusSnapshot = body_json(call(&app, "GET", "/status").await).await;
    assert_eq!(snap.orders.total, 0);
}

#[tokio::test]
async fn create_order_without_priority_is_unprocessable() {
    let (app, _clock) = test_app(DispatcherConfig::default());
    let res = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/orders")
                .header("content-type", "application/json")
                .body(Body::from(json!({ "type": "VIP" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn vip_jumps_the_queue_over_http() {
    let (app, clock) = test_app(DispatcherConfig::default());

    post_order(&app, "NORMAL").await;
    post_order(&app, "VIP").await;

    let res = call(&app, "POST", "/bots").await;
    assert_eq!(res.status(), StatusCode::CREATED);
    let bot: Bot = body_json(res).await;
    assert_eq!(bot.id, BotId(1));
    assert_eq!(bot.status, BotStatus::Busy);
    assert_eq!(bot.current_order, Some(OrderId(2)));

    clock.advance(Duration::from_secs(10));

    let snap: StatusSnapshot = body_json(call(&app, "GET", "/status").await).await;
    assert_eq!(snap.complete.len(), 1);
    assert_eq!(snap.complete[0].id, OrderId(2));
    assert_eq!(snap.processing.len(), 1);
    assert_eq!(snap.processing[0].id, OrderId(1));
    assert_eq!(snap.bot_list[0].current_order, Some(OrderId(1)));
}

#[tokio::test]
async fn remove_latest_bot_on_empty_pool_is_null() {
    let (app, _clock) = test_app(DispatcherConfig::default());

    let res = call(&app, "DELETE", "/bots/latest").await;
    assert_eq!(res.status(), StatusCode::OK);
    let v: Value = body_json(res).await;
    assert!(v["removed"].is_null());
}

#[tokio::test]
async fn remove_busy_bot_returns_order_to_pending() {
    let (app, clock) = test_app(DispatcherConfig::default());

    call(&app, "POST", "/bots").await;
    post_order(&app, "NORMAL").await;
    clock.advance(Duration::from_secs(3));

    let res = call(&app, "DELETE", "/bots/latest").await;
    assert_eq!(res.status(), StatusCode::OK);
    let removed: RemovedBot = body_json(res).await;
    assert_eq!(removed.removed.map(|b| b.id), Some(BotId(1)));

    clock.advance(Duration::from_secs(30));
    let snap: StatusSnapshot = body_json(call(&app, "GET", "/status").await).await;
    assert_eq!(snap.bots.total, 0);
    assert_eq!(snap.pending.len(), 1);
    assert_eq!(snap.pending[0].id, OrderId(1));
    assert_eq!(snap.pending[0].status, OrderStatus::Pending);
    assert!(snap.complete.is_empty());
}

#[tokio::test]
async fn add_bot_beyond_capacity_conflicts() {
    let (app, _clock) = test_app(DispatcherConfig::default().with_max_bots(1));

    assert_eq!(call(&app, "POST", "/bots").await.status(), StatusCode::CREATED);
    let res = call(&app, "POST", "/bots").await;
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let v: Value = body_json(res).await;
    assert!(v["error"].as_str().unwrap().contains("full"));
}

#[tokio::test]
async fn status_is_read_only() {
    let (app, _clock) = test_app(DispatcherConfig::default());
    post_order(&app, "VIP").await;
    post_order(&app, "NORMAL").await;

    let first: Value = body_json(call(&app, "GET", "/status").await).await;
    let second: Value = body_json(call(&app, "GET", "/status").await).await;
    assert_eq!(first, second);
    assert_eq!(first["queue"]["vip"], 1);
    assert_eq!(first["queue"]["normal"], 1);
    assert_eq!(first["pending"][0]["priority"], "VIP");
    assert_eq!(first["pending"][0]["status"], "PENDING");
}

#[tokio::test]
async fn integrity_endpoint_reports_valid() {
    let (app, clock) = test_app(DispatcherConfig::default());
    call(&app, "POST", "/bots").await;
    call(&app, "POST", "/bots").await;
    for tag in ["NORMAL", "VIP", "NORMAL"] {
        post_order(&app, tag).await;
    }
    clock.advance(Duration::from_secs(4));
    call(&app, "DELETE", "/bots/latest").await;

    let report: IntegrityReport = body_json(call(&app, "GET", "/integrity").await).await;
    assert!(report.valid, "issues: {:?}", report.issues);
    assert!(report.issues.is_empty());
}
