//! HTTP dispatch pipeline tests.
//!
//! These drive the real router with `tower`'s `oneshot` and exercise every
//! guard that does not need a live store: throttling, method and route
//! gates, the admin-token authorization path, and reply serialization.
//! The store URI points nowhere; nothing here may touch it.

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_util::ServiceExt;
use vireo::{ping_route, reply, Reply, Route, Routes, Runtime, ServiceConfig};

const ADMIN_TOKEN: &str = "T";

fn test_config(req_per_sec: u32) -> ServiceConfig {
    ServiceConfig {
        service_id: "wallet_1".into(),
        db_uri: "mongodb://127.0.0.1:27017/?serverSelectionTimeoutMS=200&connectTimeoutMS=200"
            .into(),
        db_name: "wallet_test".into(),
        db_prefix: "wa".into(),
        admin_token: ADMIN_TOKEN.into(),
        req_per_sec,
        ..ServiceConfig::default()
    }
}

async fn test_app(req_per_sec: u32, routes: Routes) -> (Arc<Runtime>, Router) {
    let rt = Runtime::connect(test_config(req_per_sec), routes)
        .await
        .expect("runtime");
    let app = vireo::api::router(rt.clone());
    (rt, app)
}

fn post(route: &str) -> axum::http::request::Builder {
    Request::builder()
        .method(Method::POST)
        .uri(format!("/api/{route}"))
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .expect("body");
    String::from_utf8(bytes.to_vec()).expect("utf8 body")
}

async fn body_json(response: axum::response::Response) -> Value {
    serde_json::from_str(&body_string(response).await).expect("json body")
}

#[tokio::test]
async fn ping_with_admin_token_succeeds() {
    let (_rt, app) = test_app(50, Routes::new().add(ping_route())).await;

    let request = post("ping")
        .header("token", ADMIN_TOKEN)
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("application/json; charset=utf-8")
    );
    assert_eq!(body_json(response).await, json!({"response": true}));
}

#[tokio::test]
async fn missing_token_is_unauthorized() {
    let (_rt, app) = test_app(50, Routes::new().add(ping_route())).await;

    let request = post("ping").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_string(response).await, "not logged in\n");
}

#[tokio::test]
async fn token_cookie_is_accepted() {
    let (_rt, app) = test_app(50, Routes::new().add(ping_route())).await;

    let request = post("ping")
        .header("cookie", format!("token={ADMIN_TOKEN}"))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn public_route_needs_no_token() {
    let routes = Routes::new().add(Route::handler("health", true, |_rt, _body| async {
        reply! {"ok": true}
    }));
    let (_rt, app) = test_app(50, routes).await;

    let request = post("health").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"ok": true}));
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let (_rt, app) = test_app(50, Routes::new().add(ping_route())).await;

    let request = post("nope")
        .header("token", ADMIN_TOKEN)
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn non_post_method_is_not_found() {
    let (_rt, app) = test_app(50, Routes::new().add(ping_route())).await;

    let request = Request::builder()
        .method(Method::GET)
        .uri("/api/ping")
        .header("token", ADMIN_TOKEN)
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn handler_receives_request_body() {
    let routes = Routes::new().add(Route::handler("echo", false, |_rt, body: Reply| async move {
        reply! {"got": Value::Object(body)}
    }));
    let (_rt, app) = test_app(50, routes).await;

    let request = post("echo")
        .header("token", ADMIN_TOKEN)
        .body(Body::from(r#"{"user_id": "u1"}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"got": {"user_id": "u1"}}));
}

#[tokio::test]
async fn malformed_handler_body_is_a_bad_request() {
    let (_rt, app) = test_app(50, Routes::new().add(ping_route())).await;

    let request = post("ping")
        .header("token", ADMIN_TOKEN)
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_string(response).await, "can't read your request!\n");
}

#[tokio::test]
async fn rate_limit_allows_four_of_five_per_window() {
    // req_per_sec = 1 means a cap of 5 attempts per 5-second window, of
    // which the fifth is rejected.
    let (_rt, app) = test_app(1, Routes::new().add(ping_route())).await;

    for attempt in 1..=4 {
        let request = post("ping")
            .header("token", ADMIN_TOKEN)
            .header("x-real-ip", "203.0.113.9")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK, "attempt {attempt}");
    }

    let request = post("ping")
        .header("token", ADMIN_TOKEN)
        .header("x-real-ip", "203.0.113.9")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_string(response).await, "rate limit exceeded\n");

    // A different client address still gets through.
    let request = post("ping")
        .header("token", ADMIN_TOKEN)
        .header("x-real-ip", "203.0.113.10")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn rate_limit_applies_before_auth_and_routing() {
    let (_rt, app) = test_app(1, Routes::new().add(ping_route())).await;

    // Unauthenticated and unknown-route attempts still burn the window.
    for _ in 0..4 {
        let request = post("nope")
            .header("x-real-ip", "203.0.113.11")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
    let request = post("ping")
        .header("token", ADMIN_TOKEN)
        .header("x-real-ip", "203.0.113.11")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn command_without_store_reports_system_internal() {
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use validator::Validate;
    use vireo::{Command, CommandCtx};

    #[derive(Debug, Default, Serialize, Deserialize, Validate)]
    struct Credit {
        #[validate(length(min = 1))]
        user_id: String,
    }

    #[derive(Serialize)]
    struct Credited {
        user_id: String,
    }

    impl vireo::DomainEvent for Credited {
        fn event_name(&self) -> &'static str {
            "EvCredited"
        }
    }

    #[async_trait]
    impl Command for Credit {
        fn name(&self) -> &'static str {
            "Credit"
        }

        async fn handle(&self, ctx: &mut CommandCtx<'_>) -> vireo::Result<Reply> {
            ctx.emit(&Credited {
                user_id: self.user_id.clone(),
            })
            .await?;
            Ok(Reply::new())
        }
    }

    let routes = Routes::new().add(Route::command::<Credit>("credit", false));
    let (_rt, app) = test_app(50, routes).await;

    // The transaction cannot start against the unreachable store; the root
    // still comes back with the outcome embedded.
    let request = post("credit")
        .header("token", ADMIN_TOKEN)
        .body(Body::from(r#"{"user_id": "u1"}"#))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let root = body_json(response).await;
    assert_eq!(root["executed"], json!(false));
    assert_eq!(root["error"]["code"], json!(0));
    assert_eq!(root["command"]["user_id"], json!("u1"));

    // Validation failures short-circuit before the store is touched.
    let request = post("credit")
        .header("token", ADMIN_TOKEN)
        .body(Body::from(r#"{"user_id": ""}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let root = body_json(response).await;
    assert_eq!(root["executed"], json!(false));
    assert_eq!(root["error"]["code"], json!(1));
    assert!(root["error"]["message"]
        .as_str()
        .unwrap()
        .contains("user_id"));
}
