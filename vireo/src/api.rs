//! HTTP transport.
//!
//! A single entry point serves `POST /api/<route>`. Every request walks the
//! same guard pipeline (throttle, method, route lookup, token, authorize,
//! idempotency) and each guard either proceeds or produces the terminal
//! response for that request.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::Response;
use axum::routing::any;
use axum::Router;
use bson::doc;
use serde_json::Value;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::auth;
use crate::routes::serve_route;
use crate::runtime::Runtime;
use crate::util;

const MAX_BODY_BYTES: usize = 1 << 20;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub fn router(rt: Arc<Runtime>) -> Router {
    Router::new()
        .route("/api/{route}", any(dispatch))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(rt)
}

async fn dispatch(
    State(rt): State<Arc<Runtime>>,
    Path(route_name): Path<String>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();

    let connect_info = parts
        .extensions
        .get::<ConnectInfo<std::net::SocketAddr>>()
        .copied();
    let ip = util::client_ip(&parts.headers, connect_info.map(|info| info.0));
    if !rt.throttle().allow(&ip) {
        return plain_error(StatusCode::FORBIDDEN, "rate limit exceeded");
    }

    if parts.method != Method::POST {
        return not_found();
    }
    let Some(route) = rt.route(&route_name) else {
        return not_found();
    };
    tracing::debug!(route = %route_name, "serving route");

    let token = extract_token(&parts.headers);
    if !auth::authorize(&rt, &token, route).await {
        return plain_error(StatusCode::UNAUTHORIZED, "not logged in");
    }

    let call_id = header_value(&parts.headers, "callId");
    if !call_id.is_empty() {
        let coll = rt.store().collection(&rt.config().col_commands);
        match coll.find_one(doc! {"_id": &call_id}).await {
            Err(err) => {
                tracing::error!(error = %err, "call record lookup failed");
                return not_found();
            }
            Ok(Some(record)) => {
                tracing::debug!(call_id = %call_id, "idempotent replay");
                let stored = record
                    .get("response")
                    .cloned()
                    .unwrap_or(bson::Bson::Null);
                return json_response(stored.into_relaxed_extjson());
            }
            Ok(None) => {}
        }
    }

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::error!(error = %err, "request body read failed");
            return plain_error(StatusCode::BAD_REQUEST, "can't read your request!");
        }
    };

    match serve_route(&rt, route, &body, call_id).await {
        Ok(value) => json_response(value),
        Err(err) => {
            tracing::error!(route = %route_name, error = %err, "http dispatch failed");
            plain_error(StatusCode::BAD_REQUEST, "can't read your request!")
        }
    }
}

/// Cookie takes precedence over the header.
fn extract_token(headers: &HeaderMap) -> String {
    util::cookie_value(headers, "token")
        .unwrap_or_else(|| header_value(headers, "token"))
}

fn header_value(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn json_response(value: Value) -> Response {
    let body = match serde_json::to_vec(&value) {
        Ok(body) => body,
        Err(err) => {
            tracing::error!(error = %err, "response encode failed");
            return not_found();
        }
    };
    match Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json; charset=utf-8")
        .body(Bytes::from(body).into())
    {
        Ok(response) => response,
        Err(_) => not_found(),
    }
}

fn plain_error(status: StatusCode, message: &str) -> Response {
    let response = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header("x-content-type-options", "nosniff")
        .body(format!("{message}\n").into());
    match response {
        Ok(response) => response,
        Err(_) => Response::new(axum::body::Body::empty()),
    }
}

fn not_found() -> Response {
    plain_error(StatusCode::NOT_FOUND, "404 page not found")
}
