//! HTTP transport.
//!
//! One POST route, configured per server (default `/rpc`). The transport
//! owns everything the protocol core deliberately leaves out: content-type
//! enforcement (415), body size limits, semantic HTTP status mapping, and
//! response headers:
//!
//! | Header | Source |
//! |--------|--------|
//! | `X-Forrst-Request-Id` | echoed response id |
//! | `X-Forrst-Duration-Ms` | `meta.duration.value` |
//! | `X-Forrst-Node` | `meta.node` |
//! | `RateLimit-Limit/-Remaining/-Reset` | `meta.rate_limit` (quota extension) |
//!
//! Requests declaring the `stream` extension with `accept = true` against
//! a streamable function are diverted to the SSE adapter; everything else
//! is a single JSON response.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted; intra-service callers
//! may sit behind browser-based dashboards or sidecars.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};

use crate::error::{ErrorCode, ErrorObject};
use crate::extensions::stream::wants_stream;
use crate::handler::{DispatchOutcome, RequestHandler};
use crate::protocol::Response;
use crate::runtime::ServerContext;
use crate::sse;

#[derive(Clone)]
struct AppState {
    handler: Arc<RequestHandler>,
    response_max_bytes: usize,
}

/// Start the HTTP server and run until ctrl-c.
pub async fn run_server(ctx: ServerContext) -> Result<()> {
    let bind_addr = ctx.config.server.bind.clone();
    let path = ctx.config.server.path.clone();
    let request_max_bytes = ctx.config.limits.request_max_bytes;

    let state = AppState {
        handler: ctx.handler.clone(),
        response_max_bytes: ctx.config.limits.response_max_bytes,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route(&path, post(handle_rpc))
        // Leave our own limit check the one that fires, so oversize
        // bodies get a protocol error instead of a bare 413.
        .layer(DefaultBodyLimit::max(request_max_bytes.saturating_add(4096)))
        .layer(cors)
        .with_state(state);

    ctx.start_sweeper();

    tracing::info!("forrst listening on http://{bind_addr}{path}");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down");
}

async fn handle_rpc(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    let started = Instant::now();

    if !is_json_content_type(&headers) {
        let response = Response::failure(
            None,
            vec![ErrorObject::new(
                ErrorCode::InvalidRequest,
                "Content-Type must be application/json",
            )],
        );
        return encode(
            DispatchOutcome {
                status: 415,
                response,
            },
            state.response_max_bytes,
        );
    }

    let request = match state.handler.parse(&body, started) {
        Ok(request) => request,
        Err(outcome) => return encode(outcome, state.response_max_bytes),
    };

    if wants_stream(&request) {
        let ctx = match state.handler.prepare(request, started) {
            Ok(ctx) => Arc::new(ctx),
            Err(outcome) => return encode(outcome, state.response_max_bytes),
        };
        if ctx.descriptor().capabilities.streamable {
            return match sse::serve_stream(state.handler.clone(), ctx).await {
                Ok(response) => response,
                Err(outcome) => encode(outcome, state.response_max_bytes),
            };
        }
        // Not streamable: let the pipeline produce the applicability
        // error as a plain JSON response.
        let outcome = state.handler.dispatch_prepared(&ctx).await;
        return encode(outcome, state.response_max_bytes);
    }

    let outcome = state.handler.dispatch_request(request, started).await;
    encode(outcome, state.response_max_bytes)
}

fn is_json_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            let mime = v.split(';').next().unwrap_or("").trim();
            mime.eq_ignore_ascii_case("application/json")
        })
        .unwrap_or(false)
}

/// Serialize a dispatch outcome, enforce the response size cap, and stamp
/// transport headers.
fn encode(outcome: DispatchOutcome, response_max_bytes: usize) -> axum::response::Response {
    let DispatchOutcome { status, response } = outcome;

    let mut body = serde_json::to_vec(&response).unwrap_or_else(|_| b"{}".to_vec());
    let (status, response) = if body.len() > response_max_bytes {
        tracing::warn!(
            bytes = body.len(),
            limit = response_max_bytes,
            "response exceeds size cap"
        );
        let capped = Response::failure(
            response.id.clone(),
            vec![ErrorObject::new(
                ErrorCode::InternalError,
                "response exceeds the configured size limit",
            )],
        );
        body = serde_json::to_vec(&capped).unwrap_or_else(|_| b"{}".to_vec());
        (capped.http_status(), capped)
    } else {
        (status, response)
    };

    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut http = (status, body).into_response();
    let headers = http.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    insert_header(
        headers,
        "x-forrst-request-id",
        response.id.as_deref().unwrap_or("null"),
    );
    if let Some(duration) = response
        .meta
        .get("duration")
        .and_then(|d| d.get("value"))
        .and_then(Value::as_u64)
    {
        insert_header(headers, "x-forrst-duration-ms", &duration.to_string());
    }
    if let Some(node) = response.meta.get("node").and_then(Value::as_str) {
        insert_header(headers, "x-forrst-node", node);
    }
    if let Some(rate) = response.meta.get("rate_limit") {
        for (key, header_name) in [
            ("limit", "ratelimit-limit"),
            ("remaining", "ratelimit-remaining"),
            ("reset", "ratelimit-reset"),
        ] {
            if let Some(value) = rate.get(key).and_then(Value::as_u64) {
                insert_header(headers, header_name, &value.to_string());
            }
        }
    }
    http
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(content_type: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, content_type.parse().unwrap());
        headers
    }

    #[test]
    fn test_content_type_detection() {
        assert!(is_json_content_type(&headers_with("application/json")));
        assert!(is_json_content_type(&headers_with(
            "application/json; charset=utf-8"
        )));
        assert!(!is_json_content_type(&headers_with("text/plain")));
        assert!(!is_json_content_type(&HeaderMap::new()));
    }
}
