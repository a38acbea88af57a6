//! Request routing
//!
//! | Route                          | Purpose                                  |
//! |--------------------------------|------------------------------------------|
//! | `GET /api/{collection}?filter` | catalog read through the edge pipeline   |
//! | `GET /api/cache?action=...`    | `stats`, `health`, `get&key=`, `demo`    |
//! | `POST /api/cache`              | `set`, `invalidate`, `delete`, `clear`   |
//! | `GET /healthz`, `/readyz`      | liveness / readiness                     |
//! | `GET /metrics`                 | Prometheus text exposition               |
//!
//! Every `/api/` request passes admission control first.

use std::borrow::Cow;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Body;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING, IF_NONE_MATCH};
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::query::Collection;
use crate::ratelimit::RateDecision;
use crate::response::{PreparedResponse, RequestHeaders};
use crate::service::EdgeService;
use crate::stats::component;

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 64 * 1024;

type HttpResponse = Response<Full<Bytes>>;

/// Cache administration command posted to `/api/cache`
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum AdminCommand {
    Set {
        key: String,
        value: Value,
        #[serde(default, alias = "ttlSecs")]
        ttl: u64,
        #[serde(default)]
        tags: Vec<String>,
    },
    Invalidate {
        tags: Vec<String>,
    },
    Delete {
        key: String,
    },
    /// Drop the local tier; the shared tier is kept
    Clear,
}

/// Answer one request. Never fails: errors become JSON error responses.
pub async fn handle<B>(service: &EdgeService, peer: SocketAddr, req: Request<B>) -> HttpResponse
where
    B: Body + Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let request_id = Uuid::new_v4().to_string();
    let span = info_span!(
        "request",
        id = %request_id,
        method = %req.method(),
        path = %req.uri().path(),
    );
    let started = Instant::now();

    let mut response = route(service, peer, req)
        .instrument(span)
        .await
        .unwrap_or_else(error_response);

    set_header(&mut response, "x-request-id", &request_id);
    service
        .stats()
        .record_latency(component::REQUEST, started.elapsed());
    response
}

async fn route<B>(service: &EdgeService, peer: SocketAddr, req: Request<B>) -> Result<HttpResponse>
where
    B: Body + Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match (&method, path.as_str()) {
        (&Method::GET, "/healthz") | (&Method::GET, "/livez") => Ok(text(StatusCode::OK, "ok")),
        (&Method::GET, "/readyz") => Ok(if service.is_ready() {
            text(StatusCode::OK, "ok")
        } else {
            text(StatusCode::SERVICE_UNAVAILABLE, "not ready")
        }),
        (&Method::GET, "/metrics") => Ok(match service.stats().render_prometheus() {
            Some(body) => plain(StatusCode::OK, "text/plain; version=0.0.4", Bytes::from(body)),
            None => json_error(StatusCode::NOT_FOUND, "metrics exposition disabled"),
        }),
        (_, p) if p.starts_with("/api/") => {
            let identity = client_identity(req.headers(), peer);
            let decision = service.admit(&identity)?;
            let mut response = api(service, req, &path).await?;
            rate_limit_headers(&mut response, &decision);
            Ok(response)
        }
        _ => Ok(json_error(StatusCode::NOT_FOUND, "no such route")),
    }
}

async fn api<B>(service: &EdgeService, req: Request<B>, path: &str) -> Result<HttpResponse>
where
    B: Body + Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    if path == "/api/cache" {
        return match *req.method() {
            Method::GET => cache_query(service, req.uri().query().unwrap_or("")).await,
            Method::POST => cache_command(service, req).await,
            _ => Ok(method_not_allowed()),
        };
    }

    let Ok(collection) = path.trim_start_matches("/api/").parse::<Collection>() else {
        return Ok(json_error(StatusCode::NOT_FOUND, "no such collection"));
    };
    if req.method() != Method::GET {
        return Ok(method_not_allowed());
    }

    let headers = req.headers();
    let request = RequestHeaders {
        accept_encoding: header_str(headers, &ACCEPT_ENCODING),
        if_none_match: header_str(headers, &IF_NONE_MATCH),
    };
    let outcome = service
        .read(collection, req.uri().query().unwrap_or(""), request)
        .await?;
    debug!(key = %outcome.key, source = ?outcome.source, "Catalog read served");
    Ok(prepared(outcome.response))
}

async fn cache_query(service: &EdgeService, query: &str) -> Result<HttpResponse> {
    match query_param(query, "action").as_deref() {
        None | Some("stats") => json_ok(StatusCode::OK, &service.stats_report()),
        Some("health") => json_ok(StatusCode::OK, &service.health_report()),
        Some("demo") => json_ok(StatusCode::OK, &service.run_demo().await?),
        Some("get") => {
            let key = query_param(query, "key")
                .filter(|k| !k.is_empty())
                .ok_or_else(|| Error::InvalidRequest("action=get requires a key".into()))?;
            Ok(match service.cache().get(&key).await {
                Some(value) => plain(StatusCode::OK, "application/json", value),
                None => json_error(StatusCode::NOT_FOUND, &format!("key {} is not cached", key)),
            })
        }
        Some(other) => Err(Error::InvalidRequest(format!("unknown action: {}", other))),
    }
}

async fn cache_command<B>(service: &EdgeService, req: Request<B>) -> Result<HttpResponse>
where
    B: Body + Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let body = Limited::new(req.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| Error::InvalidRequest(format!("unreadable request body: {}", e)))?
        .to_bytes();
    let command: AdminCommand = serde_json::from_slice(&body)?;
    let cache = service.cache();

    match command {
        AdminCommand::Set { key, value, ttl, tags } => {
            if key.is_empty() {
                return Err(Error::InvalidRequest("key must not be empty".into()));
            }
            let payload = Bytes::from(serde_json::to_vec(&value)?);
            let stored = cache.set(&key, payload, ttl, &tags).await;
            json_ok(StatusCode::OK, &json!({ "action": "set", "key": key, "stored": stored }))
        }
        AdminCommand::Invalidate { tags } => {
            if tags.is_empty() {
                return Err(Error::InvalidRequest("invalidate requires at least one tag".into()));
            }
            let invalidated = cache.invalidate_tags(&tags).await;
            json_ok(
                StatusCode::OK,
                &json!({ "action": "invalidate", "tags": tags, "invalidated": invalidated }),
            )
        }
        AdminCommand::Delete { key } => {
            let deleted = cache.delete(&key).await;
            json_ok(StatusCode::OK, &json!({ "action": "delete", "key": key, "deleted": deleted }))
        }
        AdminCommand::Clear => {
            let cleared = cache.clear_local();
            json_ok(StatusCode::OK, &json!({ "action": "clear", "cleared": cleared }))
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// First `X-Forwarded-For` hop, then `X-Real-IP`, then the socket peer
fn client_identity(headers: &HeaderMap, peer: SocketAddr) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next());
    let real_ip = headers.get("x-real-ip").and_then(|v| v.to_str().ok());

    forwarded
        .into_iter()
        .chain(real_ip)
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| peer.ip().to_string())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        if k != name {
            return None;
        }
        urlencoding::decode(&v.replace('+', " "))
            .ok()
            .map(Cow::into_owned)
    })
}

fn set_header(response: &mut HttpResponse, name: &str, value: &str) {
    match (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        (Ok(name), Ok(value)) => {
            response.headers_mut().insert(name, value);
        }
        _ => warn!(header = name, "Dropping invalid response header"),
    }
}

fn rate_limit_headers(response: &mut HttpResponse, decision: &RateDecision) {
    set_header(response, "x-ratelimit-limit", &decision.limit.to_string());
    set_header(response, "x-ratelimit-remaining", &decision.remaining.to_string());
}

fn plain(status: StatusCode, content_type: &str, body: Bytes) -> HttpResponse {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    set_header(&mut response, "content-type", content_type);
    response
}

fn text(status: StatusCode, body: &'static str) -> HttpResponse {
    plain(status, "text/plain", Bytes::from_static(body.as_bytes()))
}

fn json_ok<T: Serialize>(status: StatusCode, value: &T) -> Result<HttpResponse> {
    Ok(plain(status, "application/json", Bytes::from(serde_json::to_vec(value)?)))
}

fn json_error(status: StatusCode, message: &str) -> HttpResponse {
    let body = json!({ "error": message, "status": status.as_u16() });
    plain(status, "application/json", Bytes::from(body.to_string()))
}

fn method_not_allowed() -> HttpResponse {
    json_error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
}

fn prepared(response: PreparedResponse) -> HttpResponse {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK);
    let mut out = Response::new(Full::new(response.body));
    *out.status_mut() = status;
    for (name, value) in &response.headers {
        set_header(&mut out, name, value);
    }
    out
}

fn error_response(err: Error) -> HttpResponse {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!("Request failed: {}", err);
    } else {
        debug!("Request rejected: {}", err);
    }

    let body = json!({
        "error": err.to_string(),
        "status": status.as_u16(),
        "retryable": err.is_retryable(),
    });
    let mut response = plain(status, "application/json", Bytes::from(body.to_string()));

    if let Error::RateLimitExceeded {
        remaining,
        retry_after_secs,
        ..
    } = &err
    {
        set_header(&mut response, "retry-after", &retry_after_secs.to_string());
        set_header(&mut response, "x-ratelimit-remaining", &remaining.to_string());
    }
    response
}

// =============================================================================
// Tests
// =============================================================================
