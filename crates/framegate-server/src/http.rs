//! HTTP front for the framegate server.
//!
//! This module provides the axum server that turns incoming HTTP requests
//! into worker payloads. The flow per request:
//!
//! 1. Static-first: GET/HEAD requests matching a static rule prefix are
//!    served from disk
//! 2. Everything else is dispatched to the worker pools; paths under a
//!    configured streaming prefix are relayed frame by frame, the rest get a
//!    unary response
//! 3. A worker 404 gets one last-chance static retry
//!
//! Built-in endpoints use the double-underscore namespace: `/__health`,
//! `/__stats`, `/__recycle` and the `/__events/{channel}` SSE bridge onto
//! the event hub.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::Stream;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tower::ServiceExt;
use tower_http::services::ServeDir;
use tracing::{error, info};

use framegate_common::{GateError, RequestPayload, ResponsePayload, Result};

use crate::dispatcher::Dispatcher;
use crate::hub::{EventHub, Subscription};
use crate::sink::StreamSink;

/// Maps a URL prefix to a directory under the project root, nginx-location
/// style.
#[derive(Debug, Clone)]
pub struct StaticRule {
    /// URL prefix, e.g. `/assets/`.
    pub prefix: String,
    /// Directory relative to the project root, e.g. `public/assets`.
    pub dir: PathBuf,
}

/// HTTP front configuration.
#[derive(Debug, Clone, Default)]
pub struct HttpConfig {
    /// Project root static rule directories are resolved against.
    pub project_root: PathBuf,
    /// Static rules tried, in order, before worker dispatch.
    pub static_rules: Vec<StaticRule>,
    /// Paths under these prefixes use the streaming worker protocol.
    pub stream_prefixes: Vec<String>,
}

struct AppState {
    dispatcher: Arc<Dispatcher>,
    hub: Arc<EventHub>,
    config: HttpConfig,
}

type SharedState = Arc<AppState>;

/// The framegate HTTP server.
pub struct HttpServer {
    state: SharedState,
}

impl HttpServer {
    pub fn new(dispatcher: Arc<Dispatcher>, hub: Arc<EventHub>, config: HttpConfig) -> Self {
        Self {
            state: Arc::new(AppState {
                dispatcher,
                hub,
                config,
            }),
        }
    }

    /// Binds `addr` and serves until shutdown.
    pub async fn run(self, addr: SocketAddr) -> Result<()> {
        let app = router(self.state);

        let listener = TcpListener::bind(addr).await?;
        info!("framegate listening on {}", listener.local_addr()?);

        axum::serve(listener, app).await?;
        Ok(())
    }
}

fn router(state: SharedState) -> Router {
    Router::new()
        .route("/__health", get(health))
        .route("/__stats", get(stats))
        .route("/__recycle", post(recycle))
        .route(
            "/__events/{channel}",
            get(events_subscribe).post(events_publish),
        )
        .fallback(handle_request)
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn stats(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.dispatcher.stats())
}

async fn recycle(State(state): State<SharedState>) -> impl IntoResponse {
    state.dispatcher.mark_all_workers_dead();
    info!("marked all workers dead, they respawn on next use");
    (StatusCode::OK, "workers recycled\n")
}

/// Catch-all: static rules first, then the worker pools.
async fn handle_request(State(state): State<SharedState>, request: Request) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();

    if let Some(response) = try_serve_static(&state, &method, &uri).await {
        return response;
    }

    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("failed to read request body: {err}"),
            )
                .into_response()
        }
    };

    let payload = build_payload(&parts.method, &parts.uri, &parts.headers, &body);

    if state
        .config
        .stream_prefixes
        .iter()
        .any(|prefix| payload.path.starts_with(prefix.as_str()))
    {
        return stream_response(state, payload).await;
    }

    match state.dispatcher.dispatch(&payload).await {
        Ok(response) => {
            // Worker 404s get a last-chance static retry.
            if response.status_or_default() == 404 {
                if let Some(static_response) = try_serve_static(&state, &method, &uri).await {
                    return static_response;
                }
            }
            render_unary(response)
        }
        Err(err) => {
            error!(path = %payload.path, error = %err, "worker error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("worker error: {err}"),
            )
                .into_response()
        }
    }
}

/// Converts an HTTP request into the worker payload shape. Only the first
/// value of a repeated header is forwarded.
fn build_payload(
    method: &Method,
    uri: &Uri,
    headers: &axum::http::HeaderMap,
    body: &[u8],
) -> RequestPayload {
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());

    let mut payload = RequestPayload::new(method.as_str(), path);
    for (name, value) in headers {
        if payload.headers.contains_key(name.as_str()) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            payload
                .headers
                .insert(name.as_str().to_string(), value.to_string());
        }
    }
    payload.body = String::from_utf8_lossy(body).into_owned();
    payload
}

fn render_unary(response: ResponsePayload) -> Response {
    let mut builder = axum::http::Response::builder().status(response.status_or_default());
    for (name, value) in &response.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    match builder.body(Body::from(response.body)) {
        Ok(response) => response,
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("invalid worker response: {err}"),
        )
            .into_response(),
    }
}

/// Tries each static rule in order. Only GET/HEAD are served statically; a
/// rule whose directory has no matching file falls through so the workers
/// can decide.
async fn try_serve_static(state: &AppState, method: &Method, uri: &Uri) -> Option<Response> {
    if method != Method::GET && method != Method::HEAD {
        return None;
    }

    let path = uri.path();
    for rule in &state.config.static_rules {
        let Some(rel) = path.strip_prefix(rule.prefix.as_str()) else {
            continue;
        };

        let dir = state.config.project_root.join(&rule.dir);
        let request = match axum::http::Request::builder()
            .method(method.clone())
            .uri(format!("/{}", rel.trim_start_matches('/')))
            .body(Body::empty())
        {
            Ok(request) => request,
            Err(_) => continue,
        };

        // ServeDir guards against path traversal and handles HEAD itself.
        let response = match ServeDir::new(&dir).oneshot(request).await {
            Ok(response) => response,
            Err(infallible) => match infallible {},
        };
        if response.status() != StatusCode::NOT_FOUND {
            return Some(response.into_response());
        }
    }

    None
}

/// Sink that forwards the relayed stream into an HTTP response: headers via
/// a oneshot, body chunks via a channel feeding `Body::from_stream`.
struct ChannelSink {
    headers: Option<oneshot::Sender<(u16, Vec<(String, String)>)>>,
    body: mpsc::UnboundedSender<Bytes>,
}

impl StreamSink for ChannelSink {
    fn send_headers(&mut self, status: u16, headers: Vec<(String, String)>) -> Result<()> {
        self.headers
            .take()
            .and_then(|tx| tx.send((status, headers)).ok())
            .ok_or_else(|| GateError::Io(std::io::Error::other("client went away")))
    }

    fn send_data(&mut self, data: &[u8]) -> Result<()> {
        self.body
            .send(Bytes::copy_from_slice(data))
            .map_err(|_| GateError::Io(std::io::Error::other("client went away")))
    }
}

async fn stream_response(state: SharedState, payload: RequestPayload) -> Response {
    let (headers_tx, headers_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::unbounded_channel::<Bytes>();

    let dispatcher = Arc::clone(&state.dispatcher);
    tokio::spawn(async move {
        let mut sink = ChannelSink {
            headers: Some(headers_tx),
            body: body_tx,
        };
        if let Err(err) = dispatcher.dispatch_stream(&payload, &mut sink).await {
            error!(path = %payload.path, error = %err, "stream dispatch failed");
        }
    });

    let Ok((status, headers)) = headers_rx.await else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "worker stream failed before headers",
        )
            .into_response();
    };

    let body_stream = futures::stream::unfold(body_rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|chunk| (Ok::<_, Infallible>(chunk), rx))
    });

    let mut builder = axum::http::Response::builder().status(status);
    for (name, value) in &headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    match builder.body(Body::from_stream(body_stream)) {
        Ok(response) => response,
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("invalid worker response: {err}"),
        )
            .into_response(),
    }
}

/// Hub subscription that unsubscribes itself when the SSE client goes away.
struct SseSubscription {
    hub: Arc<EventHub>,
    sub: Subscription,
}

impl Drop for SseSubscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.sub.channel(), self.sub.id());
    }
}

async fn events_subscribe(
    State(state): State<SharedState>,
    Path(channel): Path<String>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let guard = SseSubscription {
        hub: Arc::clone(&state.hub),
        sub: state.hub.subscribe(&channel),
    };

    let stream = futures::stream::unfold(guard, |mut guard| async move {
        match guard.sub.recv().await {
            Some(event) => {
                let sse_event = Event::default()
                    .event(event.event)
                    .data(String::from_utf8_lossy(&event.data).into_owned());
                Some((Ok::<_, Infallible>(sse_event), guard))
            }
            None => None,
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize)]
struct PublishBody {
    #[serde(default = "default_event_name")]
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

fn default_event_name() -> String {
    "message".to_string()
}

async fn events_publish(
    State(state): State<SharedState>,
    Path(channel): Path<String>,
    Json(body): Json<PublishBody>,
) -> impl IntoResponse {
    state.hub.publish(&channel, &body.event, &body.data).await;
    StatusCode::ACCEPTED
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::WorkerPool;
    use crate::worker::{Worker, WorkerConfig};
    use axum::http::header::HeaderValue;

    fn stub_state(fast: usize, slow: usize) -> SharedState {
        let make = |n: usize| {
            WorkerPool::from_workers(
                (0..n)
                    .map(|_| Arc::new(Worker::detached(WorkerConfig::default())))
                    .collect(),
            )
        };
        Arc::new(AppState {
            dispatcher: Arc::new(Dispatcher::from_pools(make(fast), make(slow))),
            hub: Arc::new(EventHub::new()),
            config: HttpConfig::default(),
        })
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[test]
    fn build_payload_takes_path_query_and_first_header_value() {
        let uri: Uri = "/orders?draft=1".parse().unwrap();
        let mut headers = axum::http::HeaderMap::new();
        headers.append("x-tag", HeaderValue::from_static("one"));
        headers.append("x-tag", HeaderValue::from_static("two"));
        headers.insert("host", HeaderValue::from_static("localhost"));

        let payload = build_payload(&Method::POST, &uri, &headers, b"body bytes");

        assert_eq!(payload.method, "POST");
        assert_eq!(payload.path, "/orders?draft=1");
        assert_eq!(payload.headers["x-tag"], "one");
        assert_eq!(payload.headers["host"], "localhost");
        assert_eq!(payload.body, "body bytes");
        assert!(!payload.id.is_empty());
    }

    #[test]
    fn render_unary_maps_zero_status_to_ok() {
        let response = render_unary(ResponsePayload {
            status: 0,
            headers: std::collections::HashMap::from([(
                "X-Powered-By".to_string(),
                "framegate".to_string(),
            )]),
            body: "hello".to_string(),
        });
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("X-Powered-By").unwrap(),
            "framegate"
        );
    }

    #[test]
    fn render_unary_keeps_explicit_status() {
        let response = render_unary(ResponsePayload {
            status: 418,
            ..Default::default()
        });
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    }

    #[tokio::test]
    async fn health_endpoint() {
        let app = router(stub_state(1, 1));
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/__health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "OK");
    }

    #[tokio::test]
    async fn stats_endpoint_reports_pools() {
        let state = stub_state(2, 1);
        state.dispatcher.mark_all_workers_dead();
        let app = router(state);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/__stats")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_string(response).await;
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["fast"]["workers"], 2);
        assert_eq!(value["fast"]["dead_workers"], 2);
        assert_eq!(value["slow"]["workers"], 1);
    }

    #[tokio::test]
    async fn recycle_endpoint_marks_workers_dead() {
        let state = stub_state(2, 2);
        let app = router(Arc::clone(&state));

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method(Method::POST)
                    .uri("/__recycle")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let stats = state.dispatcher.stats();
        assert_eq!(stats.fast.dead_workers, 2);
        assert_eq!(stats.slow.dead_workers, 2);
    }

    #[tokio::test]
    async fn publish_endpoint_feeds_the_hub() {
        let state = stub_state(1, 1);
        let mut sub = state.hub.subscribe("deploys");
        let app = router(Arc::clone(&state));

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method(Method::POST)
                    .uri("/__events/deploys")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"event":"finished","data":{"ok":true}}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let event = sub.recv().await.expect("published event should arrive");
        assert_eq!(event.event, "finished");
        assert_eq!(event.data, br#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn dispatch_failure_surfaces_as_500() {
        // Stub workers have no process, so dispatch fails.
        let app = router(stub_state(1, 1));
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/anything")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn static_rule_serves_file_before_workers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("public/assets")).unwrap();
        std::fs::write(dir.path().join("public/assets/app.css"), "body{}").unwrap();

        let state = {
            let base = stub_state(1, 1);
            Arc::new(AppState {
                dispatcher: Arc::clone(&base.dispatcher),
                hub: Arc::clone(&base.hub),
                config: HttpConfig {
                    project_root: dir.path().to_path_buf(),
                    static_rules: vec![StaticRule {
                        prefix: "/assets/".to_string(),
                        dir: PathBuf::from("public/assets"),
                    }],
                    stream_prefixes: Vec::new(),
                },
            })
        };
        let app = router(state);

        let response = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/assets/app.css")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "body{}");

        // A miss under the prefix falls through to the (stub) workers.
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/assets/missing.css")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn static_rules_ignore_post() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("public")).unwrap();
        std::fs::write(dir.path().join("public/form.html"), "<form>").unwrap();

        let state = {
            let base = stub_state(1, 1);
            Arc::new(AppState {
                dispatcher: Arc::clone(&base.dispatcher),
                hub: Arc::clone(&base.hub),
                config: HttpConfig {
                    project_root: dir.path().to_path_buf(),
                    static_rules: vec![StaticRule {
                        prefix: "/".to_string(),
                        dir: PathBuf::from("public"),
                    }],
                    stream_prefixes: Vec::new(),
                },
            })
        };
        let app = router(state);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method(Method::POST)
                    .uri("/form.html")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        // POST skips the static path and lands on the stub workers.
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
