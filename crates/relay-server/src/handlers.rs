//! HTTP handlers for the relay server.
//!
//! Publishing is plain request/response. Receiving holds the response open
//! and streams one JSON line per envelope until the client goes away.

use crate::config::{Config, LimitsConfig};
use crate::error::ApiError;
use crate::metrics::{self, SubscriberMetricsGuard};
use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use relay_core::{
    BroadcastRegistry, DeliverySession, Envelope, EnvelopeSink, Keepalive, LineEncoder, Payload,
    SinkError,
};
use relay_protocol::{FileMessage, TextMessage, MESSAGE_ID_HEADER, STREAM_CONTENT_TYPE};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Lines buffered between a session and the response body.
const BODY_CHANNEL_CAPACITY: usize = 16;

/// How often registry totals are copied into the metrics exporter.
const METRICS_SYNC_INTERVAL: Duration = Duration::from_secs(5);

/// Sender used when neither the request nor its credentials name one.
const ANONYMOUS_SENDER: &str = "anon";

/// Shared server state.
pub struct AppState {
    /// The subscriber registry.
    pub registry: BroadcastRegistry,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            registry: BroadcastRegistry::with_config(config.subscribers.to_registry_config()),
            config,
        }
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.body_limit();

    Router::new()
        .route("/send", post(send_handler))
        .route("/file", post(file_handler))
        .route("/receive", get(receive_handler))
        .route("/health", get(health_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Run the HTTP server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }

        // Keepalive pings and notices are published outside any request.
        let registry = state.registry.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(METRICS_SYNC_INTERVAL);
            loop {
                ticker.tick().await;
                metrics::set_registry_stats(registry.stats());
            }
        });
    }

    if config.keepalive.enabled {
        Keepalive::new(
            state.registry.clone(),
            config.keepalive.to_keepalive_config(),
        )
        .spawn();
    }

    let app = router(state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Relay server listening on {}", addr);
    info!("Stream endpoint: http://{}/receive", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.registry.stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "subscribers": stats.subscriber_count,
        "published": stats.published,
        "dropped": stats.dropped,
    }))
}

/// Publish a text message.
async fn send_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let msg: TextMessage = serde_json::from_slice(&body).map_err(|e| {
        debug!(error = %e, "Invalid JSON on /send");
        ApiError::InvalidJson
    })?;

    let sender = resolve_sender(&headers, msg.sender);
    let id = publish(&state, Payload::text(sender, msg.text));

    debug!(msg = %id, "Published text message");
    Ok((StatusCode::NO_CONTENT, [(MESSAGE_ID_HEADER, id)]))
}

/// Publish one chunk of a file.
async fn file_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let mut msg: FileMessage = serde_json::from_slice(&body).map_err(|e| {
        debug!(error = %e, "Invalid JSON on /file");
        ApiError::InvalidJson
    })?;

    msg.sender = resolve_sender(&headers, std::mem::take(&mut msg.sender));
    validate_file(&msg, &state.config.limits)?;

    let id = publish(&state, Payload::File(msg.into()));

    debug!(msg = %id, "Published file chunk");
    Ok((StatusCode::NO_CONTENT, [(MESSAGE_ID_HEADER, id)]))
}

/// Stream envelopes to the client until it disconnects.
async fn receive_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(BODY_CHANNEL_CAPACITY);
    let mut session = DeliverySession::open(&state.registry);
    metrics::set_registry_stats(state.registry.stats());

    // The receiver lives in the response body; hyper drops it when the
    // client goes away, which resolves `closed()`.
    let watch = tx.clone();
    let registry = state.registry.clone();
    tokio::spawn(async move {
        let _metrics_guard = SubscriberMetricsGuard::new();
        let mut sink = BodySink::new(tx);
        let end = session
            .run(&mut sink, async move { watch.closed().await })
            .await;
        debug!(rcv = %session.id(), ?end, "Receiver finished");
        metrics::set_registry_stats(registry.stats());
    });

    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|line| (line, rx))
    });

    (
        [
            (header::CONTENT_TYPE, STREAM_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
            (header::EXPIRES, "0"),
        ],
        Body::from_stream(stream),
    )
}

/// Stamp, count and broadcast a payload. Returns the new envelope's id.
fn publish(state: &AppState, payload: Payload) -> String {
    let envelope = state.registry.envelope(payload);
    let id = envelope.id().to_string();

    state.registry.publish(envelope);
    metrics::set_registry_stats(state.registry.stats());

    id
}

/// Credentials win over the body; an empty result becomes anonymous.
fn resolve_sender(headers: &HeaderMap, body_sender: String) -> String {
    let sender = basic_auth_user(headers).unwrap_or(body_sender);
    if sender.is_empty() {
        ANONYMOUS_SENDER.to_string()
    } else {
        sender
    }
}

/// Username from a well-formed `Authorization: Basic` header.
fn basic_auth_user(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }

    let decoded = BASE64_STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, _password) = decoded.split_once(':')?;
    Some(user.to_string())
}

fn validate_file(msg: &FileMessage, limits: &LimitsConfig) -> Result<(), ApiError> {
    if msg.total_size == 0 {
        return Err(ApiError::EmptyFile);
    }

    let limit = limits.file_size_limit;
    if limit != 0 {
        if msg.total_size > limit {
            return Err(ApiError::FileTooLarge);
        }
        if msg.offset > limit {
            return Err(ApiError::OffsetTooLarge);
        }
    }

    if msg.data_b64.len() > limits.chunk_size_limit {
        return Err(ApiError::ChunkTooLarge);
    }

    Ok(())
}

/// Writes encoded lines into the streaming response body.
struct BodySink {
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
    encoder: LineEncoder,
}

impl BodySink {
    fn new(tx: mpsc::Sender<Result<Bytes, io::Error>>) -> Self {
        Self {
            tx,
            encoder: LineEncoder::new(),
        }
    }
}

#[async_trait]
impl EnvelopeSink for BodySink {
    async fn write(&mut self, envelope: &Envelope) -> Result<(), SinkError> {
        let line = self.encoder.encode(envelope)?;
        let len = line.len();

        self.tx.send(Ok(line)).await.map_err(|_| SinkError::Closed)?;
        metrics::record_streamed(len);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use relay_protocol::{codec, WireMessage};
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        let mut config = Config::default();
        config.limits.file_size_limit = 1024;
        config.limits.chunk_size_limit = 64;
        config.metrics.enabled = false;
        config.keepalive.enabled = false;
        Arc::new(AppState::new(config))
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn file_body(total_size: u64, offset: u64, data: &str) -> String {
        serde_json::json!({
            "filename": "a.txt",
            "mimetype": "text/plain",
            "total_size": total_size,
            "offset": offset,
            "data_b64": data,
        })
        .to_string()
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn next_line(body: &mut Body) -> WireMessage {
        let frame = tokio::time::timeout(Duration::from_secs(1), body.frame())
            .await
            .expect("stream stalled")
            .expect("stream ended")
            .unwrap();
        let data = frame.into_data().unwrap();
        codec::decode_line(&data).unwrap()
    }

    #[tokio::test]
    async fn test_send_publishes_text() {
        let state = test_state();
        let mut sub = state.registry.subscribe();
        let _join = sub.try_recv().unwrap();

        let response = router(state.clone())
            .oneshot(post_json("/send", r#"{"sender":"alice","text":"hi"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let id = response.headers()[MESSAGE_ID_HEADER].to_str().unwrap().to_string();

        let envelope = sub.try_recv().unwrap();
        assert_eq!(envelope.id(), id);
        assert_eq!(envelope.payload(), &Payload::text("alice", "hi"));
    }

    #[tokio::test]
    async fn test_send_rejects_invalid_json() {
        let state = test_state();
        let response = router(state.clone())
            .oneshot(post_json("/send", "{not json"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(response).await, "Bad Request: Invalid JSON");
        assert_eq!(state.registry.stats().published, 0);
    }

    #[tokio::test]
    async fn test_sender_resolution() {
        let state = test_state();
        let mut sub = state.registry.subscribe();
        let _join = sub.try_recv().unwrap();

        // "bob:secret"
        let mut request = post_json("/send", r#"{"sender":"alice","text":"a"}"#);
        request
            .headers_mut()
            .insert(header::AUTHORIZATION, "Basic Ym9iOnNlY3JldA==".parse().unwrap());
        router(state.clone()).oneshot(request).await.unwrap();

        router(state.clone())
            .oneshot(post_json("/send", r#"{"text":"b"}"#))
            .await
            .unwrap();

        assert_eq!(sub.try_recv().unwrap().payload(), &Payload::text("bob", "a"));
        assert_eq!(sub.try_recv().unwrap().payload(), &Payload::text("anon", "b"));
    }

    #[test]
    fn test_basic_auth_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(basic_auth_user(&headers), None);

        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(basic_auth_user(&headers), None);

        // No colon after decoding.
        headers.insert(header::AUTHORIZATION, "Basic Ym9i".parse().unwrap());
        assert_eq!(basic_auth_user(&headers), None);

        // ":pw" has an empty username.
        headers.insert(header::AUTHORIZATION, "basic OnB3".parse().unwrap());
        assert_eq!(basic_auth_user(&headers), Some(String::new()));
        assert_eq!(resolve_sender(&headers, "carol".into()), "anon");
    }

    #[tokio::test]
    async fn test_file_validation() {
        let cases = [
            (file_body(0, 0, "aGk="), "Bad Request: File must have size"),
            (file_body(2048, 0, "aGk="), "Bad Request: File Too Large"),
            (file_body(10, 2048, "aGk="), "Bad Request: Offset Too Large"),
            (file_body(10, 0, &"A".repeat(65)), "Bad Request: Chunk Too Large"),
        ];

        let state = test_state();
        for (body, expected) in cases {
            let response = router(state.clone())
                .oneshot(post_json("/file", &body))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            assert_eq!(body_text(response).await, expected);
        }
        assert_eq!(state.registry.stats().published, 0);
    }

    #[tokio::test]
    async fn test_file_limit_zero_disables_size_checks() {
        let mut config = Config::default();
        config.limits.file_size_limit = 0;
        config.metrics.enabled = false;
        let state = Arc::new(AppState::new(config));
        let mut sub = state.registry.subscribe();
        let _join = sub.try_recv().unwrap();

        let response = router(state.clone())
            .oneshot(post_json("/file", &file_body(u64::MAX, u64::MAX - 1, "aGk=")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let envelope = sub.try_recv().unwrap();
        match envelope.payload() {
            Payload::File(chunk) => {
                assert_eq!(chunk.sender, "anon");
                assert_eq!(chunk.filename, "a.txt");
                assert_eq!(chunk.data, "aGk=");
            }
            other => panic!("expected file chunk, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_receive_streams_lines() {
        let state = test_state();
        let response = router(state.clone())
            .oneshot(Request::get("/receive").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], STREAM_CONTENT_TYPE);
        assert_eq!(
            response.headers()[header::CACHE_CONTROL],
            "no-cache, no-store, must-revalidate"
        );
        assert_eq!(response.headers()[header::EXPIRES], "0");

        let mut body = response.into_body();

        let hello = next_line(&mut body).await;
        assert_eq!(hello.id, "SERVER-HELLO");
        assert!(hello.ping.present);
        assert!(hello.ping.random.is_empty());

        let join = next_line(&mut body).await;
        assert_eq!(join.system.text, "total subscribers +1 = 1");

        state.registry.publish_payload(Payload::text("alice", "hi"));
        let text = next_line(&mut body).await;
        assert!(text.text.present);
        assert_eq!(text.text.sender, "alice");
        assert_eq!(text.text.text, "hi");

        drop(body);
        tokio::time::timeout(Duration::from_secs(1), async {
            while state.registry.subscriber_count() != 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("subscriber not released after disconnect");
    }

    #[tokio::test]
    async fn test_health() {
        let state = test_state();
        let response = router(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["subscribers"], 0);
    }
}
