//! HTTP surface: the SSE fragment stream, client commands, and a small
//! read-only JSON API.
//!
//! Commands never fail from the client's point of view. Bad or incomplete
//! parameters are ignored and backend errors are logged; the response is
//! `204 No Content` either way.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use futures::Stream;
use ircdeck_core::backend::AddServerParams;
use ircdeck_core::error::PushError;
use ircdeck_core::fragment::{EncodedFragment, TreeEntry};
use ircdeck_core::history::DEFAULT_SESSION;
use ircdeck_core::stream::{FragmentSink, StreamCoordinator};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};

use crate::network::NetworkManager;

/// Fragments buffered per client before pushes start waiting.
const CLIENT_BUFFER: usize = 64;

pub struct AppState {
    pub coordinator: Arc<StreamCoordinator<NetworkManager>>,
    /// Bound on handing one fragment to a client's SSE stream.
    pub push_timeout: Duration,
    started: Instant,
}

impl AppState {
    pub fn new(coordinator: Arc<StreamCoordinator<NetworkManager>>, push_timeout: Duration) -> Self {
        Self {
            coordinator,
            push_timeout,
            started: Instant::now(),
        }
    }
}

// ── SSE transport ──────────────────────────────────────────────────────

/// Feeds one client's SSE response.
///
/// Each fragment becomes one `fragment` event. The receiver side is owned by
/// the response body, so it is dropped when the client goes away.
pub struct SseSink {
    tx: mpsc::Sender<EncodedFragment>,
    timeout: Duration,
}

impl SseSink {
    pub fn new(timeout: Duration) -> (Self, mpsc::Receiver<EncodedFragment>) {
        let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
        (Self { tx, timeout }, rx)
    }
}

impl FragmentSink for SseSink {
    async fn push(&mut self, fragments: Vec<EncodedFragment>) -> Result<(), PushError> {
        for fragment in fragments {
            self.tx
                .send_timeout(fragment, self.timeout)
                .await
                .map_err(|e| match e {
                    mpsc::error::SendTimeoutError::Timeout(_) => PushError::TimedOut(self.timeout),
                    mpsc::error::SendTimeoutError::Closed(_) => PushError::Closed,
                })?;
        }
        Ok(())
    }

    async fn closed(&self) {
        self.tx.closed().await
    }
}

/// `{"selector": ..., "payload": ...}`. Selectors are fixed ASCII, so no
/// escaping is needed; the payload is already JSON.
fn fragment_json(fragment: &EncodedFragment) -> String {
    format!(
        r#"{{"selector":"{}","payload":{}}}"#,
        fragment.selector, fragment.data
    )
}

fn sse_event(fragment: &EncodedFragment) -> SseEvent {
    SseEvent::default().event("fragment").data(fragment_json(fragment))
}

// ── Router ─────────────────────────────────────────────────────────────

pub fn router(state: Arc<AppState>, web_static_dir: Option<&str>) -> Router {
    let mut app = Router::new()
        .route("/stream", get(stream))
        .route("/focus/server", post(focus_server))
        .route("/focus/window", post(focus_window))
        .route("/input", post(submit_input))
        .route("/history/up", post(history_up))
        .route("/history/down", post(history_down))
        .route("/servers", post(add_server))
        .route("/servers/{server}", delete(remove_server))
        .route("/api/v1/health", get(api_health))
        .route("/api/v1/tree", get(api_tree))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    if let Some(web_dir) = web_static_dir {
        let dir = std::path::PathBuf::from(web_dir);
        if dir.exists() {
            tracing::info!("Serving web client from {}", dir.display());
            let index_path = dir.join("index.html");
            let serve = tower_http::services::ServeDir::new(&dir)
                .append_index_html_on_directories(true)
                .fallback(tower_http::services::ServeFile::new(index_path));
            app = app.fallback_service(serve);
        } else {
            tracing::warn!("Web static dir not found: {}", dir.display());
        }
    }

    app.with_state(state)
}

// ── Handlers ───────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct SessionQuery {
    pub session: Option<String>,
}

async fn stream(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SessionQuery>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let session = q.session.unwrap_or_else(|| DEFAULT_SESSION.to_string());
    let (sink, rx) = SseSink::new(state.push_timeout);
    let client = state.coordinator.open(&session, sink);
    tokio::spawn(client.run());

    let events = futures::stream::unfold(rx, |mut rx| async move {
        let fragment = rx.recv().await?;
        Some((Ok(sse_event(&fragment)), rx))
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

#[derive(Debug, Default, Deserialize)]
pub struct FocusQuery {
    pub server: Option<String>,
    pub window: Option<String>,
}

async fn focus_server(State(state): State<Arc<AppState>>, Query(q): Query<FocusQuery>) -> StatusCode {
    if let Some(server) = q.server.as_deref().filter(|s| !s.is_empty()) {
        state.coordinator.focus_server(server);
    }
    StatusCode::NO_CONTENT
}

async fn focus_window(State(state): State<Arc<AppState>>, Query(q): Query<FocusQuery>) -> StatusCode {
    if let Some(window) = q.window.as_deref().filter(|w| !w.is_empty()) {
        let server = q.server.as_deref().filter(|s| !s.is_empty());
        state.coordinator.focus_window(server, window);
    }
    StatusCode::NO_CONTENT
}

#[derive(Debug, Default, Deserialize)]
pub struct InputQuery {
    pub session: Option<String>,
    pub input: Option<String>,
}

impl InputQuery {
    fn session(&self) -> &str {
        self.session.as_deref().unwrap_or(DEFAULT_SESSION)
    }
}

async fn submit_input(State(state): State<Arc<AppState>>, Query(q): Query<InputQuery>) -> StatusCode {
    if let Some(input) = q.input.as_deref() {
        state.coordinator.submit_input(q.session(), input).await;
    }
    StatusCode::NO_CONTENT
}

#[derive(Debug, Serialize)]
pub struct HistoryValue {
    pub value: String,
}

fn history_response(value: Option<String>) -> Response {
    match value {
        Some(value) => Json(HistoryValue { value }).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn history_up(State(state): State<Arc<AppState>>, Query(q): Query<InputQuery>) -> Response {
    let current = q.input.as_deref().unwrap_or("");
    history_response(state.coordinator.history_up(q.session(), current))
}

async fn history_down(State(state): State<Arc<AppState>>, Query(q): Query<InputQuery>) -> Response {
    history_response(state.coordinator.history_down(q.session()))
}

async fn add_server(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AddServerParams>,
) -> StatusCode {
    if let Err(e) = state.coordinator.add_server(&params).await {
        tracing::warn!(hostname = ?params.hostname, error = %e, "add server failed");
    }
    StatusCode::NO_CONTENT
}

async fn remove_server(State(state): State<Arc<AppState>>, Path(server): Path<String>) -> StatusCode {
    if let Err(e) = state.coordinator.remove_server(&server).await {
        tracing::warn!(server = %server, error = %e, "remove server failed");
    }
    StatusCode::NO_CONTENT
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub networks: usize,
    pub connected: usize,
    pub dropped_notifications: u64,
    pub uptime_secs: u64,
}

async fn api_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let manager = state.coordinator.backend();
    let networks = manager.networks();
    Json(HealthResponse {
        networks: networks.len(),
        connected: networks.iter().filter(|n| n.is_connected()).count(),
        dropped_notifications: manager.dropped_notifications(),
        uptime_secs: state.started.elapsed().as_secs(),
    })
}

async fn api_tree(State(state): State<Arc<AppState>>) -> Json<Vec<TreeEntry>> {
    Json(state.coordinator.tree_entries())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ircdeck_core::backend::AddServer;
    use ircdeck_core::notify::NotificationQueue;
    use ircdeck_core::stream::StreamConfig;
    use ircdeck_sdk::client::{ClientHandle, Command};
    use ircdeck_sdk::event::Event;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        state: Arc<AppState>,
        commands: mpsc::Receiver<Command>,
    }

    fn fixture() -> Fixture {
        let queue = NotificationQueue::new(8, Duration::from_millis(10));
        let manager = Arc::new(NetworkManager::new(queue.sender(), None));
        let (tx, commands) = mpsc::channel(16);
        let network = manager
            .register(
                AddServer {
                    hostname: "irc.test".to_string(),
                    port: 6667,
                    tls: false,
                    nick: "deck".to_string(),
                    sasl_user: None,
                    sasl_password: None,
                    channels: Vec::new(),
                },
                ClientHandle::from_sender(tx),
            )
            .unwrap();
        network.apply(Event::Registered {
            nick: "deck".to_string(),
        });
        network.apply(Event::Joined {
            channel: "#rust".to_string(),
            nick: "deck".to_string(),
        });

        let coordinator = Arc::new(StreamCoordinator::new(
            manager,
            queue,
            StreamConfig::default(),
            CancellationToken::new(),
        ));
        Fixture {
            state: Arc::new(AppState::new(coordinator, Duration::from_millis(50))),
            commands,
        }
    }

    fn focus(server: Option<&str>, window: Option<&str>) -> Query<FocusQuery> {
        Query(FocusQuery {
            server: server.map(str::to_string),
            window: window.map(str::to_string),
        })
    }

    fn input(text: &str) -> Query<InputQuery> {
        Query(InputQuery {
            session: None,
            input: Some(text.to_string()),
        })
    }

    #[tokio::test]
    async fn focus_then_input_reaches_the_server() {
        let mut f = fixture();
        let status = focus_window(State(f.state.clone()), focus(Some("irc.test"), Some("#rust"))).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        submit_input(State(f.state.clone()), input("hello")).await;
        assert_eq!(
            f.commands.try_recv().unwrap(),
            Command::Privmsg {
                target: "#rust".to_string(),
                text: "hello".to_string()
            }
        );
    }

    #[tokio::test]
    async fn missing_parameters_are_ignored() {
        let f = fixture();
        focus_server(State(f.state.clone()), focus(None, None)).await;
        focus_window(State(f.state.clone()), focus(Some("irc.test"), None)).await;
        assert_eq!(f.state.coordinator.selection(), (None, None));
        let status = add_server(State(f.state.clone()), Query(AddServerParams::default())).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn history_endpoints() {
        let f = fixture();
        submit_input(State(f.state.clone()), input("first")).await;

        let up = history_up(State(f.state.clone()), input("")).await;
        assert_eq!(up.status(), StatusCode::OK);
        let down = history_down(State(f.state.clone()), input("")).await;
        assert_eq!(down.status(), StatusCode::OK, "leaving navigation clears the line");
        let down = history_down(State(f.state.clone()), input("")).await;
        assert_eq!(down.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn tree_and_health() {
        let f = fixture();
        let Json(tree) = api_tree(State(f.state.clone())).await;
        let ids: Vec<_> = tree.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["irc.test", "irc.test/#rust"]);

        let Json(health) = api_health(State(f.state.clone())).await;
        assert_eq!(health.networks, 1);
        assert_eq!(health.connected, 1);
        assert_eq!(health.dropped_notifications, 0);
    }

    #[tokio::test]
    async fn remove_unknown_server_is_no_content() {
        let f = fixture();
        let status = remove_server(State(f.state.clone()), Path("nope".to_string())).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(f.state.coordinator.backend().networks().len(), 1);
    }

    #[tokio::test]
    async fn sse_sink_reports_closed_and_timeouts() {
        let (mut sink, mut rx) = SseSink::new(Duration::from_millis(20));
        let fragment = EncodedFragment {
            selector: "#input",
            data: "{}".to_string(),
        };

        // Fill the buffer, then one more times out.
        let batch = vec![fragment.clone(); CLIENT_BUFFER];
        sink.push(batch).await.unwrap();
        let err = sink.push(vec![fragment.clone()]).await.unwrap_err();
        assert!(matches!(err, PushError::TimedOut(_)));

        assert_eq!(rx.recv().await.unwrap(), fragment);
        drop(rx);
        tokio::time::timeout(Duration::from_millis(100), sink.closed())
            .await
            .expect("closed resolves once the client is gone");
        let err = sink.push(vec![fragment]).await.unwrap_err();
        assert!(matches!(err, PushError::Closed));
    }

    #[test]
    fn fragment_json_wraps_selector_and_payload() {
        let json = fragment_json(&EncodedFragment {
            selector: "#tree",
            data: r#"{"type":"tree","data":{"entries":[]}}"#.to_string(),
        });
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["selector"], "#tree");
        assert_eq!(value["payload"]["type"], "tree");
    }
}
