//! End-to-end tests of the stream coordinator against an in-memory backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use ircdeck_core::backend::{
    AddServer, AddServerParams, Backend, ConnectionInfo, ConnectionSnapshot, Line, LineKind,
    SnapshotConnection, SnapshotItem, ViewRef, WindowContent,
};
use ircdeck_core::error::{BackendError, PushError};
use ircdeck_core::fragment::{EncodedFragment, NOTIFICATIONS, TREE, WINDOW};
use ircdeck_core::input::InputCommand;
use ircdeck_core::notify::{Notification, NotificationKind, NotificationQueue};
use ircdeck_core::stream::{FragmentSink, StreamConfig, StreamCoordinator, StreamState};

#[derive(Debug, Clone, PartialEq)]
struct View(String);

impl ViewRef for View {}

#[derive(Default)]
struct FakeState {
    /// server -> (channels, queries)
    servers: Vec<(String, Vec<String>, Vec<String>)>,
    lines: HashMap<String, Vec<String>>,
    sent: Vec<(String, String, String)>,
    executed: Vec<InputCommand>,
}

#[derive(Default)]
struct FakeBackend {
    state: Mutex<FakeState>,
}

impl FakeBackend {
    fn with(servers: &[(&str, &[&str])]) -> Arc<Self> {
        let backend = Self::default();
        backend.state.lock().servers = servers
            .iter()
            .map(|(s, chans)| (s.to_string(), chans.iter().map(|c| c.to_string()).collect(), Vec::new()))
            .collect();
        Arc::new(backend)
    }

    fn remove_channel(&self, server: &str, channel: &str) {
        let mut state = self.state.lock();
        if let Some(entry) = state.servers.iter_mut().find(|(s, _, _)| s == server) {
            entry.1.retain(|c| c != channel);
        }
    }

    fn sent(&self) -> Vec<(String, String, String)> {
        self.state.lock().sent.clone()
    }
}

impl Backend for FakeBackend {
    type View = View;

    fn snapshot(&self) -> ConnectionSnapshot<View> {
        let state = self.state.lock();
        let item = |server: &str, name: &str| SnapshotItem::new(name, name, View(format!("{server}/{name}")));
        ConnectionSnapshot {
            connections: state
                .servers
                .iter()
                .map(|(server, chans, queries)| SnapshotConnection {
                    item: SnapshotItem::new(server.as_str(), server.as_str(), View(server.clone())),
                    channels: chans.iter().map(|c| item(server.as_str(), c.as_str())).collect(),
                    queries: queries.iter().map(|q| item(server.as_str(), q.as_str())).collect(),
                })
                .collect(),
        }
    }

    fn connection(&self, identity: &str) -> Option<ConnectionInfo> {
        let state = self.state.lock();
        state.servers.iter().any(|(s, _, _)| s == identity).then(|| ConnectionInfo {
            identity: identity.to_string(),
            nick: "deck".to_string(),
            connected: true,
        })
    }

    fn window_content(&self, view: &View) -> WindowContent {
        let state = self.state.lock();
        WindowContent {
            title: view.0.clone(),
            topic: None,
            lines: state
                .lines
                .get(&view.0)
                .into_iter()
                .flatten()
                .map(|text| Line {
                    timestamp: "00:00".to_string(),
                    from: "deck".to_string(),
                    text: text.clone(),
                    kind: LineKind::Message,
                })
                .collect(),
            nicks: Vec::new(),
        }
    }

    async fn send_message(&self, server: &str, window: &str, text: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state
            .lines
            .entry(format!("{server}/{window}"))
            .or_default()
            .push(text.to_string());
        state.sent.push((server.to_string(), window.to_string(), text.to_string()));
        Ok(())
    }

    async fn execute(
        &self,
        server: &str,
        _window: Option<&str>,
        command: InputCommand,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if let InputCommand::Msg { target, .. } = &command
            && let Some(entry) = state.servers.iter_mut().find(|(s, _, _)| s == server)
        {
            entry.2.push(target.clone());
        }
        state.executed.push(command);
        Ok(())
    }

    async fn add_server(&self, server: AddServer) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if state.servers.iter().any(|(s, _, _)| *s == server.hostname) {
            return Err(BackendError::DuplicateServer(server.hostname));
        }
        state.servers.push((server.hostname, server.channels, Vec::new()));
        Ok(())
    }

    async fn remove_server(&self, identity: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let before = state.servers.len();
        state.servers.retain(|(s, _, _)| s != identity);
        if state.servers.len() == before {
            return Err(BackendError::UnknownServer(identity.to_string()));
        }
        Ok(())
    }
}

struct ChannelSink {
    tx: mpsc::UnboundedSender<Vec<EncodedFragment>>,
    gone: CancellationToken,
}

impl FragmentSink for ChannelSink {
    async fn push(&mut self, fragments: Vec<EncodedFragment>) -> Result<(), PushError> {
        self.tx.send(fragments).map_err(|_| PushError::Closed)
    }

    async fn closed(&self) {
        self.gone.cancelled().await
    }
}

struct Harness {
    backend: Arc<FakeBackend>,
    coordinator: Arc<StreamCoordinator<FakeBackend>>,
    queue_tx: ircdeck_core::notify::NotificationSender,
    shutdown: CancellationToken,
}

fn harness(tick: Duration) -> Harness {
    let backend = FakeBackend::with(&[("s1", &["#x", "#y"][..]), ("s2", &["#z"][..])]);
    let queue = NotificationQueue::new(8, Duration::from_millis(50));
    let queue_tx = queue.sender();
    let shutdown = CancellationToken::new();
    let config = StreamConfig {
        tick,
        ..StreamConfig::default()
    };
    let coordinator = Arc::new(StreamCoordinator::new(
        backend.clone(),
        queue,
        config,
        shutdown.clone(),
    ));
    Harness {
        backend,
        coordinator,
        queue_tx,
        shutdown,
    }
}

struct Client {
    rx: mpsc::UnboundedReceiver<Vec<EncodedFragment>>,
    gone: CancellationToken,
    task: tokio::task::JoinHandle<StreamState>,
}

fn open(h: &Harness, session: &str) -> Client {
    let (tx, rx) = mpsc::unbounded_channel();
    let gone = CancellationToken::new();
    let stream = h.coordinator.open(
        session,
        ChannelSink {
            tx,
            gone: gone.clone(),
        },
    );
    Client {
        rx,
        gone,
        task: tokio::spawn(stream.run()),
    }
}

async fn next_push(client: &mut Client) -> Vec<EncodedFragment> {
    tokio::time::timeout(Duration::from_millis(500), client.rx.recv())
        .await
        .expect("push within 500ms")
        .expect("stream still open")
}

fn fragment<'a>(batch: &'a [EncodedFragment], selector: &str) -> Option<&'a str> {
    batch.iter().find(|f| f.selector == selector).map(|f| f.data.as_str())
}

fn active_id(tree_json: &str) -> Option<String> {
    let json: serde_json::Value = serde_json::from_str(tree_json).unwrap();
    json["data"]["entries"]
        .as_array()
        .unwrap()
        .iter()
        .find(|e| e["active"] == true)
        .map(|e| e["id"].as_str().unwrap().to_string())
}

#[tokio::test]
async fn submitted_input_is_sent_and_pushed_before_tick() {
    let h = harness(Duration::from_secs(5));
    h.coordinator.focus_window(Some("s1"), "#x");
    let mut client = open(&h, "default");

    let initial = next_push(&mut client).await;
    assert!(fragment(&initial, TREE).is_some(), "initial push carries the tree");
    assert!(fragment(&initial, WINDOW).is_some(), "initial push carries the window");

    h.coordinator.submit_input("default", "hello").await;
    assert_eq!(
        h.backend.sent(),
        vec![("s1".to_string(), "#x".to_string(), "hello".to_string())]
    );

    let update = next_push(&mut client).await;
    let window = fragment(&update, WINDOW).expect("window re-sent");
    assert!(window.contains("hello"), "window fragment shows the sent line: {window}");
    assert!(fragment(&update, TREE).is_none(), "unchanged tree is not re-sent");

    client.gone.cancel();
}

#[tokio::test]
async fn client_disconnect_ends_the_loop() {
    let h = harness(Duration::from_secs(5));
    let mut client = open(&h, "default");
    next_push(&mut client).await;

    client.gone.cancel();
    let state = tokio::time::timeout(Duration::from_millis(500), client.task)
        .await
        .expect("loop exits promptly")
        .unwrap();
    assert_eq!(state, StreamState::Closed);
}

#[tokio::test]
async fn server_shutdown_ends_every_loop() {
    let h = harness(Duration::from_secs(5));
    let mut a = open(&h, "a");
    let mut b = open(&h, "b");
    next_push(&mut a).await;
    next_push(&mut b).await;

    h.shutdown.cancel();
    for client in [a, b] {
        let state = tokio::time::timeout(Duration::from_millis(500), client.task)
            .await
            .expect("loop exits promptly")
            .unwrap();
        assert_eq!(state, StreamState::Closed);
    }
}

#[tokio::test]
async fn removed_window_falls_back_to_first_node() {
    let h = harness(Duration::from_secs(5));
    h.coordinator.focus_window(Some("s1"), "#x");
    h.backend.remove_channel("s1", "#x");

    let mut client = open(&h, "default");
    let initial = next_push(&mut client).await;
    let tree = fragment(&initial, TREE).unwrap();
    assert_eq!(active_id(tree).as_deref(), Some("s1"));
    assert_eq!(h.coordinator.selection(), (Some("s1".to_string()), None));
    client.gone.cancel();
}

#[tokio::test]
async fn focus_is_shared_between_clients() {
    let h = harness(Duration::from_secs(5));
    let mut a = open(&h, "a");
    let mut b = open(&h, "b");
    next_push(&mut a).await;
    next_push(&mut b).await;

    h.coordinator.focus_window(Some("s2"), "#z");
    for client in [&mut a, &mut b] {
        let update = next_push(client).await;
        let tree = fragment(&update, TREE).expect("tree re-sent");
        assert_eq!(active_id(tree).as_deref(), Some("s2/#z"));
    }
    a.gone.cancel();
    b.gone.cancel();
}

#[tokio::test]
async fn unknown_focus_targets_are_ignored() {
    let h = harness(Duration::from_secs(5));
    h.coordinator.focus_server("nope");
    assert_eq!(h.coordinator.selection(), (None, None));

    h.coordinator.focus_window(None, "#x");
    assert_eq!(h.coordinator.selection(), (None, None), "window needs a server");

    h.coordinator.focus_server("s1");
    h.coordinator.focus_window(None, "#missing");
    assert_eq!(h.coordinator.selection(), (Some("s1".to_string()), None));

    h.coordinator.focus_window(None, "#y");
    assert_eq!(
        h.coordinator.selection(),
        (Some("s1".to_string()), Some("#y".to_string()))
    );
}

#[tokio::test]
async fn focus_targets_match_without_case() {
    let h = harness(Duration::from_secs(5));
    h.coordinator.focus_server("S1");
    assert_eq!(h.coordinator.selection(), (Some("s1".to_string()), None));

    h.coordinator.focus_window(Some("S2"), "#Z");
    assert_eq!(
        h.coordinator.selection(),
        (Some("s2".to_string()), Some("#z".to_string()))
    );
    let active = h.coordinator.tree_entries().into_iter().find(|e| e.active).map(|e| e.id);
    assert_eq!(active.as_deref(), Some("s2/#z"));
}

#[tokio::test]
async fn input_without_window_only_records_history() {
    let h = harness(Duration::from_secs(5));
    h.coordinator.submit_input("default", "hello").await;
    assert!(h.backend.sent().is_empty());
    assert_eq!(h.coordinator.history_up("default", "").as_deref(), Some("hello"));
    assert_eq!(h.coordinator.history_up("other", ""), None, "sessions are separate");
}

#[tokio::test]
async fn msg_command_opens_and_focuses_query() {
    let h = harness(Duration::from_secs(5));
    h.coordinator.focus_server("s1");
    h.coordinator.submit_input("default", "/msg bob hi").await;

    let executed = h.backend.state.lock().executed.clone();
    assert_eq!(
        executed,
        vec![InputCommand::Msg {
            target: "bob".to_string(),
            text: "hi".to_string()
        }]
    );
    assert_eq!(
        h.coordinator.selection(),
        (Some("s1".to_string()), Some("bob".to_string()))
    );
}

#[tokio::test]
async fn history_down_clears_line_only_when_leaving_navigation() {
    let h = harness(Duration::from_secs(5));
    h.coordinator.submit_input("s", "one").await;
    h.coordinator.submit_input("s", "two").await;

    assert_eq!(h.coordinator.history_down("s"), None);
    assert_eq!(h.coordinator.history_up("s", "").as_deref(), Some("two"));
    assert_eq!(h.coordinator.history_up("s", "").as_deref(), Some("one"));
    assert_eq!(h.coordinator.history_down("s").as_deref(), Some("two"));
    assert_eq!(h.coordinator.history_down("s").as_deref(), Some(""));
    assert_eq!(h.coordinator.history_down("s"), None);
}

#[tokio::test]
async fn notifications_reach_one_client_once() {
    let h = harness(Duration::from_millis(20));
    let mut client = open(&h, "default");
    next_push(&mut client).await;

    h.queue_tx
        .enqueue(Notification::new(
            NotificationKind::Highlight,
            "s1",
            "#x",
            "alice",
            "deck: ping",
        ))
        .await
        .unwrap();

    let batch = next_push(&mut client).await;
    let data = fragment(&batch, NOTIFICATIONS).expect("notification pushed");
    assert!(data.contains("deck: ping"));
    assert!(data.contains("highlight"));

    // Nothing changed since: later ticks push nothing.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(client.rx.try_recv().is_err());
    client.gone.cancel();
}

/// Fails the `fail_on`-th push (1-based) with `error`, then behaves.
struct FlakySink {
    inner: ChannelSink,
    pushes: usize,
    fail_on: usize,
    error: fn() -> PushError,
}

impl FragmentSink for FlakySink {
    async fn push(&mut self, fragments: Vec<EncodedFragment>) -> Result<(), PushError> {
        self.pushes += 1;
        if self.pushes == self.fail_on {
            return Err((self.error)());
        }
        self.inner.push(fragments).await
    }

    async fn closed(&self) {
        self.inner.closed().await
    }
}

fn open_flaky(h: &Harness, fail_on: usize, error: fn() -> PushError) -> Client {
    let (tx, rx) = mpsc::unbounded_channel();
    let gone = CancellationToken::new();
    let sink = FlakySink {
        inner: ChannelSink {
            tx,
            gone: gone.clone(),
        },
        pushes: 0,
        fail_on,
        error,
    };
    let stream = h.coordinator.open("default", sink);
    Client {
        rx,
        gone,
        task: tokio::spawn(stream.run()),
    }
}

fn highlight(text: &str) -> Notification {
    Notification::new(NotificationKind::Highlight, "s1", "#x", "alice", text)
}

#[tokio::test]
async fn notification_survives_a_timed_out_push() {
    let h = harness(Duration::from_millis(20));
    let mut client = open_flaky(&h, 2, || PushError::TimedOut(Duration::from_millis(1)));
    next_push(&mut client).await;

    h.queue_tx.enqueue(highlight("deck: still there?")).await.unwrap();

    let batch = next_push(&mut client).await;
    let data = fragment(&batch, NOTIFICATIONS).expect("notification retried after the failed push");
    assert!(data.contains("deck: still there?"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(client.rx.try_recv().is_err(), "delivered exactly once");
    client.gone.cancel();
}

#[tokio::test]
async fn closed_client_hands_notifications_to_the_next() {
    let h = harness(Duration::from_millis(20));
    let mut first = open_flaky(&h, 2, || PushError::Closed);
    next_push(&mut first).await;

    h.queue_tx.enqueue(highlight("deck: anyone?")).await.unwrap();
    let state = tokio::time::timeout(Duration::from_millis(500), first.task)
        .await
        .expect("loop exits after a closed push")
        .unwrap();
    assert_eq!(state, StreamState::Closed);

    let mut second = open(&h, "default");
    let mut delivered = false;
    for _ in 0..3 {
        let batch = next_push(&mut second).await;
        if let Some(data) = fragment(&batch, NOTIFICATIONS) {
            assert!(data.contains("deck: anyone?"));
            delivered = true;
            break;
        }
    }
    assert!(delivered, "requeued notification reached the other client");
    second.gone.cancel();
}

#[tokio::test]
async fn add_and_remove_servers() {
    let h = harness(Duration::from_secs(5));
    h.coordinator
        .add_server(&AddServerParams {
            hostname: Some("irc.example.net".to_string()),
            channels: Some("#a".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    h.coordinator.focus_window(Some("irc.example.net"), "#a");
    assert_eq!(
        h.coordinator.selection(),
        (Some("irc.example.net".to_string()), Some("#a".to_string()))
    );

    // Missing hostname is ignored.
    h.coordinator.add_server(&AddServerParams::default()).await.unwrap();

    h.coordinator.remove_server("irc.example.net").await.unwrap();
    let ids: Vec<_> = h.coordinator.tree_entries().into_iter().map(|e| e.id).collect();
    assert_eq!(ids, vec!["s1", "s1/#x", "s1/#y", "s2", "s2/#z"]);
    assert!(h.coordinator.remove_server("irc.example.net").await.is_err());
}
