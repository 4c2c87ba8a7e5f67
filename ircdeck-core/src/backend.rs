//! The narrow interface the core consumes from the backend connection engine.

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::input::InputCommand;

/// Default port when an add-server request has none or an unparseable one.
pub const DEFAULT_PORT: u16 = 6667;
/// Default TLS setting when an add-server request has none or an unparseable one.
pub const DEFAULT_TLS: bool = true;

/// Opaque reference to one backend window (server status, channel, or query).
///
/// Equality must be identity: two references compare equal only when they
/// point at the same backend window.
pub trait ViewRef: Clone + PartialEq + Send + Sync + 'static {
    /// Called when this window gains focus.
    fn on_activate(&self) {}
    /// Called when this window loses focus.
    fn on_deactivate(&self) {}
}

/// Unread activity shown next to a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Activity {
    pub unread: usize,
    pub mention: bool,
}

/// One channel, query, or connection in a snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotItem<V> {
    /// Stable backend identity (server name, channel name, nick).
    pub identity: String,
    pub name: String,
    pub view: V,
    pub activity: Activity,
}

impl<V> SnapshotItem<V> {
    pub fn new(identity: impl Into<String>, name: impl Into<String>, view: V) -> Self {
        Self {
            identity: identity.into(),
            name: name.into(),
            view,
            activity: Activity::default(),
        }
    }
}

/// One connection and its windows, in backend-reported order.
#[derive(Debug, Clone)]
pub struct SnapshotConnection<V> {
    pub item: SnapshotItem<V>,
    pub channels: Vec<SnapshotItem<V>>,
    pub queries: Vec<SnapshotItem<V>>,
}

/// Read-only view of the backend's connections at one instant.
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot<V> {
    pub connections: Vec<SnapshotConnection<V>>,
}

impl<V> Default for ConnectionSnapshot<V> {
    fn default() -> Self {
        Self {
            connections: Vec::new(),
        }
    }
}

/// Summary of one connection, looked up by identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub identity: String,
    pub nick: String,
    pub connected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    Message,
    Action,
    Notice,
    System,
}

/// One rendered line of a window's scrollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Line {
    pub timestamp: String,
    pub from: String,
    pub text: String,
    pub kind: LineKind,
}

/// Everything needed to render the focused window's main pane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WindowContent {
    pub title: String,
    pub topic: Option<String>,
    pub lines: Vec<Line>,
    pub nicks: Vec<String>,
}

/// Raw add-server parameters as they arrive from a client request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AddServerParams {
    pub hostname: Option<String>,
    pub port: Option<String>,
    pub tls: Option<String>,
    pub nick: Option<String>,
    pub sasl_user: Option<String>,
    pub sasl_password: Option<String>,
    /// Comma-separated channels to join after registration.
    pub channels: Option<String>,
}

/// A validated add-server request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddServer {
    pub hostname: String,
    pub port: u16,
    pub tls: bool,
    pub nick: String,
    pub sasl_user: Option<String>,
    pub sasl_password: Option<String>,
    #[serde(default)]
    pub channels: Vec<String>,
}

impl AddServer {
    /// Resolve request parameters. Unparseable port/TLS values fall back to
    /// [`DEFAULT_PORT`]/[`DEFAULT_TLS`]; a missing hostname yields `None`.
    pub fn from_params(params: &AddServerParams, default_nick: &str) -> Option<Self> {
        let hostname = non_empty(params.hostname.as_deref())?.to_string();
        let port = params
            .port
            .as_deref()
            .and_then(|p| p.trim().parse::<u16>().ok())
            .filter(|p| *p != 0)
            .unwrap_or(DEFAULT_PORT);
        let tls = params
            .tls
            .as_deref()
            .and_then(parse_flag)
            .unwrap_or(DEFAULT_TLS);
        let nick = non_empty(params.nick.as_deref())
            .unwrap_or(default_nick)
            .to_string();
        let sasl_user = non_empty(params.sasl_user.as_deref()).map(str::to_string);
        let sasl_password = non_empty(params.sasl_password.as_deref()).map(str::to_string);
        let channels = params
            .channels
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        Some(Self {
            hostname,
            port,
            tls,
            nick,
            sasl_user,
            sasl_password,
            channels,
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// The backend connection engine as seen by the core.
///
/// Read accessors are synchronous and must not block on I/O: they are called
/// while the process-wide cycle lock is held. Command methods are async and
/// are always called without that lock.
pub trait Backend: Send + Sync + 'static {
    type View: ViewRef;

    /// Enumerate connections, their channels and their queries.
    fn snapshot(&self) -> ConnectionSnapshot<Self::View>;

    /// Look up one connection by identity.
    fn connection(&self, identity: &str) -> Option<ConnectionInfo>;

    /// Content of one window. A window that has vanished renders empty.
    fn window_content(&self, view: &Self::View) -> WindowContent;

    /// Send `text` to `window` on `server`.
    fn send_message(
        &self,
        server: &str,
        window: &str,
        text: &str,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Run a parsed slash command in the context of `server` and the focused
    /// `window`, if any.
    fn execute(
        &self,
        server: &str,
        window: Option<&str>,
        command: InputCommand,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    fn add_server(&self, server: AddServer) -> impl Future<Output = Result<(), BackendError>> + Send;

    fn remove_server(&self, identity: &str) -> impl Future<Output = Result<(), BackendError>> + Send;
}
