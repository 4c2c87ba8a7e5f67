//! Connected networks and their windows.
//!
//! [`NetworkManager`] is the backend the stream coordinator renders: an
//! ordered list of networks, each with a status window plus channel and
//! query windows in the order they were opened. One pump task per network
//! applies SDK events to its windows.

use std::collections::{HashMap, VecDeque};
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use chrono::{DateTime, Local};
use ircdeck_core::backend::{
    Activity, AddServer, Backend, ConnectionInfo, ConnectionSnapshot, Line, LineKind,
    SnapshotConnection, SnapshotItem, ViewRef, WindowContent,
};
use ircdeck_core::error::BackendError;
use ircdeck_core::input::{InputCommand, is_channel};
use ircdeck_core::notify::{Notification, NotificationKind, NotificationSender};
use ircdeck_sdk::client::{self, ClientHandle, ConnectConfig, SaslCredentials};
use ircdeck_sdk::event::Event;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::SavedServers;

/// Maximum number of lines kept per window.
const MAX_LINES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    Status,
    Channel,
    Query,
}

#[derive(Debug, Default)]
struct WindowState {
    lines: VecDeque<Line>,
    topic: Option<String>,
    nicks: Vec<String>,
}

/// A status, channel, or query window.
#[derive(Debug)]
pub struct Window {
    kind: WindowKind,
    name: RwLock<String>,
    state: Mutex<WindowState>,
    unread: AtomicUsize,
    mention: AtomicBool,
    active: AtomicBool,
}

impl Window {
    fn new(kind: WindowKind, name: &str) -> WindowRef {
        WindowRef(Arc::new(Self {
            kind,
            name: RwLock::new(name.to_string()),
            state: Mutex::new(WindowState::default()),
            unread: AtomicUsize::new(0),
            mention: AtomicBool::new(false),
            active: AtomicBool::new(false),
        }))
    }

    pub fn kind(&self) -> WindowKind {
        self.kind
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    fn is_named(&self, name: &str) -> bool {
        self.name.read().eq_ignore_ascii_case(name)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn activity(&self) -> Activity {
        Activity {
            unread: self.unread.load(Ordering::Relaxed),
            mention: self.mention.load(Ordering::Relaxed),
        }
    }

    fn push(&self, timestamp: String, from: &str, text: &str, kind: LineKind) {
        let mut state = self.state.lock();
        state.lines.push_back(Line {
            timestamp,
            from: sanitize_text(from),
            text: sanitize_text(text),
            kind,
        });
        if state.lines.len() > MAX_LINES {
            state.lines.pop_front();
        }
    }

    fn push_system(&self, text: &str) {
        self.push(now_str(), "", text, LineKind::System);
    }

    /// Count an incoming line unless the window is being looked at.
    fn mark_unread(&self, mention: bool) {
        if self.is_active() {
            return;
        }
        self.unread.fetch_add(1, Ordering::Relaxed);
        if mention {
            self.mention.store(true, Ordering::Relaxed);
        }
    }

    fn has_nick(&self, nick: &str) -> bool {
        self.state
            .lock()
            .nicks
            .iter()
            .any(|n| strip_prefix(n).eq_ignore_ascii_case(nick))
    }

    fn add_nicks<I: IntoIterator<Item = String>>(&self, nicks: I) {
        let mut state = self.state.lock();
        for nick in nicks {
            let bare = strip_prefix(&nick).to_string();
            if !state.nicks.iter().any(|n| strip_prefix(n).eq_ignore_ascii_case(&bare)) {
                state.nicks.push(nick);
            }
        }
    }

    fn remove_nick(&self, nick: &str) -> bool {
        let mut state = self.state.lock();
        let before = state.nicks.len();
        state.nicks.retain(|n| !strip_prefix(n).eq_ignore_ascii_case(nick));
        state.nicks.len() != before
    }

    fn rename_nick(&self, old: &str, new: &str) -> bool {
        let mut state = self.state.lock();
        match state
            .nicks
            .iter_mut()
            .find(|n| strip_prefix(n).eq_ignore_ascii_case(old))
        {
            Some(entry) => {
                let prefix_len = entry.len() - strip_prefix(entry).len();
                *entry = format!("{}{new}", &entry[..prefix_len]);
                true
            }
            None => false,
        }
    }

    fn set_topic(&self, topic: &str) {
        self.state.lock().topic = (!topic.is_empty()).then(|| sanitize_text(topic));
    }

    fn content(&self) -> WindowContent {
        let state = self.state.lock();
        WindowContent {
            title: self.name(),
            topic: state.topic.clone(),
            lines: state.lines.iter().cloned().collect(),
            nicks: state.nicks.clone(),
        }
    }
}

/// Shared reference to a [`Window`]. Two references are equal only when
/// they point at the same window.
#[derive(Debug, Clone)]
pub struct WindowRef(Arc<Window>);

impl PartialEq for WindowRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Deref for WindowRef {
    type Target = Window;

    fn deref(&self) -> &Window {
        &self.0
    }
}

impl ViewRef for WindowRef {
    fn on_activate(&self) {
        self.active.store(true, Ordering::Release);
        self.unread.store(0, Ordering::Relaxed);
        self.mention.store(false, Ordering::Relaxed);
    }

    fn on_deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }
}

/// One IRC network: its connection handle and windows.
pub struct Network {
    server: AddServer,
    nick: RwLock<String>,
    connected: AtomicBool,
    handle: ClientHandle,
    status: WindowRef,
    channels: RwLock<Vec<WindowRef>>,
    queries: RwLock<Vec<WindowRef>>,
    cancel: CancellationToken,
}

impl Network {
    fn new(server: AddServer, handle: ClientHandle) -> Self {
        let status = Window::new(WindowKind::Status, &server.hostname);
        Self {
            nick: RwLock::new(server.nick.clone()),
            server,
            connected: AtomicBool::new(false),
            handle,
            status,
            channels: RwLock::new(Vec::new()),
            queries: RwLock::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.server.hostname
    }

    pub fn server(&self) -> &AddServer {
        &self.server
    }

    pub fn nick(&self) -> String {
        self.nick.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn status(&self) -> &WindowRef {
        &self.status
    }

    /// Send QUIT and stop applying events.
    pub async fn quit(&self, reason: Option<&str>) -> anyhow::Result<()> {
        self.cancel.cancel();
        self.handle.quit(reason).await
    }

    fn is_me(&self, nick: &str) -> bool {
        self.nick.read().eq_ignore_ascii_case(nick)
    }

    pub fn channel(&self, name: &str) -> Option<WindowRef> {
        self.channels.read().iter().find(|w| w.is_named(name)).cloned()
    }

    pub fn query(&self, name: &str) -> Option<WindowRef> {
        self.queries.read().iter().find(|w| w.is_named(name)).cloned()
    }

    /// A channel or query by name.
    pub fn window(&self, name: &str) -> Option<WindowRef> {
        self.channel(name).or_else(|| self.query(name))
    }

    fn ensure_channel(&self, name: &str) -> WindowRef {
        Self::ensure(&self.channels, WindowKind::Channel, name)
    }

    fn ensure_query(&self, name: &str) -> WindowRef {
        Self::ensure(&self.queries, WindowKind::Query, name)
    }

    fn ensure(list: &RwLock<Vec<WindowRef>>, kind: WindowKind, name: &str) -> WindowRef {
        let mut windows = list.write();
        if let Some(existing) = windows.iter().find(|w| w.is_named(name)) {
            return existing.clone();
        }
        let window = Window::new(kind, name);
        windows.push(window.clone());
        window
    }

    fn remove_channel(&self, name: &str) {
        self.channels.write().retain(|w| !w.is_named(name));
    }

    fn remove_query(&self, name: &str) {
        self.queries.write().retain(|w| !w.is_named(name));
    }

    fn windows_with_nick(&self, nick: &str) -> Vec<WindowRef> {
        self.channels
            .read()
            .iter()
            .filter(|w| w.has_nick(nick))
            .cloned()
            .collect()
    }

    /// Apply one SDK event. Returns a notification for the user, if the
    /// event deserves one.
    pub fn apply(&self, event: Event) -> Option<Notification> {
        match event {
            Event::Connected => {
                self.status
                    .push_system(&format!("Connected to {}", self.server.address()));
            }
            Event::Registered { nick } => {
                *self.nick.write() = nick.clone();
                self.connected.store(true, Ordering::Release);
                self.status.push_system(&format!("Registered as {nick}"));
            }
            Event::Authenticated { account } => {
                self.status
                    .push_system(&format!("SASL authentication successful as {account}"));
            }
            Event::AuthFailed { reason } => {
                self.status
                    .push_system(&format!("SASL authentication failed: {reason}"));
            }
            Event::Joined { channel, nick } => {
                if self.is_me(&nick) {
                    let window = self.ensure_channel(&channel);
                    window.push_system(&format!("Now talking in {channel}"));
                } else if let Some(window) = self.channel(&channel) {
                    window.add_nicks([nick.clone()]);
                    window.push_system(&format!("{nick} joined"));
                }
            }
            Event::Parted { channel, nick } => {
                if self.is_me(&nick) {
                    self.remove_channel(&channel);
                    self.status.push_system(&format!("Left {channel}"));
                } else if let Some(window) = self.channel(&channel) {
                    window.remove_nick(&nick);
                    window.push_system(&format!("{nick} left"));
                }
            }
            Event::Kicked {
                channel,
                nick,
                by,
                reason,
            } => {
                if self.is_me(&nick) {
                    self.remove_channel(&channel);
                    self.status
                        .push_system(&format!("Kicked from {channel} by {by}: {reason}"));
                } else if let Some(window) = self.channel(&channel) {
                    window.remove_nick(&nick);
                    window.push_system(&format!("{nick} was kicked by {by}: {reason}"));
                }
            }
            Event::Message {
                from,
                target,
                text,
                notice,
                tags,
            } => return self.apply_message(from, target, text, notice, &tags),
            Event::Names { channel, nicks } => {
                if let Some(window) = self.channel(&channel) {
                    window.add_nicks(nicks);
                }
            }
            Event::TopicChanged {
                channel,
                topic,
                set_by,
            } => {
                if let Some(window) = self.channel(&channel) {
                    window.set_topic(&topic);
                    match set_by {
                        Some(by) => window.push_system(&format!("{by} changed the topic to: {topic}")),
                        None => window.push_system(&format!("Topic: {topic}")),
                    }
                }
            }
            Event::NickChanged { old_nick, new_nick } => {
                if self.is_me(&old_nick) {
                    *self.nick.write() = new_nick.clone();
                    self.status
                        .push_system(&format!("You are now known as {new_nick}"));
                }
                for window in self.channels.read().iter() {
                    if window.rename_nick(&old_nick, &new_nick) {
                        window.push_system(&format!("{old_nick} is now known as {new_nick}"));
                    }
                }
                if let Some(query) = self.query(&old_nick) {
                    *query.name.write() = new_nick.clone();
                    query.push_system(&format!("{old_nick} is now known as {new_nick}"));
                }
            }
            Event::UserQuit { nick, reason } => {
                for window in self.windows_with_nick(&nick) {
                    window.remove_nick(&nick);
                    window.push_system(&format!("{nick} quit ({reason})"));
                }
                if let Some(query) = self.query(&nick) {
                    query.push_system(&format!("{nick} quit ({reason})"));
                }
            }
            Event::ServerNotice { text } => {
                self.status
                    .push(now_str(), self.identity(), &text, LineKind::Notice);
            }
            Event::Disconnected { reason } => {
                self.connected.store(false, Ordering::Release);
                self.status.push_system(&format!("Disconnected: {reason}"));
            }
        }
        None
    }

    fn apply_message(
        &self,
        from: String,
        target: String,
        text: String,
        notice: bool,
        tags: &HashMap<String, String>,
    ) -> Option<Notification> {
        let action = text
            .strip_prefix("\x01ACTION ")
            .map(|t| t.strip_suffix('\x01').unwrap_or(t).to_string());
        let (kind, text) = match action {
            Some(action) => (LineKind::Action, action),
            None if notice => (LineKind::Notice, text),
            None => (LineKind::Message, text),
        };

        let ours = self.is_me(&from);
        let in_channel = is_channel(&target);
        let window = if in_channel {
            self.ensure_channel(&target)
        } else if notice {
            self.query(&from).unwrap_or_else(|| self.status.clone())
        } else if ours {
            self.ensure_query(&target)
        } else {
            self.ensure_query(&from)
        };
        window.push(timestamp(tags), &from, &text, kind);
        if ours {
            return None;
        }

        let mention = mentions(&text, &self.nick());
        let was_active = window.is_active();
        window.mark_unread(mention || (!in_channel && !notice));
        if was_active {
            return None;
        }

        let kind = if !in_channel && notice {
            NotificationKind::Notice
        } else if !in_channel {
            NotificationKind::PrivateMessage
        } else if mention {
            NotificationKind::Highlight
        } else {
            return None;
        };
        Some(Notification::new(kind, self.identity(), window.name(), from, text))
    }

    /// Echo one of our own lines into `window`.
    fn echo(&self, window: &Window, text: &str, kind: LineKind) {
        window.push(now_str(), &self.nick(), text, kind);
    }

    fn snapshot(&self) -> SnapshotConnection<WindowRef> {
        let item = |w: &WindowRef| {
            let name = w.name();
            let mut item = SnapshotItem::new(name.clone(), name, w.clone());
            item.activity = w.activity();
            item
        };
        let mut status = SnapshotItem::new(self.identity(), self.identity(), self.status.clone());
        status.activity = self.status.activity();
        SnapshotConnection {
            item: status,
            channels: self.channels.read().iter().map(item).collect(),
            queries: self.queries.read().iter().map(item).collect(),
        }
    }
}

/// Hands notifications to the queue and counts the ones it had to drop.
struct Notifier {
    sender: NotificationSender,
    dropped: AtomicU64,
}

impl Notifier {
    async fn deliver(&self, notification: Notification) {
        if let Err(e) = self.sender.enqueue(notification).await {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            let dropped = e.into_notification();
            tracing::warn!(
                network = %dropped.network,
                window = %dropped.window,
                dropped_total = total,
                "notification dropped"
            );
        }
    }
}

pub struct NetworkManager {
    networks: RwLock<Vec<Arc<Network>>>,
    notifier: Arc<Notifier>,
    /// Where the server list is saved; `None` disables persistence.
    store: Option<PathBuf>,
}

impl NetworkManager {
    pub fn new(notifications: NotificationSender, store: Option<PathBuf>) -> Self {
        Self {
            networks: RwLock::new(Vec::new()),
            notifier: Arc::new(Notifier {
                sender: notifications,
                dropped: AtomicU64::new(0),
            }),
            store,
        }
    }

    pub fn networks(&self) -> Vec<Arc<Network>> {
        self.networks.read().clone()
    }

    pub fn network(&self, identity: &str) -> Option<Arc<Network>> {
        self.networks
            .read()
            .iter()
            .find(|n| n.identity().eq_ignore_ascii_case(identity))
            .cloned()
    }

    /// Notifications dropped because the queue stayed full.
    pub fn dropped_notifications(&self) -> u64 {
        self.notifier.dropped.load(Ordering::Relaxed)
    }

    /// Reconnect every saved server.
    pub fn restore(&self) {
        let Some(path) = &self.store else { return };
        let saved = SavedServers::load(path);
        tracing::info!(count = saved.servers.len(), "restoring saved servers");
        for server in saved.servers {
            let address = server.address();
            if let Err(e) = self.connect(server) {
                tracing::warn!(server = %address, error = %e, "skipping saved server");
            }
        }
    }

    /// Open a connection and start its event pump.
    pub fn connect(&self, server: AddServer) -> Result<Arc<Network>, BackendError> {
        let mut networks = self.networks.write();
        if networks
            .iter()
            .any(|n| n.identity().eq_ignore_ascii_case(&server.hostname))
        {
            return Err(BackendError::DuplicateServer(server.hostname));
        }
        let (handle, events) = client::connect(connect_config(&server));
        let network = Arc::new(Network::new(server, handle));
        networks.push(network.clone());
        drop(networks);

        tracing::info!(server = %network.server.address(), tls = network.server.tls, "connecting");
        self.spawn_pump(network.clone(), events);
        Ok(network)
    }

    /// Add a network around an existing handle without starting a pump.
    pub fn register(&self, server: AddServer, handle: ClientHandle) -> Result<Arc<Network>, BackendError> {
        let mut networks = self.networks.write();
        if networks
            .iter()
            .any(|n| n.identity().eq_ignore_ascii_case(&server.hostname))
        {
            return Err(BackendError::DuplicateServer(server.hostname));
        }
        let network = Arc::new(Network::new(server, handle));
        networks.push(network.clone());
        Ok(network)
    }

    /// Apply `events` to `network` until the connection ends or the network
    /// is removed.
    pub fn spawn_pump(&self, network: Arc<Network>, mut events: mpsc::Receiver<Event>) {
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = network.cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                let registered = matches!(event, Event::Registered { .. });
                if let Some(notification) = network.apply(event) {
                    notifier.deliver(notification).await;
                }
                if registered {
                    for channel in &network.server.channels {
                        if let Err(e) = network.handle.join(channel, None).await {
                            tracing::warn!(server = %network.identity(), channel = %channel, error = %e, "autojoin failed");
                        }
                    }
                }
            }
            tracing::debug!(server = %network.identity(), "event pump stopped");
        });
    }

    fn persist(&self) {
        let Some(path) = &self.store else { return };
        let saved = SavedServers {
            servers: self.networks.read().iter().map(|n| n.server.clone()).collect(),
        };
        saved.save(path);
    }

    fn require(&self, identity: &str) -> Result<Arc<Network>, BackendError> {
        self.network(identity)
            .ok_or_else(|| BackendError::UnknownServer(identity.to_string()))
    }
}

fn connect_config(server: &AddServer) -> ConnectConfig {
    let sasl = match (&server.sasl_user, &server.sasl_password) {
        (Some(username), Some(password)) => Some(SaslCredentials {
            username: username.clone(),
            password: password.clone(),
        }),
        _ => None,
    };
    ConnectConfig {
        server_addr: server.address(),
        nick: server.nick.clone(),
        user: server.nick.clone(),
        realname: "ircdeck".to_string(),
        tls: server.tls,
        sasl,
    }
}

impl Backend for NetworkManager {
    type View = WindowRef;

    fn snapshot(&self) -> ConnectionSnapshot<WindowRef> {
        ConnectionSnapshot {
            connections: self.networks.read().iter().map(|n| n.snapshot()).collect(),
        }
    }

    fn connection(&self, identity: &str) -> Option<ConnectionInfo> {
        self.network(identity).map(|n| ConnectionInfo {
            identity: n.identity().to_string(),
            nick: n.nick(),
            connected: n.is_connected(),
        })
    }

    fn window_content(&self, view: &WindowRef) -> WindowContent {
        view.content()
    }

    async fn send_message(&self, server: &str, window: &str, text: &str) -> Result<(), BackendError> {
        let network = self.require(server)?;
        let Some(target) = network.window(window) else {
            tracing::debug!(server, window, "no such window, message dropped");
            return Ok(());
        };
        for line in text.split(['\r', '\n']).filter(|l| !l.is_empty()) {
            network.handle.privmsg(&target.name(), line).await?;
            network.echo(&target, line, LineKind::Message);
        }
        Ok(())
    }

    async fn execute(
        &self,
        server: &str,
        window: Option<&str>,
        command: InputCommand,
    ) -> Result<(), BackendError> {
        let network = self.require(server)?;
        let focused = window.and_then(|w| network.window(w));
        let focused_channel = focused
            .as_ref()
            .filter(|w| w.kind() == WindowKind::Channel)
            .map(|w| w.name());

        match command {
            InputCommand::Join { channel, key } => {
                network.handle.join(&channel, key.as_deref()).await?;
            }
            InputCommand::Part { channel, reason } => {
                if let Some(channel) = channel.or(focused_channel) {
                    network.handle.part(&channel, reason.as_deref()).await?;
                }
            }
            InputCommand::Msg { target, text } => {
                network.handle.privmsg(&target, &text).await?;
                let window = if is_channel(&target) {
                    network.channel(&target)
                } else {
                    Some(network.ensure_query(&target))
                };
                if let Some(window) = window {
                    network.echo(&window, &text, LineKind::Message);
                }
            }
            InputCommand::Me(text) => {
                if let Some(window) = focused.filter(|w| w.kind() != WindowKind::Status) {
                    network.handle.action(&window.name(), &text).await?;
                    network.echo(&window, &text, LineKind::Action);
                }
            }
            InputCommand::Nick(nick) => network.handle.nick(&nick).await?,
            InputCommand::Topic(topic) => {
                if let Some(channel) = focused_channel {
                    network.handle.topic(&channel, topic.as_deref()).await?;
                }
            }
            InputCommand::Quote(raw) => network.handle.raw(&raw).await?,
            InputCommand::Close => match focused {
                Some(w) if w.kind() == WindowKind::Query => network.remove_query(&w.name()),
                Some(w) if w.kind() == WindowKind::Channel => {
                    network.handle.part(&w.name(), None).await?;
                }
                _ => {}
            },
            InputCommand::Quit(reason) => {
                network.handle.quit(reason.as_deref()).await?;
            }
        }
        Ok(())
    }

    async fn add_server(&self, server: AddServer) -> Result<(), BackendError> {
        self.connect(server)?;
        self.persist();
        Ok(())
    }

    async fn remove_server(&self, identity: &str) -> Result<(), BackendError> {
        let network = self.require(identity)?;
        self.networks.write().retain(|n| !Arc::ptr_eq(n, &network));
        if let Err(e) = network.quit(Some("ircdeck")).await {
            tracing::debug!(server = %identity, error = %e, "quit on removal failed");
        }
        self.persist();
        tracing::info!(server = %identity, "server removed");
        Ok(())
    }
}

fn now_str() -> String {
    Local::now().format("%H:%M").to_string()
}

/// Line time from the IRCv3 `time` tag, or now.
fn timestamp(tags: &HashMap<String, String>) -> String {
    tags.get("time")
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Local))
        .unwrap_or_else(Local::now)
        .format("%H:%M")
        .to_string()
}

fn mentions(text: &str, nick: &str) -> bool {
    !nick.is_empty() && text.to_lowercase().contains(&nick.to_lowercase())
}

fn strip_prefix(nick: &str) -> &str {
    nick.trim_start_matches(['~', '&', '@', '%', '+'])
}

/// Strip control characters that would corrupt the display.
pub fn sanitize_text(s: &str) -> String {
    s.chars()
        .filter(|&c| c == '\t' || (c >= ' ' && c != '\x7f'))
        .collect()
}
