//! Per-client push loops and the client command surface.
//!
//! One [`StreamCoordinator`] is shared by every client. Each open client gets
//! a [`ClientStream`] that renders the tree and the focused window on a fixed
//! tick, or sooner when focus changes or input is submitted, and pushes only
//! the fragments whose content changed since its previous push.
//!
//! Rendering happens under the cycle lock. Writes never do.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::backend::{AddServer, AddServerParams, Backend};
use crate::error::{BackendError, PushError};
use crate::focus::{FocusNotifier, FocusTracker, RedrawNotifier};
use crate::fragment::{self, EncodedFragment, Fragment, TreeEntry, WindowView};
use crate::history::HistoryRegistry;
use crate::input::{Input, InputCommand, is_channel};
use crate::notify::{Notification, NotificationQueue};
use crate::tree::ViewTree;

/// Interval between periodic pushes.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub tick: Duration,
    /// Per-session history cap; `None` keeps everything.
    pub history_limit: Option<usize>,
    /// Nick used for added servers that don't name one.
    pub default_nick: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            tick: DEFAULT_TICK,
            history_limit: Some(500),
            default_nick: "ircdeck".to_string(),
        }
    }
}

/// The client transport.
pub trait FragmentSink: Send + Sync {
    /// Write one batch. Implementations bound the write with their own
    /// timeout and report [`PushError::Closed`] once the client is gone.
    fn push(
        &mut self,
        fragments: Vec<EncodedFragment>,
    ) -> impl Future<Output = Result<(), PushError>> + Send;

    /// Resolves when the client disconnects.
    fn closed(&self) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Opening,
    Streaming,
    Closed,
}

/// Redraw and focus-change signals shared by every client loop.
struct Signals {
    redraw: watch::Sender<u64>,
    focus_generation: AtomicU64,
}

impl Signals {
    fn new() -> Self {
        let (redraw, _) = watch::channel(0);
        Self {
            redraw,
            focus_generation: AtomicU64::new(0),
        }
    }

    fn focus_generation(&self) -> u64 {
        self.focus_generation.load(Ordering::Acquire)
    }
}

impl RedrawNotifier for Signals {
    fn mark_redraw_pending(&self) {
        self.redraw.send_modify(|generation| *generation = generation.wrapping_add(1));
    }
}

impl FocusNotifier for Signals {
    fn mark_focus_changed(&self) {
        self.focus_generation.fetch_add(1, Ordering::AcqRel);
    }
}

/// Process-wide selection, mirrored into the focus tracker.
#[derive(Debug, Default, Clone)]
struct Selection {
    server: Option<String>,
    window: Option<String>,
}

pub struct StreamCoordinator<B: Backend> {
    backend: Arc<B>,
    focus: FocusTracker<B::View>,
    histories: HistoryRegistry,
    notifications: NotificationQueue,
    /// The cycle lock.
    selection: Mutex<Selection>,
    signals: Arc<Signals>,
    config: StreamConfig,
    shutdown: CancellationToken,
}

impl<B: Backend> StreamCoordinator<B> {
    pub fn new(
        backend: Arc<B>,
        notifications: NotificationQueue,
        config: StreamConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let signals = Arc::new(Signals::new());
        Self {
            backend,
            focus: FocusTracker::new(signals.clone(), signals.clone()),
            histories: HistoryRegistry::new(config.history_limit),
            notifications,
            selection: Mutex::new(Selection::default()),
            signals,
            config,
            shutdown,
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Currently selected `(server, window)`.
    pub fn selection(&self) -> (Option<String>, Option<String>) {
        let sel = self.selection.lock();
        (sel.server.clone(), sel.window.clone())
    }

    /// Focus a server's status window. Unknown servers are ignored.
    pub fn focus_server(&self, server: &str) {
        let mut sel = self.selection.lock();
        let tree = ViewTree::build(&self.backend.snapshot());
        let Some(node) = tree.lookup(server, None) else {
            tracing::debug!(server, "focus_server: unknown server");
            return;
        };
        sel.server = Some(node.server.clone());
        sel.window = None;
        self.focus.set_active(Some(node.view.clone()));
        tracing::debug!(server, "focused server");
    }

    /// Focus a channel or query on `server`, or on the selected server when
    /// `server` is `None`. Unknown targets are ignored.
    pub fn focus_window(&self, server: Option<&str>, window: &str) {
        let mut sel = self.selection.lock();
        let Some(server) = server.map(str::to_string).or_else(|| sel.server.clone()) else {
            tracing::debug!(window, "focus_window: no server selected");
            return;
        };
        let tree = ViewTree::build(&self.backend.snapshot());
        let Some(node) = tree.lookup(&server, Some(window)) else {
            tracing::debug!(server = %server, window, "focus_window: unknown window");
            return;
        };
        tracing::debug!(server = %node.server, window, "focused window");
        sel.server = Some(node.server.clone());
        sel.window = node.window.clone();
        self.focus.set_active(Some(node.view.clone()));
    }

    /// Record `text` in `session`'s history and act on it.
    pub async fn submit_input(&self, session: &str, text: &str) {
        self.histories.session(session).record(text);
        let (server, window) = self.selection();

        match Input::parse(text) {
            Input::Empty => {}
            Input::Text(text) => {
                let (Some(server), Some(window)) = (server, window) else {
                    tracing::debug!(session, "input with no active window dropped");
                    return;
                };
                if let Err(e) = self.backend.send_message(&server, &window, &text).await {
                    tracing::warn!(server = %server, window = %window, error = %e, "send failed");
                }
                self.signals.mark_redraw_pending();
            }
            Input::Command(command) => {
                let Some(server) = server else {
                    tracing::debug!(session, ?command, "command with no active server dropped");
                    return;
                };
                let query = match &command {
                    InputCommand::Msg { target, .. } if !is_channel(target) => Some(target.clone()),
                    _ => None,
                };
                if let Err(e) = self.backend.execute(&server, window.as_deref(), command).await {
                    tracing::warn!(server = %server, error = %e, "command failed");
                }
                if let Some(query) = query {
                    self.focus_window(Some(&server), &query);
                }
                self.signals.mark_redraw_pending();
            }
        }
    }

    /// Step back through `session`'s history. `None` means nothing to apply.
    pub fn history_up(&self, session: &str, current: &str) -> Option<String> {
        let value = self.histories.session(session).navigate_up(current);
        (!value.is_empty()).then_some(value)
    }

    /// Step forward through `session`'s history. `Some("")` means navigation
    /// just ended and the input line should be cleared; `None` means nothing
    /// to apply.
    pub fn history_down(&self, session: &str) -> Option<String> {
        let history = self.histories.session(session);
        let was_navigating = history.position() >= 0;
        let value = history.navigate_down();
        if !value.is_empty() || was_navigating {
            Some(value)
        } else {
            None
        }
    }

    /// Connect a new server. Requests without a hostname are ignored.
    pub async fn add_server(&self, params: &AddServerParams) -> Result<(), BackendError> {
        let Some(server) = AddServer::from_params(params, &self.config.default_nick) else {
            tracing::debug!("add_server: missing hostname");
            return Ok(());
        };
        tracing::info!(server = %server.address(), tls = server.tls, "adding server");
        self.backend.add_server(server).await?;
        self.signals.mark_redraw_pending();
        Ok(())
    }

    pub async fn remove_server(&self, identity: &str) -> Result<(), BackendError> {
        self.backend.remove_server(identity).await?;
        self.signals.mark_redraw_pending();
        Ok(())
    }

    /// The tree as clients see it, for JSON inspection.
    pub fn tree_entries(&self) -> Vec<TreeEntry> {
        let _cycle = self.selection.lock();
        let tree = ViewTree::build(&self.backend.snapshot());
        match Fragment::tree(&tree, self.focus.active().as_ref()).payload {
            fragment::FragmentPayload::Tree { entries } => entries,
            _ => Vec::new(),
        }
    }

    /// Start a client stream. Nothing is pushed until [`ClientStream::run`].
    pub fn open<S: FragmentSink>(self: &Arc<Self>, session: &str, sink: S) -> ClientStream<B, S> {
        let session = if session.is_empty() {
            crate::history::DEFAULT_SESSION
        } else {
            session
        };
        ClientStream {
            coordinator: Arc::clone(self),
            session: session.to_string(),
            sink,
            state: StreamState::Opening,
            last_sent: HashMap::new(),
            redraw: self.signals.redraw.subscribe(),
            focus_seen: self.signals.focus_generation(),
            undelivered: Vec::new(),
        }
    }

    /// One render pass: rebuild the tree, reconcile focus and selection,
    /// encode the tree and window fragments.
    fn render(&self) -> Vec<EncodedFragment> {
        let mut sel = self.selection.lock();
        let tree = ViewTree::build(&self.backend.snapshot());

        if let Some(active) = self.focus.active()
            && !tree.contains_view(&active)
        {
            self.focus.on_removed(&active, &tree);
        }

        let active = self.focus.active();
        let node = active.as_ref().and_then(|view| tree.find_view(view));
        let window = match node {
            Some(node) => {
                sel.server = Some(node.server.clone());
                sel.window = node.window.clone();
                let mut view =
                    WindowView::from_content(Some(node.id.clone()), self.backend.window_content(&node.view));
                if let Some(info) = self.backend.connection(&node.server) {
                    view.nick = Some(info.nick);
                    view.connected = info.connected;
                }
                view
            }
            None => {
                *sel = Selection::default();
                WindowView::default()
            }
        };

        let fragments = [Fragment::tree(&tree, active.as_ref()), Fragment::window(window)];
        drop(sel);

        fragments
            .iter()
            .filter_map(|f| match f.encode() {
                Ok(encoded) => Some(encoded),
                Err(e) => {
                    tracing::warn!(selector = f.selector, error = %e, "fragment encode failed");
                    None
                }
            })
            .collect()
    }

    /// Everything currently queued.
    fn drain_notifications(&self) -> Vec<Notification> {
        if !self.notifications.has_pending() {
            return Vec::new();
        }
        self.notifications.drain()
    }

    /// Put notifications a closed client never delivered back on the queue
    /// for the other clients.
    async fn requeue(&self, notifications: Vec<Notification>) {
        let sender = self.notifications.sender();
        for notification in notifications {
            if let Err(e) = sender.enqueue(notification).await {
                tracing::warn!(error = %e, "undelivered notification dropped");
            }
        }
    }
}

/// One client's push loop.
pub struct ClientStream<B: Backend, S: FragmentSink> {
    coordinator: Arc<StreamCoordinator<B>>,
    session: String,
    sink: S,
    state: StreamState,
    /// Last payload pushed per selector.
    last_sent: HashMap<&'static str, String>,
    redraw: watch::Receiver<u64>,
    focus_seen: u64,
    /// Drained from the queue but not yet pushed successfully.
    undelivered: Vec<Notification>,
}

impl<B: Backend, S: FragmentSink> ClientStream<B, S> {
    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Push the full fragment set, then stream until the client disconnects
    /// or the server shuts down.
    pub async fn run(mut self) -> StreamState {
        tracing::info!(session = %self.session, "client stream opened");

        let initial = self.coordinator.render();
        let sent = initial.clone();
        match self.sink.push(initial).await {
            Ok(()) => self.remember(&sent),
            Err(PushError::Closed) => return self.close(),
            Err(e) => tracing::warn!(session = %self.session, error = %e, "initial push failed"),
        }
        self.transition(StreamState::Streaming);

        let mut tick = tokio::time::interval(self.coordinator.config.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;

        loop {
            tokio::select! {
                _ = self.sink.closed() => break,
                _ = self.coordinator.shutdown.cancelled() => break,
                _ = tick.tick() => {}
                _ = self.redraw.changed() => {}
            }

            match self.push_cycle().await {
                Ok(()) => {}
                Err(PushError::Closed) => break,
                Err(e) => {
                    tracing::warn!(session = %self.session, error = %e, "push failed, will retry next cycle");
                }
            }
        }

        let undelivered = std::mem::take(&mut self.undelivered);
        if !undelivered.is_empty() {
            tracing::debug!(session = %self.session, count = undelivered.len(), "requeueing notifications");
            self.coordinator.requeue(undelivered).await;
        }
        self.close()
    }

    async fn push_cycle(&mut self) -> Result<(), PushError> {
        let generation = self.coordinator.signals.focus_generation();
        if generation != self.focus_seen {
            // New focus: re-send the pane even if its content is unchanged.
            self.focus_seen = generation;
            self.last_sent.remove(fragment::WINDOW);
        }

        let changed: Vec<EncodedFragment> = self
            .coordinator
            .render()
            .into_iter()
            .filter(|f| self.last_sent.get(f.selector) != Some(&f.data))
            .collect();
        // Retry what the last failed push carried before taking more.
        if self.undelivered.is_empty() {
            self.undelivered = self.coordinator.drain_notifications();
        }
        let notifications: Vec<EncodedFragment> = self
            .undelivered
            .iter()
            .filter_map(|n| Fragment::notification(n.clone()).encode().ok())
            .collect();
        if changed.is_empty() && notifications.is_empty() {
            return Ok(());
        }

        tracing::debug!(
            session = %self.session,
            fragments = changed.len(),
            notifications = notifications.len(),
            "pushing"
        );
        let mut batch = changed.clone();
        batch.extend(notifications);
        self.sink.push(batch).await?;
        self.remember(&changed);
        self.undelivered.clear();
        Ok(())
    }

    fn remember(&mut self, fragments: &[EncodedFragment]) {
        for f in fragments {
            self.last_sent.insert(f.selector, f.data.clone());
        }
    }

    fn transition(&mut self, next: StreamState) {
        tracing::debug!(session = %self.session, from = ?self.state, to = ?next, "stream state");
        self.state = next;
    }

    fn close(mut self) -> StreamState {
        self.transition(StreamState::Closed);
        tracing::info!(session = %self.session, "client stream closed");
        self.state
    }
}
