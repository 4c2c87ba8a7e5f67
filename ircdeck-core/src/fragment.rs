//! Fragments: the units pushed to display clients.
//!
//! Each fragment targets one region of the page by selector and carries a
//! JSON payload tagged with `type`/`data` so clients can switch on `type`.

use serde::Serialize;

use crate::backend::{Line, ViewRef, WindowContent};
use crate::notify::Notification;
use crate::tree::ViewTree;

pub const TREE: &str = "#tree";
pub const WINDOW: &str = "#window";
pub const NOTIFICATIONS: &str = "#notifications";

/// One row of the navigation tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeEntry {
    pub id: String,
    pub label: String,
    pub depth: usize,
    pub active: bool,
    pub unread: usize,
    pub mention: bool,
}

/// The focused window's main pane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WindowView {
    /// Tree id of the focused node, `None` when nothing is focused.
    pub id: Option<String>,
    pub title: String,
    pub topic: Option<String>,
    pub lines: Vec<Line>,
    pub nicks: Vec<String>,
    /// Our nick on the focused server.
    pub nick: Option<String>,
    pub connected: bool,
}

impl WindowView {
    pub fn from_content(id: Option<String>, content: WindowContent) -> Self {
        Self {
            id,
            title: content.title,
            topic: content.topic,
            lines: content.lines,
            nicks: content.nicks,
            nick: None,
            connected: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum FragmentPayload {
    Tree { entries: Vec<TreeEntry> },
    Window(WindowView),
    Notification(Notification),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fragment {
    pub selector: &'static str,
    pub payload: FragmentPayload,
}

/// A fragment serialized for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFragment {
    pub selector: &'static str,
    pub data: String,
}

impl Fragment {
    pub fn tree<V: ViewRef>(tree: &ViewTree<V>, active: Option<&V>) -> Self {
        let entries = tree
            .flattened()
            .iter()
            .map(|node| TreeEntry {
                id: node.id.clone(),
                label: node.label.clone(),
                depth: node.depth,
                active: active == Some(&node.view),
                unread: node.activity.unread,
                mention: node.activity.mention,
            })
            .collect();
        Self {
            selector: TREE,
            payload: FragmentPayload::Tree { entries },
        }
    }

    pub fn window(view: WindowView) -> Self {
        Self {
            selector: WINDOW,
            payload: FragmentPayload::Window(view),
        }
    }

    pub fn notification(notification: Notification) -> Self {
        Self {
            selector: NOTIFICATIONS,
            payload: FragmentPayload::Notification(notification),
        }
    }

    pub fn encode(&self) -> Result<EncodedFragment, serde_json::Error> {
        Ok(EncodedFragment {
            selector: self.selector,
            data: serde_json::to_string(&self.payload)?,
        })
    }
}
