//! Display tree construction.
//!
//! Turns a [`ConnectionSnapshot`] into a [`ViewTree`]: one root per
//! connection, channels then queries beneath it, in the order the backend
//! reports them. Building is pure and deterministic; an unchanged snapshot
//! always yields the same ids in the same order.
//!
//! Deduplication is a linear scan by identity. Backends report tens of
//! connections, not thousands; if that changes, key the lookup by id and keep
//! the ordered vectors alongside.

use crate::backend::{Activity, ConnectionSnapshot, SnapshotItem};

/// One renderable entry: a server, channel, or direct conversation.
#[derive(Debug, Clone)]
pub struct DisplayNode<V> {
    /// Root: backend identity. Child: `parent_id + "/" + child identity`.
    pub id: String,
    pub label: String,
    pub view: V,
    pub activity: Activity,
    pub children: Vec<DisplayNode<V>>,
}

/// A node's position in the pre-order listing of the tree.
#[derive(Debug, Clone)]
pub struct FlatNode<V> {
    pub id: String,
    pub label: String,
    pub view: V,
    pub activity: Activity,
    pub depth: usize,
    /// Identity of the connection this node belongs to.
    pub server: String,
    /// Identity of the channel or query, `None` for the server node itself.
    pub window: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ViewTree<V> {
    roots: Vec<DisplayNode<V>>,
    flattened: Vec<FlatNode<V>>,
}

impl<V> Default for ViewTree<V> {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            flattened: Vec::new(),
        }
    }
}

impl<V: Clone + PartialEq> ViewTree<V> {
    /// Build a fresh tree. Never fails: an empty snapshot gives an empty tree
    /// and duplicate identities resolve to the first occurrence.
    pub fn build(snapshot: &ConnectionSnapshot<V>) -> Self {
        let mut tree = Self::default();
        for conn in &snapshot.connections {
            let root = tree.root_or_insert(&conn.item);
            for item in conn.channels.iter().chain(conn.queries.iter()) {
                tree.child_or_insert(root, item);
            }
        }
        tree
    }

    fn root_or_insert(&mut self, item: &SnapshotItem<V>) -> usize {
        if let Some(pos) = self.roots.iter().position(|r| r.id == item.identity) {
            return pos;
        }
        self.roots.push(DisplayNode {
            id: item.identity.clone(),
            label: item.name.clone(),
            view: item.view.clone(),
            activity: item.activity,
            children: Vec::new(),
        });
        self.flattened.push(FlatNode {
            id: item.identity.clone(),
            label: item.name.clone(),
            view: item.view.clone(),
            activity: item.activity,
            depth: 0,
            server: item.identity.clone(),
            window: None,
        });
        self.roots.len() - 1
    }

    fn child_or_insert(&mut self, root: usize, item: &SnapshotItem<V>) {
        let parent = &self.roots[root];
        let id = format!("{}/{}", parent.id, item.identity);
        if parent.children.iter().any(|c| c.id == id) {
            return;
        }

        // Children go right after the parent's last descendant so the flat
        // listing stays a pre-order walk even when a duplicated connection
        // adds children to an earlier root.
        let parent_flat = self
            .flattened
            .iter()
            .position(|n| n.depth == 0 && n.id == parent.id)
            .unwrap_or(self.flattened.len());
        let insert_at = (parent_flat + 1 + parent.children.len()).min(self.flattened.len());
        let server = parent.id.clone();

        self.flattened.insert(
            insert_at,
            FlatNode {
                id: id.clone(),
                label: item.name.clone(),
                view: item.view.clone(),
                activity: item.activity,
                depth: 1,
                server,
                window: Some(item.identity.clone()),
            },
        );
        self.roots[root].children.push(DisplayNode {
            id,
            label: item.name.clone(),
            view: item.view.clone(),
            activity: item.activity,
            children: Vec::new(),
        });
    }

    pub fn roots(&self) -> &[DisplayNode<V>] {
        &self.roots
    }

    /// Pre-order listing of every node.
    pub fn flattened(&self) -> &[FlatNode<V>] {
        &self.flattened
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn find(&self, id: &str) -> Option<&FlatNode<V>> {
        self.flattened.iter().find(|n| n.id == id)
    }

    /// The server node (`window: None`) or one of its children, matched by
    /// identity. IRC names are case-insensitive, so an exact match wins and
    /// an ASCII case-insensitive one is the fallback.
    pub fn lookup(&self, server: &str, window: Option<&str>) -> Option<&FlatNode<V>> {
        self.flattened
            .iter()
            .find(|n| n.server == server && n.window.as_deref() == window)
            .or_else(|| {
                self.flattened.iter().find(|n| {
                    n.server.eq_ignore_ascii_case(server)
                        && match (n.window.as_deref(), window) {
                            (None, None) => true,
                            (Some(have), Some(want)) => have.eq_ignore_ascii_case(want),
                            _ => false,
                        }
                })
            })
    }

    pub fn find_view(&self, view: &V) -> Option<&FlatNode<V>> {
        self.flattened.iter().find(|n| &n.view == view)
    }

    pub fn contains_view(&self, view: &V) -> bool {
        self.find_view(view).is_some()
    }

    /// Index of `view` in the flattened listing.
    pub fn position_of(&self, view: &V) -> Option<usize> {
        self.flattened.iter().position(|n| &n.view == view)
    }

    /// Flattened ids, in order.
    pub fn ids(&self) -> Vec<&str> {
        self.flattened.iter().map(|n| n.id.as_str()).collect()
    }
}
