//! The single shared focus.
//!
//! Focus is process-wide: every connected client renders the same focused
//! window, and a focus change from one client shows up in every other
//! client's next push.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::backend::ViewRef;
use crate::tree::ViewTree;

/// Told when the display needs repainting. Must not block.
pub trait RedrawNotifier: Send + Sync {
    fn mark_redraw_pending(&self);
}

/// Told when the focused window changes. Must not block.
pub trait FocusNotifier: Send + Sync {
    fn mark_focus_changed(&self);
}

/// Holds at most one active view reference.
pub struct FocusTracker<V> {
    active: RwLock<Option<V>>,
    redraw: Arc<dyn RedrawNotifier>,
    focus: Arc<dyn FocusNotifier>,
}

impl<V: ViewRef> FocusTracker<V> {
    pub fn new(redraw: Arc<dyn RedrawNotifier>, focus: Arc<dyn FocusNotifier>) -> Self {
        Self {
            active: RwLock::new(None),
            redraw,
            focus,
        }
    }

    /// Replace the active reference and signal both hooks.
    ///
    /// Signals even when `view` equals the current reference; callers that
    /// want to suppress redundant redraws compare first.
    pub fn set_active(&self, view: Option<V>) {
        let prev = std::mem::replace(&mut *self.active.write(), view.clone());
        Self::run_hooks(prev, view);
        self.signal();
    }

    pub fn active(&self) -> Option<V> {
        self.active.read().clone()
    }

    /// React to `removed` disappearing from the backend.
    ///
    /// No-op unless `removed` is focused. Otherwise focus moves to the first
    /// node of `latest` that is not `removed`, or clears if there is none.
    pub fn on_removed(&self, removed: &V, latest: &ViewTree<V>) {
        let (prev, fallback) = {
            let mut active = self.active.write();
            if active.as_ref() != Some(removed) {
                return;
            }
            let fallback = latest
                .flattened()
                .iter()
                .find(|node| &node.view != removed)
                .map(|node| node.view.clone());
            tracing::debug!(has_fallback = fallback.is_some(), "focused window removed");
            (std::mem::replace(&mut *active, fallback.clone()), fallback)
        };
        Self::run_hooks(prev, fallback);
        self.signal();
    }

    /// View hooks run with the state lock released.
    fn run_hooks(prev: Option<V>, next: Option<V>) {
        if let Some(prev) = prev {
            prev.on_deactivate();
        }
        if let Some(next) = next {
            next.on_activate();
        }
    }

    fn signal(&self) {
        self.redraw.mark_redraw_pending();
        self.focus.mark_focus_changed();
    }
}
