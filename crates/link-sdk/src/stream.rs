//! List stream bookkeeping: rid → path, bound to a node once one exists
//! at that path.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::tree::{normalize_path, Node};

struct StreamEntry {
    path: String,
    node: Option<Weak<Node>>,
}

impl StreamEntry {
    fn bound(&self) -> Option<Arc<Node>> {
        self.node.as_ref().and_then(Weak::upgrade)
    }
}

#[derive(Default)]
pub struct StreamManager {
    rids: Mutex<HashMap<i64, StreamEntry>>,
}

impl StreamManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `rid` against an existing node.
    pub fn open(&self, rid: i64, node: &Arc<Node>) {
        let previous = self.rids.lock().insert(
            rid,
            StreamEntry {
                path: node.path().to_owned(),
                node: Some(Arc::downgrade(node)),
            },
        );
        if let Some(old) = previous.and_then(|e| e.bound()) {
            old.remove_stream(rid);
        }
        node.add_stream(rid);
    }

    /// Record `rid` against a path that has no node yet.
    pub fn open_later(&self, rid: i64, path: &str) {
        let path = normalize_path(path);
        tracing::trace!(rid, path = %path, "list deferred");
        let previous = self.rids.lock().insert(rid, StreamEntry { path, node: None });
        if let Some(old) = previous.and_then(|e| e.bound()) {
            old.remove_stream(rid);
        }
    }

    /// Bind every deferred rid waiting on `node`'s path.  Returns the rids
    /// that were newly bound so the caller can send them a snapshot.
    pub fn on_activate_node(&self, node: &Arc<Node>) -> Vec<i64> {
        let mut bound = Vec::new();
        let mut rids = self.rids.lock();
        for (rid, entry) in rids.iter_mut() {
            if entry.path != node.path() || entry.bound().is_some() {
                continue;
            }
            entry.node = Some(Arc::downgrade(node));
            if node.add_stream(*rid) {
                bound.push(*rid);
            }
        }
        bound.sort_unstable();
        if !bound.is_empty() {
            tracing::debug!(path = %node.path(), rids = ?bound, "deferred lists bound");
        }
        bound
    }

    /// Close `rid`.  Returns false (and logs) when it was unknown.
    pub fn close(&self, rid: i64) -> bool {
        let entry = self.rids.lock().remove(&rid);
        match entry {
            Some(entry) => {
                if let Some(node) = entry.bound() {
                    node.remove_stream(rid);
                }
                true
            }
            None => {
                tracing::debug!(rid, "close for unknown rid");
                false
            }
        }
    }

    /// Forget every stream and empty every bound node's stream set.
    pub fn clear_all(&self) {
        let mut rids = self.rids.lock();
        for (rid, entry) in rids.drain() {
            if let Some(node) = entry.bound() {
                node.remove_stream(rid);
            }
        }
    }

    /// Detach streams from a node leaving the tree.  The records stay,
    /// deferred, so a node re-created at the same path rebinds them.
    pub(crate) fn unbind_node(&self, node: &Node) {
        let mut rids = self.rids.lock();
        for entry in rids.values_mut() {
            if entry.bound().is_some_and(|n| n.id() == node.id()) {
                entry.node = None;
            }
        }
        node.clear_streams();
    }

    pub fn path_for(&self, rid: i64) -> Option<String> {
        self.rids.lock().get(&rid).map(|e| e.path.clone())
    }

    /// Whether `rid` is registered but not bound to a live node.
    pub fn is_deferred(&self, rid: i64) -> bool {
        self.rids.lock().get(&rid).is_some_and(|e| e.bound().is_none())
    }

    pub fn len(&self) -> usize {
        self.rids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
