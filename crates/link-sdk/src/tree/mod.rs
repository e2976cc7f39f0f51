//! Node tree: an arena of [`Node`] records reached from the Super Root.
//!
//! Nodes live in an id-keyed arena; children are ordered `name → id` maps
//! and each node keeps a single parent id, so there are no reference
//! cycles.  There is no lock over the whole tree: the arena index, each
//! node's maps, and each node's subscriber/stream sets are locked
//! independently.  Lock order where two are held: parent children, then
//! arena; subscription map, then arena.

mod builder;
mod node;
mod snapshot;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dslink_protocol::{Response, Variant};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};

pub use builder::NodeBuilder;
pub use node::{Node, NodeId, SidHook};

use crate::action::Action;
use crate::error::TreeError;
use crate::outbox::Outbox;
use crate::stream::StreamManager;
use crate::subscription::SubscriptionManager;
use crate::value::{RemoteSetCallback, Value};
use node::{removal, NodeHooks};

/// Template applied to every node built with a given class name.
pub type NodeClass = Arc<dyn Fn(&Node) + Send + Sync>;

/// Everything needed to materialise a node.
#[derive(Default)]
pub(crate) struct NodeDraft {
    pub(crate) name: String,
    pub(crate) class: Option<String>,
    pub(crate) configs: IndexMap<String, Variant>,
    pub(crate) attributes: IndexMap<String, Variant>,
    pub(crate) value: Option<Variant>,
    pub(crate) action: Option<Action>,
    pub(crate) hooks: NodeHooks,
    pub(crate) on_remote_set: Option<RemoteSetCallback>,
}

impl NodeDraft {
    pub(crate) fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

pub struct NodeTree {
    remote: bool,
    root: Arc<Node>,
    arena: RwLock<HashMap<NodeId, Arc<Node>>>,
    next_id: AtomicU64,
    classes: RwLock<HashMap<String, NodeClass>>,
    subscriptions: SubscriptionManager,
    streams: StreamManager,
    outbox: Outbox,
}

impl NodeTree {
    /// A locally owned tree.  Responses produced by value/list changes go
    /// to `outbox`.
    pub fn new(outbox: Outbox) -> Self {
        Self::with_kind(outbox, false)
    }

    /// A mirror of a peer's tree, fed only through
    /// [`apply_list_updates`](Self::apply_list_updates).
    pub fn new_remote() -> Self {
        Self::with_kind(Outbox::detached(), true)
    }

    fn with_kind(outbox: Outbox, remote: bool) -> Self {
        let root = Arc::new(blank_node(NodeId(0), String::new(), "/".into(), None, remote, &outbox));
        let mut arena = HashMap::new();
        arena.insert(root.id, root.clone());
        Self {
            remote,
            root,
            arena: RwLock::new(arena),
            next_id: AtomicU64::new(1),
            classes: RwLock::new(HashMap::new()),
            subscriptions: SubscriptionManager::new(),
            streams: StreamManager::new(),
            outbox,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.remote
    }

    /// The Super Root: empty name, path `/`.
    pub fn root(&self) -> Arc<Node> {
        self.root.clone()
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    pub fn streams(&self) -> &StreamManager {
        &self.streams
    }

    pub(crate) fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Number of nodes, Super Root included.
    pub fn len(&self) -> usize {
        self.arena.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    pub fn node(&self, id: NodeId) -> Option<Arc<Node>> {
        self.arena.read().get(&id).cloned()
    }

    pub fn parent(&self, node: &Node) -> Option<Arc<Node>> {
        node.parent.and_then(|id| self.node(id))
    }

    /// Resolve a slash-delimited path from the Super Root.  Any missing
    /// segment yields `None`.
    pub fn get(&self, path: &str) -> Option<Arc<Node>> {
        let mut node = self.root.clone();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let id = node.child_id(segment)?;
            node = self.node(id)?;
        }
        Some(node)
    }

    /// Direct children of `node`, in insertion order.
    pub fn children(&self, node: &Node) -> Vec<Arc<Node>> {
        let ids: Vec<NodeId> = node.children.read().values().copied().collect();
        ids.into_iter().filter_map(|id| self.node(id)).collect()
    }

    /// Register a node class under `name`.  Replaces any previous class
    /// of the same name.
    pub fn add_node_class<F>(&self, name: impl Into<String>, class: F)
    where
        F: Fn(&Node) + Send + Sync + 'static,
    {
        self.classes.write().insert(name.into(), Arc::new(class));
    }

    pub fn has_node_class(&self, name: &str) -> bool {
        self.classes.read().contains_key(name)
    }

    /// Start building a child of `parent`.
    pub fn create_child(
        &self,
        parent: &Arc<Node>,
        name: impl Into<String>,
    ) -> Result<NodeBuilder<'_>, TreeError> {
        if self.remote {
            return Err(TreeError::RemoteTree);
        }
        Ok(NodeBuilder::new(self, parent.clone(), NodeDraft::named(name)))
    }

    /// Start building a child of `parent` from a registered node class.
    pub fn create_child_of_class(
        &self,
        parent: &Arc<Node>,
        name: impl Into<String>,
        class: impl Into<String>,
    ) -> Result<NodeBuilder<'_>, TreeError> {
        let mut builder = self.create_child(parent, name)?;
        builder.draft.class = Some(class.into());
        Ok(builder)
    }

    /// Materialise a draft under `parent`: insert it, apply its class,
    /// bind deferred streams waiting on its path, and announce it to
    /// streams open on the parent.
    pub(crate) fn attach(&self, parent: &Arc<Node>, draft: NodeDraft) -> Result<Arc<Node>, TreeError> {
        validate_name(&draft.name)?;
        let path = join_path(&parent.path, &draft.name);
        let id = NodeId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let mut node = blank_node(id, draft.name.clone(), path.clone(), Some(parent.id), self.remote, &self.outbox);
        node.hooks = draft.hooks;
        let class_name = draft.class;
        {
            let mut configs = node.configs.write();
            configs.insert("is".into(), Variant::from(class_name.as_deref().unwrap_or("node")));
            configs.extend(draft.configs);
            if let Some(action) = &draft.action {
                configs.insert("invokable".into(), Variant::from(action.permission.as_str()));
            }
        }
        *node.attributes.write() = draft.attributes;
        *node.action.write() = draft.action;
        if let Some(value) = draft.value {
            node.value = Value::new(value);
        }
        if let Some(callback) = draft.on_remote_set {
            node.value.set_on_remote_set(callback);
        }
        let node = Arc::new(node);

        {
            let mut children = parent.children.write();
            if children.contains_key(&node.name) {
                return Err(TreeError::Exists(path));
            }
            children.insert(node.name.clone(), id);
            self.arena.write().insert(id, node.clone());
        }

        if let Some(class_name) = class_name {
            let class = self.classes.read().get(&class_name).cloned();
            match class {
                Some(class) => class(&node),
                None => tracing::warn!(class = %class_name, path = %path, "unknown node class"),
            }
        }

        for rid in self.streams.on_activate_node(&node) {
            self.outbox.push(Response::open(rid, self.list_updates(&node)));
        }
        parent.push_list_update(Variant::List(vec![
            Variant::from(node.name.as_str()),
            self.child_summary(&node),
        ]));

        tracing::trace!(path = %path, "node created");
        Ok(node)
    }

    /// Subscribe `sid` to `node` unless the node has left the tree.
    ///
    /// [`remove_node`](Self::remove_node) takes nodes out of the arena
    /// before dropping their sids, so checking membership under the
    /// subscription lock means a concurrent removal either sees this sid
    /// or this call sees the removal.
    pub fn subscribe(&self, sid: i64, node: &Arc<Node>) -> bool {
        self.subscriptions
            .subscribe_if(sid, node, || self.arena.read().contains_key(&node.id))
    }

    /// Remove `node` and its subtree.  Subscriptions on removed nodes are
    /// dropped; their list streams stay registered as deferred so a node
    /// re-created at the same path picks them up again.
    pub fn remove_node(&self, node: &Arc<Node>) -> Result<(), TreeError> {
        let Some(parent_id) = node.parent else {
            return Err(TreeError::RootRemoval);
        };
        let doomed = self.subtree(node);
        if let Some(parent) = self.node(parent_id) {
            parent.children.write().shift_remove(&node.name);
            parent.push_list_update(removal(node.name.clone()));
        }
        {
            let mut arena = self.arena.write();
            for n in &doomed {
                arena.remove(&n.id);
            }
        }
        for n in &doomed {
            self.subscriptions.drop_node(n);
            self.streams.unbind_node(n);
        }
        tracing::trace!(path = %node.path, removed = doomed.len(), "node removed");
        Ok(())
    }

    /// Handle a `remove` target.  `/a/$key` drops config `key` of `/a`,
    /// `/a/@key` drops attribute `key`, and a plain node path removes the
    /// whole node.  Returns whether anything was removed.
    pub fn remove_config_attribute(&self, path: &str) -> Result<bool, TreeError> {
        let path = normalize_path(path);
        let (parent_path, last) = split_last(&path);
        if let Some(key) = last.strip_prefix('$') {
            let node = self.get(parent_path).ok_or_else(|| TreeError::NotFound(path.clone()))?;
            return Ok(node.remove_config(key).is_some());
        }
        if let Some(key) = last.strip_prefix('@') {
            let node = self.get(parent_path).ok_or_else(|| TreeError::NotFound(path.clone()))?;
            return Ok(node.remove_attribute(key).is_some());
        }
        match self.get(&path) {
            Some(node) => self.remove_node(&node).map(|_| true),
            None => Ok(false),
        }
    }

    /// `node` and all its descendants, parents before children.
    fn subtree(&self, node: &Arc<Node>) -> Vec<Arc<Node>> {
        let mut out = Vec::new();
        let mut pending = vec![node.clone()];
        while let Some(next) = pending.pop() {
            pending.extend(self.children(&next));
            out.push(next);
        }
        out
    }
}

impl Default for NodeTree {
    fn default() -> Self {
        Self::new(Outbox::detached())
    }
}

fn blank_node(
    id: NodeId,
    name: String,
    path: String,
    parent: Option<NodeId>,
    remote: bool,
    outbox: &Outbox,
) -> Node {
    Node {
        id,
        name,
        path,
        parent,
        remote,
        value: Value::default(),
        configs: RwLock::new(IndexMap::new()),
        attributes: RwLock::new(IndexMap::new()),
        children: RwLock::new(IndexMap::new()),
        subscribers: Mutex::default(),
        streams: Mutex::default(),
        action: RwLock::new(None),
        hooks: NodeHooks::default(),
        outbox: outbox.clone(),
    }
}

fn validate_name(name: &str) -> Result<(), TreeError> {
    let reserved = name.starts_with(['$', '@', '?']);
    if name.is_empty() || name.contains('/') || reserved {
        return Err(TreeError::InvalidName(name.to_owned()));
    }
    Ok(())
}

/// Collapse empty segments: `""`, `"/"`, and `"//"` all become `/`,
/// `"/a//b/"` becomes `/a/b`.
pub fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Split a normalized path into parent path and last segment.
fn split_last(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some(("", last)) => ("/", last),
        Some((parent, last)) => (parent, last),
        None => ("/", path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> NodeTree {
        NodeTree::default()
    }

    #[test]
    fn get_resolves_created_chains() {
        let t = tree();
        let a = t.create_child(&t.root(), "a").unwrap().build().unwrap();
        let b = t.create_child(&a, "b").unwrap().build().unwrap();
        assert_eq!(b.path(), "/a/b");
        assert_eq!(t.get("/a/b").unwrap().id(), b.id());
        assert_eq!(t.get("a/b/").unwrap().id(), b.id());
        assert_eq!(t.get("/").unwrap().id(), t.root().id());
        assert_eq!(t.get("").unwrap().id(), t.root().id());
    }

    #[test]
    fn subscribe_refuses_a_removed_node() {
        let t = tree();
        let a = t.create_child(&t.root(), "a").unwrap().build().unwrap();
        assert!(t.subscribe(1, &a));
        // Resolved before the removal, subscribed after it.
        let stale = t.get("/a").unwrap();
        t.remove_node(&a).unwrap();
        assert!(!t.subscribe(2, &stale));
        assert!(t.subscriptions().is_empty());
        assert!(stale.subscribers().is_empty());
    }

    #[test]
    fn get_returns_none_for_missing_segments() {
        let t = tree();
        t.create_child(&t.root(), "a").unwrap().build().unwrap();
        assert!(t.get("/a/missing").is_none());
        assert!(t.get("/missing/a").is_none());
        assert!(t.get("/a/$is").is_none());
    }

    #[test]
    fn children_keep_insertion_order() {
        let t = tree();
        for name in ["zeta", "alpha", "mid"] {
            t.create_child(&t.root(), name).unwrap().build().unwrap();
        }
        assert_eq!(t.root().child_names(), vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn duplicate_and_invalid_names_are_rejected() {
        let t = tree();
        t.create_child(&t.root(), "a").unwrap().build().unwrap();
        let dup = t.create_child(&t.root(), "a").unwrap().build().unwrap_err();
        assert_eq!(dup, TreeError::Exists("/a".into()));
        for bad in ["", "x/y", "$cfg", "@attr", "?value"] {
            let err = t.create_child(&t.root(), bad).unwrap().build().unwrap_err();
            assert!(matches!(err, TreeError::InvalidName(_)), "{bad:?} accepted");
        }
    }

    #[test]
    fn remote_tree_refuses_local_children() {
        let t = NodeTree::new_remote();
        assert_eq!(t.create_child(&t.root(), "a").err(), Some(TreeError::RemoteTree));
    }

    #[test]
    fn remove_config_attribute_dispatches_on_prefix() {
        let t = tree();
        let a = t
            .create_child(&t.root(), "a")
            .unwrap()
            .config("unit", "kWh")
            .attribute("color", "red")
            .build()
            .unwrap();
        assert!(t.remove_config_attribute("/a/$unit").unwrap());
        assert!(a.config("unit").is_none());
        assert!(t.remove_config_attribute("/a/@color").unwrap());
        assert!(a.attribute("color").is_none());
        assert!(!t.remove_config_attribute("/a/@color").unwrap());
        assert!(t.remove_config_attribute("/a").unwrap());
        assert!(t.get("/a").is_none());
        assert!(!t.remove_config_attribute("/a").unwrap());
        assert_eq!(t.remove_config_attribute("/"), Err(TreeError::RootRemoval));
    }

    #[test]
    fn remove_node_drops_whole_subtree() {
        let t = tree();
        let a = t.create_child(&t.root(), "a").unwrap().build().unwrap();
        let b = t.create_child(&a, "b").unwrap().build().unwrap();
        t.create_child(&b, "c").unwrap().build().unwrap();
        assert_eq!(t.len(), 4);
        t.remove_node(&a).unwrap();
        assert_eq!(t.len(), 1);
        assert!(t.get("/a/b/c").is_none());
        assert!(t.root().child_names().is_empty());
    }

    #[test]
    fn node_class_is_applied_and_recorded() {
        let t = tree();
        t.add_node_class("counter", |node: &Node| {
            node.set_config("type", "number");
            node.set_value(10);
        });
        let n = t
            .create_child_of_class(&t.root(), "c", "counter")
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(n.class_name(), "counter");
        assert_eq!(n.config("type"), Some(Variant::from("number")));
        assert_eq!(n.value().get(), Variant::Int(10));
    }

    #[test]
    fn path_helpers() {
        assert_eq!(normalize_path("//a///b/"), "/a/b");
        assert_eq!(normalize_path(""), "/");
        assert_eq!(split_last("/a/b"), ("/a", "b"));
        assert_eq!(split_last("/a"), ("/", "a"));
    }
}
