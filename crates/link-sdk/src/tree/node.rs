//! A single node record of the tree arena.

use std::collections::HashSet;
use std::sync::Arc;

use dslink_protocol::{Permission, Response, Variant};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};

use crate::action::{Action, Column, Parameter};
use crate::outbox::Outbox;
use crate::value::Value;

/// Arena handle of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u64);

/// Hook receiving a subscription id.
pub type SidHook = Arc<dyn Fn(i64) + Send + Sync>;

#[derive(Default, Clone)]
pub(crate) struct NodeHooks {
    pub(crate) on_subscribed: Option<SidHook>,
    pub(crate) on_unsubscribed: Option<SidHook>,
}

/// A node: value cell, `$config` and `@attribute` maps, ordered children,
/// and the subscriber/stream sets used by the responder.
///
/// Configs and attributes are stored without their wire prefix.
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    pub(crate) path: String,
    pub(crate) parent: Option<NodeId>,
    pub(crate) remote: bool,
    pub(crate) value: Value,
    pub(crate) configs: RwLock<IndexMap<String, Variant>>,
    pub(crate) attributes: RwLock<IndexMap<String, Variant>>,
    pub(crate) children: RwLock<IndexMap<String, NodeId>>,
    pub(crate) subscribers: Mutex<HashSet<i64>>,
    pub(crate) streams: Mutex<HashSet<i64>>,
    pub(crate) action: RwLock<Option<Action>>,
    pub(crate) hooks: NodeHooks,
    pub(crate) outbox: Outbox,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn parent_id(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn is_remote(&self) -> bool {
        self.remote
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Write the value and push `[sid, value, ts]` to every current
    /// subscriber, once per sid.  Inert on remote nodes.
    pub fn set_value(&self, value: impl Into<Variant>) {
        if self.remote {
            tracing::trace!(path = %self.path, "ignoring local write to remote node");
            return;
        }
        let (value, ts) = self.value.set(value.into());
        let sids = self.subscribers();
        if sids.is_empty() {
            return;
        }
        let stamp = Variant::from(ts.to_dsa_string());
        let updates = sids
            .into_iter()
            .map(|sid| Variant::List(vec![Variant::Int(sid), value.clone(), stamp.clone()]))
            .collect();
        self.outbox.push(Response::subscription_updates(updates));
    }

    // ── Configs / attributes ─────────────────────────────────────────

    pub fn config(&self, key: &str) -> Option<Variant> {
        self.configs.read().get(key).cloned()
    }

    pub fn configs(&self) -> IndexMap<String, Variant> {
        self.configs.read().clone()
    }

    /// Set `$key`.  Open list streams receive the change.  Inert on
    /// remote nodes.
    pub fn set_config(&self, key: impl Into<String>, value: impl Into<Variant>) {
        if self.remote {
            return;
        }
        let key = key.into();
        let value = value.into();
        self.configs.write().insert(key.clone(), value.clone());
        self.push_list_update(Variant::List(vec![Variant::from(format!("${key}")), value]));
    }

    pub fn remove_config(&self, key: &str) -> Option<Variant> {
        if self.remote {
            return None;
        }
        let removed = self.configs.write().shift_remove(key);
        if removed.is_some() {
            self.push_list_update(removal(format!("${key}")));
        }
        removed
    }

    pub fn attribute(&self, key: &str) -> Option<Variant> {
        self.attributes.read().get(key).cloned()
    }

    pub fn attributes(&self) -> IndexMap<String, Variant> {
        self.attributes.read().clone()
    }

    /// Set `@key`.  Open list streams receive the change.  Inert on
    /// remote nodes.
    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<Variant>) {
        if self.remote {
            return;
        }
        let key = key.into();
        let value = value.into();
        self.attributes.write().insert(key.clone(), value.clone());
        self.push_list_update(Variant::List(vec![Variant::from(format!("@{key}")), value]));
    }

    pub fn remove_attribute(&self, key: &str) -> Option<Variant> {
        if self.remote {
            return None;
        }
        let removed = self.attributes.write().shift_remove(key);
        if removed.is_some() {
            self.push_list_update(removal(format!("@{key}")));
        }
        removed
    }

    /// `$is`, the node class name; `"node"` when built without a class.
    pub fn class_name(&self) -> String {
        self.config("is")
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| "node".to_owned())
    }

    /// Permission advertised in `$writable`, if any.
    pub fn writable(&self) -> Option<Permission> {
        self.config("writable")
            .and_then(|v| v.as_str().and_then(|s| s.parse().ok()))
    }

    // ── Children / action ────────────────────────────────────────────

    pub fn child_names(&self) -> Vec<String> {
        self.children.read().keys().cloned().collect()
    }

    pub fn has_child(&self, name: &str) -> bool {
        self.children.read().contains_key(name)
    }

    pub(crate) fn child_id(&self, name: &str) -> Option<NodeId> {
        self.children.read().get(name).copied()
    }

    pub fn action(&self) -> Option<Action> {
        self.action.read().clone()
    }

    /// Append to `$params`.
    pub fn add_parameter(&self, parameter: &Parameter) {
        self.append_config("params", parameter.to_variant());
    }

    /// Append to `$columns`.
    pub fn add_column(&self, column: &Column) {
        self.append_config("columns", column.to_variant());
    }

    fn append_config(&self, key: &str, entry: Variant) {
        let mut list = match self.config(key) {
            Some(Variant::List(list)) => list,
            _ => Vec::new(),
        };
        list.push(entry);
        self.set_config(key, Variant::List(list));
    }

    pub fn set_action(&self, action: Action) {
        if self.remote {
            return;
        }
        self.set_config("invokable", action.permission.as_str());
        *self.action.write() = Some(action);
    }

    // ── Protocol bookkeeping ─────────────────────────────────────────

    /// Current subscriber ids, sorted.
    pub fn subscribers(&self) -> Vec<i64> {
        let mut sids: Vec<i64> = self.subscribers.lock().iter().copied().collect();
        sids.sort_unstable();
        sids
    }

    /// Currently open list stream ids, sorted.
    pub fn streams(&self) -> Vec<i64> {
        let mut rids: Vec<i64> = self.streams.lock().iter().copied().collect();
        rids.sort_unstable();
        rids
    }

    pub(crate) fn add_subscriber(&self, sid: i64) -> bool {
        self.subscribers.lock().insert(sid)
    }

    pub(crate) fn remove_subscriber(&self, sid: i64) -> bool {
        self.subscribers.lock().remove(&sid)
    }

    pub(crate) fn add_stream(&self, rid: i64) -> bool {
        self.streams.lock().insert(rid)
    }

    pub(crate) fn remove_stream(&self, rid: i64) -> bool {
        self.streams.lock().remove(&rid)
    }

    pub(crate) fn clear_streams(&self) {
        self.streams.lock().clear();
    }

    pub(crate) fn fire_subscribed(&self, sid: i64) {
        if let Some(hook) = &self.hooks.on_subscribed {
            hook(sid);
        }
    }

    pub(crate) fn fire_unsubscribed(&self, sid: i64) {
        if let Some(hook) = &self.hooks.on_unsubscribed {
            hook(sid);
        }
    }

    /// Send one list update row to every stream open on this node.
    pub(crate) fn push_list_update(&self, update: Variant) {
        for rid in self.streams() {
            self.outbox.push(Response::open(rid, vec![update.clone()]));
        }
    }
}

/// `{"name": key, "change": "remove"}`
pub(crate) fn removal(name: String) -> Variant {
    let mut map = IndexMap::new();
    map.insert("name".to_owned(), Variant::from(name));
    map.insert("change".to_owned(), Variant::from("remove"));
    Variant::Map(map)
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("path", &self.path)
            .field("remote", &self.remote)
            .field("value", &self.value)
            .finish_non_exhaustive()
    }
}
