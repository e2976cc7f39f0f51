//! Fluent builder returned by [`NodeTree::create_child`].

use std::sync::Arc;

use dslink_protocol::{Permission, Variant};

use super::{Node, NodeDraft, NodeTree};
use crate::action::{Action, Column, Parameter};
use crate::error::TreeError;

/// Accumulates a node's configs, attributes, value, and action, then
/// inserts it with [`build`](Self::build).
///
/// ```rust,no_run
/// # use dslink_sdk::{NodeTree, Permission};
/// let tree = NodeTree::default();
/// let temperature = tree
///     .create_child(&tree.root(), "temperature")?
///     .display_name("Temperature")
///     .value_type("number")
///     .writable(Permission::Write)
///     .value(21.5)
///     .build()?;
/// # Ok::<(), dslink_sdk::TreeError>(())
/// ```
pub struct NodeBuilder<'a> {
    tree: &'a NodeTree,
    parent: Arc<Node>,
    pub(crate) draft: NodeDraft,
}

impl<'a> NodeBuilder<'a> {
    pub(crate) fn new(tree: &'a NodeTree, parent: Arc<Node>, draft: NodeDraft) -> Self {
        Self {
            tree,
            parent,
            draft,
        }
    }

    /// `$name`, the human-readable label.
    pub fn display_name(self, name: impl Into<String>) -> Self {
        self.config("name", name.into())
    }

    pub fn config(mut self, key: impl Into<String>, value: impl Into<Variant>) -> Self {
        self.draft.configs.insert(key.into(), value.into());
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<Variant>) -> Self {
        self.draft.attributes.insert(key.into(), value.into());
        self
    }

    /// `$type`, e.g. `"number"`, `"string"`, `"bool"`.
    pub fn value_type(self, value_type: impl Into<String>) -> Self {
        self.config("type", value_type.into())
    }

    /// `$writable`, the permission a `set` must present.
    pub fn writable(self, permission: Permission) -> Self {
        self.config("writable", permission.as_str())
    }

    pub fn value(mut self, value: impl Into<Variant>) -> Self {
        self.draft.value = Some(value.into());
        self
    }

    pub fn action(mut self, action: Action) -> Self {
        self.draft.action = Some(action);
        self
    }

    pub fn parameter(self, parameter: Parameter) -> Self {
        self.append("params", parameter.to_variant())
    }

    pub fn column(self, column: Column) -> Self {
        self.append("columns", column.to_variant())
    }

    fn append(mut self, key: &str, entry: Variant) -> Self {
        let slot = self
            .draft
            .configs
            .entry(key.to_owned())
            .or_insert_with(|| Variant::List(Vec::new()));
        match slot {
            Variant::List(list) => list.push(entry),
            other => *other = Variant::List(vec![entry]),
        }
        self
    }

    /// Called with the sid each time a new subscription attaches.
    pub fn on_subscribed<F>(mut self, hook: F) -> Self
    where
        F: Fn(i64) + Send + Sync + 'static,
    {
        self.draft.hooks.on_subscribed = Some(Arc::new(hook));
        self
    }

    /// Called with the sid each time a subscription detaches.
    pub fn on_unsubscribed<F>(mut self, hook: F) -> Self
    where
        F: Fn(i64) + Send + Sync + 'static,
    {
        self.draft.hooks.on_unsubscribed = Some(Arc::new(hook));
        self
    }

    /// Called after a remote `set` writes this node's value.
    pub fn on_remote_set<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Variant) + Send + Sync + 'static,
    {
        self.draft.on_remote_set = Some(Arc::new(callback));
        self
    }

    /// Insert the node into its parent.
    pub fn build(self) -> Result<Arc<Node>, TreeError> {
        self.tree.attach(&self.parent, self.draft)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fills_configs_and_value() {
        let tree = NodeTree::default();
        let node = tree
            .create_child(&tree.root(), "t")
            .unwrap()
            .display_name("Temp")
            .value_type("number")
            .writable(Permission::Write)
            .attribute("unit", "C")
            .value(21.5)
            .build()
            .unwrap();
        assert_eq!(node.config("name"), Some(Variant::from("Temp")));
        assert_eq!(node.config("type"), Some(Variant::from("number")));
        assert_eq!(node.writable(), Some(Permission::Write));
        assert_eq!(node.attribute("unit"), Some(Variant::from("C")));
        assert_eq!(node.value().get(), Variant::Float(21.5));
        assert_eq!(node.class_name(), "node");
    }

    #[test]
    fn parameters_and_columns_accumulate() {
        let tree = NodeTree::default();
        let node = tree
            .create_child(&tree.root(), "act")
            .unwrap()
            .parameter(Parameter::new("a", "string"))
            .parameter(Parameter::new("b", "int"))
            .column(Column::new("ok", "bool"))
            .build()
            .unwrap();
        assert_eq!(node.config("params").unwrap().as_list().unwrap().len(), 2);
        assert_eq!(node.config("columns").unwrap().as_list().unwrap().len(), 1);
    }

    #[test]
    fn action_sets_invokable() {
        let tree = NodeTree::default();
        let node = tree
            .create_child(&tree.root(), "act")
            .unwrap()
            .action(Action::new(Permission::Config, |req: crate::InvokeRequest| async move {
                req.close();
            }))
            .build()
            .unwrap();
        assert_eq!(node.config("invokable"), Some(Variant::from("config")));
        assert_eq!(node.action().unwrap().permission, Permission::Config);
    }
}
