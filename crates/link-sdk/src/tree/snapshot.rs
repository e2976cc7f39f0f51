//! Structural snapshots: the `nodes.json` format, list responses, and
//! ingestion of a peer's list updates into a remote tree.

use std::sync::Arc;

use dslink_protocol::Variant;
use indexmap::IndexMap;

use super::{validate_name, Node, NodeDraft, NodeTree};
use crate::error::TreeError;

const VALUE_KEY: &str = "?value";

impl NodeTree {
    /// Snapshot of the whole tree below the Super Root.
    pub fn serialize(&self) -> Variant {
        self.serialize_node(&self.root)
    }

    /// `{"$key": .., "@key": .., "?value": .., "child": {..}}`
    pub fn serialize_node(&self, node: &Node) -> Variant {
        let mut out = IndexMap::new();
        for (k, v) in node.configs.read().iter() {
            out.insert(format!("${k}"), v.clone());
        }
        for (k, v) in node.attributes.read().iter() {
            out.insert(format!("@{k}"), v.clone());
        }
        let value = node.value.get();
        if !value.is_null() {
            out.insert(VALUE_KEY.to_owned(), value);
        }
        for child in self.children(node) {
            out.insert(child.name.clone(), self.serialize_node(&child));
        }
        Variant::Map(out)
    }

    /// Rebuild the tree below the Super Root from a snapshot.  Children
    /// that already exist are updated in place; `$is` re-applies a
    /// registered node class before the stored configs are laid over it.
    ///
    /// Every child name is checked first, so a rejected snapshot leaves
    /// the tree untouched.
    pub fn deserialize(&self, snapshot: &Variant) -> Result<(), TreeError> {
        check_names(snapshot)?;
        let root = self.root();
        self.deserialize_into(&root, snapshot)
    }

    fn deserialize_into(&self, node: &Arc<Node>, snapshot: &Variant) -> Result<(), TreeError> {
        let Some(entries) = snapshot.as_map() else {
            return Ok(());
        };
        for (key, value) in entries {
            if let Some(k) = key.strip_prefix('$') {
                node.configs.write().insert(k.to_owned(), value.clone());
            } else if let Some(k) = key.strip_prefix('@') {
                node.attributes.write().insert(k.to_owned(), value.clone());
            } else if key == VALUE_KEY {
                node.value.set(value.clone());
            } else if is_child_entry(key, value) {
                let child = match node.child_id(key).and_then(|id| self.node(id)) {
                    Some(existing) => existing,
                    None => {
                        let class = value
                            .get("$is")
                            .and_then(Variant::as_str)
                            .filter(|c| self.has_node_class(c))
                            .map(str::to_owned);
                        let builder = match class {
                            Some(class) => self.create_child_of_class(node, key.as_str(), class)?,
                            None => self.create_child(node, key.as_str())?,
                        };
                        builder.build()?
                    }
                };
                self.deserialize_into(&child, value)?;
            }
        }
        Ok(())
    }

    /// Rows of a `list` response for `node`: `$is` first, then the other
    /// configs, attributes, and one `[name, summary]` row per child.
    pub fn list_updates(&self, node: &Node) -> Vec<Variant> {
        let mut rows = Vec::new();
        let configs = node.configs.read().clone();
        rows.push(row("$is", Variant::from(node.class_name())));
        for (k, v) in configs.into_iter().filter(|(k, _)| k != "is") {
            rows.push(row(&format!("${k}"), v));
        }
        for (k, v) in node.attributes.read().iter() {
            rows.push(row(&format!("@{k}"), v.clone()));
        }
        for child in self.children(node) {
            rows.push(row(&child.name, self.child_summary(&child)));
        }
        rows
    }

    /// A child's entry in its parent's list: its own configs and
    /// attributes, without grandchildren.
    pub(crate) fn child_summary(&self, node: &Node) -> Variant {
        let mut out = IndexMap::new();
        for (k, v) in node.configs.read().iter() {
            out.insert(format!("${k}"), v.clone());
        }
        for (k, v) in node.attributes.read().iter() {
            out.insert(format!("@{k}"), v.clone());
        }
        Variant::Map(out)
    }

    /// Ingest list update rows received from a peer into `node`.
    ///
    /// Rows are `[key, value]` pairs or `{"name": key, "change": "remove"}`
    /// maps.  `$params` and `$columns` keep their list shape.  Only remote
    /// trees accept this.
    pub fn apply_list_updates(&self, node: &Arc<Node>, updates: &[Variant]) -> Result<(), TreeError> {
        if !self.remote {
            return Err(TreeError::NotFound(format!("{} is not a remote node", node.path)));
        }
        for update in updates {
            match update {
                Variant::List(pair) if pair.len() >= 2 => {
                    let Some(key) = pair[0].as_str() else {
                        continue;
                    };
                    self.apply_pair(node, key, &pair[1])?;
                }
                Variant::Map(change) if change.get("change").and_then(Variant::as_str) == Some("remove") => {
                    if let Some(name) = change.get("name").and_then(Variant::as_str) {
                        self.apply_removal(node, name)?;
                    }
                }
                other => tracing::trace!(update = %other, "ignoring malformed list update"),
            }
        }
        Ok(())
    }

    fn apply_pair(&self, node: &Arc<Node>, key: &str, value: &Variant) -> Result<(), TreeError> {
        if let Some(k) = key.strip_prefix('$') {
            node.configs.write().insert(k.to_owned(), value.clone());
        } else if let Some(k) = key.strip_prefix('@') {
            node.attributes.write().insert(k.to_owned(), value.clone());
        } else {
            let child = match node.child_id(key).and_then(|id| self.node(id)) {
                Some(existing) => existing,
                None => self.attach(node, NodeDraft::named(key))?,
            };
            if let Some(entries) = value.as_map() {
                for (k, v) in entries {
                    if let Some(k) = k.strip_prefix('$') {
                        child.configs.write().insert(k.to_owned(), v.clone());
                    } else if let Some(k) = k.strip_prefix('@') {
                        child.attributes.write().insert(k.to_owned(), v.clone());
                    }
                }
            }
        }
        Ok(())
    }

    fn apply_removal(&self, node: &Arc<Node>, name: &str) -> Result<(), TreeError> {
        if let Some(k) = name.strip_prefix('$') {
            node.configs.write().shift_remove(k);
        } else if let Some(k) = name.strip_prefix('@') {
            node.attributes.write().shift_remove(k);
        } else if let Some(child) = node.child_id(name).and_then(|id| self.node(id)) {
            self.remove_node(&child)?;
        }
        Ok(())
    }
}

fn row(key: &str, value: Variant) -> Variant {
    Variant::List(vec![Variant::from(key), value])
}

fn is_child_entry(key: &str, value: &Variant) -> bool {
    !key.starts_with(['$', '@']) && key != VALUE_KEY && value.as_map().is_some()
}

fn check_names(snapshot: &Variant) -> Result<(), TreeError> {
    let Some(entries) = snapshot.as_map() else {
        return Ok(());
    };
    for (key, value) in entries.iter().filter(|(k, v)| is_child_entry(k, v)) {
        validate_name(key)?;
        check_names(value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dslink_protocol::Permission;
    use serde_json::json;

    fn sample_tree() -> NodeTree {
        let tree = NodeTree::default();
        let a = tree
            .create_child(&tree.root(), "a")
            .unwrap()
            .display_name("Alpha")
            .attribute("color", "red")
            .build()
            .unwrap();
        tree.create_child(&a, "b")
            .unwrap()
            .value_type("number")
            .writable(Permission::Write)
            .value(42)
            .build()
            .unwrap();
        tree.create_child(&tree.root(), "c").unwrap().build().unwrap();
        tree
    }

    fn describe(tree: &NodeTree, node: &Arc<Node>, out: &mut Vec<String>) {
        let mut configs: Vec<String> = node.configs().iter().map(|(k, v)| format!("${k}={v}")).collect();
        configs.sort();
        let mut attrs: Vec<String> = node.attributes().iter().map(|(k, v)| format!("@{k}={v}")).collect();
        attrs.sort();
        out.push(format!("{} {:?} {:?} {}", node.path(), configs, attrs, node.value().get()));
        for child in tree.children(node) {
            describe(tree, &child, out);
        }
    }

    fn shape(tree: &NodeTree) -> Vec<String> {
        let mut out = Vec::new();
        describe(tree, &tree.root(), &mut out);
        out.sort();
        out
    }

    #[test]
    fn snapshot_round_trip_rebuilds_equivalent_tree() {
        let original = sample_tree();
        let snapshot = original.serialize();
        let text = serde_json::to_string(&snapshot).unwrap();

        let restored = NodeTree::default();
        restored.deserialize(&serde_json::from_str(&text).unwrap()).unwrap();
        assert_eq!(shape(&original), shape(&restored));
    }

    #[test]
    fn round_trip_ignores_key_order() {
        let reordered = Variant::from(json!({
            "c": {"$is": "node"},
            "a": {
                "b": {"?value": 42, "$writable": "write", "$type": "number", "$is": "node"},
                "@color": "red",
                "$name": "Alpha",
                "$is": "node"
            }
        }));
        let restored = NodeTree::default();
        restored.deserialize(&reordered).unwrap();
        assert_eq!(shape(&sample_tree()), shape(&restored));
    }

    #[test]
    fn rejected_snapshot_leaves_the_tree_untouched() {
        let tree = NodeTree::default();
        let corrupt = Variant::from(json!({
            "Test": {"$is": "node"},
            "a": {"ok": {}, "": {"$is": "node"}},
            "?bad": {}
        }));
        let err = tree.deserialize(&corrupt).unwrap_err();
        assert!(matches!(err, TreeError::InvalidName(_)));
        assert_eq!(tree.len(), 1);
        assert!(tree.get("/Test").is_none());

        // Defaults can still be built on the clean tree.
        tree.create_child(&tree.root(), "Test").unwrap().build().unwrap();
    }

    #[test]
    fn snapshot_uses_prefixed_keys() {
        let snap = sample_tree().serialize();
        let a = snap.get("a").unwrap();
        assert_eq!(a.get("$name"), Some(&Variant::from("Alpha")));
        assert_eq!(a.get("@color"), Some(&Variant::from("red")));
        assert_eq!(a.get("b").unwrap().get("?value"), Some(&Variant::Int(42)));
    }

    #[test]
    fn deserialize_reapplies_registered_classes() {
        let tree = NodeTree::default();
        tree.add_node_class("rng", |node: &Node| node.set_config("type", "number"));
        tree.deserialize(&Variant::from(json!({"r": {"$is": "rng"}}))).unwrap();
        let r = tree.get("/r").unwrap();
        assert_eq!(r.class_name(), "rng");
        assert_eq!(r.config("type"), Some(Variant::from("number")));
    }

    #[test]
    fn list_updates_start_with_is_and_summarise_children() {
        let tree = sample_tree();
        let rows = tree.list_updates(&tree.get("/a").unwrap());
        assert_eq!(rows[0], Variant::from(json!(["$is", "node"])));
        assert!(rows.contains(&Variant::from(json!(["$name", "Alpha"]))));
        assert!(rows.contains(&Variant::from(json!(["@color", "red"]))));
        let child = rows.last().unwrap().as_list().unwrap();
        assert_eq!(child[0], Variant::from("b"));
        assert_eq!(child[1].get("$type"), Some(&Variant::from("number")));
        assert!(child[1].get("?value").is_none());
    }

    #[test]
    fn remote_tree_ingests_list_updates() {
        let tree = NodeTree::new_remote();
        let root = tree.root();
        let updates = vec![
            Variant::from(json!(["$is", "node"])),
            Variant::from(json!(["@icon", "x.png"])),
            Variant::from(json!(["$params", [{"name": "a", "type": "string"}]])),
            Variant::from(json!(["child", {"$is": "rng", "$type": "number", "@unit": "C"}])),
        ];
        tree.apply_list_updates(&root, &updates).unwrap();
        assert_eq!(root.attribute("icon"), Some(Variant::from("x.png")));
        assert_eq!(root.config("params").unwrap().as_list().unwrap().len(), 1);
        let child = tree.get("/child").unwrap();
        assert!(child.is_remote());
        assert_eq!(child.config("type"), Some(Variant::from("number")));
        assert_eq!(child.attribute("unit"), Some(Variant::from("C")));

        tree.apply_list_updates(&root, &[Variant::from(json!({"name": "child", "change": "remove"}))])
            .unwrap();
        assert!(tree.get("/child").is_none());
    }

    #[test]
    fn remote_nodes_ignore_local_mutation() {
        let tree = NodeTree::new_remote();
        let root = tree.root();
        tree.apply_list_updates(&root, &[Variant::from(json!(["n", {"$type": "number"}]))])
            .unwrap();
        let n = tree.get("/n").unwrap();
        n.set_value(5);
        n.set_config("type", "string");
        assert!(n.value().get().is_null());
        assert_eq!(n.config("type"), Some(Variant::from("number")));
    }

    #[test]
    fn local_tree_rejects_list_ingestion() {
        let tree = NodeTree::default();
        assert!(tree.apply_list_updates(&tree.root(), &[]).is_err());
    }
}
