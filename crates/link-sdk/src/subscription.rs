//! Subscription bookkeeping: which node each sid watches.
//!
//! Lock order is manager map first, then the node's subscriber set.  Node
//! hooks run after both locks are released.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::tree::Node;

#[derive(Default)]
pub struct SubscriptionManager {
    sids: Mutex<HashMap<i64, Arc<Node>>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `sid` on `node`.  An sid already bound to another node is
    /// detached from it first.
    pub fn subscribe(&self, sid: i64, node: &Arc<Node>) {
        self.subscribe_if(sid, node, || true);
    }

    /// Like [`subscribe`](Self::subscribe), but only when `live` still
    /// holds under the manager lock.  Returns whether `sid` was registered.
    pub(crate) fn subscribe_if(&self, sid: i64, node: &Arc<Node>, live: impl FnOnce() -> bool) -> bool {
        let (previous, added) = {
            let mut sids = self.sids.lock();
            if !live() {
                return false;
            }
            let previous = sids.insert(sid, node.clone());
            let previous = previous.filter(|old| old.id() != node.id());
            if let Some(old) = &previous {
                old.remove_subscriber(sid);
            }
            (previous, node.add_subscriber(sid))
        };
        if let Some(old) = previous {
            tracing::trace!(sid, from = %old.path(), to = %node.path(), "sid moved");
            old.fire_unsubscribed(sid);
        }
        if added {
            node.fire_subscribed(sid);
        }
        true
    }

    /// Drop `sid`.  Returns false (and logs) when it was unknown.
    pub fn unsubscribe(&self, sid: i64) -> bool {
        let removed = {
            let mut sids = self.sids.lock();
            let node = sids.remove(&sid);
            node.map(|node| {
                let was_member = node.remove_subscriber(sid);
                (node, was_member)
            })
        };
        match removed {
            Some((node, was_member)) => {
                if was_member {
                    node.fire_unsubscribed(sid);
                }
                true
            }
            None => {
                tracing::debug!(sid, "unsubscribe for unknown sid");
                false
            }
        }
    }

    /// Forget every subscription and empty every subscriber set.  Nodes
    /// themselves are untouched.
    pub fn clear_all(&self) {
        let drained: Vec<(i64, Arc<Node>)> = {
            let mut sids = self.sids.lock();
            let drained: Vec<_> = sids.drain().collect();
            for (sid, node) in &drained {
                node.remove_subscriber(*sid);
            }
            drained
        };
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "subscriptions cleared");
        }
        for (sid, node) in drained {
            node.fire_unsubscribed(sid);
        }
    }

    /// Forget the subscriptions of a node that left the tree.
    pub(crate) fn drop_node(&self, node: &Node) {
        let mut sids = self.sids.lock();
        sids.retain(|_, n| n.id() != node.id());
        node.subscribers.lock().clear();
    }

    pub fn node_for(&self, sid: i64) -> Option<Arc<Node>> {
        self.sids.lock().get(&sid).cloned()
    }

    pub fn len(&self) -> usize {
        self.sids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::NodeTree;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counters() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)))
    }

    #[test]
    fn subscribe_then_unsubscribe_leaves_nothing_behind() {
        let tree = NodeTree::default();
        let n = tree.create_child(&tree.root(), "n").unwrap().build().unwrap();
        let subs = tree.subscriptions();

        subs.subscribe(1, &n);
        assert_eq!(n.subscribers(), vec![1]);
        assert_eq!(subs.node_for(1).unwrap().id(), n.id());

        assert!(subs.unsubscribe(1));
        assert!(n.subscribers().is_empty());
        assert!(subs.node_for(1).is_none());
        assert!(subs.is_empty());
    }

    #[test]
    fn unknown_sid_does_not_disturb_others() {
        let tree = NodeTree::default();
        let n = tree.create_child(&tree.root(), "n").unwrap().build().unwrap();
        let subs = tree.subscriptions();
        subs.subscribe(1, &n);
        assert!(!subs.unsubscribe(99));
        assert_eq!(n.subscribers(), vec![1]);
        assert_eq!(subs.len(), 1);
    }

    #[test]
    fn resubscribe_moves_sid_between_nodes() {
        let tree = NodeTree::default();
        let a = tree.create_child(&tree.root(), "a").unwrap().build().unwrap();
        let b = tree.create_child(&tree.root(), "b").unwrap().build().unwrap();
        let subs = tree.subscriptions();
        subs.subscribe(5, &a);
        subs.subscribe(5, &b);
        assert!(a.subscribers().is_empty());
        assert_eq!(b.subscribers(), vec![5]);
        assert_eq!(subs.len(), 1);
    }

    #[test]
    fn hooks_fire_on_attach_and_detach_only() {
        let tree = NodeTree::default();
        let (on, off) = counters();
        let (on2, off2) = (on.clone(), off.clone());
        let n = tree
            .create_child(&tree.root(), "n")
            .unwrap()
            .on_subscribed(move |_| {
                on2.fetch_add(1, Ordering::SeqCst);
            })
            .on_unsubscribed(move |_| {
                off2.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .unwrap();
        let subs = tree.subscriptions();
        subs.subscribe(1, &n);
        subs.subscribe(1, &n);
        assert_eq!(on.load(Ordering::SeqCst), 1);
        subs.subscribe(2, &n);
        subs.unsubscribe(1);
        assert_eq!(on.load(Ordering::SeqCst), 2);
        assert_eq!(off.load(Ordering::SeqCst), 1);
        subs.clear_all();
        assert_eq!(off.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn clear_all_keeps_nodes() {
        let tree = NodeTree::default();
        let a = tree.create_child(&tree.root(), "a").unwrap().build().unwrap();
        let b = tree.create_child(&tree.root(), "b").unwrap().build().unwrap();
        let subs = tree.subscriptions();
        subs.subscribe(1, &a);
        subs.subscribe(2, &b);
        subs.clear_all();
        assert!(subs.is_empty());
        assert!(a.subscribers().is_empty() && b.subscribers().is_empty());
        assert!(tree.get("/a").is_some() && tree.get("/b").is_some());
    }

    #[test]
    fn removed_node_loses_its_sids() {
        let tree = NodeTree::default();
        let a = tree.create_child(&tree.root(), "a").unwrap().build().unwrap();
        tree.subscriptions().subscribe(1, &a);
        tree.remove_node(&a).unwrap();
        assert!(tree.subscriptions().node_for(1).is_none());
    }

    #[test]
    fn value_change_reaches_each_subscriber_once() {
        let (outbox, mut rx) = crate::outbox::Outbox::channel();
        let tree = NodeTree::new(outbox);
        let n = tree.create_child(&tree.root(), "n").unwrap().build().unwrap();
        tree.subscriptions().subscribe(3, &n);
        tree.subscriptions().subscribe(1, &n);
        n.set_value(9);

        let push = rx.try_recv().unwrap();
        assert_eq!(push.rid, 0);
        let updates = push.updates.unwrap();
        assert_eq!(updates.len(), 2);
        let first = updates[0].as_list().unwrap();
        assert_eq!(first[0], dslink_protocol::Variant::Int(1));
        assert_eq!(first[1], dslink_protocol::Variant::Int(9));
        assert!(rx.try_recv().is_err());
    }
}
