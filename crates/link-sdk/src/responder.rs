//! Responder engine: dispatches inbound requests against the node tree and
//! the subscription/stream managers.

use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

use dslink_protocol::{Permission, ProtocolError, RawRequest, Request, Response, SubscribePath, Variant};
use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::action::InvokeRequest;
use crate::error::PersistenceError;
use crate::tree::NodeTree;

/// Result of one inbound `requests` array.
#[derive(Debug, Default)]
pub struct Dispatch {
    /// Synchronous responses, in request order.
    pub responses: Vec<Response>,
    /// Requests that could not be decoded.  Their siblings were still
    /// processed.
    pub errors: Vec<ProtocolError>,
}

pub struct Responder {
    tree: Arc<NodeTree>,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl Responder {
    pub fn new(tree: Arc<NodeTree>) -> Self {
        Self {
            tree,
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn tree(&self) -> &Arc<NodeTree> {
        &self.tree
    }

    /// Number of invoke handlers still running.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Process one batch of requests in array order.
    ///
    /// Must be called from within a tokio runtime: invoke handlers are
    /// spawned onto it.
    pub fn process_requests(&self, requests: Vec<RawRequest>) -> Dispatch {
        let mut dispatch = Dispatch::default();
        for raw in requests {
            match Request::try_from(raw) {
                Ok(request) => self.handle(request, &mut dispatch.responses),
                Err(e) => dispatch.errors.push(e),
            }
        }
        dispatch
    }

    fn handle(&self, request: Request, out: &mut Vec<Response>) {
        tracing::trace!(method = request.method(), rid = ?request.rid(), "dispatch");
        match request {
            Request::List { rid, path } => self.list(rid, &path, out),
            Request::Set {
                rid,
                path,
                value,
                permit,
            } => self.set(rid, &path, value, permit.as_deref(), out),
            Request::Remove { rid, path } => {
                match self.tree.remove_config_attribute(&path) {
                    Ok(removed) => tracing::trace!(rid, path = %path, removed, "remove"),
                    Err(e) => tracing::debug!(rid, path = %path, error = %e, "remove refused"),
                }
                out.push(Response::closed(rid));
            }
            Request::Invoke {
                rid,
                path,
                permit,
                params,
            } => self.invoke(rid, path, permit.as_deref(), params),
            Request::Subscribe { rid, paths } => self.subscribe(rid, paths, out),
            Request::Unsubscribe { rid, sids } => {
                for sid in sids {
                    self.tree.subscriptions().unsubscribe(sid);
                }
                out.push(Response::closed(rid));
            }
            Request::Close { rid } => {
                if let Some(rid) = rid {
                    self.tree.streams().close(rid);
                }
            }
        }
    }

    fn list(&self, rid: i64, path: &str, out: &mut Vec<Response>) {
        match self.tree.get(path) {
            Some(node) => {
                self.tree.streams().open(rid, &node);
                out.push(Response::open(rid, self.tree.list_updates(&node)));
            }
            None => self.tree.streams().open_later(rid, path),
        }
    }

    fn set(&self, rid: i64, path: &str, value: Variant, permit: Option<&str>, out: &mut Vec<Response>) {
        let Some(node) = self.tree.get(path) else {
            tracing::trace!(rid, path, "set on missing node");
            return;
        };
        if let Some(permit) = permit {
            let writable = node.config("writable");
            if writable.as_ref().and_then(Variant::as_str) != Some(permit) {
                tracing::trace!(rid, path, permit, "set permit mismatch");
                return;
            }
        }
        node.set_value(value);
        node.value().invoke_remote_set();
        out.push(Response::closed(rid));
    }

    fn invoke(&self, rid: i64, path: String, permit: Option<&str>, params: Variant) {
        let Some(node) = self.tree.get(&path) else {
            tracing::trace!(rid, path = %path, "invoke on missing node");
            return;
        };
        let Some(action) = node.action() else {
            tracing::trace!(rid, path = %path, "invoke on node without action");
            return;
        };
        let permit = match permit.map(str::parse::<Permission>) {
            None => None,
            Some(Ok(p)) if p.allows(action.permission) => Some(p),
            Some(_) => {
                tracing::trace!(rid, path = %path, required = %action.permission, "invoke permission denied");
                return;
            }
        };
        let columns = match node.config("columns") {
            Some(Variant::List(columns)) => columns,
            _ => Vec::new(),
        };

        let request = InvokeRequest::new(
            rid,
            path,
            permit,
            params,
            columns,
            self.tree.outbox().clone(),
            self.cancel.child_token(),
        );
        let close = request.closer();
        let handler = action.handler.clone();
        self.tasks.spawn(async move {
            // A panicking handler still ends its stream.
            if AssertUnwindSafe(handler.invoke(request)).catch_unwind().await.is_err() {
                tracing::error!(rid, "invoke handler panicked");
                close();
            }
        });
    }

    fn subscribe(&self, rid: i64, paths: Vec<SubscribePath>, out: &mut Vec<Response>) {
        for SubscribePath { path, sid } in paths {
            let Some(node) = self.tree.get(&path) else {
                tracing::trace!(sid, path = %path, "subscribe to missing node");
                continue;
            };
            if !self.tree.subscribe(sid, &node) {
                tracing::trace!(sid, path = %path, "subscribe raced a removal");
                continue;
            }
            let (value, ts) = node.value().snapshot();
            out.push(Response::subscription_updates(vec![Variant::List(vec![
                Variant::Int(sid),
                value,
                Variant::from(ts.to_dsa_string()),
            ])]));
        }
        out.push(Response::closed(rid));
    }

    // ── Snapshot persistence ─────────────────────────────────────────

    /// Write the tree to `path`.  Failures are logged at debug level and
    /// reported as `false`.
    pub async fn save_nodes(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        match self.write_snapshot(path).await {
            Ok(bytes) => {
                tracing::debug!(path = %path.display(), bytes, "node snapshot written");
                true
            }
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "failed to write node snapshot");
                false
            }
        }
    }

    /// Rebuild the tree from `path`.  A missing or corrupt file yields
    /// `false` so the caller can fall back to its default nodes.
    pub async fn load_nodes(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        match self.read_snapshot(path).await {
            Ok(()) => {
                tracing::debug!(path = %path.display(), nodes = self.tree.len(), "node snapshot loaded");
                true
            }
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "failed to load node snapshot");
                false
            }
        }
    }

    async fn write_snapshot(&self, path: &Path) -> Result<usize, PersistenceError> {
        let json = serde_json::to_string_pretty(&self.tree.serialize())?;
        tokio::fs::write(path, &json).await?;
        Ok(json.len())
    }

    async fn read_snapshot(&self, path: &Path) -> Result<(), PersistenceError> {
        let raw = tokio::fs::read_to_string(path).await?;
        let snapshot: Variant = serde_json::from_str(&raw)?;
        if snapshot.as_map().is_none() {
            return Err(PersistenceError::InvalidSnapshot(format!(
                "expected an object, found {}",
                snapshot.type_name()
            )));
        }
        self.tree
            .deserialize(&snapshot)
            .map_err(|e| PersistenceError::InvalidSnapshot(e.to_string()))
    }

    /// Cancel running invoke handlers and wait for them to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}
