//! Invocable actions: permission, parameter/column schema, and the async
//! handler that drives the invoke response stream.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dslink_protocol::{Permission, Response, StreamState, Variant};
use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;

use crate::outbox::Outbox;

/// Implement this trait to handle `invoke` requests on a node.
///
/// Handlers run on their own task, off the dispatch path.  The handler owns
/// the response stream: it sends rows with [`InvokeRequest::update_table`]
/// and must finish with [`InvokeRequest::close`].
///
/// # Example
///
/// ```rust,no_run
/// use dslink_sdk::{ActionHandler, InvokeRequest};
///
/// struct Ping;
///
/// #[async_trait::async_trait]
/// impl ActionHandler for Ping {
///     async fn invoke(&self, request: InvokeRequest) {
///         request.update_table(vec![vec![true.into()]]);
///         request.close();
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait ActionHandler: Send + Sync + 'static {
    async fn invoke(&self, request: InvokeRequest);
}

#[async_trait::async_trait]
impl<F, Fut> ActionHandler for F
where
    F: Fn(InvokeRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn invoke(&self, request: InvokeRequest) {
        (self)(request).await
    }
}

/// Action descriptor attached to a node.
#[derive(Clone)]
pub struct Action {
    pub permission: Permission,
    pub(crate) handler: Arc<dyn ActionHandler>,
}

impl Action {
    pub fn new<H: ActionHandler>(permission: Permission, handler: H) -> Self {
        Self {
            permission,
            handler: Arc::new(handler),
        }
    }

    pub fn from_arc(permission: Permission, handler: Arc<dyn ActionHandler>) -> Self {
        Self {
            permission,
            handler,
        }
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action")
            .field("permission", &self.permission)
            .finish_non_exhaustive()
    }
}

/// One entry of a node's `$params`.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub value_type: String,
    pub default: Option<Variant>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value_type: value_type.into(),
            default: None,
        }
    }

    pub fn with_default(mut self, default: impl Into<Variant>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn to_variant(&self) -> Variant {
        let mut map = IndexMap::new();
        map.insert("name".to_owned(), Variant::from(self.name.as_str()));
        map.insert("type".to_owned(), Variant::from(self.value_type.as_str()));
        if let Some(default) = &self.default {
            map.insert("default".to_owned(), default.clone());
        }
        Variant::Map(map)
    }
}

/// One entry of a node's `$columns`.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub value_type: String,
}

impl Column {
    pub fn new(name: impl Into<String>, value_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value_type: value_type.into(),
        }
    }

    pub fn to_variant(&self) -> Variant {
        let mut map = IndexMap::new();
        map.insert("name".to_owned(), Variant::from(self.name.as_str()));
        map.insert("type".to_owned(), Variant::from(self.value_type.as_str()));
        Variant::Map(map)
    }
}

/// A single invocation handed to an [`ActionHandler`].
pub struct InvokeRequest {
    rid: i64,
    path: String,
    permit: Option<Permission>,
    params: Variant,
    columns: Vec<Variant>,
    outbox: Outbox,
    cancel: CancellationToken,
    columns_sent: AtomicBool,
    closed: Arc<AtomicBool>,
}

impl InvokeRequest {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        rid: i64,
        path: String,
        permit: Option<Permission>,
        params: Variant,
        columns: Vec<Variant>,
        outbox: Outbox,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            rid,
            path,
            permit,
            params,
            columns,
            // Rows must not leak into a later broker session.
            outbox: outbox.pinned(),
            cancel,
            columns_sent: AtomicBool::new(false),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Closes the stream on behalf of a handler that can no longer do it
    /// itself.  Shares the idempotence flag with [`close`](Self::close).
    pub(crate) fn closer(&self) -> impl FnOnce() + Send + 'static {
        let closed = self.closed.clone();
        let outbox = self.outbox.clone();
        let rid = self.rid;
        move || {
            if !closed.swap(true, Ordering::SeqCst) {
                outbox.push(Response::closed(rid));
            }
        }
    }

    pub fn rid(&self) -> i64 {
        self.rid
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn permit(&self) -> Option<Permission> {
        self.permit
    }

    pub fn params(&self) -> &Variant {
        &self.params
    }

    /// Look up one named parameter.
    pub fn param(&self, name: &str) -> Option<&Variant> {
        self.params.get(name)
    }

    /// Cancelled when the link shuts down.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stream result rows.  The first call also carries the column schema.
    pub fn update_table(&self, rows: Vec<Vec<Variant>>) {
        if self.is_closed() {
            tracing::debug!(rid = self.rid, "update on closed invoke stream dropped");
            return;
        }
        let columns = if self.columns_sent.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(self.columns.clone())
        };
        self.outbox.push(Response {
            rid: self.rid,
            stream: Some(StreamState::Open),
            updates: Some(rows.into_iter().map(Variant::List).collect()),
            columns,
        });
    }

    /// Close the invoke stream.  Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.outbox.push(Response::closed(self.rid));
    }
}
