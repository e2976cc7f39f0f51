//! Builder pattern for constructing a [`Link`].

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::handshake::{Handshaker, HttpHandshake};
use crate::keys::LinkKeys;
use crate::link::{Link, LinkHooks, LinkParts, NoHooks, TransportFactory};
use crate::outbox::Outbox;
use crate::requester::{NullRequester, Requester};
use crate::transport::{Transport, WebSocketTransport};
use crate::tree::NodeTree;

/// Fluent builder for [`Link`].
///
/// # Example
///
/// ```rust,no_run
/// # use dslink_sdk::LinkBuilder;
/// let link = LinkBuilder::new()
///     .name("rng")
///     .broker_url("http://localhost:8080/conn")
///     .connection_attempt_limit(5)
///     .build()
///     .unwrap();
/// ```
pub struct LinkBuilder {
    config: LinkConfig,
    hooks: Arc<dyn LinkHooks>,
    requester: Arc<dyn Requester>,
    handshaker: Option<Arc<dyn Handshaker>>,
    transport: Option<TransportFactory>,
}

impl LinkBuilder {
    pub fn new() -> Self {
        Self {
            config: LinkConfig::default(),
            hooks: Arc::new(NoHooks),
            requester: Arc::new(NullRequester),
            handshaker: None,
            transport: None,
        }
    }

    /// Replace the whole configuration, e.g. one read from `dslink.toml`.
    pub fn config(mut self, config: LinkConfig) -> Self {
        self.config = config;
        self
    }

    // ── Identity / broker ────────────────────────────────────────────

    /// Link name; prefix of the dsId.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Broker `conn` endpoint, e.g. `http://localhost:8080/conn`.
    pub fn broker_url(mut self, url: impl Into<String>) -> Self {
        self.config.broker_url = url.into();
        self
    }

    pub fn keys_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.keys_path = path.into();
        self
    }

    /// Force `json` or `msgpack` instead of the broker's choice.
    pub fn communication_format(mut self, format: impl Into<String>) -> Self {
        self.config.communication_format = format.into();
        self
    }

    // ── Connection behavior ──────────────────────────────────────────

    /// Attempts per connect cycle; negative means unlimited.
    pub fn connection_attempt_limit(mut self, limit: i32) -> Self {
        self.config.connection_attempt_limit = limit;
        self
    }

    /// Cap on the linear back-off between attempts, in seconds.
    pub fn max_connection_cooldown(mut self, secs: u64) -> Self {
        self.config.max_connection_cooldown = secs;
        self
    }

    pub fn keepalive_interval(mut self, secs: u64) -> Self {
        self.config.keepalive_interval = secs;
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.auto_reconnect = enabled;
        self
    }

    // ── Persistence ──────────────────────────────────────────────────

    /// Restore the tree from the snapshot file at startup.
    pub fn load_nodes_json(mut self, enabled: bool) -> Self {
        self.config.load_nodes_json = enabled;
        self
    }

    pub fn nodes_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.nodes_path = path.into();
        self
    }

    // ── Collaborators ────────────────────────────────────────────────

    pub fn hooks(mut self, hooks: impl LinkHooks) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    pub fn requester(mut self, requester: impl Requester) -> Self {
        self.requester = Arc::new(requester);
        self
    }

    /// Replace the HTTP handshake.  When set, no key file is touched.
    pub fn handshaker(mut self, handshaker: impl Handshaker) -> Self {
        self.handshaker = Some(Arc::new(handshaker));
        self
    }

    /// Replace the WebSocket transport.  Called once per connection.
    pub fn transport<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Transport> + Send + Sync + 'static,
    {
        self.transport = Some(Arc::new(factory));
        self
    }

    /// Build the [`Link`].  Loads (or creates) the key file unless a
    /// custom handshaker was supplied.
    pub fn build(self) -> Result<Link, LinkError> {
        self.config.validate()?;

        let handshaker = match self.handshaker {
            Some(handshaker) => handshaker,
            None => {
                let keys = LinkKeys::load_or_create(&self.config.keys_path)?;
                let handshake = HttpHandshake::new(&self.config, keys);
                tracing::info!(ds_id = %handshake.ds_id(), "link identity");
                Arc::new(handshake)
            }
        };
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(|| Box::new(WebSocketTransport::new()) as Box<dyn Transport>));

        let (outbox, rx) = Outbox::channel();
        Ok(Link::from_parts(LinkParts {
            config: self.config,
            tree: Arc::new(NodeTree::new(outbox)),
            outbox: rx,
            requester: self.requester,
            handshaker,
            transport,
            hooks: self.hooks,
        }))
    }
}

impl Default for LinkBuilder {
    fn default() -> Self {
        Self::new()
    }
}
