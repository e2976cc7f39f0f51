//! `dslink-sdk`: building blocks for DSA links.
//!
//! A "link" is a process that connects to a DSA broker, exposes a tree of
//! nodes to it, and answers the broker's `list`, `set`, `remove`,
//! `invoke`, `subscribe`, `unsubscribe` and `close` requests.  This crate
//! provides the node tree, the responder engine, and the connection
//! lifecycle so link authors only describe their nodes.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │  Your Link                                                │
//! │                                                           │
//! │   let link = LinkBuilder::new()                           │
//! │       .name("rng")                                        │
//! │       .broker_url("http://localhost:8080/conn")           │
//! │       .hooks(MyNodes)                                     │
//! │       .build()?;                                          │
//! │   link.connect().await?;                                  │
//! │                                                           │
//! │   let tree = link.tree();                                 │
//! │   tree.get("/Test").unwrap().set_value(42);               │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Connection flow
//!
//! 1. Load `nodes.json` or let [`LinkHooks::initialize_default_nodes`]
//!    populate the tree
//! 2. POST the public key to the broker (`conn?dsId=...`), derive the
//!    auth token from the salt and the ECDH shared secret
//! 3. Open the WebSocket in the negotiated format (`json` or `msgpack`)
//! 4. Main loop:
//!    - inbound `requests` go to the [`Responder`], inbound `responses`
//!      to the [`Requester`]; replies ack the inbound `msg`
//!    - value pushes, list updates and invoke rows drain from the outbox
//!    - an empty envelope is sent when nothing else was written for one
//!      keepalive interval
//! 5. On close: subscriptions and list streams are cleared, then the link
//!    reconnects with linear back-off unless [`Link::disconnect`] was called

pub mod action;
pub mod builder;
pub mod config;
pub mod error;
pub mod handshake;
pub mod keys;
pub mod link;
pub mod outbox;
pub mod reconnect;
pub mod requester;
pub mod responder;
pub mod stream;
pub mod subscription;
pub mod transport;
pub mod tree;
pub mod value;

// Re-export the most commonly used types at the crate root.
pub use action::{Action, ActionHandler, Column, InvokeRequest, Parameter};
pub use builder::LinkBuilder;
pub use config::LinkConfig;
pub use error::{HandshakeError, LinkError, PersistenceError, TransportError, TreeError};
pub use handshake::{build_ws_url, Handshaker, HttpHandshake, RemoteEndpoint, Session};
pub use keys::{auth_token, LinkKeys};
pub use link::{ConnectionState, Link, LinkHooks, NoHooks, TransportFactory};
pub use outbox::{Outbox, OutboxReceiver};
pub use reconnect::ConnectBackoff;
pub use requester::{NullRequester, Requester};
pub use responder::{Dispatch, Responder};
pub use stream::StreamManager;
pub use subscription::SubscriptionManager;
pub use transport::{Transport, WebSocketTransport};
pub use tree::{normalize_path, Node, NodeBuilder, NodeId, NodeTree};
pub use value::{Timestamp, Value};

// Re-export protocol types so link authors need only one dependency.
pub use dslink_protocol::{
    Envelope, Frame, Permission, ProtocolError, RawRequest, Response, StreamState, Variant,
};
