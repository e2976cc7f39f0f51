//! Connection lifecycle: handshake, connect/retry loop, keepalive, frame
//! dispatch, and reconnect-triggered cleanup.
//!
//! One supervisor task owns the live transport.  It races inbound frames
//! against queued outbox responses and control commands, so encoding and
//! writing never happen from two places at once.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use dslink_protocol::{codec_for, Codec, Envelope, Frame, JsonCodec};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::builder::LinkBuilder;
use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::handshake::Handshaker;
use crate::outbox::OutboxReceiver;
use crate::requester::Requester;
use crate::responder::Responder;
use crate::transport::Transport;
use crate::tree::NodeTree;

/// Responses drained from the outbox into one envelope, at most.
const OUTBOX_BATCH: usize = 64;

/// Binary frames at least this large are not hex-dumped in debug logs.
const FRAME_LOG_LIMIT: usize = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Handshaking,
    Connected,
    Closing,
}

/// Application callbacks around the connection lifecycle.  All methods
/// default to no-ops.
pub trait LinkHooks: Send + Sync + 'static {
    /// Populate the tree when no snapshot was loaded at startup.
    fn initialize_default_nodes(&self, _tree: &NodeTree) {}

    fn on_connection_open(&self) {}

    fn on_connection_closed(&self) {}

    /// A connect cycle used up its attempt budget.
    fn on_connection_failed(&self) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl LinkHooks for NoHooks {}

/// Creates a fresh transport for each connection.
pub type TransportFactory = Arc<dyn Fn() -> Box<dyn Transport> + Send + Sync>;

enum Command {
    Ping,
    Close,
}

struct Connection {
    transport: Box<dyn Transport>,
    codec: Box<dyn Codec>,
    commands: mpsc::UnboundedReceiver<Command>,
}

/// A link: the local node tree plus its connection to a broker.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct Link {
    inner: Arc<LinkInner>,
}

struct LinkInner {
    config: LinkConfig,
    tree: Arc<NodeTree>,
    responder: Responder,
    requester: Arc<dyn Requester>,
    handshaker: Arc<dyn Handshaker>,
    transport: TransportFactory,
    hooks: Arc<dyn LinkHooks>,
    state: watch::Sender<ConnectionState>,
    outbox: tokio::sync::Mutex<OutboxReceiver>,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    msg_id: AtomicI64,
    /// Set by every numbered write; the keepalive skips its ping when set.
    active: AtomicBool,
    reconnect: AtomicBool,
    stop: AtomicBool,
    supervising: AtomicBool,
    initialized: AtomicBool,
    keepalive_started: AtomicBool,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

pub(crate) struct LinkParts {
    pub(crate) config: LinkConfig,
    pub(crate) tree: Arc<NodeTree>,
    pub(crate) outbox: OutboxReceiver,
    pub(crate) requester: Arc<dyn Requester>,
    pub(crate) handshaker: Arc<dyn Handshaker>,
    pub(crate) transport: TransportFactory,
    pub(crate) hooks: Arc<dyn LinkHooks>,
}

impl Link {
    pub fn builder() -> LinkBuilder {
        LinkBuilder::new()
    }

    pub(crate) fn from_parts(parts: LinkParts) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(LinkInner {
                responder: Responder::new(parts.tree.clone()),
                config: parts.config,
                tree: parts.tree,
                requester: parts.requester,
                handshaker: parts.handshaker,
                transport: parts.transport,
                hooks: parts.hooks,
                state,
                outbox: tokio::sync::Mutex::new(parts.outbox),
                commands: Mutex::new(None),
                msg_id: AtomicI64::new(1),
                active: AtomicBool::new(false),
                reconnect: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                supervising: AtomicBool::new(false),
                initialized: AtomicBool::new(false),
                keepalive_started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }

    pub fn tree(&self) -> &Arc<NodeTree> {
        &self.inner.tree
    }

    pub fn responder(&self) -> &Responder {
        &self.inner.responder
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.current_state()
    }

    /// Watch state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Restore the tree from `nodes_path` when enabled, otherwise (or when
    /// the snapshot is missing or corrupt) let the hooks build the default
    /// nodes.  Runs once; [`connect`](Self::connect) calls it.
    pub async fn initialize(&self) {
        self.inner.initialize().await;
    }

    pub async fn save_nodes(&self) -> bool {
        self.inner.responder.save_nodes(&self.inner.config.nodes_path).await
    }

    pub async fn load_nodes(&self) -> bool {
        self.inner.responder.load_nodes(&self.inner.config.nodes_path).await
    }

    /// Save the tree to an explicit path.
    pub async fn save_nodes_to(&self, path: impl AsRef<Path>) -> bool {
        self.inner.responder.save_nodes(path).await
    }

    /// Run the connect loop until the link is connected, then hand the
    /// connection to a background supervisor that reconnects after an
    /// unexpected close.
    ///
    /// Returns [`LinkError::ReconnectExhausted`] when the attempt budget
    /// runs out; the `on_connection_failed` hook has fired by then.
    pub async fn connect(&self) -> Result<(), LinkError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(LinkError::Shutdown);
        }
        if inner.supervising.swap(true, Ordering::SeqCst) {
            tracing::debug!("connect called while already connected");
            return Ok(());
        }
        inner.initialize().await;
        inner.stop.store(false, Ordering::SeqCst);
        inner.reconnect.store(inner.config.auto_reconnect, Ordering::SeqCst);
        inner.spawn_keepalive();

        match inner.connect_cycle().await {
            Ok(connection) => {
                let supervisor = inner.clone();
                inner.tasks.spawn(async move { supervisor.supervise(connection).await });
                Ok(())
            }
            Err(e) => {
                inner.supervising.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Close the connection without reconnecting.  Waits until the link
    /// is disconnected.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.reconnect.store(false, Ordering::SeqCst);
        inner.stop.store(true, Ordering::SeqCst);
        let commands = inner.commands.lock().clone();
        if let Some(commands) = commands {
            // The supervisor may already be gone.
            let _ = commands.send(Command::Close);
        }
        let mut state = inner.state.subscribe();
        let _ = state.wait_for(|s| *s == ConnectionState::Disconnected).await;
    }

    /// Disconnect, cancel the keepalive and running invoke handlers, and
    /// wait for every background task to finish.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.reconnect.store(false, Ordering::SeqCst);
        inner.stop.store(true, Ordering::SeqCst);
        inner.shutdown.cancel();
        inner.responder.shutdown().await;
        inner.tasks.close();
        inner.tasks.wait().await;
        tracing::info!(name = %inner.config.name, "link shut down");
    }
}

impl LinkInner {
    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = ?previous, to = ?next, "connection state");
        }
    }

    async fn initialize(&self) {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return;
        }
        let loaded = self.config.load_nodes_json && self.responder.load_nodes(&self.config.nodes_path).await;
        if !loaded {
            self.hooks.initialize_default_nodes(&self.tree);
        }
    }

    fn spawn_keepalive(self: &Arc<Self>) {
        if self.keepalive_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.clone();
        let interval = self.config.keepalive();
        self.tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if inner.current_state() != ConnectionState::Connected {
                    continue;
                }
                if inner.active.swap(false, Ordering::SeqCst) {
                    tracing::trace!("link active, ping skipped");
                    continue;
                }
                let commands = inner.commands.lock().clone();
                if let Some(commands) = commands {
                    let _ = commands.send(Command::Ping);
                }
            }
            tracing::debug!("keepalive stopped");
        });
    }

    /// Handshake and open the transport, retrying with linear back-off.
    async fn connect_cycle(&self) -> Result<Connection, LinkError> {
        let backoff = self.config.backoff();
        let mut attempts: u32 = 0;
        loop {
            if self.shutdown.is_cancelled() {
                self.set_state(ConnectionState::Disconnected);
                return Err(LinkError::Shutdown);
            }
            if self.stop.load(Ordering::SeqCst) {
                self.set_state(ConnectionState::Disconnected);
                return Err(LinkError::Cancelled);
            }
            if backoff.should_give_up(attempts) {
                tracing::warn!(attempts, "failed to connect within the connection attempt limit");
                self.set_state(ConnectionState::Disconnected);
                self.hooks.on_connection_failed();
                return Err(LinkError::ReconnectExhausted(attempts));
            }

            attempts += 1;
            self.set_state(ConnectionState::Handshaking);
            match self.try_connect().await {
                Ok((transport, codec)) => return Ok(self.open(transport, codec)),
                Err(e) => {
                    let delay = backoff.delay_for_attempt(attempts);
                    tracing::warn!(
                        attempt = attempts,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "failed to connect"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.cancelled() => {}
                    }
                }
            }
        }
    }

    async fn try_connect(&self) -> Result<(Box<dyn Transport>, Box<dyn Codec>), LinkError> {
        let session = self.handshaker.handshake().await?;
        let codec = codec_for(&session.format).unwrap_or_else(|| {
            tracing::warn!(format = %session.format, "unsupported format, using json");
            Box::new(JsonCodec)
        });
        let mut transport = (self.transport)();
        transport.connect(&session.ws_url).await?;
        Ok((transport, codec))
    }

    fn open(&self, transport: Box<dyn Transport>, codec: Box<dyn Codec>) -> Connection {
        let (tx, commands) = mpsc::unbounded_channel();
        *self.commands.lock() = Some(tx);
        self.active.store(false, Ordering::SeqCst);
        let session = self.tree.outbox().begin_session();
        self.set_state(ConnectionState::Connected);
        tracing::info!(name = %self.config.name, format = codec.format(), session, "connected to broker");
        self.hooks.on_connection_open();
        Connection {
            transport,
            codec,
            commands,
        }
    }

    async fn supervise(self: Arc<Self>, mut connection: Connection) {
        loop {
            self.run_connection(connection).await;
            let retry = !self.shutdown.is_cancelled() && self.reconnect.load(Ordering::SeqCst);
            if !retry {
                // Released before the state flips so a connect() issued
                // right after disconnect() is not ignored.
                self.supervising.store(false, Ordering::SeqCst);
                self.on_close();
                return;
            }
            self.on_close();
            tracing::info!("connection lost, reconnecting");
            match self.connect_cycle().await {
                Ok(next) => connection = next,
                Err(e) => {
                    tracing::error!(error = %e, "reconnect failed");
                    self.supervising.store(false, Ordering::SeqCst);
                    return;
                }
            }
        }
    }

    async fn run_connection(&self, connection: Connection) {
        let Connection {
            mut transport,
            codec,
            mut commands,
        } = connection;

        // Held for the whole connection; anything queued while
        // disconnected is flushed first.
        let mut outbox = self.outbox.lock().await;
        // A disconnect() that raced the connect leaves the stop flag set.
        while !self.stop.load(Ordering::SeqCst) {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(Command::Ping) => {
                        tracing::debug!("sent ping");
                        if let Err(e) = self.write(transport.as_mut(), codec.as_ref(), Envelope::default(), false).await {
                            tracing::warn!(error = %e, "ping failed");
                            break;
                        }
                    }
                    Some(Command::Close) | None => break,
                },
                Some(first) = outbox.recv() => {
                    let mut responses = vec![first];
                    while responses.len() < OUTBOX_BATCH {
                        match outbox.try_recv() {
                            Ok(next) => responses.push(next),
                            Err(_) => break,
                        }
                    }
                    let envelope = Envelope {
                        responses: Some(responses),
                        ..Envelope::default()
                    };
                    if let Err(e) = self.write(transport.as_mut(), codec.as_ref(), envelope, true).await {
                        tracing::warn!(error = %e, "write failed");
                        break;
                    }
                }
                frame = transport.recv() => {
                    let Some(frame) = frame else { break };
                    if let Some(reply) = self.on_frame(codec.as_ref(), frame).await {
                        if let Err(e) = self.write(transport.as_mut(), codec.as_ref(), reply, true).await {
                            tracing::warn!(error = %e, "write failed");
                            break;
                        }
                    }
                }
            }
        }
        drop(outbox);

        *self.commands.lock() = None;
        self.set_state(ConnectionState::Closing);
        transport.disconnect().await;
    }

    fn on_close(&self) {
        self.tree.subscriptions().clear_all();
        self.tree.streams().clear_all();
        tracing::info!(name = %self.config.name, "disconnected from broker");
        self.hooks.on_connection_closed();
        self.set_state(ConnectionState::Disconnected);
    }

    async fn write(
        &self,
        transport: &mut dyn Transport,
        codec: &dyn Codec,
        mut envelope: Envelope,
        numbered: bool,
    ) -> Result<(), LinkError> {
        if numbered {
            envelope.msg = Some(self.msg_id.fetch_add(1, Ordering::SeqCst));
            self.active.store(true, Ordering::SeqCst);
        }
        let frame = codec.encode(&envelope)?;
        log_frame("sent", &frame);
        transport.send(frame).await?;
        Ok(())
    }

    async fn on_frame(&self, codec: &dyn Codec, frame: Frame) -> Option<Envelope> {
        log_frame("received", &frame);
        match codec.decode(&frame) {
            Ok(envelope) => self.on_envelope(envelope).await,
            Err(e) => {
                tracing::warn!(error = %e, "undecodable frame dropped");
                None
            }
        }
    }

    /// Route one inbound envelope.  Returns the reply to write, if the
    /// requests or responses produced anything.
    async fn on_envelope(&self, envelope: Envelope) -> Option<Envelope> {
        let mut reply = Envelope {
            ack: envelope.msg,
            ..Envelope::default()
        };
        if let Some(requests) = envelope.requests {
            let dispatch = self.responder.process_requests(requests);
            for error in &dispatch.errors {
                tracing::warn!(error = %error, "request rejected");
            }
            if !dispatch.responses.is_empty() {
                reply.responses = Some(dispatch.responses);
            }
        }
        if let Some(responses) = envelope.responses {
            let requests = self.requester.process_responses(responses).await;
            if !requests.is_empty() {
                reply.requests = Some(requests);
            }
        }
        (!reply.is_empty()).then_some(reply)
    }
}

fn log_frame(direction: &'static str, frame: &Frame) {
    if !tracing::enabled!(tracing::Level::DEBUG) {
        return;
    }
    match frame {
        Frame::Text(text) => tracing::debug!(direction, frame = %text, "text frame"),
        Frame::Binary(bytes) if bytes.len() < FRAME_LOG_LIMIT => {
            let hex: Vec<String> = bytes.iter().map(|b| format!("{b:02X}")).collect();
            tracing::debug!(direction, frame = %hex.join("-"), "binary frame");
        }
        Frame::Binary(_) => tracing::debug!(direction, "binary frame (over 5000 bytes)"),
    }
}
