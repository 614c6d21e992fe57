//! A single audio node: connection state machine, outbound queue and
//! frame dispatch.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use lp_protocol::{Command, DecodeError, GuildId, IncomingOp};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::pool::PoolShared;
use crate::reconnect::ReconnectBackoff;
use crate::shutdown::Shutdown;
use crate::types::{ConnectionState, EventHandler, NodeError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Headers sent verbatim on every (re)connect attempt.
#[derive(Clone)]
pub(crate) struct ConnectHeaders {
    pub(crate) authorization: HeaderValue,
    pub(crate) user_id: HeaderValue,
    pub(crate) num_shards: HeaderValue,
}

/// Handle to one managed node connection.
///
/// Cheap to clone; all clones drive the same connection.  Create via
/// [`NodeBuilder`](crate::NodeBuilder) or [`NodePool::add`](crate::NodePool::add).
#[derive(Clone)]
pub struct Node {
    pub(crate) inner: Arc<NodeInner>,
}

pub(crate) struct NodeInner {
    name: String,
    url: String,
    headers: ConnectHeaders,
    backoff: ReconnectBackoff,
    /// Per-node jitter salt so nodes that drop together retry apart.
    retry_salt: u64,
    handler: Arc<dyn EventHandler>,
    shutdown: Shutdown,
    link: Mutex<Link>,
    state_tx: watch::Sender<ConnectionState>,
    listener: Mutex<Option<JoinHandle<()>>>,
    pub(crate) pool: Mutex<Weak<PoolShared>>,
}

/// Everything `send` needs to decide between transmitting and queueing.
/// Kept under one lock so a flush on connect and a concurrent `send`
/// cannot interleave.
struct Link {
    state: ConnectionState,
    writer: Option<mpsc::UnboundedSender<Command>>,
    queue: VecDeque<Command>,
}

impl Node {
    pub(crate) fn new(
        name: String,
        url: String,
        headers: ConnectHeaders,
        backoff: ReconnectBackoff,
        handler: Arc<dyn EventHandler>,
        shutdown: Shutdown,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let retry_salt = {
            let mut hasher = DefaultHasher::new();
            url.hash(&mut hasher);
            hasher.finish()
        };
        Self {
            inner: Arc::new(NodeInner {
                name,
                url,
                headers,
                backoff,
                retry_salt,
                handler,
                shutdown,
                link: Mutex::new(Link {
                    state: ConnectionState::Disconnected,
                    writer: None,
                    queue: VecDeque::new(),
                }),
                state_tx,
                listener: Mutex::new(None),
                pool: Mutex::new(Weak::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.link.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch state transitions (e.g. to wait for `Connected`).
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Number of commands waiting for the next successful connect.
    pub fn queued(&self) -> usize {
        self.inner.link.lock().queue.len()
    }

    pub(crate) fn shutdown_signaled(&self) -> bool {
        self.inner.shutdown.is_signaled()
    }

    fn set_state(&self, link: &mut Link, state: ConnectionState) {
        link.state = state;
        self.inner.state_tx.send_replace(state);
    }

    // ── Connection state machine ─────────────────────────────────────

    /// Connect to the node, retrying transport failures with backoff.
    ///
    /// Returns immediately if a connect is already in flight or the node is
    /// connected.  With `timeout`, gives up with [`NodeError::ConnectTimeout`]
    /// once it elapses; without, retries until connected or shut down.  An
    /// attempt abandoned because of shutdown returns `Ok(())` without
    /// reaching `Connected`.
    pub async fn connect(&self, timeout: Option<Duration>) -> Result<(), NodeError> {
        {
            let mut link = self.inner.link.lock();
            match link.state {
                ConnectionState::Disconnected => {
                    self.set_state(&mut link, ConnectionState::Connecting)
                }
                ConnectionState::ShuttingDown => return Err(NodeError::ShuttingDown),
                ConnectionState::Connecting | ConnectionState::Connected => return Ok(()),
            }
        }

        tracing::debug!(node = %self.inner.name, url = %self.inner.url, "connecting to node");

        let attempt = self.open_with_retry();
        let opened = match timeout {
            Some(limit) => match tokio::time::timeout(limit, attempt).await {
                Ok(result) => result,
                Err(_) => Err(NodeError::ConnectTimeout(limit)),
            },
            None => attempt.await,
        };

        match opened {
            Ok(Some(ws)) => {
                self.start(ws);
                Ok(())
            }
            Ok(None) => {
                tracing::debug!(node = %self.inner.name, "connect abandoned, shutdown signaled");
                self.abandon_connecting();
                Ok(())
            }
            Err(e) => {
                self.abandon_connecting();
                Err(e)
            }
        }
    }

    /// Open the socket, retrying transport-level failures forever.
    /// `Ok(None)` means shutdown was signaled first.
    async fn open_with_retry(&self) -> Result<Option<WsStream>, NodeError> {
        let shutdown = &self.inner.shutdown;
        let mut attempt: u32 = 1;

        loop {
            if shutdown.is_signaled() {
                return Ok(None);
            }

            let request = self.request()?;
            let result = tokio::select! {
                r = tokio_tungstenite::connect_async(request) => r,
                _ = shutdown.signaled() => return Ok(None),
            };

            match result {
                Ok((ws, _response)) => return Ok(Some(ws)),
                Err(e) if is_retryable(&e) => {
                    let delay = self.inner.backoff.delay(attempt - 1, self.inner.retry_salt);
                    tracing::debug!(
                        node = %self.inner.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "connect attempt failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.signaled() => return Ok(None),
                    }
                    attempt = attempt.saturating_add(1);
                }
                Err(e) => {
                    tracing::warn!(node = %self.inner.name, error = %e, "node rejected connection");
                    return Err(NodeError::Rejected(e.to_string()));
                }
            }
        }
    }

    /// Build the handshake request with the node's auth headers.
    fn request(&self) -> Result<Request, NodeError> {
        let mut request = self
            .inner
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| NodeError::Config(format!("invalid node url {}: {e}", self.inner.url)))?;
        let headers = request.headers_mut();
        let auth = &self.inner.headers;
        headers.insert(header::AUTHORIZATION, auth.authorization.clone());
        headers.insert("user-id", auth.user_id.clone());
        headers.insert("num-shards", auth.num_shards.clone());
        Ok(request)
    }

    fn abandon_connecting(&self) {
        let mut link = self.inner.link.lock();
        if link.state == ConnectionState::Connecting {
            self.set_state(&mut link, ConnectionState::Disconnected);
        }
    }

    /// Go live on a freshly opened socket: flush the queue, mark the node
    /// `Connected`, and start the writer and receive loop.
    fn start(&self, ws: WsStream) {
        let (sink, stream) = ws.split();
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut link = self.inner.link.lock();
            if link.state != ConnectionState::Connecting {
                tracing::debug!(node = %self.inner.name, "node shut down while connecting, dropping socket");
                return;
            }
            // Flushed commands leave the queue for good; a later reconnect
            // never replays them.
            let flushed = link.queue.len();
            for command in link.queue.drain(..) {
                let _ = tx.send(command);
            }
            link.writer = Some(tx);
            self.set_state(&mut link, ConnectionState::Connected);
            tracing::info!(node = %self.inner.name, flushed, "connected to node");
        }

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(self.inner.name.clone(), sink, rx));
        tokio::spawn(dispatch_loop(
            self.inner.name.clone(),
            self.inner.handler.clone(),
            frames_rx,
        ));
        let listener = tokio::spawn(self.clone().listen(stream, frames_tx));
        *self.inner.listener.lock() = Some(listener);
    }

    /// Receive loop: read frames in arrival order and queue each known one
    /// for the dispatch task.  Never waits on the handler.
    async fn listen(
        self,
        mut stream: SplitStream<WsStream>,
        frames: mpsc::UnboundedSender<(IncomingOp, serde_json::Value)>,
    ) {
        let shutdown = self.inner.shutdown.clone();

        loop {
            let msg = tokio::select! {
                _ = shutdown.signaled() => break,
                msg = stream.next() => msg,
            };
            match msg {
                Some(Ok(Message::Text(text))) => self.route(&text, &frames),
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!(node = %self.inner.name, ?frame, "node closed connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(node = %self.inner.name, error = %e, "websocket read failed");
                    break;
                }
                None => break,
            }
        }

        tracing::debug!(
            node = %self.inner.name,
            shutdown = shutdown.is_signaled(),
            "listener exited"
        );
        self.on_listener_exit();
    }

    fn route(&self, text: &str, frames: &mpsc::UnboundedSender<(IncomingOp, serde_json::Value)>) {
        let frame = match lp_protocol::parse_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(node = %self.inner.name, error = %e, "dropping unparseable frame");
                return;
            }
        };

        let Some(op) = IncomingOp::classify(&frame) else {
            tracing::debug!(node = %self.inner.name, frame = %text, "received unknown op");
            return;
        };
        tracing::debug!(node = %self.inner.name, op = %op, "received known op");

        if frames.send((op, frame)).is_err() {
            tracing::warn!(node = %self.inner.name, op = %op, "dispatch task gone, dropping frame");
        }
    }

    fn on_listener_exit(&self) {
        {
            let mut link = self.inner.link.lock();
            link.writer = None;
            if link.state == ConnectionState::Connected {
                self.set_state(&mut link, ConnectionState::Disconnected);
            }
        }

        if self.inner.shutdown.is_signaled() {
            tracing::debug!(node = %self.inner.name, "shutting down, not reconnecting");
            return;
        }
        tokio::spawn(self.clone().reconnect());
    }

    /// Unbounded reconnect after an unexpected close.
    ///
    /// Boxed because it re-enters `connect`, which spawns the listener that
    /// schedules this future.
    fn reconnect(self) -> BoxFuture<'static, ()> {
        async move {
            tracing::info!(node = %self.inner.name, "attempting reconnect");
            match self.connect(None).await {
                Ok(()) if self.is_connected() => {
                    tracing::info!(node = %self.inner.name, "reconnect successful");
                }
                Ok(()) | Err(NodeError::ShuttingDown) => {
                    tracing::debug!(node = %self.inner.name, "reconnect abandoned");
                }
                Err(e) => {
                    tracing::warn!(
                        node = %self.inner.name,
                        error = %e,
                        "reconnect failed, call connect() to retry"
                    );
                }
            }
        }
        .boxed()
    }

    /// Shut the node down: stop retrying, close the socket and leave the pool.
    ///
    /// Only this node's signal fires; other nodes keep running unless they
    /// share it.  The node ends in `ShuttingDown` and cannot reconnect.
    pub async fn disconnect(&self) {
        self.inner.shutdown.signal();
        {
            let mut link = self.inner.link.lock();
            // Dropping the writer lets it drain and close the socket.
            link.writer = None;
            self.set_state(&mut link, ConnectionState::ShuttingDown);
        }

        let listener = self.inner.listener.lock().take();
        if let Some(handle) = listener {
            let _ = handle.await;
        }

        let pool = self.inner.pool.lock().upgrade();
        if let Some(pool) = pool {
            pool.remove(self);
        }
        tracing::info!(node = %self.inner.name, "node shut down");
    }

    // ── Outbound ─────────────────────────────────────────────────────

    /// Transmit `command` now if connected, otherwise queue it for the next
    /// successful connect.  Never blocks on connectivity.
    pub fn send(&self, command: Command) {
        let mut link = self.inner.link.lock();
        let command = match (link.state, &link.writer) {
            (ConnectionState::Connected, Some(writer)) => match writer.send(command) {
                Ok(()) => return,
                Err(mpsc::error::SendError(command)) => command,
            },
            _ => command,
        };
        tracing::debug!(
            node = %self.inner.name,
            op = command.op(),
            queued = link.queue.len() + 1,
            "node not connected, queueing command"
        );
        link.queue.push_back(command);
    }

    pub fn voice_update(&self, guild_id: GuildId, session_id: &str, event: serde_json::Value) {
        self.send(Command::voice_update(guild_id, session_id, event));
    }

    pub fn play(&self, guild_id: GuildId, track: &str) {
        self.send(Command::play(guild_id, track));
    }

    pub fn stop(&self, guild_id: GuildId) {
        self.send(Command::stop(guild_id));
    }

    pub fn pause(&self, guild_id: GuildId, pause: bool) {
        self.send(Command::pause(guild_id, pause));
    }

    pub fn volume(&self, guild_id: GuildId, volume: i32) {
        self.send(Command::volume(guild_id, volume));
    }

    pub fn seek(&self, guild_id: GuildId, position: i64) {
        self.send(Command::seek(guild_id, position));
    }
}

/// Non-owning [`Node`] handle for state the node's own handler holds.
#[derive(Clone)]
pub(crate) struct WeakNode(Weak<NodeInner>);

impl WeakNode {
    pub(crate) fn upgrade(&self) -> Option<Node> {
        self.0.upgrade().map(|inner| Node { inner })
    }
}

impl Node {
    pub(crate) fn downgrade(&self) -> WeakNode {
        WeakNode(Arc::downgrade(&self.inner))
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Node {}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.inner.name)
            .field("url", &self.inner.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Writer task: serializes queued commands onto the socket in order.
async fn write_loop(
    node: String,
    mut sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    while let Some(command) = rx.recv().await {
        let json = match command.encode() {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(node = %node, error = %e, "failed to serialize command");
                continue;
            }
        };
        tracing::debug!(node = %node, op = command.op(), guild = %command.guild_id(), "sending command");
        if let Err(e) = sink.send(Message::Text(json)).await {
            tracing::warn!(node = %node, error = %e, "websocket write failed");
            break;
        }
    }
    let _ = sink.close().await;
}

/// Dispatch task: decodes frames and calls the handler one at a time, in
/// arrival order.  Ends once the receive loop drops its sender.
async fn dispatch_loop(
    node: String,
    handler: Arc<dyn EventHandler>,
    mut frames: mpsc::UnboundedReceiver<(IncomingOp, serde_json::Value)>,
) {
    while let Some((op, frame)) = frames.recv().await {
        if let Err(e) = dispatch(handler.as_ref(), &node, op, frame) {
            tracing::error!(node = %node, op = %op, error = %e, "failed to decode frame");
        }
    }
}

/// Decode one classified frame and hand it to the handler.
///
/// Unknown event types are dropped quietly; a malformed payload is returned
/// as an error to the dispatch task.  A panicking handler is contained here.
pub(crate) fn dispatch(
    handler: &dyn EventHandler,
    node: &str,
    op: IncomingOp,
    frame: serde_json::Value,
) -> Result<(), DecodeError> {
    let Some(payload) = lp_protocol::decode(op, &frame)? else {
        tracing::debug!(node = %node, frame = %frame, "unknown event type");
        return Ok(());
    };

    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(op, payload, &frame)));
    if outcome.is_err() {
        tracing::error!(node = %node, op = %op, "event handler panicked");
    }
    Ok(())
}

/// Transport failures worth retrying; anything else means the node will
/// keep refusing us.
fn is_retryable(err: &WsError) -> bool {
    match err {
        WsError::Io(_) | WsError::ConnectionClosed | WsError::AlreadyClosed | WsError::Protocol(_) => {
            true
        }
        WsError::Http(response) => response.status().is_server_error(),
        _ => false,
    }
}
