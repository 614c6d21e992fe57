//! Core types: connection state, the upward event handler, and errors.

use std::time::Duration;

use lp_protocol::{IncomingOp, Payload};

/// Connection state of a single node.
///
/// `Disconnected` is both the initial state and the state a node returns to
/// between reconnect attempts.  `ShuttingDown` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ShuttingDown,
}

/// Receives every frame a node decodes.
///
/// Called from the node's dispatch task, never from the receive loop, so a
/// slow handler holds back later frames but never reads from the socket.
/// Calls for one node happen one at a time in arrival order.
pub trait EventHandler: Send + Sync + 'static {
    fn handle(&self, op: IncomingOp, payload: Payload, raw: &serde_json::Value);
}

/// Adapter so plain closures can be used as handlers.
pub(crate) struct FnHandler<F>(pub(crate) F);

impl<F> EventHandler for FnHandler<F>
where
    F: Fn(IncomingOp, Payload, &serde_json::Value) + Send + Sync + 'static,
{
    fn handle(&self, op: IncomingOp, payload: Payload, raw: &serde_json::Value) {
        (self.0)(op, payload, raw)
    }
}

/// Errors surfaced by a single node.
#[derive(thiserror::Error, Debug)]
pub enum NodeError {
    #[error("config: {0}")]
    Config(String),
    #[error("invalid {0} header value")]
    InvalidHeader(&'static str),
    #[error("timed out after {0:?} connecting to node")]
    ConnectTimeout(Duration),
    #[error("node rejected connection: {0}")]
    Rejected(String),
    #[error("node is shutting down")]
    ShuttingDown,
}

/// Errors surfaced by the pool.
#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    #[error("no nodes available")]
    NoNodesAvailable,
    #[error("voice session: {0}")]
    Voice(#[from] anyhow::Error),
    #[error("gateway dispatch: {0}")]
    Dispatch(#[from] lp_protocol::DecodeError),
    #[error(transparent)]
    Node(#[from] NodeError),
}
