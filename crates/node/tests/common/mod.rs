//! In-process stand-in for an audio node: accepts WebSocket connections,
//! records handshake headers and received frames, and lets the test push
//! frames or drop the connection.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use lp_node::{ConnectionState, Node, NodeBuilder, ReconnectBackoff};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderMap, StatusCode};
use tokio_tungstenite::tungstenite::Message;

pub const WAIT: Duration = Duration::from_secs(5);

enum Push {
    Text(String),
    Close,
}

/// One accepted connection, as seen from the node side.
pub struct NodeConn {
    pub headers: HeaderMap,
    frames: mpsc::UnboundedReceiver<Value>,
    push: mpsc::UnboundedSender<Push>,
}

impl NodeConn {
    /// Next frame the client sent on this connection.
    pub async fn next_frame(&mut self) -> Value {
        tokio::time::timeout(WAIT, self.frames.recv())
            .await
            .expect("timeout waiting for frame")
            .expect("connection closed before frame")
    }

    /// Resolves once the client side of this connection is gone.
    pub async fn closed(&mut self) {
        let drained = tokio::time::timeout(WAIT, async {
            while self.frames.recv().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok(), "connection still open");
    }

    pub fn send_json(&self, frame: Value) {
        let _ = self.push.send(Push::Text(frame.to_string()));
    }

    /// Close the socket from the node side.
    pub fn close(&self) {
        let _ = self.push.send(Push::Close);
    }
}

pub struct MiniNode {
    pub addr: SocketAddr,
    conns: mpsc::UnboundedReceiver<NodeConn>,
}

impl MiniNode {
    pub async fn start() -> Self {
        Self::bind(None).await
    }

    /// A node that refuses every handshake with `status`.
    pub async fn rejecting(status: StatusCode) -> Self {
        Self::bind(Some(status)).await
    }

    async fn bind(reject: Option<StatusCode>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (conn_tx, conns) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _peer)) = listener.accept().await {
                let conn_tx = conn_tx.clone();
                tokio::spawn(serve(stream, conn_tx, reject));
            }
        });

        Self { addr, conns }
    }

    pub async fn accept(&mut self) -> NodeConn {
        tokio::time::timeout(WAIT, self.conns.recv())
            .await
            .expect("timeout waiting for client connection")
            .expect("listener stopped")
    }

    /// Assert that no client connects within `window`.
    pub async fn expect_no_connection(&mut self, window: Duration) {
        if let Ok(Some(_)) = tokio::time::timeout(window, self.conns.recv()).await {
            panic!("unexpected client connection");
        }
    }

    pub fn builder(&self) -> NodeBuilder {
        NodeBuilder::new()
            .host(self.addr.ip().to_string())
            .port(self.addr.port())
            .password("youshallnotpass")
            .user_id(1234)
            .num_shards(2)
            .reconnect_backoff(fast_backoff())
    }
}

async fn serve(
    stream: tokio::net::TcpStream,
    conn_tx: mpsc::UnboundedSender<NodeConn>,
    reject: Option<StatusCode>,
) {
    let mut headers = HeaderMap::new();
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        headers = req.headers().clone();
        match reject {
            Some(status) => {
                let mut err = ErrorResponse::new(Some("rejected".into()));
                *err.status_mut() = status;
                Err(err)
            }
            None => Ok(resp),
        }
    };
    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(_) => return,
    };
    let (mut sink, mut stream) = ws.split();

    let (frame_tx, frames) = mpsc::unbounded_channel();
    let (push, mut push_rx) = mpsc::unbounded_channel();
    let _ = conn_tx.send(NodeConn {
        headers,
        frames,
        push,
    });

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(frame) = serde_json::from_str::<Value>(&text) {
                        let _ = frame_tx.send(frame);
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            push = push_rx.recv() => match push {
                Some(Push::Text(text)) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(Push::Close) | None => {
                    let _ = sink.close().await;
                    break;
                }
            },
        }
    }
}

pub fn fast_backoff() -> ReconnectBackoff {
    ReconnectBackoff {
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
        backoff_factor: 2.0,
        jitter: 0.0,
    }
}

/// Wait until `node` reports `state`.
pub async fn wait_for_state(node: &Node, state: ConnectionState) {
    let mut rx = node.subscribe_state();
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("node never reached {state:?}, stuck in {:?}", node.state()))
        .expect("state channel closed");
}

/// A loopback port with nothing listening on it.
pub async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}
