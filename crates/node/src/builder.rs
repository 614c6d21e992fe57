//! Builder pattern for constructing a [`Node`].

use std::sync::Arc;

use lp_domain::config::NodeConfig;
use lp_protocol::{IncomingOp, Payload};
use tokio_tungstenite::tungstenite::http::HeaderValue;

use crate::node::{ConnectHeaders, Node};
use crate::reconnect::ReconnectBackoff;
use crate::shutdown::Shutdown;
use crate::types::{EventHandler, FnHandler, NodeError};

/// Fluent builder for [`Node`].
///
/// # Example
///
/// ```rust,no_run
/// # use lp_node::NodeBuilder;
/// let node = NodeBuilder::new()
///     .host("127.0.0.1")
///     .port(2333)
///     .password("youshallnotpass")
///     .user_id(1234)
///     .num_shards(1)
///     .on_event(|op, payload, _raw| println!("{op}: {payload:?}"))
///     .build()
///     .unwrap();
/// ```
pub struct NodeBuilder {
    pub(crate) name: Option<String>,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) password: String,
    pub(crate) user_id: u64,
    pub(crate) num_shards: u32,
    pub(crate) backoff: ReconnectBackoff,
    pub(crate) handler: Option<Arc<dyn EventHandler>>,
    pub(crate) shutdown: Option<Shutdown>,
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self {
            name: None,
            host: "localhost".into(),
            port: 2333,
            password: "youshallnotpass".into(),
            user_id: 0,
            num_shards: 1,
            backoff: ReconnectBackoff::default(),
            handler: None,
            shutdown: None,
        }
    }

    /// Start from a config entry.  The event handler still has to be set.
    pub fn from_config(cfg: &NodeConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            host: cfg.host.clone(),
            port: cfg.port,
            password: cfg.password.clone(),
            user_id: cfg.user_id,
            num_shards: cfg.num_shards,
            ..Self::new()
        }
    }

    // ── Endpoint / identity ──────────────────────────────────────────

    /// Display name used in logs (default `host:port`).
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Shared secret, sent as the `Authorization` header.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    /// Client identity, sent as the `User-Id` header.
    pub fn user_id(mut self, user_id: u64) -> Self {
        self.user_id = user_id;
        self
    }

    /// Shard count, sent as the `Num-Shards` header.
    pub fn num_shards(mut self, num_shards: u32) -> Self {
        self.num_shards = num_shards;
        self
    }

    // ── Behavior ─────────────────────────────────────────────────────

    /// Override the reconnect backoff policy.
    pub fn reconnect_backoff(mut self, backoff: ReconnectBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the handler that receives every decoded frame.
    pub fn handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Closure form of [`handler`](Self::handler).
    pub fn on_event<F>(self, f: F) -> Self
    where
        F: Fn(IncomingOp, Payload, &serde_json::Value) + Send + Sync + 'static,
    {
        self.handler(Arc::new(FnHandler(f)))
    }

    /// Watch an externally owned shutdown signal instead of a private one.
    pub fn shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Build the [`Node`].  The node starts `Disconnected`.
    pub fn build(self) -> Result<Node, NodeError> {
        if self.host.trim().is_empty() {
            return Err(NodeError::Config("host is required".into()));
        }
        if self.num_shards == 0 {
            return Err(NodeError::Config("num_shards must be at least 1".into()));
        }
        self.backoff
            .validate()
            .map_err(|e| NodeError::Config(format!("reconnect backoff: {e}")))?;
        let handler = self
            .handler
            .ok_or_else(|| NodeError::Config("an event handler is required".into()))?;

        let headers = ConnectHeaders {
            authorization: HeaderValue::from_str(&self.password)
                .map_err(|_| NodeError::InvalidHeader("Authorization"))?,
            user_id: HeaderValue::from(self.user_id),
            num_shards: HeaderValue::from(self.num_shards),
        };
        let name = self
            .name
            .unwrap_or_else(|| format!("{}:{}", self.host, self.port));

        Ok(Node::new(
            name,
            format!("ws://{}:{}", self.host, self.port),
            headers,
            self.backoff,
            handler,
            self.shutdown.unwrap_or_default(),
        ))
    }
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConnectionState;

    fn noop(_: IncomingOp, _: Payload, _: &serde_json::Value) {}

    #[test]
    fn defaults_name_to_host_and_port() {
        let node = NodeBuilder::new()
            .host("lava.local")
            .port(80)
            .on_event(noop)
            .build()
            .unwrap();
        assert_eq!(node.name(), "lava.local:80");
        assert_eq!(node.url(), "ws://lava.local:80");
        assert_eq!(node.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn handler_is_required() {
        let err = NodeBuilder::new().build().unwrap_err();
        assert!(matches!(err, NodeError::Config(_)));
    }

    #[test]
    fn rejects_zero_shards_and_empty_host() {
        assert!(NodeBuilder::new().num_shards(0).on_event(noop).build().is_err());
        assert!(NodeBuilder::new().host("  ").on_event(noop).build().is_err());
    }

    #[test]
    fn rejects_unusable_backoff() {
        let err = NodeBuilder::new()
            .reconnect_backoff(ReconnectBackoff {
                backoff_factor: -2.0,
                ..ReconnectBackoff::default()
            })
            .on_event(noop)
            .build()
            .unwrap_err();
        assert!(matches!(err, NodeError::Config(msg) if msg.contains("backoff_factor")));
    }

    #[test]
    fn rejects_password_that_cannot_be_a_header() {
        let err = NodeBuilder::new()
            .password("line\nbreak")
            .on_event(noop)
            .build()
            .unwrap_err();
        assert!(matches!(err, NodeError::InvalidHeader("Authorization")));
    }

    #[test]
    fn from_config_copies_identity() {
        let cfg = NodeConfig {
            name: Some("eu-1".into()),
            host: "10.0.0.5".into(),
            port: 2444,
            password: "pw".into(),
            user_id: 77,
            num_shards: 3,
        };
        let node = NodeBuilder::from_config(&cfg).on_event(noop).build().unwrap();
        assert_eq!(node.name(), "eu-1");
        assert_eq!(node.url(), "ws://10.0.0.5:2444");
    }
}
