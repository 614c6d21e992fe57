//! Registry of nodes and the sticky guild → node assignment.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use lp_domain::config::PoolConfig;
use lp_protocol::GuildId;
use parking_lot::RwLock;

use crate::builder::NodeBuilder;
use crate::node::Node;
use crate::reconnect::ReconnectBackoff;
use crate::shutdown::Shutdown;
use crate::types::{EventHandler, NodeError, PoolError};

/// Thread-safe pool of nodes.
///
/// A guild is assigned to the least-loaded node the first time it is asked
/// for and stays there for the pool's lifetime.  Guilds of a removed node
/// are not moved elsewhere.
#[derive(Clone, Default)]
pub struct NodePool {
    shared: Arc<PoolShared>,
}

/// Non-owning handle to a [`NodePool`], for handlers the pool's own nodes
/// hold on to.
#[derive(Clone, Default)]
pub struct WeakNodePool {
    shared: Weak<PoolShared>,
}

impl WeakNodePool {
    pub fn upgrade(&self) -> Option<NodePool> {
        self.shared.upgrade().map(|shared| NodePool { shared })
    }
}

#[derive(Default)]
pub(crate) struct PoolShared {
    /// Registration order; ties in load go to the earliest entry.
    entries: RwLock<Vec<PoolEntry>>,
    shutdown: Shutdown,
}

struct PoolEntry {
    node: Node,
    guilds: HashSet<GuildId>,
}

impl PoolShared {
    pub(crate) fn remove(&self, node: &Node) -> bool {
        let mut entries = self.entries.write();
        let Some(idx) = entries.iter().position(|e| &e.node == node) else {
            return false;
        };
        let entry = entries.remove(idx);
        tracing::info!(
            node = %node.name(),
            guilds = entry.guilds.len(),
            remaining = entries.len(),
            "node removed"
        );
        true
    }
}

impl NodePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one node per config entry, all reporting to `handler`.
    /// The config is validated first.
    pub fn from_config(
        config: &PoolConfig,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Self, NodeError> {
        let pool = Self::new();
        pool.add_configured(config, handler)?;
        Ok(pool)
    }

    /// Validate `config`, then add one node per entry to this pool.
    pub fn add_configured(
        &self,
        config: &PoolConfig,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Vec<Node>, NodeError> {
        config
            .validate()
            .map_err(|e| NodeError::Config(e.to_string()))?;
        let backoff = ReconnectBackoff::from(&config.reconnect);
        config
            .nodes
            .iter()
            .map(|node_config| {
                self.add(
                    NodeBuilder::from_config(node_config)
                        .reconnect_backoff(backoff.clone())
                        .handler(handler.clone()),
                )
            })
            .collect()
    }

    pub fn downgrade(&self) -> WeakNodePool {
        WeakNodePool {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Build a node wired to this pool's shutdown signal and register it.
    pub fn add(&self, builder: NodeBuilder) -> Result<Node, NodeError> {
        let node = builder.shutdown(self.shared.shutdown.child()).build()?;
        self.register(node.clone());
        Ok(node)
    }

    /// Add a node with an empty assignment set.  Registering the same node
    /// twice is a no-op.
    pub fn register(&self, node: Node) {
        *node.inner.pool.lock() = Arc::downgrade(&self.shared);

        let mut entries = self.shared.entries.write();
        if entries.iter().any(|e| e.node == node) {
            return;
        }
        tracing::info!(node = %node.name(), url = %node.url(), "node registered");
        entries.push(PoolEntry {
            node,
            guilds: HashSet::new(),
        });
    }

    /// Return the node `guild_id` is pinned to, assigning it to the node
    /// with the fewest guilds if it has none yet.
    pub fn assign_or_get(&self, guild_id: GuildId) -> Result<Node, PoolError> {
        let mut entries = self.shared.entries.write();

        if let Some(entry) = entries.iter().find(|e| e.guilds.contains(&guild_id)) {
            return Ok(entry.node.clone());
        }

        // `min_by_key` keeps the first of equal minima.
        let entry = entries
            .iter_mut()
            .min_by_key(|e| e.guilds.len())
            .ok_or(PoolError::NoNodesAvailable)?;
        entry.guilds.insert(guild_id);
        tracing::debug!(
            guild = %guild_id,
            node = %entry.node.name(),
            load = entry.guilds.len(),
            "guild assigned"
        );
        Ok(entry.node.clone())
    }

    /// The node `guild_id` is pinned to, without assigning.
    pub fn node_for(&self, guild_id: GuildId) -> Option<Node> {
        self.shared
            .entries
            .read()
            .iter()
            .find(|e| e.guilds.contains(&guild_id))
            .map(|e| e.node.clone())
    }

    /// Guilds pinned to `node`, sorted.  Empty for unknown nodes.
    pub fn assigned(&self, node: &Node) -> Vec<GuildId> {
        let entries = self.shared.entries.read();
        let mut guilds: Vec<GuildId> = entries
            .iter()
            .find(|e| &e.node == node)
            .map(|e| e.guilds.iter().copied().collect())
            .unwrap_or_default();
        guilds.sort();
        guilds
    }

    /// Remove `node` and its assignments.  Other nodes are untouched.
    pub fn remove(&self, node: &Node) -> bool {
        self.shared.remove(node)
    }

    /// Registered nodes in registration order.
    pub fn nodes(&self) -> Vec<Node> {
        self.shared
            .entries
            .read()
            .iter()
            .map(|e| e.node.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.shared.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.entries.read().is_empty()
    }

    /// Connect every node concurrently.
    pub async fn connect_all(&self, timeout: Option<Duration>) -> Vec<(Node, Result<(), NodeError>)> {
        let nodes = self.nodes();
        let futs = nodes.iter().map(|n| n.connect(timeout));
        let results = futures_util::future::join_all(futs).await;
        nodes.into_iter().zip(results).collect()
    }

    /// Disconnect every node, then fire the pool-wide shutdown signal.
    ///
    /// Iterates a snapshot, since each disconnect removes its node from the
    /// registry.
    pub async fn shutdown_all(&self) {
        for node in self.nodes() {
            node.disconnect().await;
        }
        self.shared.shutdown.signal();
        tracing::info!("node pool shut down");
    }
}
