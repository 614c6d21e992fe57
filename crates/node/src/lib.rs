//! Connection and pool management for remote audio nodes.
//!
//! A "node" is a remote audio-processing server reached over WebSocket.
//! The client sends player commands and receives track events, player
//! position updates and periodic stats.  This crate keeps those
//! connections alive and routes work to them:
//!
//! ```text
//!  NodePool::assign_or_get(guild) ──► Node::send(cmd) ──┬─ Connected ──► writer task ──► socket
//!                                                       └─ otherwise ──► outbound queue
//!
//!  socket ──► receive loop ──► classify op ──► dispatch task ──► EventHandler::handle
//! ```
//!
//! # Connection flow
//!
//! 1. Connect WS with `Authorization`, `User-Id` and `Num-Shards` headers
//! 2. On transport failure: retry with jittered exponential back-off
//! 3. On connect: flush the outbound queue in submission order, start the
//!    receive loop
//! 4. On unexpected close: reconnect (unbounded retries)
//! 5. On `disconnect()` or pool shutdown: stop retrying and close
//!
//! # Players
//!
//! [`Players`] sits on top as the nodes' event handler.  It keeps one
//! [`Player`] (track queue, position, volume) per guild, starts the next
//! track when one finishes, and turns the chat gateway's voice dispatches
//! into `voiceUpdate` commands for the guild's node.

pub mod builder;
pub mod node;
pub mod player;
pub mod pool;
pub mod reconnect;
pub mod shutdown;
pub mod types;
pub mod voice;

// ── Re-exports for ergonomic imports ─────────────────────────────────

pub use builder::NodeBuilder;
pub use node::Node;
pub use player::{Player, Players, Track};
pub use pool::{NodePool, WeakNodePool};
pub use reconnect::ReconnectBackoff;
pub use shutdown::Shutdown;
pub use types::{ConnectionState, EventHandler, NodeError, PoolError};
pub use voice::{
    join_voice, leave_voice, VoiceProgress, VoiceSession, VoiceSessions, VoiceStateTracker,
};

// Re-export protocol types so callers never need to import lp-protocol directly.
pub use lp_protocol::{ChannelId, Command, GuildId, IncomingOp, Payload, UserId, VoiceDispatch};
