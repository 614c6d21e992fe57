//! Voice join orchestration.
//!
//! Moving the client into a voice channel happens over the chat gateway,
//! not the node socket, so it is delegated to a [`VoiceSession`] supplied
//! by the application.  This module pins the guild to a node first so
//! the voice update that follows lands on the right one, and
//! [`VoiceStateTracker`] assembles that update from the gateway's replies.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use lp_protocol::{ChannelId, GuildId, UserId, VoiceDispatch};
use parking_lot::Mutex;
use serde_json::Value;

use crate::node::Node;
use crate::pool::NodePool;
use crate::types::PoolError;

/// Gateway-side handle able to move the client in and out of voice.
#[async_trait]
pub trait VoiceSession: Send + Sync {
    /// Ask to join `channel`, or to leave voice when `channel` is `None`.
    async fn request_join(&self, guild_id: GuildId, channel: Option<ChannelId>)
        -> anyhow::Result<()>;
}

/// Resolves the voice session responsible for a guild (e.g. its shard).
pub trait VoiceSessions: Send + Sync {
    fn session_for(&self, guild_id: GuildId) -> Arc<dyn VoiceSession>;
}

impl<F> VoiceSessions for F
where
    F: Fn(GuildId) -> Arc<dyn VoiceSession> + Send + Sync,
{
    fn session_for(&self, guild_id: GuildId) -> Arc<dyn VoiceSession> {
        self(guild_id)
    }
}

/// Pin `guild_id` to a node, then ask the gateway to join `channel`.
pub async fn join_voice(
    pool: &NodePool,
    sessions: &dyn VoiceSessions,
    guild_id: GuildId,
    channel: ChannelId,
) -> Result<Node, PoolError> {
    let node = pool.assign_or_get(guild_id)?;
    tracing::debug!(guild = %guild_id, channel = %channel, node = %node.name(), "requesting voice join");
    sessions
        .session_for(guild_id)
        .request_join(guild_id, Some(channel))
        .await?;
    Ok(node)
}

/// Ask the gateway to leave voice in `guild_id`.  The guild keeps its node.
pub async fn leave_voice(sessions: &dyn VoiceSessions, guild_id: GuildId) -> Result<(), PoolError> {
    tracing::debug!(guild = %guild_id, "requesting voice leave");
    sessions.session_for(guild_id).request_join(guild_id, None).await?;
    Ok(())
}

/// What a gateway voice dispatch did to a guild's voice state.
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceProgress {
    /// Not about this client.
    Ignored,
    /// One half of the handshake is still missing.
    Pending,
    /// Both halves are known; hand them to the guild's node.
    Ready {
        guild_id: GuildId,
        session_id: String,
        event: Value,
    },
    /// The client left voice in this guild; its state was cleared.
    Left { guild_id: GuildId },
}

#[derive(Default)]
struct GuildVoice {
    channel: Option<ChannelId>,
    session_id: Option<String>,
    event: Option<Value>,
}

/// Pairs the client's own `VOICE_STATE_UPDATE` with the guild's
/// `VOICE_SERVER_UPDATE`.
///
/// Either half may arrive first and either may be refreshed later (a
/// channel move or voice server change); every update that leaves both
/// halves present yields [`VoiceProgress::Ready`] again.
pub struct VoiceStateTracker {
    user_id: UserId,
    guilds: Mutex<HashMap<GuildId, GuildVoice>>,
}

impl VoiceStateTracker {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            guilds: Mutex::new(HashMap::new()),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// The voice channel the client was last seen joining in `guild_id`.
    pub fn channel(&self, guild_id: GuildId) -> Option<ChannelId> {
        self.guilds.lock().get(&guild_id).and_then(|g| g.channel)
    }

    pub fn apply(&self, dispatch: VoiceDispatch) -> VoiceProgress {
        let mut guilds = self.guilds.lock();
        let guild_id = dispatch.guild_id();

        match dispatch {
            VoiceDispatch::StateUpdate { user_id, .. } if user_id != self.user_id => {
                return VoiceProgress::Ignored;
            }
            VoiceDispatch::StateUpdate { channel_id: None, .. } => {
                guilds.remove(&guild_id);
                return VoiceProgress::Left { guild_id };
            }
            VoiceDispatch::StateUpdate {
                channel_id,
                session_id,
                ..
            } => {
                let state = guilds.entry(guild_id).or_default();
                state.channel = channel_id;
                state.session_id = Some(session_id);
            }
            VoiceDispatch::ServerUpdate { event, .. } => {
                guilds.entry(guild_id).or_default().event = Some(event);
            }
        }

        match guilds.get(&guild_id) {
            Some(GuildVoice {
                session_id: Some(session_id),
                event: Some(event),
                ..
            }) => VoiceProgress::Ready {
                guild_id,
                session_id: session_id.clone(),
                event: event.clone(),
            },
            _ => VoiceProgress::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NodeBuilder;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingSession {
        calls: Mutex<Vec<(GuildId, Option<ChannelId>)>>,
    }

    #[async_trait]
    impl VoiceSession for RecordingSession {
        async fn request_join(
            &self,
            guild_id: GuildId,
            channel: Option<ChannelId>,
        ) -> anyhow::Result<()> {
            self.calls.lock().push((guild_id, channel));
            Ok(())
        }
    }

    struct FailingSession;

    #[async_trait]
    impl VoiceSession for FailingSession {
        async fn request_join(&self, _: GuildId, _: Option<ChannelId>) -> anyhow::Result<()> {
            anyhow::bail!("shard offline")
        }
    }

    fn pool_with_one_node() -> (NodePool, Node) {
        let pool = NodePool::new();
        let node = pool
            .add(NodeBuilder::new().host("127.0.0.1").on_event(|_, _, _| {}))
            .unwrap();
        (pool, node)
    }

    #[tokio::test]
    async fn join_assigns_then_delegates() {
        let (pool, node) = pool_with_one_node();
        let session = Arc::new(RecordingSession::default());
        let shared = session.clone();
        let sessions = move |_: GuildId| -> Arc<dyn VoiceSession> { shared.clone() };

        let joined = join_voice(&pool, &sessions, GuildId(5), ChannelId(50)).await.unwrap();
        assert_eq!(joined, node);
        assert_eq!(pool.assigned(&node), vec![GuildId(5)]);
        assert_eq!(*session.calls.lock(), vec![(GuildId(5), Some(ChannelId(50)))]);

        leave_voice(&sessions, GuildId(5)).await.unwrap();
        assert_eq!(session.calls.lock().last(), Some(&(GuildId(5), None)));
        assert_eq!(pool.node_for(GuildId(5)), Some(node));
    }

    #[tokio::test]
    async fn join_on_empty_pool_fails_before_gateway() {
        let pool = NodePool::new();
        let session = Arc::new(RecordingSession::default());
        let shared = session.clone();
        let sessions = move |_: GuildId| -> Arc<dyn VoiceSession> { shared.clone() };

        let err = join_voice(&pool, &sessions, GuildId(1), ChannelId(2)).await.unwrap_err();
        assert!(matches!(err, PoolError::NoNodesAvailable));
        assert!(session.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn gateway_failure_is_surfaced() {
        let (pool, _node) = pool_with_one_node();
        let sessions = |_: GuildId| -> Arc<dyn VoiceSession> { Arc::new(FailingSession) };
        let err = join_voice(&pool, &sessions, GuildId(1), ChannelId(2)).await.unwrap_err();
        assert!(matches!(err, PoolError::Voice(_)));
        assert!(err.to_string().contains("shard offline"));
    }

    fn own_state(guild: u64, channel: Option<u64>, session: &str) -> VoiceDispatch {
        VoiceDispatch::StateUpdate {
            guild_id: GuildId(guild),
            user_id: UserId(7),
            channel_id: channel.map(ChannelId),
            session_id: session.into(),
        }
    }

    fn server(guild: u64, token: &str) -> VoiceDispatch {
        VoiceDispatch::ServerUpdate {
            guild_id: GuildId(guild),
            event: json!({"guild_id": guild.to_string(), "token": token}),
        }
    }

    #[test]
    fn ready_once_both_halves_arrive_in_either_order() {
        let tracker = VoiceStateTracker::new(UserId(7));
        assert_eq!(tracker.apply(own_state(1, Some(10), "s1")), VoiceProgress::Pending);
        assert_eq!(
            tracker.apply(server(1, "t1")),
            VoiceProgress::Ready {
                guild_id: GuildId(1),
                session_id: "s1".into(),
                event: json!({"guild_id": "1", "token": "t1"}),
            }
        );
        assert_eq!(tracker.channel(GuildId(1)), Some(ChannelId(10)));

        assert_eq!(tracker.apply(server(2, "t2")), VoiceProgress::Pending);
        assert!(matches!(
            tracker.apply(own_state(2, Some(20), "s2")),
            VoiceProgress::Ready { guild_id: GuildId(2), .. }
        ));
    }

    #[test]
    fn other_members_are_ignored() {
        let tracker = VoiceStateTracker::new(UserId(7));
        let other = VoiceDispatch::StateUpdate {
            guild_id: GuildId(1),
            user_id: UserId(8),
            channel_id: Some(ChannelId(10)),
            session_id: "theirs".into(),
        };
        assert_eq!(tracker.apply(other), VoiceProgress::Ignored);
        assert_eq!(tracker.apply(server(1, "t")), VoiceProgress::Pending);
    }

    #[test]
    fn leaving_clears_state() {
        let tracker = VoiceStateTracker::new(UserId(7));
        tracker.apply(own_state(1, Some(10), "s1"));
        tracker.apply(server(1, "t1"));

        assert_eq!(
            tracker.apply(own_state(1, None, "s1")),
            VoiceProgress::Left { guild_id: GuildId(1) }
        );
        assert_eq!(tracker.channel(GuildId(1)), None);
        // A fresh server update alone is not enough after a leave.
        assert_eq!(tracker.apply(server(1, "t2")), VoiceProgress::Pending);
    }

    #[test]
    fn refreshed_half_is_resent() {
        let tracker = VoiceStateTracker::new(UserId(7));
        tracker.apply(own_state(1, Some(10), "s1"));
        tracker.apply(server(1, "t1"));

        let VoiceProgress::Ready { event, .. } = tracker.apply(server(1, "t2")) else {
            panic!("expected ready");
        };
        assert_eq!(event["token"], "t2");

        let VoiceProgress::Ready { session_id, .. } = tracker.apply(own_state(1, Some(11), "s2"))
        else {
            panic!("expected ready");
        };
        assert_eq!(session_id, "s2");
        assert_eq!(tracker.channel(GuildId(1)), Some(ChannelId(11)));
    }
}
