//! Chat-gateway voice dispatches.
//!
//! A node can only join a voice channel once it has both halves of the
//! voice handshake: the client's own `VOICE_STATE_UPDATE` (for the session
//! ID) and the guild's `VOICE_SERVER_UPDATE` (forwarded as the opaque
//! `event`).  These arrive on the chat gateway, not the node socket.

use lp_domain::{ChannelId, GuildId, UserId};
use serde::Deserialize;
use serde_json::Value;

use crate::incoming::DecodeError;

const VOICE_STATE_UPDATE: &str = "VOICE_STATE_UPDATE";
const VOICE_SERVER_UPDATE: &str = "VOICE_SERVER_UPDATE";

#[derive(Debug, Clone, PartialEq)]
pub enum VoiceDispatch {
    /// Voice endpoint and token for a guild, forwarded to the node as is.
    ServerUpdate { guild_id: GuildId, event: Value },
    /// A member's voice state.  `channel_id` is `None` when they left voice.
    StateUpdate {
        guild_id: GuildId,
        user_id: UserId,
        channel_id: Option<ChannelId>,
        session_id: String,
    },
}

#[derive(Deserialize)]
struct RawServerUpdate {
    guild_id: GuildId,
}

#[derive(Deserialize)]
struct RawStateUpdate {
    guild_id: GuildId,
    user_id: UserId,
    #[serde(default)]
    channel_id: Option<ChannelId>,
    session_id: String,
}

impl VoiceDispatch {
    /// Pick the voice dispatches out of a gateway frame
    /// (`{"t": "<name>", "d": {...}}`).  Any other dispatch is `Ok(None)`.
    pub fn from_gateway(frame: &Value) -> Result<Option<Self>, DecodeError> {
        let Some(kind) = frame.get("t").and_then(Value::as_str) else {
            return Ok(None);
        };
        let data = frame.get("d").unwrap_or(&Value::Null);

        match kind {
            VOICE_SERVER_UPDATE => {
                let raw = RawServerUpdate::deserialize(data).map_err(|source| {
                    DecodeError::Dispatch { kind: VOICE_SERVER_UPDATE, source }
                })?;
                Ok(Some(Self::ServerUpdate {
                    guild_id: raw.guild_id,
                    event: data.clone(),
                }))
            }
            VOICE_STATE_UPDATE => {
                let raw = RawStateUpdate::deserialize(data).map_err(|source| {
                    DecodeError::Dispatch { kind: VOICE_STATE_UPDATE, source }
                })?;
                Ok(Some(Self::StateUpdate {
                    guild_id: raw.guild_id,
                    user_id: raw.user_id,
                    channel_id: raw.channel_id,
                    session_id: raw.session_id,
                }))
            }
            _ => Ok(None),
        }
    }

    pub fn guild_id(&self) -> GuildId {
        match self {
            Self::ServerUpdate { guild_id, .. } | Self::StateUpdate { guild_id, .. } => *guild_id,
        }
    }
}
