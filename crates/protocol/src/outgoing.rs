//! Client → node player commands.

use lp_domain::GuildId;
use serde::{Deserialize, Serialize};

/// A command frame sent to a node.
///
/// Serializes to `{"op": "<name>", "guildId": "<id>", ...}`; the guild ID is
/// always stringified on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Command {
    /// Hand the node the voice session a guild just joined.
    #[serde(rename = "voiceUpdate")]
    VoiceUpdate {
        #[serde(rename = "guildId")]
        guild_id: GuildId,
        #[serde(rename = "sessionId")]
        session_id: String,
        /// Raw voice-server event, forwarded untouched.
        event: serde_json::Value,
    },

    #[serde(rename = "play")]
    Play {
        #[serde(rename = "guildId")]
        guild_id: GuildId,
        track: String,
    },

    #[serde(rename = "stop")]
    Stop {
        #[serde(rename = "guildId")]
        guild_id: GuildId,
    },

    #[serde(rename = "pause")]
    Pause {
        #[serde(rename = "guildId")]
        guild_id: GuildId,
        pause: bool,
    },

    #[serde(rename = "volume")]
    Volume {
        #[serde(rename = "guildId")]
        guild_id: GuildId,
        volume: i32,
    },

    /// Seek to `position` milliseconds into the current track.
    #[serde(rename = "seek")]
    Seek {
        #[serde(rename = "guildId")]
        guild_id: GuildId,
        position: i64,
    },
}

impl Command {
    pub fn voice_update(
        guild_id: GuildId,
        session_id: impl Into<String>,
        event: serde_json::Value,
    ) -> Self {
        Self::VoiceUpdate {
            guild_id,
            session_id: session_id.into(),
            event,
        }
    }

    pub fn play(guild_id: GuildId, track: impl Into<String>) -> Self {
        Self::Play {
            guild_id,
            track: track.into(),
        }
    }

    pub fn stop(guild_id: GuildId) -> Self {
        Self::Stop { guild_id }
    }

    pub fn pause(guild_id: GuildId, pause: bool) -> Self {
        Self::Pause { guild_id, pause }
    }

    pub fn volume(guild_id: GuildId, volume: i32) -> Self {
        Self::Volume { guild_id, volume }
    }

    pub fn seek(guild_id: GuildId, position: i64) -> Self {
        Self::Seek { guild_id, position }
    }

    /// The wire name of this command's `op`.
    pub fn op(&self) -> &'static str {
        match self {
            Self::VoiceUpdate { .. } => "voiceUpdate",
            Self::Play { .. } => "play",
            Self::Stop { .. } => "stop",
            Self::Pause { .. } => "pause",
            Self::Volume { .. } => "volume",
            Self::Seek { .. } => "seek",
        }
    }

    pub fn guild_id(&self) -> GuildId {
        match self {
            Self::VoiceUpdate { guild_id, .. }
            | Self::Play { guild_id, .. }
            | Self::Stop { guild_id }
            | Self::Pause { guild_id, .. }
            | Self::Volume { guild_id, .. }
            | Self::Seek { guild_id, .. } => *guild_id,
        }
    }

    /// Encode to the JSON text sent over the socket.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn wire(cmd: &Command) -> Value {
        serde_json::from_str(&cmd.encode().unwrap()).unwrap()
    }

    #[test]
    fn play_frame_shape() {
        let cmd = Command::play(GuildId(7), "abc");
        assert_eq!(
            wire(&cmd),
            json!({"op": "play", "guildId": "7", "track": "abc"})
        );
    }

    #[test]
    fn stop_frame_has_only_op_and_guild() {
        assert_eq!(
            wire(&Command::stop(GuildId(7))),
            json!({"op": "stop", "guildId": "7"})
        );
    }

    #[test]
    fn pause_volume_seek_shapes() {
        assert_eq!(
            wire(&Command::pause(GuildId(1), true)),
            json!({"op": "pause", "guildId": "1", "pause": true})
        );
        assert_eq!(
            wire(&Command::volume(GuildId(1), 80)),
            json!({"op": "volume", "guildId": "1", "volume": 80})
        );
        assert_eq!(
            wire(&Command::seek(GuildId(1), 30_000)),
            json!({"op": "seek", "guildId": "1", "position": 30000})
        );
    }

    #[test]
    fn voice_update_forwards_event_untouched() {
        let event = json!({"token": "t0k", "guild_id": "99", "endpoint": "eu.voice:443"});
        let cmd = Command::voice_update(GuildId(99), "sess-1", event.clone());
        assert_eq!(
            wire(&cmd),
            json!({"op": "voiceUpdate", "guildId": "99", "sessionId": "sess-1", "event": event})
        );
    }

    #[test]
    fn op_and_guild_accessors() {
        let cmd = Command::seek(GuildId(5), 10);
        assert_eq!(cmd.op(), "seek");
        assert_eq!(cmd.guild_id(), GuildId(5));
    }

    #[test]
    fn commands_parse_back_from_wire_text() {
        let cmd: Command =
            serde_json::from_str(r#"{"op":"volume","guildId":"12","volume":150}"#).unwrap();
        assert_eq!(cmd, Command::volume(GuildId(12), 150));
    }
}
