//! Node → client frames: classification and decoding.

use std::fmt;

use lp_domain::GuildId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The three `op` values a node pushes to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IncomingOp {
    /// Track lifecycle event (see [`EventType`]).
    Event,
    /// Periodic playback position of one player.
    PlayerUpdate,
    /// Periodic node resource report.
    Stats,
}

impl IncomingOp {
    pub fn from_wire(op: &str) -> Option<Self> {
        match op {
            "event" => Some(Self::Event),
            "playerUpdate" => Some(Self::PlayerUpdate),
            "stats" => Some(Self::Stats),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::PlayerUpdate => "playerUpdate",
            Self::Stats => "stats",
        }
    }

    /// Read the `op` field of a frame.  `None` for a missing or unknown op.
    pub fn classify(frame: &Value) -> Option<Self> {
        frame.get("op").and_then(Value::as_str).and_then(Self::from_wire)
    }
}

impl fmt::Display for IncomingOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Track event names carried in the `type` field of an `event` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    TrackEnd,
    TrackException,
    TrackStuck,
}

impl EventType {
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "TrackEndEvent" => Some(Self::TrackEnd),
            "TrackExceptionEvent" => Some(Self::TrackException),
            "TrackStuckEvent" => Some(Self::TrackStuck),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TrackEnd => "TrackEndEvent",
            Self::TrackException => "TrackExceptionEvent",
            Self::TrackStuck => "TrackStuckEvent",
        }
    }
}

/// Why playback of a track ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

impl TrackEndReason {
    pub fn from_wire(reason: &str) -> Option<Self> {
        match reason {
            "FINISHED" => Some(Self::Finished),
            "LOAD_FAILED" => Some(Self::LoadFailed),
            "STOPPED" => Some(Self::Stopped),
            "REPLACED" => Some(Self::Replaced),
            "CLEANUP" => Some(Self::Cleanup),
            _ => None,
        }
    }

    /// Whether the next queued track may start (only after a natural finish).
    pub fn may_start_next(self) -> bool {
        matches!(self, Self::Finished)
    }
}

/// A decoded `event` frame.
///
/// Only the event type is required on the wire; everything else is
/// best-effort and `None` when absent.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackEvent {
    End {
        guild_id: Option<GuildId>,
        track: Option<String>,
        reason: Option<TrackEndReason>,
    },
    Exception {
        guild_id: Option<GuildId>,
        track: Option<String>,
        error: Option<String>,
    },
    Stuck {
        guild_id: Option<GuildId>,
        track: Option<String>,
        threshold_ms: Option<u64>,
    },
}

impl TrackEvent {
    pub fn kind(&self) -> EventType {
        match self {
            Self::End { .. } => EventType::TrackEnd,
            Self::Exception { .. } => EventType::TrackException,
            Self::Stuck { .. } => EventType::TrackStuck,
        }
    }

    pub fn guild_id(&self) -> Option<GuildId> {
        match self {
            Self::End { guild_id, .. }
            | Self::Exception { guild_id, .. }
            | Self::Stuck { guild_id, .. } => *guild_id,
        }
    }
}

#[derive(Deserialize)]
struct EventTag {
    #[serde(rename = "type")]
    kind: String,
}

/// Wire shape of an `event` frame of a known type.
#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "guildId", default)]
    guild_id: Option<GuildId>,
    #[serde(default)]
    track: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(rename = "thresholdMs", default)]
    threshold_ms: Option<u64>,
}

/// Playback position snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerState {
    /// Position in the current track, in milliseconds.
    pub position: i64,
    /// Node wall-clock time the position was sampled at (epoch ms).
    pub time: i64,
}

/// A decoded `playerUpdate` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerUpdate {
    #[serde(rename = "guildId", default, skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<GuildId>,
    pub state: PlayerState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub reservable: u64,
    pub used: u64,
    pub free: u64,
    pub allocated: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuInfo {
    pub cores: u32,
    pub system_load: f64,
    pub lavalink_load: f64,
}

/// Audio frame counters for the last minute (not sent by every node).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameStats {
    pub sent: i64,
    pub nulled: i64,
    pub deficit: i64,
}

/// A decoded `stats` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub memory: MemoryInfo,
    pub players: u32,
    pub playing_players: u32,
    pub cpu: CpuInfo,
    /// Node uptime in milliseconds.
    pub uptime: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_stats: Option<FrameStats>,
}

/// A fully decoded incoming frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Event(TrackEvent),
    PlayerUpdate(PlayerUpdate),
    Stats(Stats),
}

impl Payload {
    pub fn op(&self) -> IncomingOp {
        match self {
            Self::Event(_) => IncomingOp::Event,
            Self::PlayerUpdate(_) => IncomingOp::PlayerUpdate,
            Self::Stats(_) => IncomingOp::Stats,
        }
    }

    /// The guild the frame concerns; `None` for node-wide stats.
    pub fn guild_id(&self) -> Option<GuildId> {
        match self {
            Self::Event(event) => event.guild_id(),
            Self::PlayerUpdate(update) => update.guild_id,
            Self::Stats(_) => None,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[source] serde_json::Error),

    #[error("malformed {op} frame: {source}")]
    Malformed {
        op: IncomingOp,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed {kind} dispatch: {source}")]
    Dispatch {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Parse raw socket text into a JSON frame.
pub fn parse_frame(text: &str) -> Result<Value, DecodeError> {
    serde_json::from_str(text).map_err(DecodeError::Json)
}

/// Decode a classified frame into its typed payload.
///
/// Returns `Ok(None)` for an `event` frame whose `type` is not a known
/// [`EventType`].  A missing or mistyped required field is an error.
pub fn decode(op: IncomingOp, frame: &Value) -> Result<Option<Payload>, DecodeError> {
    let malformed = |source| DecodeError::Malformed { op, source };

    match op {
        IncomingOp::Event => {
            // Extras are only typed once the event type is known.
            let tag = EventTag::deserialize(frame).map_err(malformed)?;
            let Some(kind) = EventType::from_wire(&tag.kind) else {
                return Ok(None);
            };
            let raw = RawEvent::deserialize(frame).map_err(malformed)?;
            let event = match kind {
                EventType::TrackEnd => TrackEvent::End {
                    guild_id: raw.guild_id,
                    track: raw.track,
                    reason: raw.reason.as_deref().and_then(TrackEndReason::from_wire),
                },
                EventType::TrackException => TrackEvent::Exception {
                    guild_id: raw.guild_id,
                    track: raw.track,
                    error: raw.error.map(|e| match e {
                        Value::String(s) => s,
                        other => other.to_string(),
                    }),
                },
                EventType::TrackStuck => TrackEvent::Stuck {
                    guild_id: raw.guild_id,
                    track: raw.track,
                    threshold_ms: raw.threshold_ms,
                },
            };
            Ok(Some(Payload::Event(event)))
        }
        IncomingOp::PlayerUpdate => PlayerUpdate::deserialize(frame)
            .map(|u| Some(Payload::PlayerUpdate(u)))
            .map_err(malformed),
        IncomingOp::Stats => Stats::deserialize(frame)
            .map(|s| Some(Payload::Stats(s)))
            .map_err(malformed),
    }
}
