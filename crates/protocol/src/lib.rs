//! Node control protocol: JSON frames exchanged with an audio node over
//! WebSocket.
//!
//! Outgoing frames are player commands ([`Command`]), serialized as flat
//! objects keyed by `op`.  Incoming frames are classified by their `op`
//! field into one of three [`IncomingOp`]s and decoded into a typed
//! [`Payload`].  Anything else is reported as unknown and left to the
//! caller to drop.
//!
//! [`VoiceDispatch`] reads the two chat-gateway voice events a node needs
//! before it can join a voice channel.

mod gateway;
mod incoming;
mod outgoing;

pub use gateway::VoiceDispatch;
pub use incoming::{
    decode, parse_frame, CpuInfo, DecodeError, EventType, FrameStats, IncomingOp, MemoryInfo,
    Payload, PlayerState, PlayerUpdate, Stats, TrackEndReason, TrackEvent,
};
pub use lp_domain::{ChannelId, GuildId, UserId};
pub use outgoing::Command;
