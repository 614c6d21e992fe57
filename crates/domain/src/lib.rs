//! Shared identifiers, configuration and errors for the node pool crates.

pub mod config;
pub mod error;
pub mod ids;

pub use ids::{ChannelId, GuildId, UserId};
