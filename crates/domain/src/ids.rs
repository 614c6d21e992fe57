//! Discord-style snowflake identifiers.
//!
//! The wire protocol carries guild IDs as decimal strings, so the newtypes
//! serialize as strings and accept either a string or a number on input.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

macro_rules! snowflake {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl $name {
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse().map(Self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                match RawId::deserialize(deserializer)? {
                    RawId::Num(n) => Ok(Self(n)),
                    RawId::Str(s) => s.parse().map_err(serde::de::Error::custom),
                }
            }
        }
    };
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Num(u64),
    Str(String),
}

snowflake! {
    /// A guild: the session group a pool pins to exactly one node.
    GuildId
}

snowflake! {
    /// A voice channel inside a guild.
    ChannelId
}

snowflake! {
    /// A chat account; the client's own ID filters voice state updates.
    UserId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guild_id_serializes_as_string() {
        let json = serde_json::to_string(&GuildId(42)).unwrap();
        assert_eq!(json, "\"42\"");
    }

    #[test]
    fn guild_id_accepts_string_or_number() {
        let a: GuildId = serde_json::from_str("\"1234\"").unwrap();
        let b: GuildId = serde_json::from_str("1234").unwrap();
        assert_eq!(a, b);
        assert!(serde_json::from_str::<GuildId>("\"abc\"").is_err());
    }

    #[test]
    fn channel_id_parses_from_str() {
        let c: ChannelId = "987654321".parse().unwrap();
        assert_eq!(c.get(), 987_654_321);
        assert_eq!(c.to_string(), "987654321");
    }
}
