use std::fmt::Display;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// milliseconds between the unix epoch and the platform epoch
pub const SNOWFLAKE_EPOCH: u64 = 1_420_070_400_000;

macro_rules! genid {
    ($name:ident) => {
        /// a snowflake id; serializes as a decimal string on the wire
        #[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Default)]
        pub struct $name(pub u64);

        impl $name {
            pub fn into_inner(self) -> u64 {
                self.0
            }

            /// millisecond unix timestamp encoded in the id's upper bits
            pub fn timestamp_millis(self) -> u64 {
                (self.0 >> 22) + SNOWFLAKE_EPOCH
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for u64 {
            fn from(val: $name) -> Self {
                val.0
            }
        }

        impl FromStr for $name {
            type Err = <u64 as FromStr>::Err;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                struct IdVisitor;

                impl Visitor<'_> for IdVisitor {
                    type Value = u64;

                    fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                        f.write_str("a snowflake as a string or integer")
                    }

                    fn visit_str<E: de::Error>(self, v: &str) -> Result<u64, E> {
                        v.parse().map_err(de::Error::custom)
                    }

                    fn visit_u64<E: de::Error>(self, v: u64) -> Result<u64, E> {
                        Ok(v)
                    }
                }

                deserializer.deserialize_any(IdVisitor).map($name)
            }
        }
    };
}

genid!(GuildId);
genid!(ChannelId);
genid!(MessageId);
genid!(UserId);
genid!(RoleId);
genid!(EmojiId);
genid!(AttachmentId);
genid!(WebhookId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_as_string() {
        let id: MessageId = serde_json::from_str("\"175928847299117063\"").unwrap();
        assert_eq!(id, MessageId(175928847299117063));
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"175928847299117063\"");
    }

    #[test]
    fn serde_accepts_integers() {
        let id: UserId = serde_json::from_str("80351110224678912").unwrap();
        assert_eq!(id.into_inner(), 80351110224678912);
    }

    #[test]
    fn timestamp_extraction() {
        // from the platform's snowflake documentation example
        let id = MessageId(175928847299117063);
        assert_eq!(id.timestamp_millis(), 1_462_015_105_796);
    }
}
