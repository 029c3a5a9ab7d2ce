use serde::{Deserialize, Serialize};

use crate::guild::Member;
use crate::ids::{ChannelId, GuildId, MessageId, UserId};
use crate::permission::Permissions;

/// channel types, by wire discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum ChannelKind {
    Text,
    Dm,
    Voice,
    GroupDm,
    Category,
    Announcement,
    AnnouncementThread,
    PublicThread,
    PrivateThread,
    Stage,
    Forum,
    Unknown(u8),
}

impl From<u8> for ChannelKind {
    fn from(value: u8) -> Self {
        match value {
            0 => ChannelKind::Text,
            1 => ChannelKind::Dm,
            2 => ChannelKind::Voice,
            3 => ChannelKind::GroupDm,
            4 => ChannelKind::Category,
            5 => ChannelKind::Announcement,
            10 => ChannelKind::AnnouncementThread,
            11 => ChannelKind::PublicThread,
            12 => ChannelKind::PrivateThread,
            13 => ChannelKind::Stage,
            15 => ChannelKind::Forum,
            other => ChannelKind::Unknown(other),
        }
    }
}

impl From<ChannelKind> for u8 {
    fn from(value: ChannelKind) -> Self {
        match value {
            ChannelKind::Text => 0,
            ChannelKind::Dm => 1,
            ChannelKind::Voice => 2,
            ChannelKind::GroupDm => 3,
            ChannelKind::Category => 4,
            ChannelKind::Announcement => 5,
            ChannelKind::AnnouncementThread => 10,
            ChannelKind::PublicThread => 11,
            ChannelKind::PrivateThread => 12,
            ChannelKind::Stage => 13,
            ChannelKind::Forum => 15,
            ChannelKind::Unknown(other) => other,
        }
    }
}

impl ChannelKind {
    /// channels whose message history the archiver pulls
    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            ChannelKind::Text | ChannelKind::Voice | ChannelKind::Announcement | ChannelKind::Forum
        )
    }

    pub fn is_thread(self) -> bool {
        matches!(
            self,
            ChannelKind::AnnouncementThread | ChannelKind::PublicThread | ChannelKind::PrivateThread
        )
    }
}

/// the principal an overwrite applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum PrincipalKind {
    Role,
    Member,
    Unknown(u8),
}

impl From<u8> for PrincipalKind {
    fn from(value: u8) -> Self {
        match value {
            0 => PrincipalKind::Role,
            1 => PrincipalKind::Member,
            other => PrincipalKind::Unknown(other),
        }
    }
}

impl From<PrincipalKind> for u8 {
    fn from(value: PrincipalKind) -> Self {
        match value {
            PrincipalKind::Role => 0,
            PrincipalKind::Member => 1,
            PrincipalKind::Unknown(other) => other,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionOverwrite {
    /// role id or user id, depending on `kind`
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: PrincipalKind,
    pub allow: Permissions,
    pub deny: Permissions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadMetadata {
    pub archived: bool,
    #[serde(default)]
    pub archive_timestamp: Option<String>,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub invitable: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    #[serde(rename = "type")]
    pub kind: ChannelKind,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub nsfw: bool,
    #[serde(default)]
    pub position: Option<i64>,
    #[serde(default)]
    pub parent_id: Option<ChannelId>,
    #[serde(default)]
    pub owner_id: Option<UserId>,
    #[serde(default)]
    pub permission_overwrites: Vec<PermissionOverwrite>,
    #[serde(default)]
    pub last_message_id: Option<MessageId>,
    #[serde(default)]
    pub message_count: Option<u64>,
    #[serde(default)]
    pub thread_metadata: Option<ThreadMetadata>,
}

impl Channel {
    pub fn is_private_thread(&self) -> bool {
        self.kind == ChannelKind::PrivateThread
    }
}

/// THREAD_LIST_SYNC body; also sent when an account gains access to a
/// channel that has active threads
#[derive(Debug, Clone, Deserialize)]
pub struct ThreadListSync {
    pub guild_id: GuildId,
    #[serde(default)]
    pub channel_ids: Vec<ChannelId>,
    #[serde(default)]
    pub threads: Vec<Channel>,
}

/// one page of `threads/archived/{public|private}`
#[derive(Debug, Clone, Deserialize)]
pub struct ArchivedThreadsPage {
    #[serde(default)]
    pub threads: Vec<Channel>,
    #[serde(default)]
    pub members: Vec<Member>,
    #[serde(default)]
    pub has_more: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_roundtrip_keeps_unknown_discriminants() {
        let k: ChannelKind = serde_json::from_str("14").unwrap();
        assert_eq!(k, ChannelKind::Unknown(14));
        assert_eq!(serde_json::to_string(&k).unwrap(), "14");
    }

    #[test]
    fn text_like_classification() {
        assert!(ChannelKind::Text.is_text_like());
        assert!(ChannelKind::Voice.is_text_like());
        assert!(ChannelKind::Forum.is_text_like());
        assert!(!ChannelKind::Category.is_text_like());
        assert!(!ChannelKind::PublicThread.is_text_like());
        assert!(ChannelKind::PublicThread.is_thread());
    }
}
