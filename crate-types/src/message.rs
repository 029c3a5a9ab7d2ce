use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{AttachmentId, ChannelId, EmojiId, GuildId, MessageId, UserId, WebhookId};
use crate::user::User;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    #[serde(default)]
    pub author: Option<User>,
    #[serde(default)]
    pub content: String,
    pub timestamp: String,
    #[serde(default)]
    pub edited_timestamp: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: u8,
    #[serde(default)]
    pub flags: Option<u64>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub message_reference: Option<Value>,
    #[serde(default)]
    pub embeds: Vec<Value>,
    #[serde(default)]
    pub components: Vec<Value>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    #[serde(default)]
    pub webhook_id: Option<WebhookId>,
}

impl Message {
    pub fn has_reactions(&self) -> bool {
        !self.reactions.is_empty()
    }
}

/// MESSAGE_UPDATE body; every monitored field is optional
///
/// an update without `edited_timestamp` is the platform unfurling links:
/// it only legitimately touches embeds.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageUpdate {
    pub id: MessageId,
    pub channel_id: ChannelId,
    #[serde(default)]
    pub author: Option<User>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub edited_timestamp: Option<String>,
    #[serde(default)]
    pub flags: Option<u64>,
    #[serde(default)]
    pub pinned: Option<bool>,
    #[serde(default)]
    pub embeds: Option<Vec<Value>>,
    #[serde(default)]
    pub components: Option<Vec<Value>>,
    #[serde(default)]
    pub attachments: Option<Vec<Attachment>>,
    #[serde(default)]
    pub webhook_id: Option<WebhookId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: AttachmentId,
    pub filename: String,
    #[serde(default)]
    pub size: u64,
    pub url: String,
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Emoji {
    #[serde(default)]
    pub id: Option<EmojiId>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub animated: bool,
}

impl Emoji {
    /// the path segment form used by the reactions endpoint
    pub fn api_name(&self) -> String {
        match (&self.id, &self.name) {
            (Some(id), Some(name)) => format!("{name}:{id}"),
            (None, Some(name)) => name.clone(),
            _ => String::new(),
        }
    }
}

/// normal vs "super" reactions; stored and enumerated separately
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReactionKind {
    Normal,
    Burst,
}

impl ReactionKind {
    pub fn as_int(self) -> i64 {
        match self {
            ReactionKind::Normal => 0,
            ReactionKind::Burst => 1,
        }
    }
}

/// a reaction summary attached to a fetched message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reaction {
    pub count: u64,
    #[serde(default)]
    pub count_details: Option<ReactionCountDetails>,
    pub emoji: Emoji,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionCountDetails {
    #[serde(default)]
    pub normal: u64,
    #[serde(default)]
    pub burst: u64,
}

impl Reaction {
    /// which kinds actually have placements to enumerate
    pub fn kinds(&self) -> Vec<ReactionKind> {
        match &self.count_details {
            Some(details) => {
                let mut kinds = Vec::new();
                if details.normal > 0 {
                    kinds.push(ReactionKind::Normal);
                }
                if details.burst > 0 {
                    kinds.push(ReactionKind::Burst);
                }
                kinds
            }
            None => vec![ReactionKind::Normal],
        }
    }
}

/// MESSAGE_REACTION_ADD / MESSAGE_REACTION_REMOVE body
#[derive(Debug, Clone, Deserialize)]
pub struct ReactionGatewayEvent {
    pub user_id: UserId,
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    pub emoji: Emoji,
    #[serde(default)]
    pub burst: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReactionRemoveAll {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReactionRemoveEmoji {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub emoji: Emoji,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageDelete {
    pub id: MessageId,
    pub channel_id: ChannelId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageDeleteBulk {
    pub ids: Vec<MessageId>,
    pub channel_id: ChannelId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emoji_api_name() {
        let unicode = Emoji {
            id: None,
            name: Some("✨".to_owned()),
            animated: false,
        };
        assert_eq!(unicode.api_name(), "✨");

        let custom = Emoji {
            id: Some(EmojiId(41771983429993937)),
            name: Some("blobwave".to_owned()),
            animated: true,
        };
        assert_eq!(custom.api_name(), "blobwave:41771983429993937");
    }

    #[test]
    fn reaction_kinds_from_details() {
        let r: Reaction = serde_json::from_str(
            r#"{"count":3,"count_details":{"normal":2,"burst":1},"emoji":{"id":null,"name":"✨"}}"#,
        )
        .unwrap();
        assert_eq!(r.kinds(), vec![ReactionKind::Normal, ReactionKind::Burst]);
    }
}
