//! wire and domain types for the hagfish archiver
//!
//! everything here is pure data: snowflake ids, permission bitfields, the
//! gateway envelope, and the subset of platform objects the archiver
//! observes. no i/o.

pub mod channel;
pub mod gateway;
pub mod guild;
pub mod ids;
pub mod message;
pub mod permission;
pub mod timing;
pub mod user;

pub use channel::{
    ArchivedThreadsPage, Channel, ChannelKind, PermissionOverwrite, PrincipalKind, ThreadListSync,
    ThreadMetadata,
};
pub use gateway::{
    close_behavior, op, CloseBehavior, GatewayPayload, Hello, Identify, Ready,
    RequestGuildMembers, Resume,
};
pub use guild::{Guild, GuildCreate, GuildMembersChunk, Member, Role, UnavailableGuild};
pub use ids::{AttachmentId, ChannelId, EmojiId, GuildId, MessageId, RoleId, UserId, WebhookId};
pub use message::{
    Attachment, Emoji, Message, MessageUpdate, Reaction, ReactionGatewayEvent, ReactionKind,
};
pub use permission::Permissions;
pub use timing::{ImageHash, Timing};
pub use user::User;
