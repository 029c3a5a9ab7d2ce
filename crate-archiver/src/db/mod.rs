//! the archive store: a single writer task owning one sqlite connection,
//! reached through a typed request channel
//!
//! every other component observes platform objects and hands them here as
//! records; the writer compares them against the latest stored snapshot and
//! appends only on inequality.

use std::path::Path;
use std::sync::Arc;

use hagfish_types::{
    Attachment, Channel, ChannelId, Emoji, Guild, GuildId, ImageHash, Member, Message, MessageId,
    MessageUpdate, ReactionKind, Role, RoleId, Timing, User, UserId, WebhookId,
};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Connection, SqliteConnection};
use tokio::sync::{mpsc, oneshot, Mutex, OwnedMutexGuard};

use crate::error::{Error, Result};

mod schema;
mod writer;

pub use schema::WEBHOOK_USER_MAX;

/// what a snapshot add did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// no row existed; inserted
    FirstSnapshot,
    /// differed from the latest; latest copied to history, then updated
    AnotherSnapshot,
    /// field-by-field equal to the latest; nothing written
    SameAsLatest,
    /// partial update with no base to merge into
    PartialNoSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Guild,
    Channel,
    Role,
    Message,
}

#[derive(Debug, Clone)]
pub struct GuildRecord {
    pub id: GuildId,
    pub name: String,
    pub owner_id: UserId,
    pub icon: Option<ImageHash>,
}

impl GuildRecord {
    pub fn from_wire(guild: &Guild) -> GuildRecord {
        GuildRecord {
            id: guild.id,
            name: guild.name.clone(),
            owner_id: guild.owner_id,
            icon: guild.icon.as_deref().map(ImageHash::parse),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChannelRecord {
    pub id: ChannelId,
    pub guild_id: Option<GuildId>,
    pub kind: u8,
    pub name: Option<String>,
    pub topic: Option<String>,
    pub nsfw: bool,
    pub parent_id: Option<ChannelId>,
    pub position: Option<i64>,
    /// overwrites as canonical json, ordered by principal id
    pub overwrites: String,
}

impl ChannelRecord {
    pub fn from_wire(channel: &Channel) -> ChannelRecord {
        let mut overwrites = channel.permission_overwrites.clone();
        overwrites.sort_by_key(|o| o.id);
        ChannelRecord {
            id: channel.id,
            guild_id: channel.guild_id,
            kind: channel.kind.into(),
            name: channel.name.clone(),
            topic: channel.topic.clone(),
            nsfw: channel.nsfw,
            parent_id: channel.parent_id,
            position: channel.position,
            overwrites: serde_json::to_string(&overwrites).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoleRecord {
    pub id: RoleId,
    pub guild_id: GuildId,
    pub name: String,
    pub permissions: u64,
    pub color: u32,
    pub hoist: bool,
    pub position: i64,
}

impl RoleRecord {
    pub fn from_wire(guild_id: GuildId, role: &Role) -> RoleRecord {
        RoleRecord {
            id: role.id,
            guild_id,
            name: role.name.clone(),
            permissions: role.permissions.0,
            color: role.color,
            hoist: role.hoist,
            position: role.position,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: UserId,
    pub username: String,
    pub discriminator: Option<String>,
    pub global_name: Option<String>,
    pub avatar: Option<ImageHash>,
    pub bot: bool,
}

impl UserRecord {
    pub fn from_wire(user: &User) -> UserRecord {
        UserRecord {
            id: user.id,
            username: user.username.clone(),
            discriminator: user.discriminator.clone(),
            global_name: user.global_name.clone(),
            avatar: user.avatar.as_deref().map(ImageHash::parse),
            bot: user.bot,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemberRecord {
    pub guild_id: GuildId,
    pub user_id: UserId,
    pub nick: Option<String>,
    /// held role ids as canonical json, sorted
    pub roles: String,
    pub joined_at: Option<String>,
    pub avatar: Option<ImageHash>,
}

impl MemberRecord {
    pub fn from_wire(guild_id: GuildId, member: &Member) -> Option<MemberRecord> {
        let user = member.user.as_ref()?;
        let mut roles: Vec<u64> = member.roles.iter().map(|r| r.into_inner()).collect();
        roles.sort_unstable();
        Some(MemberRecord {
            guild_id,
            user_id: user.id,
            nick: member.nick.clone(),
            roles: serde_json::to_string(&roles).unwrap_or_default(),
            joined_at: member.joined_at.clone(),
            avatar: member.avatar.as_deref().map(ImageHash::parse),
        })
    }
}

#[derive(Debug, Clone)]
pub struct AttachmentRecord {
    pub id: i64,
    pub filename: String,
    pub size: u64,
    pub url: String,
    pub content_type: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl AttachmentRecord {
    pub fn from_wire(attachment: &Attachment) -> AttachmentRecord {
        AttachmentRecord {
            id: attachment.id.into_inner() as i64,
            filename: attachment.filename.clone(),
            size: attachment.size,
            url: attachment.url.clone(),
            content_type: attachment.content_type.clone(),
            width: attachment.width,
            height: attachment.height,
        }
    }
}

/// the identity a webhook message writes under; resolved by the writer to a
/// synthetic author id
#[derive(Debug, Clone)]
pub struct WebhookAuthor {
    pub webhook_id: WebhookId,
    pub name: String,
    pub avatar: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub webhook: Option<WebhookAuthor>,
    pub kind: u8,
    pub content: String,
    pub edited_timestamp: Option<String>,
    pub flags: Option<u64>,
    pub pinned: bool,
    pub reference: Option<String>,
    pub embeds: String,
    pub components: String,
    pub attachments: Vec<AttachmentRecord>,
}

impl MessageRecord {
    /// None when the message has no usable author
    pub fn from_wire(message: &Message) -> Option<MessageRecord> {
        let author = message.author.as_ref()?;
        let webhook = message.webhook_id.map(|webhook_id| WebhookAuthor {
            webhook_id,
            name: author.username.clone(),
            avatar: author.avatar.clone(),
        });
        Some(MessageRecord {
            id: message.id,
            channel_id: message.channel_id,
            author_id: author.id,
            webhook,
            kind: message.kind,
            content: message.content.clone(),
            edited_timestamp: message.edited_timestamp.clone(),
            flags: message.flags,
            pinned: message.pinned,
            reference: message
                .message_reference
                .as_ref()
                .map(|r| r.to_string()),
            embeds: serde_json::to_string(&message.embeds).unwrap_or_default(),
            components: serde_json::to_string(&message.components).unwrap_or_default(),
            attachments: message.attachments.iter().map(AttachmentRecord::from_wire).collect(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct MessagePatch {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author_id: Option<UserId>,
    pub content: Option<String>,
    /// absent means the platform is backfilling embeds after unfurling
    pub edited_timestamp: Option<String>,
    pub flags: Option<u64>,
    pub pinned: Option<bool>,
    pub embeds: Option<String>,
    pub components: Option<String>,
    pub attachments: Option<Vec<AttachmentRecord>>,
}

impl MessagePatch {
    pub fn from_wire(update: &MessageUpdate) -> MessagePatch {
        MessagePatch {
            id: update.id,
            channel_id: update.channel_id,
            author_id: update.author.as_ref().map(|a| a.id),
            content: update.content.clone(),
            edited_timestamp: update.edited_timestamp.clone(),
            flags: update.flags,
            pinned: update.pinned,
            embeds: update
                .embeds
                .as_ref()
                .map(|e| serde_json::to_string(e).unwrap_or_default()),
            components: update
                .components
                .as_ref()
                .map(|c| serde_json::to_string(c).unwrap_or_default()),
            attachments: update
                .attachments
                .as_ref()
                .map(|a| a.iter().map(AttachmentRecord::from_wire).collect()),
        }
    }
}

type Resp<T> = oneshot::Sender<Result<T>>;

pub(crate) enum Request {
    Begin(Resp<()>),
    Commit(Resp<()>),
    Rollback,
    Optimize(Resp<()>),
    Close(Resp<()>),
    AddGuild(GuildRecord, Timing, Resp<AddOutcome>),
    AddChannel(ChannelRecord, Timing, Resp<AddOutcome>),
    AddRole(RoleRecord, Timing, Resp<AddOutcome>),
    AddUser(UserRecord, Timing, Resp<AddOutcome>),
    AddMember(MemberRecord, Timing, Resp<AddOutcome>),
    MemberLeave(GuildId, UserId, Timing, Resp<AddOutcome>),
    AddMessage(Box<MessageRecord>, Timing, Resp<AddOutcome>),
    PatchMessage(Box<MessagePatch>, Timing, Resp<AddOutcome>),
    MarkDeleted(EntityKind, i64, Timing, Resp<()>),
    AddReaction(MessageId, Emoji, ReactionKind, UserId, Timing, Resp<()>),
    AddInitialReactions(MessageId, Emoji, ReactionKind, Vec<UserId>, Resp<()>),
    RemoveReaction(MessageId, Emoji, ReactionKind, UserId, Timing, Resp<()>),
    RemoveAllReactions(MessageId, Timing, Resp<()>),
    RemoveEmojiReactions(MessageId, Emoji, Timing, Resp<()>),
    SyncGuildMembers(GuildId, Vec<UserId>, Timing, Resp<()>),
    MaxMessageId(ChannelId, Resp<Option<MessageId>>),
    SearchMessages(String, Resp<Vec<MessageId>>),
    GuildIds(Resp<Vec<GuildId>>),
    ChannelIds(GuildId, Resp<Vec<ChannelId>>),
    #[cfg(test)]
    ScalarInt(String, Resp<Option<i64>>),
    #[cfg(test)]
    ScalarText(String, Resp<Option<String>>),
}

/// cloneable handle to the writer task
#[derive(Clone)]
pub struct Db {
    tx: mpsc::Sender<Request>,
    tx_lock: Arc<Mutex<()>>,
}

impl Db {
    pub async fn open(path: &Path) -> Result<Db> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        Self::open_with(options).await
    }

    /// in-memory store, for tests
    pub async fn open_in_memory() -> Result<Db> {
        Self::open_with(SqliteConnectOptions::new().in_memory(true)).await
    }

    async fn open_with(options: SqliteConnectOptions) -> Result<Db> {
        let mut conn = SqliteConnection::connect_with(&options).await?;
        sqlx::raw_sql(schema::SCHEMA).execute(&mut conn).await?;
        let (tx, rx) = mpsc::channel(256);
        writer::spawn(conn, rx);
        Ok(Db {
            tx,
            tx_lock: Arc::new(Mutex::new(())),
        })
    }

    async fn call<T>(&self, build: impl FnOnce(Resp<T>) -> Request) -> Result<T> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(build(resp))
            .await
            .map_err(|_| Error::WriterClosed)?;
        rx.await.map_err(|_| Error::WriterClosed)?
    }

    /// open an exclusive transaction; point writes from other tasks that
    /// race with it simply join the batch
    pub async fn transaction(&self) -> Result<TxGuard> {
        let guard = self.tx_lock.clone().lock_owned().await;
        self.call(Request::Begin).await?;
        Ok(TxGuard {
            db: self.clone(),
            _guard: guard,
            committed: false,
        })
    }

    pub async fn optimize(&self) -> Result<()> {
        self.call(Request::Optimize).await
    }

    pub async fn close(&self) -> Result<()> {
        self.call(Request::Close).await
    }

    pub async fn add_guild(&self, record: GuildRecord, timing: Timing) -> Result<AddOutcome> {
        self.call(|resp| Request::AddGuild(record, timing, resp)).await
    }

    pub async fn add_channel(&self, record: ChannelRecord, timing: Timing) -> Result<AddOutcome> {
        self.call(|resp| Request::AddChannel(record, timing, resp)).await
    }

    pub async fn add_role(&self, record: RoleRecord, timing: Timing) -> Result<AddOutcome> {
        self.call(|resp| Request::AddRole(record, timing, resp)).await
    }

    pub async fn add_user(&self, record: UserRecord, timing: Timing) -> Result<AddOutcome> {
        self.call(|resp| Request::AddUser(record, timing, resp)).await
    }

    pub async fn add_member(&self, record: MemberRecord, timing: Timing) -> Result<AddOutcome> {
        self.call(|resp| Request::AddMember(record, timing, resp)).await
    }

    /// record "this user left": a snapshot with every membership field null
    pub async fn member_leave(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        timing: Timing,
    ) -> Result<AddOutcome> {
        self.call(|resp| Request::MemberLeave(guild_id, user_id, timing, resp)).await
    }

    pub async fn add_message(&self, record: MessageRecord, timing: Timing) -> Result<AddOutcome> {
        self.call(|resp| Request::AddMessage(Box::new(record), timing, resp)).await
    }

    pub async fn patch_message(&self, patch: MessagePatch, timing: Timing) -> Result<AddOutcome> {
        self.call(|resp| Request::PatchMessage(Box::new(patch), timing, resp)).await
    }

    pub async fn mark_deleted(&self, kind: EntityKind, id: i64, timing: Timing) -> Result<()> {
        self.call(|resp| Request::MarkDeleted(kind, id, timing, resp)).await
    }

    pub async fn add_reaction(
        &self,
        message_id: MessageId,
        emoji: Emoji,
        kind: ReactionKind,
        user_id: UserId,
        timing: Timing,
    ) -> Result<()> {
        self.call(|resp| Request::AddReaction(message_id, emoji, kind, user_id, timing, resp))
            .await
    }

    /// placements recovered by enumeration; start time 0 means "existed
    /// since before archival"
    pub async fn add_initial_reactions(
        &self,
        message_id: MessageId,
        emoji: Emoji,
        kind: ReactionKind,
        user_ids: Vec<UserId>,
    ) -> Result<()> {
        self.call(|resp| Request::AddInitialReactions(message_id, emoji, kind, user_ids, resp))
            .await
    }

    pub async fn remove_reaction(
        &self,
        message_id: MessageId,
        emoji: Emoji,
        kind: ReactionKind,
        user_id: UserId,
        timing: Timing,
    ) -> Result<()> {
        self.call(|resp| Request::RemoveReaction(message_id, emoji, kind, user_id, timing, resp))
            .await
    }

    pub async fn remove_all_reactions(&self, message_id: MessageId, timing: Timing) -> Result<()> {
        self.call(|resp| Request::RemoveAllReactions(message_id, timing, resp)).await
    }

    pub async fn remove_emoji_reactions(
        &self,
        message_id: MessageId,
        emoji: Emoji,
        timing: Timing,
    ) -> Result<()> {
        self.call(|resp| Request::RemoveEmojiReactions(message_id, emoji, timing, resp)).await
    }

    pub async fn sync_guild_members(
        &self,
        guild_id: GuildId,
        user_ids: Vec<UserId>,
        timing: Timing,
    ) -> Result<()> {
        self.call(|resp| Request::SyncGuildMembers(guild_id, user_ids, timing, resp)).await
    }

    /// the resume point for a channel backfill
    pub async fn max_message_id(&self, channel_id: ChannelId) -> Result<Option<MessageId>> {
        self.call(|resp| Request::MaxMessageId(channel_id, resp)).await
    }

    pub async fn search_messages(&self, query: String) -> Result<Vec<MessageId>> {
        self.call(|resp| Request::SearchMessages(query, resp)).await
    }

    pub async fn guild_ids(&self) -> Result<Vec<GuildId>> {
        self.call(Request::GuildIds).await
    }

    pub async fn channel_ids(&self, guild_id: GuildId) -> Result<Vec<ChannelId>> {
        self.call(|resp| Request::ChannelIds(guild_id, resp)).await
    }
}

#[cfg(test)]
impl Db {
    async fn scalar_int(&self, sql: &str) -> Result<Option<i64>> {
        let sql = sql.to_owned();
        self.call(|resp| Request::ScalarInt(sql, resp)).await
    }

    async fn scalar_text(&self, sql: &str) -> Result<Option<String>> {
        let sql = sql.to_owned();
        self.call(|resp| Request::ScalarText(sql, resp)).await
    }
}

/// an open transaction; rolls back if dropped without commit
pub struct TxGuard {
    db: Db,
    _guard: OwnedMutexGuard<()>,
    committed: bool,
}

impl TxGuard {
    pub async fn commit(mut self) -> Result<()> {
        self.committed = true;
        self.db.call(Request::Commit).await
    }
}

impl Drop for TxGuard {
    fn drop(&mut self) {
        if !self.committed {
            let _ = self.db.tx.try_send(Request::Rollback);
        }
    }
}

#[cfg(test)]
mod tests {
    use hagfish_types::{ChannelKind, EmojiId};

    use super::*;

    fn guild_record(name: &str) -> GuildRecord {
        GuildRecord {
            id: GuildId(100),
            name: name.to_owned(),
            owner_id: UserId(1),
            icon: None,
        }
    }

    fn message_record(id: u64, content: &str) -> MessageRecord {
        MessageRecord {
            id: MessageId(id),
            channel_id: ChannelId(200),
            author_id: UserId(1),
            webhook: None,
            kind: 0,
            content: content.to_owned(),
            edited_timestamp: None,
            flags: Some(0),
            pinned: false,
            reference: None,
            embeds: "[]".to_owned(),
            components: "[]".to_owned(),
            attachments: Vec::new(),
        }
    }

    fn sparkles() -> Emoji {
        Emoji {
            id: None,
            name: Some("✨".to_owned()),
            animated: false,
        }
    }

    #[tokio::test]
    async fn snapshot_dedup() {
        let db = Db::open_in_memory().await.unwrap();
        let first = db.add_guild(guild_record("a"), Timing::new(1, true)).await.unwrap();
        assert_eq!(first, AddOutcome::FirstSnapshot);
        let again = db.add_guild(guild_record("a"), Timing::new(2, true)).await.unwrap();
        assert_eq!(again, AddOutcome::SameAsLatest);
        let count = db
            .scalar_int("SELECT COUNT(*) FROM latest_guild_snapshots")
            .await
            .unwrap();
        assert_eq!(count, Some(1));
    }

    #[tokio::test]
    async fn edit_copies_latest_into_history() {
        let db = Db::open_in_memory().await.unwrap();
        db.add_message(message_record(42, "a"), Timing::new(1, false)).await.unwrap();
        let mut edited = message_record(42, "b");
        edited.edited_timestamp = Some("2024-01-01T00:00:00Z".to_owned());
        let outcome = db.add_message(edited, Timing::new(2, true)).await.unwrap();
        assert_eq!(outcome, AddOutcome::AnotherSnapshot);

        let latest = db
            .scalar_text("SELECT content FROM latest_message_snapshots WHERE id = 42")
            .await
            .unwrap();
        assert_eq!(latest.as_deref(), Some("b"));
        let previous = db
            .scalar_text("SELECT content FROM previous_message_snapshots WHERE id = 42")
            .await
            .unwrap();
        assert_eq!(previous.as_deref(), Some("a"));
        let previous_count = db
            .scalar_int("SELECT COUNT(*) FROM previous_message_snapshots WHERE id = 42")
            .await
            .unwrap();
        assert_eq!(previous_count, Some(1));
    }

    #[tokio::test]
    async fn non_advancing_timestamp_is_fatal() {
        let db = Db::open_in_memory().await.unwrap();
        db.add_message(message_record(1, "a"), Timing::new(5, false)).await.unwrap();
        let result = db.add_message(message_record(1, "b"), Timing::new(5, false)).await;
        assert!(matches!(result, Err(Error::TimestampRegression(_))));
    }

    #[tokio::test]
    async fn partial_without_base_needs_required_fields() {
        let db = Db::open_in_memory().await.unwrap();
        let bare = MessagePatch {
            id: MessageId(9),
            channel_id: ChannelId(200),
            author_id: None,
            content: None,
            edited_timestamp: Some("2024-01-01T00:00:00Z".to_owned()),
            flags: Some(1),
            pinned: None,
            embeds: None,
            components: None,
            attachments: None,
        };
        let outcome = db.patch_message(bare.clone(), Timing::new(1, true)).await.unwrap();
        assert_eq!(outcome, AddOutcome::PartialNoSnapshot);

        let with_content = MessagePatch {
            content: Some("hello".to_owned()),
            ..bare
        };
        let outcome = db.patch_message(with_content, Timing::new(2, true)).await.unwrap();
        assert_eq!(outcome, AddOutcome::FirstSnapshot);
    }

    #[tokio::test]
    async fn patch_merges_over_stored_base() {
        let db = Db::open_in_memory().await.unwrap();
        db.add_message(message_record(7, "original"), Timing::new(1, false)).await.unwrap();
        let patch = MessagePatch {
            id: MessageId(7),
            channel_id: ChannelId(200),
            author_id: None,
            content: Some("edited".to_owned()),
            edited_timestamp: Some("2024-01-01T00:00:00Z".to_owned()),
            flags: None,
            pinned: None,
            embeds: None,
            components: None,
            attachments: None,
        };
        let outcome = db.patch_message(patch, Timing::new(2, true)).await.unwrap();
        assert_eq!(outcome, AddOutcome::AnotherSnapshot);
        let author = db
            .scalar_int("SELECT author_id FROM latest_message_snapshots WHERE id = 7")
            .await
            .unwrap();
        // untouched fields carried over from the base
        assert_eq!(author, Some(1));
    }

    #[tokio::test]
    async fn embed_backfill_mutates_in_place() {
        let db = Db::open_in_memory().await.unwrap();
        db.add_message(message_record(5, "link"), Timing::new(1, true)).await.unwrap();
        let patch = MessagePatch {
            id: MessageId(5),
            channel_id: ChannelId(200),
            author_id: None,
            content: None,
            edited_timestamp: None,
            flags: None,
            pinned: None,
            embeds: Some("[{\"title\":\"t\"}]".to_owned()),
            components: None,
            attachments: None,
        };
        db.patch_message(patch, Timing::new(2, true)).await.unwrap();

        let embeds = db
            .scalar_text("SELECT embeds FROM latest_message_snapshots WHERE id = 5")
            .await
            .unwrap();
        assert_eq!(embeds.as_deref(), Some("[{\"title\":\"t\"}]"));
        // in place: no history row, original observation time kept
        let previous = db
            .scalar_int("SELECT COUNT(*) FROM previous_message_snapshots WHERE id = 5")
            .await
            .unwrap();
        assert_eq!(previous, Some(0));
        let timestamp = db
            .scalar_int("SELECT _timestamp FROM latest_message_snapshots WHERE id = 5")
            .await
            .unwrap();
        assert_eq!(timestamp, Some(Timing::new(1, true).into_inner()));
    }

    #[tokio::test]
    async fn unedited_update_touching_content_is_skipped() {
        let db = Db::open_in_memory().await.unwrap();
        db.add_message(message_record(6, "keep"), Timing::new(1, true)).await.unwrap();
        let patch = MessagePatch {
            id: MessageId(6),
            channel_id: ChannelId(200),
            author_id: None,
            content: Some("clobber".to_owned()),
            edited_timestamp: None,
            flags: None,
            pinned: None,
            embeds: Some("[]".to_owned()),
            components: None,
            attachments: None,
        };
        let outcome = db.patch_message(patch, Timing::new(2, true)).await.unwrap();
        assert_eq!(outcome, AddOutcome::SameAsLatest);
        let content = db
            .scalar_text("SELECT content FROM latest_message_snapshots WHERE id = 6")
            .await
            .unwrap();
        assert_eq!(content.as_deref(), Some("keep"));
    }

    #[tokio::test]
    async fn member_leave_then_rejoin() {
        let db = Db::open_in_memory().await.unwrap();
        let record = MemberRecord {
            guild_id: GuildId(100),
            user_id: UserId(1),
            nick: Some("nick".to_owned()),
            roles: "[2]".to_owned(),
            joined_at: Some("2024-01-01T00:00:00Z".to_owned()),
            avatar: None,
        };
        db.add_member(record.clone(), Timing::new(1, true)).await.unwrap();
        let left = db
            .member_leave(GuildId(100), UserId(1), Timing::new(2, true))
            .await
            .unwrap();
        assert_eq!(left, AddOutcome::AnotherSnapshot);
        let nick = db
            .scalar_text("SELECT nick FROM latest_member_snapshots WHERE user_id = 1")
            .await
            .unwrap();
        assert_eq!(nick, None);

        // the transition back to "joined" stays representable
        let rejoined = db.add_member(record, Timing::new(3, true)).await.unwrap();
        assert_eq!(rejoined, AddOutcome::AnotherSnapshot);
        let history = db
            .scalar_int("SELECT COUNT(*) FROM previous_member_snapshots WHERE user_id = 1")
            .await
            .unwrap();
        assert_eq!(history, Some(2));
    }

    #[tokio::test]
    async fn webhook_identities_get_distinct_synthetic_authors() {
        let db = Db::open_in_memory().await.unwrap();
        let hook = |name: &str| WebhookAuthor {
            webhook_id: WebhookId(900),
            name: name.to_owned(),
            avatar: None,
        };
        let mut a = message_record(1, "x");
        a.webhook = Some(hook("alpha"));
        let mut b = message_record(2, "y");
        b.webhook = Some(hook("beta"));
        let mut c = message_record(3, "z");
        c.webhook = Some(hook("alpha"));
        db.add_message(a, Timing::new(1, true)).await.unwrap();
        db.add_message(b, Timing::new(2, true)).await.unwrap();
        db.add_message(c, Timing::new(3, true)).await.unwrap();

        let author1 = db
            .scalar_int("SELECT author_id FROM latest_message_snapshots WHERE id = 1")
            .await
            .unwrap()
            .unwrap();
        let author2 = db
            .scalar_int("SELECT author_id FROM latest_message_snapshots WHERE id = 2")
            .await
            .unwrap()
            .unwrap();
        let author3 = db
            .scalar_int("SELECT author_id FROM latest_message_snapshots WHERE id = 3")
            .await
            .unwrap()
            .unwrap();
        assert_ne!(author1, author2);
        assert_eq!(author1, author3);
        assert!(author1 < WEBHOOK_USER_MAX && author2 < WEBHOOK_USER_MAX);
    }

    #[tokio::test]
    async fn reaction_lifecycle_with_initial_load_dedup() {
        let db = Db::open_in_memory().await.unwrap();
        let added = Timing::new(10, true);
        let removed = Timing::new(20, true);
        db.add_reaction(MessageId(7), sparkles(), ReactionKind::Normal, UserId(3), added)
            .await
            .unwrap();

        // an initial load listing the same user must not duplicate the
        // open placement
        db.add_initial_reactions(MessageId(7), sparkles(), ReactionKind::Normal, vec![UserId(3)])
            .await
            .unwrap();
        let rows = db.scalar_int("SELECT COUNT(*) FROM reactions").await.unwrap();
        assert_eq!(rows, Some(1));

        db.remove_reaction(MessageId(7), sparkles(), ReactionKind::Normal, UserId(3), removed)
            .await
            .unwrap();
        let start = db.scalar_int("SELECT start FROM reactions").await.unwrap();
        let end = db.scalar_int("SELECT \"end\" FROM reactions").await.unwrap();
        assert_eq!(start, Some(added.into_inner()));
        assert_eq!(end, Some(removed.into_inner()));
    }

    #[tokio::test]
    async fn initial_reactions_use_the_zero_sentinel() {
        let db = Db::open_in_memory().await.unwrap();
        db.add_initial_reactions(
            MessageId(8),
            Emoji {
                id: Some(EmojiId(41)),
                name: Some("blob".to_owned()),
                animated: false,
            },
            ReactionKind::Burst,
            vec![UserId(3), UserId(4)],
        )
        .await
        .unwrap();
        let rows = db
            .scalar_int("SELECT COUNT(*) FROM reactions WHERE start = 0 AND kind = 1")
            .await
            .unwrap();
        assert_eq!(rows, Some(2));
    }

    #[tokio::test]
    async fn attachments_insert_once() {
        let db = Db::open_in_memory().await.unwrap();
        let mut message = message_record(11, "file");
        message.attachments.push(AttachmentRecord {
            id: 500,
            filename: "cat.png".to_owned(),
            size: 123,
            url: "https://cdn.discordapp.com/attachments/200/500/cat.png".to_owned(),
            content_type: Some("image/png".to_owned()),
            width: Some(1),
            height: Some(1),
        });
        db.add_message(message.clone(), Timing::new(1, false)).await.unwrap();
        // re-observing the same message is a no-op for attachments too
        db.add_message(message, Timing::new(2, false)).await.unwrap();
        let rows = db.scalar_int("SELECT COUNT(*) FROM attachments").await.unwrap();
        assert_eq!(rows, Some(1));
    }

    #[tokio::test]
    async fn mark_deleted_preserves_the_last_state() {
        let db = Db::open_in_memory().await.unwrap();
        let channel = ChannelRecord {
            id: ChannelId(200),
            guild_id: Some(GuildId(100)),
            kind: ChannelKind::Text.into(),
            name: Some("general".to_owned()),
            topic: None,
            nsfw: false,
            parent_id: None,
            position: Some(0),
            overwrites: "[]".to_owned(),
        };
        db.add_channel(channel, Timing::new(1, true)).await.unwrap();
        db.mark_deleted(EntityKind::Channel, 200, Timing::new(2, true)).await.unwrap();

        let deleted = db
            .scalar_int("SELECT _deleted FROM latest_channel_snapshots WHERE id = 200")
            .await
            .unwrap();
        assert_eq!(deleted, Some(1));
        let previous_name = db
            .scalar_text("SELECT name FROM previous_channel_snapshots WHERE id = 200")
            .await
            .unwrap();
        assert_eq!(previous_name.as_deref(), Some("general"));
    }

    #[tokio::test]
    async fn max_message_id_is_the_resume_point() {
        let db = Db::open_in_memory().await.unwrap();
        assert_eq!(db.max_message_id(ChannelId(200)).await.unwrap(), None);
        for id in [3, 1, 2] {
            db.add_message(message_record(id, "m"), Timing::new(id as i64, false))
                .await
                .unwrap();
        }
        assert_eq!(
            db.max_message_id(ChannelId(200)).await.unwrap(),
            Some(MessageId(3))
        );
        // other channels do not bleed in
        assert_eq!(db.max_message_id(ChannelId(999)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn search_follows_the_latest_content() {
        let db = Db::open_in_memory().await.unwrap();
        db.add_message(message_record(21, "orca sighting"), Timing::new(1, false))
            .await
            .unwrap();
        assert_eq!(
            db.search_messages("orca".to_owned()).await.unwrap(),
            vec![MessageId(21)]
        );

        let mut edited = message_record(21, "hagfish sighting");
        edited.edited_timestamp = Some("2024-01-01T00:00:00Z".to_owned());
        db.add_message(edited, Timing::new(2, true)).await.unwrap();
        assert!(db.search_messages("orca".to_owned()).await.unwrap().is_empty());
        assert_eq!(
            db.search_messages("hagfish".to_owned()).await.unwrap(),
            vec![MessageId(21)]
        );
    }

    #[tokio::test]
    async fn transactions_batch_writes() {
        let db = Db::open_in_memory().await.unwrap();
        let tx = db.transaction().await.unwrap();
        for id in 1..=3 {
            db.add_message(message_record(id, "m"), Timing::new(id as i64, false))
                .await
                .unwrap();
        }
        tx.commit().await.unwrap();
        let rows = db
            .scalar_int("SELECT COUNT(*) FROM latest_message_snapshots")
            .await
            .unwrap();
        assert_eq!(rows, Some(3));
    }

    #[tokio::test]
    async fn enumerates_guilds_and_channels() {
        let db = Db::open_in_memory().await.unwrap();
        db.add_guild(guild_record("g"), Timing::new(1, true)).await.unwrap();
        for id in [201u64, 200] {
            let channel = ChannelRecord {
                id: ChannelId(id),
                guild_id: Some(GuildId(100)),
                kind: 0,
                name: Some(format!("c{id}")),
                topic: None,
                nsfw: false,
                parent_id: None,
                position: None,
                overwrites: "[]".to_owned(),
            };
            db.add_channel(channel, Timing::new(1, true)).await.unwrap();
        }
        assert_eq!(db.guild_ids().await.unwrap(), vec![GuildId(100)]);
        assert_eq!(
            db.channel_ids(GuildId(100)).await.unwrap(),
            vec![ChannelId(200), ChannelId(201)]
        );
    }

    #[tokio::test]
    async fn sync_guild_members_records_the_full_set() {
        let db = Db::open_in_memory().await.unwrap();
        db.sync_guild_members(GuildId(100), vec![UserId(1), UserId(2)], Timing::new(1, true))
            .await
            .unwrap();
        let ids = db
            .scalar_text("SELECT user_ids FROM sync_guild_members WHERE guild_id = 100")
            .await
            .unwrap();
        assert_eq!(ids.as_deref(), Some("[1,2]"));
    }
}
