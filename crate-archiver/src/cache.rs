use std::collections::{BTreeSet, HashMap, HashSet};

use hagfish_types::{
    Channel, ChannelId, ChannelKind, GuildId, MessageId, Permissions, RoleId, UserId,
};

/// index of an account in the configured account list
pub type AccountIx = usize;

/// the runtime picture of one guild, built from gateway dispatches
///
/// cache entries are never destroyed; a deleted guild is recorded in the
/// database but stays here until process exit.
#[derive(Debug)]
pub struct CachedGuild {
    pub id: GuildId,
    pub name: String,
    pub owner_id: UserId,
    /// role id -> permission bitfield
    pub roles: HashMap<RoleId, Permissions>,
    /// per-account membership record
    pub accounts: HashMap<AccountIx, GuildAccountRecord>,
    /// ordered by id
    pub channels: BTreeSet<ChannelId>,
    /// None until a member enumeration completes
    pub member_ids: Option<HashSet<UserId>>,
}

#[derive(Debug, Clone)]
pub struct GuildAccountRecord {
    pub user_id: UserId,
    pub role_ids: HashSet<RoleId>,
    /// derived guild-wide permissions
    pub permissions: Permissions,
}

#[derive(Debug)]
pub struct CachedChannel {
    pub id: ChannelId,
    pub kind: ChannelKind,
    pub guild_id: GuildId,
    pub name: String,
    /// principal id (role or user) -> (allow, deny)
    pub overwrites: HashMap<u64, (Permissions, Permissions)>,
    pub accounts_with_read: HashSet<AccountIx>,
    pub accounts_with_manage_threads: HashSet<AccountIx>,
    /// newest message the cache knows about, fed by dispatches
    pub last_message_id: Option<MessageId>,
    /// present only until the initial sync for this channel is scheduled
    pub sync_info: Option<SyncInfo>,
}

/// startup state used to decide what the initial backfill must cover
#[derive(Debug, Clone)]
pub struct SyncInfo {
    pub last_message_id: Option<MessageId>,
    pub message_count: Option<u64>,
    pub active_threads: Vec<ThreadInfo>,
}

/// ephemeral descriptor of a thread being enumerated; never cached
#[derive(Debug, Clone)]
pub struct ThreadInfo {
    pub id: ChannelId,
    pub name: String,
    pub parent_id: ChannelId,
    pub private: bool,
    pub last_message_id: Option<MessageId>,
    pub message_count: Option<u64>,
}

impl ThreadInfo {
    pub fn from_wire(channel: &Channel) -> Option<ThreadInfo> {
        if !channel.kind.is_thread() {
            return None;
        }
        Some(ThreadInfo {
            id: channel.id,
            name: channel.name.clone().unwrap_or_default(),
            parent_id: channel.parent_id?,
            private: channel.is_private_thread(),
            last_message_id: channel.last_message_id,
            message_count: channel.message_count,
        })
    }
}

impl CachedChannel {
    pub fn from_wire(channel: &Channel, guild_id: GuildId) -> CachedChannel {
        CachedChannel {
            id: channel.id,
            kind: channel.kind,
            guild_id,
            name: channel.name.clone().unwrap_or_default(),
            overwrites: overwrite_map(channel),
            accounts_with_read: HashSet::new(),
            accounts_with_manage_threads: HashSet::new(),
            last_message_id: channel.last_message_id,
            sync_info: Some(SyncInfo {
                last_message_id: channel.last_message_id,
                message_count: channel.message_count,
                active_threads: Vec::new(),
            }),
        }
    }

    /// apply a CHANNEL_UPDATE; returns true when the overwrites changed and
    /// permissions must be recomputed
    pub fn apply_update(&mut self, channel: &Channel) -> bool {
        self.name = channel.name.clone().unwrap_or_default();
        self.kind = channel.kind;
        if channel.last_message_id.is_some() {
            self.last_message_id = channel.last_message_id;
        }
        let new = overwrite_map(channel);
        if new != self.overwrites {
            self.overwrites = new;
            true
        } else {
            false
        }
    }
}

pub fn overwrite_map(channel: &Channel) -> HashMap<u64, (Permissions, Permissions)> {
    channel
        .permission_overwrites
        .iter()
        .map(|o| (o.id, (o.allow, o.deny)))
        .collect()
}
