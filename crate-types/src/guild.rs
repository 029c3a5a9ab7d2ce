use serde::{Deserialize, Serialize};

use crate::channel::Channel;
use crate::ids::{GuildId, RoleId, UserId};
use crate::permission::Permissions;
use crate::user::User;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guild {
    pub id: GuildId,
    pub name: String,
    pub owner_id: UserId,
    #[serde(default)]
    pub icon: Option<String>,
}

/// GUILD_CREATE carries the guild plus its full runtime contents
#[derive(Debug, Clone, Deserialize)]
pub struct GuildCreate {
    #[serde(flatten)]
    pub guild: Guild,
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub threads: Vec<Channel>,
    #[serde(default)]
    pub members: Vec<Member>,
    #[serde(default)]
    pub member_count: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnavailableGuild {
    pub id: GuildId,
    #[serde(default)]
    pub unavailable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    pub permissions: Permissions,
    #[serde(default)]
    pub color: u32,
    #[serde(default)]
    pub hoist: bool,
    #[serde(default)]
    pub position: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default)]
    pub nick: Option<String>,
    #[serde(default)]
    pub roles: Vec<RoleId>,
    #[serde(default)]
    pub joined_at: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuildRoleEvent {
    pub guild_id: GuildId,
    pub role: Role,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuildRoleDelete {
    pub guild_id: GuildId,
    pub role_id: RoleId,
}

/// GUILD_MEMBER_UPDATE / GUILD_MEMBER_ADD body
#[derive(Debug, Clone, Deserialize)]
pub struct GuildMemberEvent {
    pub guild_id: GuildId,
    #[serde(flatten)]
    pub member: Member,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuildMemberRemove {
    pub guild_id: GuildId,
    pub user: User,
}

/// one page of a gateway member enumeration
#[derive(Debug, Clone, Deserialize)]
pub struct GuildMembersChunk {
    pub guild_id: GuildId,
    pub members: Vec<Member>,
    pub chunk_index: u64,
    pub chunk_count: u64,
}

impl GuildMembersChunk {
    pub fn is_last(&self) -> bool {
        self.chunk_index + 1 >= self.chunk_count
    }
}
