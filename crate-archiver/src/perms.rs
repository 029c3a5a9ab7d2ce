//! pure permission computations over the cached runtime picture

use hagfish_types::Permissions;

use crate::cache::{CachedChannel, CachedGuild, GuildAccountRecord};

/// guild-wide permissions: the OR of every held role's bitfield, with the
/// @everyone role (id == guild id) always held
pub fn guild_permissions(guild: &CachedGuild, record: &GuildAccountRecord) -> Permissions {
    if guild.owner_id == record.user_id {
        return Permissions::ALL;
    }
    let mut perms = guild
        .roles
        .get(&hagfish_types::RoleId(guild.id.into_inner()))
        .copied()
        .unwrap_or(Permissions::NONE);
    for role_id in &record.role_ids {
        if let Some(role_perms) = guild.roles.get(role_id) {
            perms |= *role_perms;
        }
    }
    if perms.contains(Permissions::ADMINISTRATOR) {
        Permissions::ALL
    } else {
        perms
    }
}

/// effective channel permissions, applying overwrites in the platform's
/// documented order: @everyone, then roles (deny before allow, folded
/// across held roles), then the member overwrite
pub fn channel_permissions(
    guild: &CachedGuild,
    channel: &CachedChannel,
    record: &GuildAccountRecord,
) -> Permissions {
    let base = record.permissions;
    if guild.owner_id == record.user_id || base.contains(Permissions::ADMINISTRATOR) {
        return Permissions::ALL;
    }

    let mut perms = base;
    if let Some((allow, deny)) = channel.overwrites.get(&guild.id.into_inner()) {
        perms = (perms & !*deny) | *allow;
    }

    let mut role_allow = Permissions::NONE;
    let mut role_deny = Permissions::NONE;
    for role_id in &record.role_ids {
        if let Some((allow, deny)) = channel.overwrites.get(&role_id.into_inner()) {
            role_allow |= *allow;
            role_deny |= *deny;
        }
    }
    perms = (perms & !role_deny) | role_allow;

    if let Some((allow, deny)) = channel.overwrites.get(&record.user_id.into_inner()) {
        perms = (perms & !*deny) | *allow;
    }
    perms
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, HashMap, HashSet};

    use hagfish_types::{ChannelKind, GuildId, RoleId, UserId};

    use super::*;

    const GUILD: GuildId = GuildId(100);
    const ME: UserId = UserId(7);

    fn guild(roles: &[(u64, Permissions)]) -> CachedGuild {
        CachedGuild {
            id: GUILD,
            name: "test".into(),
            owner_id: UserId(1),
            roles: roles.iter().map(|(id, p)| (RoleId(*id), *p)).collect(),
            accounts: HashMap::new(),
            channels: BTreeSet::new(),
            member_ids: None,
        }
    }

    fn record(role_ids: &[u64], permissions: Permissions) -> GuildAccountRecord {
        GuildAccountRecord {
            user_id: ME,
            role_ids: role_ids.iter().copied().map(RoleId).collect(),
            permissions,
        }
    }

    fn channel(overwrites: &[(u64, Permissions, Permissions)]) -> CachedChannel {
        CachedChannel {
            id: hagfish_types::ChannelId(200),
            kind: ChannelKind::Text,
            guild_id: GUILD,
            name: "general".into(),
            overwrites: overwrites
                .iter()
                .map(|(id, allow, deny)| (*id, (*allow, *deny)))
                .collect(),
            accounts_with_read: HashSet::new(),
            accounts_with_manage_threads: HashSet::new(),
            last_message_id: None,
            sync_info: None,
        }
    }

    #[test]
    fn guild_perms_fold_roles_and_everyone() {
        let g = guild(&[
            (100, Permissions::VIEW_CHANNEL),
            (2, Permissions::READ_MESSAGE_HISTORY),
            (3, Permissions::MANAGE_THREADS),
        ]);
        let perms = guild_permissions(&g, &record(&[2], Permissions::NONE));
        assert!(perms.contains(Permissions::READ));
        assert!(!perms.contains(Permissions::MANAGE_THREADS));
    }

    #[test]
    fn administrator_means_everything() {
        let g = guild(&[(2, Permissions::ADMINISTRATOR)]);
        let perms = guild_permissions(&g, &record(&[2], Permissions::NONE));
        assert_eq!(perms, Permissions::ALL);
    }

    #[test]
    fn owner_means_everything() {
        let mut g = guild(&[]);
        g.owner_id = ME;
        assert_eq!(guild_permissions(&g, &record(&[], Permissions::NONE)), Permissions::ALL);
    }

    #[test]
    fn everyone_overwrite_applies_first() {
        let g = guild(&[]);
        // base grants read; @everyone denies view, role 2 re-allows it
        let c = channel(&[
            (100, Permissions::NONE, Permissions::VIEW_CHANNEL),
            (2, Permissions::VIEW_CHANNEL, Permissions::NONE),
        ]);
        let with_role = channel_permissions(&g, &c, &record(&[2], Permissions::READ));
        assert!(with_role.contains(Permissions::READ));

        let without_role = channel_permissions(&g, &c, &record(&[], Permissions::READ));
        assert!(!without_role.contains(Permissions::VIEW_CHANNEL));
        assert!(without_role.contains(Permissions::READ_MESSAGE_HISTORY));
    }

    #[test]
    fn role_allow_beats_role_deny() {
        let g = guild(&[]);
        // one held role denies history, another allows it; allow wins
        let c = channel(&[
            (2, Permissions::NONE, Permissions::READ_MESSAGE_HISTORY),
            (3, Permissions::READ_MESSAGE_HISTORY, Permissions::NONE),
        ]);
        let perms = channel_permissions(&g, &c, &record(&[2, 3], Permissions::READ));
        assert!(perms.contains(Permissions::READ_MESSAGE_HISTORY));
    }

    #[test]
    fn member_overwrite_applies_last() {
        let g = guild(&[]);
        let c = channel(&[
            (2, Permissions::READ_MESSAGE_HISTORY, Permissions::NONE),
            (ME.0, Permissions::NONE, Permissions::READ_MESSAGE_HISTORY),
        ]);
        let perms = channel_permissions(&g, &c, &record(&[2], Permissions::READ));
        assert!(!perms.contains(Permissions::READ_MESSAGE_HISTORY));
        assert!(perms.contains(Permissions::VIEW_CHANNEL));
    }

    #[test]
    fn admin_ignores_overwrites() {
        let g = guild(&[]);
        let c = channel(&[(100, Permissions::NONE, Permissions::ALL)]);
        let perms = channel_permissions(&g, &c, &record(&[], Permissions::ALL));
        assert_eq!(perms, Permissions::ALL);
    }
}
