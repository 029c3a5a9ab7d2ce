//! realtime dispatch handling: every gateway event becomes cache updates
//! plus snapshot writes
//!
//! called sequentially per account, so writes from one dispatch land before
//! the next dispatch is looked at.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use hagfish_types::{
    Channel, ChannelId, Guild, GuildCreate, GuildId, GuildMembersChunk, Message, MessageUpdate,
    Permissions, ReactionKind, Ready, Timing, User,
};
use hagfish_types::channel::ThreadListSync;
use hagfish_types::guild::{GuildMemberEvent, GuildMemberRemove, GuildRoleDelete, GuildRoleEvent};
use hagfish_types::message::{
    MessageDelete, MessageDeleteBulk, ReactionGatewayEvent, ReactionRemoveAll, ReactionRemoveEmoji,
};
use serde_json::Value;
use tracing::{debug, info};

use crate::cache::{AccountIx, CachedChannel, CachedGuild, GuildAccountRecord, ThreadInfo};
use crate::db::{
    ChannelRecord, EntityKind, GuildRecord, MemberRecord, MessagePatch, MessageRecord, RoleRecord,
    UserRecord,
};
use crate::error::Result;
use crate::sync::{
    check_all_ready, permissions_changed, request_guild_members, spawn_message_sync,
    update_channel_access, State,
};

pub async fn handle_dispatch(
    state: &Arc<State>,
    ix: AccountIx,
    kind: &str,
    data: Value,
    live: bool,
) -> Result<()> {
    let timing = Timing::now(live);
    match kind {
        "READY" => on_ready(state, ix, data).await,
        "GUILD_CREATE" => on_guild_create(state, ix, data, timing).await,
        "GUILD_UPDATE" => on_guild_update(state, data, timing).await,
        "GUILD_DELETE" => on_guild_delete(state, ix, data, timing).await,
        "GUILD_ROLE_CREATE" | "GUILD_ROLE_UPDATE" => on_role_upsert(state, data, timing).await,
        "GUILD_ROLE_DELETE" => on_role_delete(state, data, timing).await,
        "GUILD_MEMBER_ADD" | "GUILD_MEMBER_UPDATE" => on_member_upsert(state, data, timing).await,
        "GUILD_MEMBER_REMOVE" => on_member_remove(state, data, timing).await,
        "GUILD_MEMBERS_CHUNK" => on_members_chunk(state, ix, data, timing).await,
        "CHANNEL_CREATE" => on_channel_create(state, data, timing).await,
        "CHANNEL_UPDATE" => on_channel_update(state, data, timing).await,
        "CHANNEL_DELETE" => on_channel_delete(state, data, timing).await,
        "THREAD_CREATE" => on_thread_upsert(state, data, timing, true).await,
        "THREAD_UPDATE" => on_thread_upsert(state, data, timing, false).await,
        "THREAD_DELETE" => on_thread_delete(state, data, timing).await,
        "THREAD_LIST_SYNC" => on_thread_list_sync(state, data, timing).await,
        "MESSAGE_CREATE" => on_message_create(state, data, timing).await,
        "MESSAGE_UPDATE" => on_message_update(state, data, timing).await,
        "MESSAGE_DELETE" => on_message_delete(state, data, timing).await,
        "MESSAGE_DELETE_BULK" => on_message_delete_bulk(state, data, timing).await,
        "MESSAGE_REACTION_ADD" => on_reaction_add(state, data, timing).await,
        "MESSAGE_REACTION_REMOVE" => on_reaction_remove(state, data, timing).await,
        "MESSAGE_REACTION_REMOVE_ALL" => on_reaction_remove_all(state, data, timing).await,
        "MESSAGE_REACTION_REMOVE_EMOJI" => on_reaction_remove_emoji(state, data, timing).await,
        "USER_UPDATE" => on_user_update(state, data, timing).await,
        _ => Ok(()),
    }
}

async fn on_ready(state: &Arc<State>, ix: AccountIx, data: Value) -> Result<()> {
    let ready: Ready = serde_json::from_value(data)?;
    let account = &state.accounts[ix];
    let _ = account.user_id.set(ready.user.id);
    state
        .db
        .add_user(UserRecord::from_wire(&ready.user), Timing::now(true))
        .await?;

    let mut pending = account.pending_guilds.lock().await;
    pending.clear();
    pending.extend(ready.guilds.iter().map(|g| g.id));
    let bootstrapped = pending.is_empty();
    drop(pending);

    info!(
        "[{}] ready as {} ({} guilds)",
        account.name,
        ready.user.display_name(),
        ready.guilds.len()
    );
    if bootstrapped {
        account.ready.store(true, Ordering::SeqCst);
        check_all_ready(state);
    }
    Ok(())
}

async fn on_guild_create(
    state: &Arc<State>,
    ix: AccountIx,
    data: Value,
    timing: Timing,
) -> Result<()> {
    let gc: GuildCreate = serde_json::from_value(data)?;
    let guild_id = gc.guild.id;
    let account = &state.accounts[ix];

    state
        .db
        .add_guild(GuildRecord::from_wire(&gc.guild), timing)
        .await?;
    for role in &gc.roles {
        state
            .db
            .add_role(RoleRecord::from_wire(guild_id, role), timing)
            .await?;
    }
    for channel in gc.channels.iter().chain(gc.threads.iter()) {
        state
            .db
            .add_channel(ChannelRecord::from_wire(channel), timing)
            .await?;
    }
    for member in &gc.members {
        if let Some(user) = &member.user {
            state.db.add_user(UserRecord::from_wire(user), timing).await?;
        }
        if let Some(record) = MemberRecord::from_wire(guild_id, member) {
            state.db.add_member(record, timing).await?;
        }
    }

    // runtime cache: the guild itself
    let our_id = account.user_id.get().copied();
    let our_roles: HashSet<_> = gc
        .members
        .iter()
        .find(|m| m.user.as_ref().map(|u| u.id) == our_id)
        .map(|m| m.roles.iter().copied().collect())
        .unwrap_or_default();
    {
        let mut guild = state.guilds.entry(guild_id).or_insert_with(|| CachedGuild {
            id: guild_id,
            name: gc.guild.name.clone(),
            owner_id: gc.guild.owner_id,
            roles: Default::default(),
            accounts: Default::default(),
            channels: Default::default(),
            member_ids: None,
        });
        guild.name = gc.guild.name.clone();
        guild.owner_id = gc.guild.owner_id;
        guild.roles = gc.roles.iter().map(|r| (r.id, r.permissions)).collect();
        if let Some(user_id) = our_id {
            guild.accounts.insert(
                ix,
                GuildAccountRecord {
                    user_id,
                    role_ids: our_roles,
                    permissions: Permissions::NONE,
                },
            );
        }
    }

    // index the channels and attach startup-active threads
    for channel in &gc.channels {
        if !channel.kind.is_text_like() && channel.kind != hagfish_types::ChannelKind::Category {
            continue;
        }
        if let Some(mut guild) = state.guilds.get_mut(&guild_id) {
            guild.channels.insert(channel.id);
        }
        state
            .channels
            .entry(channel.id)
            .and_modify(|cached| {
                cached.apply_update(channel);
            })
            .or_insert_with(|| CachedChannel::from_wire(channel, guild_id));
    }
    for thread in &gc.threads {
        let Some(info) = ThreadInfo::from_wire(thread) else {
            continue;
        };
        if let Some(mut parent) = state.channels.get_mut(&info.parent_id) {
            if let Some(sync_info) = &mut parent.sync_info {
                if !sync_info.active_threads.iter().any(|t| t.id == info.id) {
                    sync_info.active_threads.push(info);
                }
            }
        }
    }

    // derive this guild's permission picture, which also spawns syncs for
    // channels that just became reachable after the barrier
    permissions_changed(state, guild_id);

    let mut pending = account.pending_guilds.lock().await;
    pending.remove(&guild_id);
    let bootstrapped = pending.is_empty();
    drop(pending);
    if bootstrapped && !account.ready.load(Ordering::SeqCst) {
        account.ready.store(true, Ordering::SeqCst);
        debug!("[{}] bootstrapped", account.name);
        check_all_ready(state);
    }

    // a member set lost with a session gets re-enumerated here
    if state.all_ready.load(Ordering::SeqCst)
        && state.config.wants_guild(guild_id)
        && state
            .guilds
            .get(&guild_id)
            .is_some_and(|g| g.member_ids.is_none())
    {
        request_guild_members(state, guild_id);
    }
    Ok(())
}

async fn on_guild_update(state: &Arc<State>, data: Value, timing: Timing) -> Result<()> {
    let guild: Guild = serde_json::from_value(data)?;
    state
        .db
        .add_guild(GuildRecord::from_wire(&guild), timing)
        .await?;
    if let Some(mut cached) = state.guilds.get_mut(&guild.id) {
        cached.name = guild.name.clone();
        cached.owner_id = guild.owner_id;
    }
    permissions_changed(state, guild.id);
    Ok(())
}

async fn on_guild_delete(
    state: &Arc<State>,
    ix: AccountIx,
    data: Value,
    timing: Timing,
) -> Result<()> {
    let guild_id = GuildId(id_field(&data, "id")?);
    let unavailable = data
        .get("unavailable")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if unavailable {
        // an outage, not a removal
        return Ok(());
    }
    let abandoned = {
        match state.guilds.get_mut(&guild_id) {
            Some(mut guild) => {
                guild.accounts.remove(&ix);
                guild.accounts.is_empty()
            }
            None => true,
        }
    };
    permissions_changed(state, guild_id);
    if abandoned {
        state
            .db
            .mark_deleted(EntityKind::Guild, guild_id.into_inner() as i64, timing)
            .await?;
    }
    Ok(())
}

async fn on_role_upsert(state: &Arc<State>, data: Value, timing: Timing) -> Result<()> {
    let event: GuildRoleEvent = serde_json::from_value(data)?;
    state
        .db
        .add_role(RoleRecord::from_wire(event.guild_id, &event.role), timing)
        .await?;
    if let Some(mut guild) = state.guilds.get_mut(&event.guild_id) {
        guild.roles.insert(event.role.id, event.role.permissions);
    }
    permissions_changed(state, event.guild_id);
    Ok(())
}

async fn on_role_delete(state: &Arc<State>, data: Value, timing: Timing) -> Result<()> {
    let event: GuildRoleDelete = serde_json::from_value(data)?;
    state
        .db
        .mark_deleted(EntityKind::Role, event.role_id.into_inner() as i64, timing)
        .await?;
    if let Some(mut guild) = state.guilds.get_mut(&event.guild_id) {
        guild.roles.remove(&event.role_id);
        for record in guild.accounts.values_mut() {
            record.role_ids.remove(&event.role_id);
        }
    }
    permissions_changed(state, event.guild_id);
    Ok(())
}

async fn on_member_upsert(state: &Arc<State>, data: Value, timing: Timing) -> Result<()> {
    let event: GuildMemberEvent = serde_json::from_value(data)?;
    let Some(user) = &event.member.user else {
        return Ok(());
    };
    state.db.add_user(UserRecord::from_wire(user), timing).await?;
    if let Some(record) = MemberRecord::from_wire(event.guild_id, &event.member) {
        state.db.add_member(record, timing).await?;
    }

    let mut ours = false;
    if let Some(mut guild) = state.guilds.get_mut(&event.guild_id) {
        if let Some(members) = &mut guild.member_ids {
            members.insert(user.id);
        }
        for record in guild.accounts.values_mut() {
            if record.user_id == user.id {
                record.role_ids = event.member.roles.iter().copied().collect();
                ours = true;
            }
        }
    }
    if ours {
        // our own roles changed; eligibility may have moved
        permissions_changed(state, event.guild_id);
    }
    Ok(())
}

async fn on_member_remove(state: &Arc<State>, data: Value, timing: Timing) -> Result<()> {
    let event: GuildMemberRemove = serde_json::from_value(data)?;
    state
        .db
        .member_leave(event.guild_id, event.user.id, timing)
        .await?;

    let mut ours = false;
    if let Some(mut guild) = state.guilds.get_mut(&event.guild_id) {
        if let Some(members) = &mut guild.member_ids {
            members.remove(&event.user.id);
        }
        let removed: Vec<AccountIx> = guild
            .accounts
            .iter()
            .filter(|(_, r)| r.user_id == event.user.id)
            .map(|(ix, _)| *ix)
            .collect();
        for ix in removed {
            guild.accounts.remove(&ix);
            ours = true;
        }
    }
    if ours {
        permissions_changed(state, event.guild_id);
    }
    Ok(())
}

async fn on_members_chunk(
    state: &Arc<State>,
    ix: AccountIx,
    data: Value,
    timing: Timing,
) -> Result<()> {
    let chunk: GuildMembersChunk = serde_json::from_value(data)?;
    for member in &chunk.members {
        if let Some(user) = &member.user {
            state.db.add_user(UserRecord::from_wire(user), timing).await?;
        }
        if let Some(record) = MemberRecord::from_wire(chunk.guild_id, member) {
            state.db.add_member(record, timing).await?;
        }
    }

    let finished = {
        let Some(mut request) = state.member_requests.get_mut(&chunk.guild_id) else {
            return Ok(());
        };
        if request.account != ix {
            return Ok(());
        }
        request
            .user_ids
            .extend(chunk.members.iter().filter_map(|m| m.user.as_ref()).map(|u| u.id));
        chunk.is_last()
    };
    if !finished {
        return Ok(());
    }

    let Some((_, request)) = state.member_requests.remove(&chunk.guild_id) else {
        return Ok(());
    };
    state.accounts[ix].gateway_ops.fetch_sub(1, Ordering::SeqCst);
    debug!(
        "[{}] member enumeration for {} finished with {} members",
        state.accounts[ix].name,
        chunk.guild_id,
        request.user_ids.len()
    );
    if let Some(mut guild) = state.guilds.get_mut(&chunk.guild_id) {
        guild.member_ids = Some(request.user_ids.iter().copied().collect());
    }
    state
        .db
        .sync_guild_members(chunk.guild_id, request.user_ids, timing)
        .await?;
    Ok(())
}

async fn on_channel_create(state: &Arc<State>, data: Value, timing: Timing) -> Result<()> {
    let channel: Channel = serde_json::from_value(data)?;
    state
        .db
        .add_channel(ChannelRecord::from_wire(&channel), timing)
        .await?;
    let Some(guild_id) = channel.guild_id else {
        return Ok(());
    };
    if let Some(mut guild) = state.guilds.get_mut(&guild_id) {
        guild.channels.insert(channel.id);
    }
    state
        .channels
        .entry(channel.id)
        .or_insert_with(|| CachedChannel::from_wire(&channel, guild_id));
    update_channel_access(state, guild_id, channel.id);
    Ok(())
}

async fn on_channel_update(state: &Arc<State>, data: Value, timing: Timing) -> Result<()> {
    let channel: Channel = serde_json::from_value(data)?;
    state
        .db
        .add_channel(ChannelRecord::from_wire(&channel), timing)
        .await?;
    let Some(guild_id) = channel.guild_id else {
        return Ok(());
    };
    let overwrites_changed = match state.channels.get_mut(&channel.id) {
        // compare incoming overwrites to the previously cached ones;
        // recompute only on inequality
        Some(mut cached) => cached.apply_update(&channel),
        None => {
            state
                .channels
                .insert(channel.id, CachedChannel::from_wire(&channel, guild_id));
            true
        }
    };
    if overwrites_changed {
        update_channel_access(state, guild_id, channel.id);
    }
    Ok(())
}

async fn on_channel_delete(state: &Arc<State>, data: Value, timing: Timing) -> Result<()> {
    let channel_id = ChannelId(id_field(&data, "id")?);
    state
        .db
        .mark_deleted(EntityKind::Channel, channel_id.into_inner() as i64, timing)
        .await?;
    for account in &state.accounts {
        for registry in [&account.message_syncs, &account.private_thread_syncs] {
            registry.retain(|(parent, _), operation| {
                if *parent == channel_id {
                    operation.abort();
                    false
                } else {
                    true
                }
            });
        }
        for registry in [
            &account.public_list_syncs,
            &account.private_list_syncs,
            &account.joined_private_list_syncs,
        ] {
            if let Some((_, operation)) = registry.remove(&channel_id) {
                operation.abort();
            }
        }
    }
    Ok(())
}

async fn on_thread_upsert(
    state: &Arc<State>,
    data: Value,
    timing: Timing,
    created: bool,
) -> Result<()> {
    let thread: Channel = serde_json::from_value(data)?;
    state
        .db
        .add_channel(ChannelRecord::from_wire(&thread), timing)
        .await?;
    if created && state.all_ready.load(Ordering::SeqCst) {
        if let Some(info) = ThreadInfo::from_wire(&thread) {
            spawn_message_sync(state, info.parent_id, Some(info));
        }
    }
    Ok(())
}

async fn on_thread_delete(state: &Arc<State>, data: Value, timing: Timing) -> Result<()> {
    let thread_id = ChannelId(id_field(&data, "id")?);
    let parent_id = id_field(&data, "parent_id").ok().map(ChannelId);
    state
        .db
        .mark_deleted(EntityKind::Channel, thread_id.into_inner() as i64, timing)
        .await?;
    if let Some(parent_id) = parent_id {
        for account in &state.accounts {
            for registry in [&account.message_syncs, &account.private_thread_syncs] {
                if let Some((_, operation)) = registry.remove(&(parent_id, thread_id)) {
                    operation.abort();
                }
            }
        }
    }
    Ok(())
}

/// also sent when an account first gains access to a channel with active
/// threads; spawn syncs for anything not already covered
async fn on_thread_list_sync(state: &Arc<State>, data: Value, timing: Timing) -> Result<()> {
    let event: ThreadListSync = serde_json::from_value(data)?;
    for thread in &event.threads {
        state
            .db
            .add_channel(ChannelRecord::from_wire(thread), timing)
            .await?;
        if state.all_ready.load(Ordering::SeqCst) {
            if let Some(info) = ThreadInfo::from_wire(thread) {
                spawn_message_sync(state, info.parent_id, Some(info));
            }
        }
    }
    Ok(())
}

async fn on_message_create(state: &Arc<State>, data: Value, timing: Timing) -> Result<()> {
    let message: Message = serde_json::from_value(data)?;
    let Some(record) = MessageRecord::from_wire(&message) else {
        debug!("message {} has no usable author, skipping", message.id);
        return Ok(());
    };
    if record.webhook.is_none() {
        if let Some(author) = &message.author {
            state.db.add_user(UserRecord::from_wire(author), timing).await?;
        }
    }
    state.db.add_message(record, timing).await?;
    if let Some(mut channel) = state.channels.get_mut(&message.channel_id) {
        channel.last_message_id = Some(message.id);
    }
    Ok(())
}

async fn on_message_update(state: &Arc<State>, data: Value, timing: Timing) -> Result<()> {
    let update: MessageUpdate = serde_json::from_value(data)?;
    if update.edited_timestamp.is_some() && update.webhook_id.is_none() {
        if let Some(author) = &update.author {
            state.db.add_user(UserRecord::from_wire(author), timing).await?;
        }
    }
    state
        .db
        .patch_message(MessagePatch::from_wire(&update), timing)
        .await?;
    Ok(())
}

async fn on_message_delete(state: &Arc<State>, data: Value, timing: Timing) -> Result<()> {
    let event: MessageDelete = serde_json::from_value(data)?;
    state
        .db
        .mark_deleted(EntityKind::Message, event.id.into_inner() as i64, timing)
        .await?;
    Ok(())
}

async fn on_message_delete_bulk(state: &Arc<State>, data: Value, timing: Timing) -> Result<()> {
    let event: MessageDeleteBulk = serde_json::from_value(data)?;
    for id in event.ids {
        state
            .db
            .mark_deleted(EntityKind::Message, id.into_inner() as i64, timing)
            .await?;
    }
    Ok(())
}

fn reaction_kind(event: &ReactionGatewayEvent) -> ReactionKind {
    if event.burst {
        ReactionKind::Burst
    } else {
        ReactionKind::Normal
    }
}

async fn on_reaction_add(state: &Arc<State>, data: Value, timing: Timing) -> Result<()> {
    if !state.config.reactions {
        return Ok(());
    }
    let event: ReactionGatewayEvent = serde_json::from_value(data)?;
    state
        .db
        .add_reaction(
            event.message_id,
            event.emoji.clone(),
            reaction_kind(&event),
            event.user_id,
            timing,
        )
        .await?;
    Ok(())
}

async fn on_reaction_remove(state: &Arc<State>, data: Value, timing: Timing) -> Result<()> {
    if !state.config.reactions {
        return Ok(());
    }
    let event: ReactionGatewayEvent = serde_json::from_value(data)?;
    state
        .db
        .remove_reaction(
            event.message_id,
            event.emoji.clone(),
            reaction_kind(&event),
            event.user_id,
            timing,
        )
        .await?;
    Ok(())
}

async fn on_reaction_remove_all(state: &Arc<State>, data: Value, timing: Timing) -> Result<()> {
    if !state.config.reactions {
        return Ok(());
    }
    let event: ReactionRemoveAll = serde_json::from_value(data)?;
    state.db.remove_all_reactions(event.message_id, timing).await?;
    Ok(())
}

async fn on_reaction_remove_emoji(state: &Arc<State>, data: Value, timing: Timing) -> Result<()> {
    if !state.config.reactions {
        return Ok(());
    }
    let event: ReactionRemoveEmoji = serde_json::from_value(data)?;
    state
        .db
        .remove_emoji_reactions(event.message_id, event.emoji, timing)
        .await?;
    Ok(())
}

async fn on_user_update(state: &Arc<State>, data: Value, timing: Timing) -> Result<()> {
    let user: User = serde_json::from_value(data)?;
    state.db.add_user(UserRecord::from_wire(&user), timing).await?;
    Ok(())
}

/// pull a snowflake field out of a partially-typed payload
fn id_field(data: &Value, field: &str) -> Result<u64> {
    let value = data.get(field).ok_or_else(|| {
        crate::error::Error::Protocol(format!("dispatch payload missing {field}"))
    })?;
    match value {
        Value::String(s) => s
            .parse()
            .map_err(|_| crate::error::Error::Protocol(format!("bad {field}"))),
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| crate::error::Error::Protocol(format!("bad {field}"))),
        _ => Err(crate::error::Error::Protocol(format!("bad {field}"))),
    }
}
