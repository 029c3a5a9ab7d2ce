//! the sync orchestrator: decides which account fetches what, starts and
//! aborts backfills, and merges gateway events with rest pagination into
//! one ordered stream of database writes

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use hagfish_types::gateway::op;
use hagfish_types::{ChannelId, GatewayPayload, GuildId, Permissions, RequestGuildMembers, UserId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{AccountIx, CachedChannel, CachedGuild, ThreadInfo};
use crate::config::Config;
use crate::db::Db;
use crate::gateway::GatewayEvent;
use crate::perms;
use crate::rest::ArchivedScope;
use crate::tracker::{least_loaded, Account, Operation};

pub mod dispatch;
pub mod messages;
pub mod threads;

/// process-wide shared state; the runtime cache plus every account
pub struct State {
    pub config: Config,
    pub db: Db,
    pub accounts: Vec<Arc<Account>>,
    pub guilds: DashMap<GuildId, CachedGuild>,
    pub channels: DashMap<ChannelId, CachedChannel>,
    /// set once every configured account has bootstrapped
    pub all_ready: AtomicBool,
    bulk_started: AtomicBool,
    /// set when shutdown was forced by an unrecoverable error
    pub fatal: AtomicBool,
    pub shutdown: CancellationToken,
    /// in-flight gateway member enumerations, keyed by guild
    pub member_requests: DashMap<GuildId, MemberRequest>,
    op_ids: AtomicU64,
}

pub struct MemberRequest {
    pub account: AccountIx,
    pub user_ids: Vec<UserId>,
}

impl State {
    pub fn new(
        config: Config,
        db: Db,
        accounts: Vec<Arc<Account>>,
        shutdown: CancellationToken,
    ) -> State {
        State {
            config,
            db,
            accounts,
            guilds: DashMap::new(),
            channels: DashMap::new(),
            all_ready: AtomicBool::new(false),
            bulk_started: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
            shutdown,
            member_requests: DashMap::new(),
            op_ids: AtomicU64::new(1),
        }
    }

    pub fn next_op_id(&self) -> u64 {
        self.op_ids.fetch_add(1, Ordering::Relaxed)
    }
}

/// entry point for everything one gateway connection emits; called
/// sequentially per account so dispatch order is preserved
pub async fn handle_event(state: &Arc<State>, ix: AccountIx, event: GatewayEvent) {
    let account = state.accounts[ix].clone();
    match event {
        GatewayEvent::Connecting => debug!("[{}] connecting", account.name),
        GatewayEvent::ConnectionLost {
            was_connected,
            code,
            reason,
        } => {
            debug!(
                "[{}] connection lost (connected={was_connected}, code={code}, {reason})",
                account.name
            );
        }
        GatewayEvent::Dispatch { kind, data, live } => {
            if let Err(err) = dispatch::handle_dispatch(state, ix, &kind, data, live).await {
                if !err.is_abort() && !fail_fatal(state, &err) {
                    warn!("[{}] failed handling {kind}: {err}", account.name);
                }
            }
        }
        GatewayEvent::SessionLost => on_session_lost(state, ix),
        GatewayEvent::Fatal(err) => {
            error!("[{}] gateway failed: {err}", account.name);
            remove_account(state, ix);
        }
    }
}

/// a broken store invariant cannot be recovered locally; force shutdown
pub fn fail_fatal(state: &Arc<State>, err: &crate::error::Error) -> bool {
    if matches!(err, crate::error::Error::TimestampRegression(_)) {
        error!("{err}; shutting down");
        state.fatal.store(true, Ordering::SeqCst);
        state.shutdown.cancel();
        true
    } else {
        false
    }
}

/// any in-flight member enumeration on this account died with the session
fn on_session_lost(state: &Arc<State>, ix: AccountIx) {
    let account = &state.accounts[ix];
    let lost: Vec<GuildId> = state
        .member_requests
        .iter()
        .filter(|entry| entry.value().account == ix)
        .map(|entry| *entry.key())
        .collect();
    for guild_id in lost {
        state.member_requests.remove(&guild_id);
        account.gateway_ops.fetch_sub(1, Ordering::SeqCst);
        if let Some(mut guild) = state.guilds.get_mut(&guild_id) {
            guild.member_ids = None;
        }
        debug!(
            "[{}] member enumeration for {guild_id} lost with the session",
            account.name
        );
    }
}

/// drop an account whose credentials no longer work, handing its operations
/// to the remaining accounts
pub fn remove_account(state: &Arc<State>, ix: AccountIx) {
    let account = &state.accounts[ix];
    if account.removed.swap(true, Ordering::SeqCst) {
        return;
    }
    warn!("[{}] account removed", account.name);
    if let Some(gateway) = account.gateway.get() {
        gateway.destroy();
    }

    let mut message_ops: Vec<Operation> = Vec::new();
    for registry in [&account.message_syncs, &account.private_thread_syncs] {
        for entry in registry.iter() {
            message_ops.push(entry.value().clone());
        }
    }
    let mut list_ops: Vec<(ChannelId, ArchivedScope)> = Vec::new();
    for (registry, scope) in [
        (&account.public_list_syncs, ArchivedScope::Public),
        (&account.private_list_syncs, ArchivedScope::Private),
        (&account.joined_private_list_syncs, ArchivedScope::JoinedPrivate),
    ] {
        for entry in registry.iter() {
            list_ops.push((*entry.key(), scope));
        }
    }
    account.abort_all();

    // drop the account from every cached permission set so replacements
    // pick someone else
    for mut channel in state.channels.iter_mut() {
        channel.accounts_with_read.remove(&ix);
        channel.accounts_with_manage_threads.remove(&ix);
    }
    for mut guild in state.guilds.iter_mut() {
        guild.accounts.remove(&ix);
    }

    for operation in message_ops {
        spawn_message_sync(state, operation.parent, operation.thread);
    }
    for (channel_id, scope) in list_ops {
        spawn_thread_list_sync(state, channel_id, scope);
    }

    if state.accounts.iter().all(|a| !a.is_usable()) {
        error!("no usable accounts remain, shutting down");
        state.fatal.store(true, Ordering::SeqCst);
        state.shutdown.cancel();
    } else {
        check_all_ready(state);
    }
}

/// flip the all-ready barrier once every usable account has seen a
/// GUILD_CREATE for everything its READY listed
pub fn check_all_ready(state: &Arc<State>) {
    if state.all_ready.load(Ordering::SeqCst) {
        return;
    }
    let ready = state
        .accounts
        .iter()
        .all(|a| !a.is_usable() || a.ready.load(Ordering::SeqCst));
    if !ready {
        return;
    }
    state.all_ready.store(true, Ordering::SeqCst);
    info!("all accounts ready");
    if !state.bulk_started.swap(true, Ordering::SeqCst) {
        let state = state.clone();
        tokio::spawn(async move { bulk_pass(&state).await });
    }
}

/// the initial pass: member enumerations plus the backfill trio for every
/// accessible channel
async fn bulk_pass(state: &Arc<State>) {
    info!("starting initial sync pass");
    let guild_ids: Vec<GuildId> = state
        .guilds
        .iter()
        .map(|g| *g.key())
        .filter(|id| state.config.wants_guild(*id))
        .collect();

    for guild_id in guild_ids {
        request_guild_members(state, guild_id);

        if !state.config.backfill {
            continue;
        }
        let channel_ids: Vec<ChannelId> = match state.guilds.get(&guild_id) {
            Some(guild) => {
                info!("syncing {} ({guild_id})", guild.name);
                guild.channels.iter().copied().collect()
            }
            None => continue,
        };
        for channel_id in channel_ids {
            schedule_initial_channel_sync(state, channel_id);
        }
    }
}

/// ask the least gateway-loaded member account to enumerate a guild
pub fn request_guild_members(state: &Arc<State>, guild_id: GuildId) {
    if state.member_requests.contains_key(&guild_id) {
        return;
    }
    let member_ixs: Vec<AccountIx> = match state.guilds.get(&guild_id) {
        Some(guild) => guild.accounts.keys().copied().collect(),
        None => return,
    };
    let Some(account) = least_loaded(
        member_ixs.iter().map(|ix| state.accounts[*ix].as_ref()),
        |a| a.gateway_ops.load(Ordering::SeqCst),
    ) else {
        return;
    };
    let payload = GatewayPayload::new(
        op::REQUEST_GUILD_MEMBERS,
        serde_json::json!(RequestGuildMembers {
            guild_id,
            query: String::new(),
            limit: 0,
        }),
    );
    let Some(gateway) = account.gateway.get() else {
        return;
    };
    match gateway.send(payload) {
        Ok(()) => {
            account.gateway_ops.fetch_add(1, Ordering::SeqCst);
            state.member_requests.insert(
                guild_id,
                MemberRequest {
                    account: account.ix,
                    user_ids: Vec::new(),
                },
            );
            debug!("[{}] requested members for {guild_id}", account.name);
        }
        Err(err) => debug!("[{}] member request failed: {err}", account.name),
    }
}

/// the initial trio for one channel: archived-thread enumeration, message
/// syncs for startup-active threads, and the channel's own message sync
pub fn schedule_initial_channel_sync(state: &Arc<State>, channel_id: ChannelId) {
    let (threads, has_read, has_manage) = {
        let Some(mut channel) = state.channels.get_mut(&channel_id) else {
            return;
        };
        if !channel.kind.is_text_like() {
            return;
        }
        if channel.accounts_with_read.is_empty() {
            // keep sync_info; a later permission gain schedules the trio
            return;
        }
        let has_manage = !channel.accounts_with_manage_threads.is_empty();
        let info = channel.sync_info.take();
        if let Some(count) = info.as_ref().and_then(|i| i.message_count) {
            debug!("channel {} ({}) reports ~{count} messages", channel.id, channel.name);
        }
        (
            info.map(|i| i.active_threads).unwrap_or_default(),
            true,
            has_manage,
        )
    };
    if !has_read {
        return;
    }

    spawn_thread_list_sync(state, channel_id, ArchivedScope::Public);
    for thread in threads {
        spawn_message_sync(state, channel_id, Some(thread));
    }
    spawn_message_sync(state, channel_id, None);
    if has_manage {
        spawn_thread_list_sync(state, channel_id, ArchivedScope::Private);
    } else {
        // without manage-threads, only threads this account was added to
        // are reachable
        spawn_thread_list_sync(state, channel_id, ArchivedScope::JoinedPrivate);
    }
}

/// start a message backfill for a channel or one of its threads, on the
/// least rest-loaded eligible account
///
/// enforces at most one message sync per (parent, target) tuple across all
/// accounts by scanning every account's registries first.
pub fn spawn_message_sync(state: &Arc<State>, parent_id: ChannelId, thread: Option<ThreadInfo>) {
    if !state.config.backfill {
        return;
    }
    let target_id = thread.as_ref().map(|t| t.id).unwrap_or(parent_id);
    if state
        .accounts
        .iter()
        .any(|a| a.has_message_sync(parent_id, target_id))
    {
        return;
    }

    let private = thread.as_ref().is_some_and(|t| t.private);
    let (eligible, last_message_id) = {
        let Some(channel) = state.channels.get(&parent_id) else {
            return;
        };
        if !state.config.wants_guild(channel.guild_id) {
            return;
        }
        let eligible: Vec<AccountIx> = if private {
            channel.accounts_with_manage_threads.iter().copied().collect()
        } else {
            channel.accounts_with_read.iter().copied().collect()
        };
        let last = match &thread {
            Some(t) => t.last_message_id,
            None => channel.last_message_id,
        };
        (eligible, last)
    };
    let Some(account) = least_loaded(
        eligible.iter().map(|ix| state.accounts[*ix].as_ref()),
        |a| a.rest_ops.load(Ordering::SeqCst),
    ) else {
        return;
    };
    let account = state.accounts[account.ix].clone();

    let token = state.shutdown.child_token();
    let op_id = state.next_op_id();
    let operation = Operation {
        id: op_id,
        token: token.clone(),
        parent: parent_id,
        target: target_id,
        thread: thread.clone(),
    };
    let registry = if private {
        &account.private_thread_syncs
    } else {
        &account.message_syncs
    };
    registry.insert((parent_id, target_id), operation);
    account.rest_ops.fetch_add(1, Ordering::SeqCst);
    debug!(
        "[{}] message sync registered for {}",
        account.name,
        thread
            .as_ref()
            .map(|t| format!("thread {} ({})", t.id, t.name))
            .unwrap_or_else(|| format!("channel {parent_id}")),
    );

    let target = messages::MessageSyncTarget {
        parent_id,
        channel_id: target_id,
        last_message_id,
        private,
        thread,
    };
    let state = state.clone();
    tokio::spawn(async move {
        messages::run_message_sync(state, account, target, token, op_id).await;
    });
}

/// start an archived-thread enumeration on the least rest-loaded account of
/// the appropriate permission set
pub fn list_registry(
    account: &Account,
    scope: ArchivedScope,
) -> &DashMap<ChannelId, Operation> {
    match scope {
        ArchivedScope::Public => &account.public_list_syncs,
        ArchivedScope::Private => &account.private_list_syncs,
        ArchivedScope::JoinedPrivate => &account.joined_private_list_syncs,
    }
}

pub fn spawn_thread_list_sync(state: &Arc<State>, channel_id: ChannelId, scope: ArchivedScope) {
    if !state.config.backfill {
        return;
    }
    if state
        .accounts
        .iter()
        .any(|a| list_registry(a, scope).contains_key(&channel_id))
    {
        return;
    }

    let eligible: Vec<AccountIx> = {
        let Some(channel) = state.channels.get(&channel_id) else {
            return;
        };
        if !state.config.wants_guild(channel.guild_id) {
            return;
        }
        match scope {
            ArchivedScope::Private => {
                channel.accounts_with_manage_threads.iter().copied().collect()
            }
            _ => channel.accounts_with_read.iter().copied().collect(),
        }
    };
    let Some(account) = least_loaded(
        eligible.iter().map(|ix| state.accounts[*ix].as_ref()),
        |a| a.rest_ops.load(Ordering::SeqCst),
    ) else {
        return;
    };
    let account = state.accounts[account.ix].clone();

    let token = state.shutdown.child_token();
    let op_id = state.next_op_id();
    list_registry(&account, scope).insert(
        channel_id,
        Operation {
            id: op_id,
            token: token.clone(),
            parent: channel_id,
            target: channel_id,
            thread: None,
        },
    );
    account.rest_ops.fetch_add(1, Ordering::SeqCst);

    let state = state.clone();
    tokio::spawn(async move {
        threads::run_thread_list_sync(state, account, channel_id, scope, token, op_id).await;
    });
}

/// recompute every per-channel permission set of a guild and act on the
/// differences; the entry point for role/member/overwrite changes
pub fn permissions_changed(state: &Arc<State>, guild_id: GuildId) {
    let channel_ids: Vec<ChannelId> = {
        let Some(mut guild) = state.guilds.get_mut(&guild_id) else {
            return;
        };
        let guild = &mut *guild;
        let records: Vec<(AccountIx, Permissions)> = guild
            .accounts
            .iter()
            .map(|(ix, record)| (*ix, perms::guild_permissions(guild, record)))
            .collect();
        for (ix, permissions) in records {
            if let Some(record) = guild.accounts.get_mut(&ix) {
                record.permissions = permissions;
            }
        }
        guild.channels.iter().copied().collect()
    };
    for channel_id in channel_ids {
        update_channel_access(state, guild_id, channel_id);
    }
}

/// recompute one channel's permission sets; abort and hand off syncs for
/// accounts that lost access, spawn the trio when a channel becomes
/// reachable at all
pub fn update_channel_access(state: &Arc<State>, guild_id: GuildId, channel_id: ChannelId) {
    let (old_read, new_read, old_manage, new_manage) = {
        let Some(guild) = state.guilds.get(&guild_id) else {
            return;
        };
        let Some(mut channel) = state.channels.get_mut(&channel_id) else {
            return;
        };
        let mut new_read = HashSet::new();
        let mut new_manage = HashSet::new();
        for (ix, record) in &guild.accounts {
            if !state.accounts[*ix].is_usable() {
                continue;
            }
            let computed = perms::channel_permissions(&guild, &channel, record);
            if computed.contains(Permissions::READ) {
                new_read.insert(*ix);
            }
            if computed.contains(Permissions::MANAGE_THREADS) {
                new_manage.insert(*ix);
            }
        }
        let old_read = std::mem::replace(&mut channel.accounts_with_read, new_read.clone());
        let old_manage =
            std::mem::replace(&mut channel.accounts_with_manage_threads, new_manage.clone());
        (old_read, new_read, old_manage, new_manage)
    };

    let mut displaced: Vec<Operation> = Vec::new();

    for ix in old_read.difference(&new_read) {
        let account = &state.accounts[*ix];
        for registry in [&account.message_syncs, &account.private_thread_syncs] {
            registry.retain(|(parent, _), operation| {
                if *parent == channel_id {
                    operation.abort();
                    displaced.push(operation.clone());
                    false
                } else {
                    true
                }
            });
        }
        for registry in [&account.public_list_syncs, &account.joined_private_list_syncs] {
            if let Some((_, operation)) = registry.remove(&channel_id) {
                operation.abort();
            }
        }
        debug!("[{}] lost read on {channel_id}", account.name);
    }

    for ix in old_manage.difference(&new_manage) {
        let account = &state.accounts[*ix];
        account.private_thread_syncs.retain(|(parent, _), operation| {
            if *parent == channel_id {
                operation.abort();
                displaced.push(operation.clone());
                false
            } else {
                true
            }
        });
        if let Some((_, operation)) = account.private_list_syncs.remove(&channel_id) {
            operation.abort();
            spawn_thread_list_sync(state, channel_id, ArchivedScope::Private);
        }
        debug!("[{}] lost manage-threads on {channel_id}", account.name);
    }

    for operation in displaced {
        debug!("handing off message sync for {}", operation.target);
        spawn_message_sync(state, operation.parent, operation.thread);
    }

    if state.all_ready.load(Ordering::SeqCst) && old_read.is_empty() && !new_read.is_empty() {
        schedule_initial_channel_sync(state, channel_id);
    }
}

/// graceful shutdown: stop the gateways, abort every registered operation,
/// close the store
pub async fn shutdown(state: &Arc<State>) {
    info!("shutting down");
    state.shutdown.cancel();
    for account in &state.accounts {
        if let Some(gateway) = account.gateway.get() {
            gateway.destroy();
        }
        account.abort_all();
    }
    if let Err(err) = state.db.optimize().await {
        debug!("optimize on shutdown failed: {err}");
    }
    if let Err(err) = state.db.close().await {
        warn!("closing the database failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;

    use hagfish_types::ChannelKind;

    use crate::cache::GuildAccountRecord;
    use crate::config::{AccountConfig, Credentials};
    use crate::rest::Api;

    use super::*;

    async fn test_state(guild_filter: &[u64]) -> Arc<State> {
        let shutdown = CancellationToken::new();
        let config = Config {
            accounts: vec![AccountConfig {
                name: "bot1".to_owned(),
                credentials: Credentials::Bot("t".to_owned()),
            }],
            guild_filter: guild_filter.iter().copied().map(GuildId).collect(),
            backfill: true,
            reactions: true,
            stats: false,
            database: PathBuf::from(":memory:"),
        };
        let accounts = vec![Arc::new(Account::new(
            0,
            "bot1".to_owned(),
            Credentials::Bot("t".to_owned()),
            Api::new("Bot t".to_owned(), shutdown.clone()),
        ))];
        let db = crate::db::Db::open_in_memory().await.unwrap();
        Arc::new(State::new(config, db, accounts, shutdown))
    }

    fn cached_channel(id: u64, guild_id: u64, readers: &[AccountIx]) -> CachedChannel {
        CachedChannel {
            id: ChannelId(id),
            kind: ChannelKind::Text,
            guild_id: GuildId(guild_id),
            name: "general".to_owned(),
            overwrites: HashMap::new(),
            accounts_with_read: readers.iter().copied().collect(),
            accounts_with_manage_threads: Default::default(),
            last_message_id: None,
            sync_info: None,
        }
    }

    #[tokio::test]
    async fn at_most_one_message_sync_per_target() {
        let state = test_state(&[]).await;
        state
            .channels
            .insert(ChannelId(1), cached_channel(1, 10, &[0]));
        state.accounts[0].message_syncs.insert(
            (ChannelId(1), ChannelId(1)),
            Operation {
                id: 99,
                token: CancellationToken::new(),
                parent: ChannelId(1),
                target: ChannelId(1),
                thread: None,
            },
        );

        spawn_message_sync(&state, ChannelId(1), None);

        // the existing operation was found by the global scan; nothing new
        // was registered and no counter moved
        assert_eq!(state.accounts[0].message_syncs.len(), 1);
        assert_eq!(state.accounts[0].message_syncs.get(&(ChannelId(1), ChannelId(1))).unwrap().id, 99);
        assert_eq!(state.accounts[0].rest_ops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn guild_filter_gates_sync_spawns() {
        let state = test_state(&[10]).await;
        state
            .channels
            .insert(ChannelId(2), cached_channel(2, 20, &[0]));

        spawn_message_sync(&state, ChannelId(2), None);
        spawn_thread_list_sync(&state, ChannelId(2), ArchivedScope::Public);

        assert_eq!(state.accounts[0].message_syncs.len(), 0);
        assert_eq!(state.accounts[0].public_list_syncs.len(), 0);
    }

    #[tokio::test]
    async fn losing_read_aborts_the_running_sync() {
        let state = test_state(&[]).await;
        // the cached picture says account 0 can read, but the guild record
        // grants nothing, so recomputation revokes access
        let mut guild = CachedGuild {
            id: GuildId(10),
            name: "g".to_owned(),
            owner_id: UserId(999),
            roles: HashMap::new(),
            accounts: HashMap::new(),
            channels: Default::default(),
            member_ids: None,
        };
        guild.accounts.insert(
            0,
            GuildAccountRecord {
                user_id: UserId(7),
                role_ids: Default::default(),
                permissions: Permissions::NONE,
            },
        );
        guild.channels.insert(ChannelId(3));
        state.guilds.insert(GuildId(10), guild);
        state
            .channels
            .insert(ChannelId(3), cached_channel(3, 10, &[0]));

        let token = CancellationToken::new();
        state.accounts[0].message_syncs.insert(
            (ChannelId(3), ChannelId(3)),
            Operation {
                id: 1,
                token: token.clone(),
                parent: ChannelId(3),
                target: ChannelId(3),
                thread: None,
            },
        );

        update_channel_access(&state, GuildId(10), ChannelId(3));

        assert!(token.is_cancelled());
        assert_eq!(state.accounts[0].message_syncs.len(), 0);
        assert!(state
            .channels
            .get(&ChannelId(3))
            .unwrap()
            .accounts_with_read
            .is_empty());
    }
}
