use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::OnceLock;

use dashmap::DashMap;
use hagfish_types::{ChannelId, GuildId, UserId};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::ThreadInfo;
use crate::config::Credentials;
use crate::gateway::Gateway;
use crate::rest::Api;

/// one ongoing backfill, registered on exactly one account
///
/// carries enough context to restart the same work on another account.
#[derive(Debug, Clone)]
pub struct Operation {
    /// unique per operation, so a task only unregisters itself
    pub id: u64,
    pub token: CancellationToken,
    pub parent: ChannelId,
    pub target: ChannelId,
    pub thread: Option<ThreadInfo>,
}

impl Operation {
    pub fn abort(&self) {
        self.token.cancel();
    }
}

/// one configured account: credentials, connections, and the registries of
/// everything it is currently doing
pub struct Account {
    pub ix: usize,
    pub name: String,
    pub credentials: Credentials,
    pub api: Api,
    pub gateway: OnceLock<Gateway>,
    pub user_id: OnceLock<UserId>,

    /// guilds READY listed as unavailable, still awaiting GUILD_CREATE
    pub pending_guilds: Mutex<HashSet<GuildId>>,
    pub ready: AtomicBool,
    /// set once the account is dropped for bad credentials
    pub removed: AtomicBool,

    pub rest_ops: AtomicUsize,
    pub gateway_ops: AtomicUsize,

    /// keyed by (parent channel, channel-or-thread id)
    pub message_syncs: DashMap<(ChannelId, ChannelId), Operation>,
    pub private_thread_syncs: DashMap<(ChannelId, ChannelId), Operation>,
    /// keyed by parent channel
    pub public_list_syncs: DashMap<ChannelId, Operation>,
    pub private_list_syncs: DashMap<ChannelId, Operation>,
    pub joined_private_list_syncs: DashMap<ChannelId, Operation>,
}

impl Account {
    pub fn new(ix: usize, name: String, credentials: Credentials, api: Api) -> Account {
        Account {
            ix,
            name,
            credentials,
            api,
            gateway: OnceLock::new(),
            user_id: OnceLock::new(),
            pending_guilds: Mutex::new(HashSet::new()),
            ready: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            rest_ops: AtomicUsize::new(0),
            gateway_ops: AtomicUsize::new(0),
            message_syncs: DashMap::new(),
            private_thread_syncs: DashMap::new(),
            public_list_syncs: DashMap::new(),
            private_list_syncs: DashMap::new(),
            joined_private_list_syncs: DashMap::new(),
        }
    }

    pub fn is_usable(&self) -> bool {
        !self.removed.load(Ordering::SeqCst)
    }

    /// whether this account is running a message sync for the tuple, in
    /// either message registry
    pub fn has_message_sync(&self, parent: ChannelId, target: ChannelId) -> bool {
        self.message_syncs.contains_key(&(parent, target))
            || self.private_thread_syncs.contains_key(&(parent, target))
    }

    pub fn ongoing_count(&self) -> usize {
        self.message_syncs.len()
            + self.private_thread_syncs.len()
            + self.public_list_syncs.len()
            + self.private_list_syncs.len()
            + self.joined_private_list_syncs.len()
    }

    /// abort every registered operation; used on disconnect and shutdown
    pub fn abort_all(&self) {
        let mut aborted = 0usize;
        for registry in [&self.message_syncs, &self.private_thread_syncs] {
            registry.retain(|_, operation| {
                operation.abort();
                aborted += 1;
                false
            });
        }
        for registry in [
            &self.public_list_syncs,
            &self.private_list_syncs,
            &self.joined_private_list_syncs,
        ] {
            registry.retain(|_, operation| {
                operation.abort();
                aborted += 1;
                false
            });
        }
        if aborted > 0 {
            debug!("[{}] aborted {aborted} operations", self.name);
        }
    }
}

/// pick the least-loaded usable account by the given counter; ties break by
/// iteration order
pub fn least_loaded<'a, I>(accounts: I, counter: impl Fn(&Account) -> usize) -> Option<&'a Account>
where
    I: IntoIterator<Item = &'a Account>,
{
    let mut best: Option<(&Account, usize)> = None;
    for account in accounts {
        if !account.is_usable() {
            continue;
        }
        let load = counter(account);
        if best.is_none_or(|(_, b)| load < b) {
            best = Some((account, load));
        }
    }
    best.map(|(account, _)| account)
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;

    fn account(ix: usize, rest_ops: usize) -> Account {
        let account = Account::new(
            ix,
            format!("bot{ix}"),
            Credentials::Bot("t".into()),
            Api::new("Bot t".into(), CancellationToken::new()),
        );
        account.rest_ops.store(rest_ops, Ordering::SeqCst);
        account
    }

    #[test]
    fn least_loaded_prefers_lowest_counter() {
        let accounts = [account(0, 3), account(1, 1), account(2, 2)];
        let picked = least_loaded(accounts.iter(), |a| a.rest_ops.load(Ordering::SeqCst));
        assert_eq!(picked.unwrap().ix, 1);
    }

    #[test]
    fn least_loaded_breaks_ties_by_order() {
        let accounts = [account(0, 1), account(1, 1)];
        let picked = least_loaded(accounts.iter(), |a| a.rest_ops.load(Ordering::SeqCst));
        assert_eq!(picked.unwrap().ix, 0);
    }

    #[test]
    fn least_loaded_skips_removed_accounts() {
        let accounts = [account(0, 0), account(1, 5)];
        accounts[0].removed.store(true, Ordering::SeqCst);
        let picked = least_loaded(accounts.iter(), |a| a.rest_ops.load(Ordering::SeqCst));
        assert_eq!(picked.unwrap().ix, 1);
    }

    #[test]
    fn abort_all_sweeps_registries() {
        let account = account(0, 0);
        let token = CancellationToken::new();
        account.message_syncs.insert(
            (ChannelId(1), ChannelId(1)),
            Operation {
                id: 1,
                token: token.clone(),
                parent: ChannelId(1),
                target: ChannelId(1),
                thread: None,
            },
        );
        account.abort_all();
        assert!(token.is_cancelled());
        assert_eq!(account.ongoing_count(), 0);
    }
}
