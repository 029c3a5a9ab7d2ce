//! the message backfill loop for one channel or thread
//!
//! pages are fetched newest-first but inserted oldest-first, so the store's
//! max id is always a safe resume cursor, even across a crash mid-page.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use hagfish_types::{Message, MessageId, ReactionKind, Timing, User, UserId};
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::ThreadInfo;
use crate::db::{AddOutcome, MessageRecord, UserRecord};
use crate::error::{Error, Result};
use crate::sync::State;
use crate::tracker::Account;

const PAGE_LIMIT: u8 = 100;

/// how long a 403/404 "hang" may wait for the permission-change abort that
/// normally resolves it
const HANG_CEILING: Duration = Duration::from_secs(60 * 60);

pub struct MessageSyncTarget {
    pub parent_id: hagfish_types::ChannelId,
    pub channel_id: hagfish_types::ChannelId,
    pub last_message_id: Option<MessageId>,
    pub private: bool,
    pub thread: Option<ThreadInfo>,
}

pub async fn run_message_sync(
    state: Arc<State>,
    account: Arc<Account>,
    target: MessageSyncTarget,
    token: CancellationToken,
    op_id: u64,
) {
    let result = sync_messages(&state, &account, &target, &token).await;

    // only unregister our own entry; an aborter may already have swept it
    let key = (target.parent_id, target.channel_id);
    let registry = if target.private {
        &account.private_thread_syncs
    } else {
        &account.message_syncs
    };
    registry.remove_if(&key, |_, operation| operation.id == op_id);
    account.rest_ops.fetch_sub(1, Ordering::SeqCst);

    match result {
        Ok(()) => debug!("[{}] message sync for {} finished", account.name, target.channel_id),
        Err(Error::Aborted) => {
            debug!("[{}] message sync for {} aborted", account.name, target.channel_id)
        }
        Err(err) => {
            if !crate::sync::fail_fatal(&state, &err) {
                warn!(
                    "[{}] message sync for {} failed: {err}",
                    account.name, target.channel_id
                );
            }
        }
    }
}

async fn sync_messages(
    state: &Arc<State>,
    account: &Arc<Account>,
    target: &MessageSyncTarget,
    token: &CancellationToken,
) -> Result<()> {
    let stored = state.db.max_message_id(target.channel_id).await?;
    if let (Some(stored), Some(last)) = (stored, target.last_message_id) {
        if stored >= last {
            return Ok(());
        }
    }
    let mut cursor = stored.unwrap_or(MessageId(0));
    debug!(
        "[{}] backfilling {} from {cursor}",
        account.name, target.channel_id
    );
    if let Some(count) = target.thread.as_ref().and_then(|t| t.message_count) {
        debug!("thread {} reports ~{count} messages", target.channel_id);
    }

    'pages: loop {
        if token.is_cancelled() {
            return Err(Error::Aborted);
        }
        let response = account
            .api
            .channel_messages(target.channel_id, cursor, PAGE_LIMIT, token)
            .await?;
        if response.status == StatusCode::FORBIDDEN || response.status == StatusCode::NOT_FOUND {
            return hang_until_aborted(account, target, token).await;
        }
        if !response.is_success() {
            warn!(
                "[{}] unexpected status {} fetching {}",
                account.name, response.status, target.channel_id
            );
            return Ok(());
        }

        // newest first on the wire
        let page: Vec<Message> = response.json()?;
        if page.is_empty() {
            break;
        }
        let short = page.len() < PAGE_LIMIT as usize;
        cursor = page[0].id;

        let mut batch: Option<crate::db::TxGuard> = None;
        for message in page.iter().rev() {
            if token.is_cancelled() {
                // finish the open batch; everything in it precedes the
                // abort point
                if let Some(tx) = batch.take() {
                    tx.commit().await?;
                }
                return Err(Error::Aborted);
            }
            let Some(record) = MessageRecord::from_wire(message) else {
                debug!("message {} has no usable author, skipping", message.id);
                continue;
            };

            if state.config.reactions && message.has_reactions() {
                // a message with reactions gets its own transaction,
                // together with its initial placements
                if let Some(tx) = batch.take() {
                    tx.commit().await?;
                }
                let tx = state.db.transaction().await?;
                let outcome = write_message(state, message, record).await?;
                if outcome != AddOutcome::FirstSnapshot {
                    tx.commit().await?;
                    break 'pages;
                }
                fetch_initial_reactions(state, account, message, token).await?;
                tx.commit().await?;
            } else {
                if batch.is_none() {
                    batch = Some(state.db.transaction().await?);
                }
                let outcome = write_message(state, message, record).await?;
                if outcome != AddOutcome::FirstSnapshot {
                    // the realtime/backfill join point: this message is
                    // already in the store
                    if let Some(tx) = batch.take() {
                        tx.commit().await?;
                    }
                    break 'pages;
                }
            }
        }
        if let Some(tx) = batch.take() {
            tx.commit().await?;
        }

        if short {
            break;
        }
        response.reset_gate().await;
    }
    Ok(())
}

/// write one backfilled message plus its author snapshot
async fn write_message(
    state: &Arc<State>,
    message: &Message,
    record: MessageRecord,
) -> Result<AddOutcome> {
    let timing = Timing::now(false);
    if record.webhook.is_none() {
        if let Some(author) = &message.author {
            state.db.add_user(UserRecord::from_wire(author), timing).await?;
        }
    }
    state.db.add_message(record, timing).await
}

/// enumerate everyone who placed each (emoji, kind) on a message and record
/// the placements as "existed since before archival"
async fn fetch_initial_reactions(
    state: &Arc<State>,
    account: &Arc<Account>,
    message: &Message,
    token: &CancellationToken,
) -> Result<()> {
    for reaction in &message.reactions {
        for kind in reaction.kinds() {
            fetch_reactors(state, account, message, reaction, kind, token).await?;
        }
    }
    Ok(())
}

async fn fetch_reactors(
    state: &Arc<State>,
    account: &Arc<Account>,
    message: &Message,
    reaction: &hagfish_types::Reaction,
    kind: ReactionKind,
    token: &CancellationToken,
) -> Result<()> {
    let emoji_name = reaction.emoji.api_name();
    if emoji_name.is_empty() {
        return Ok(());
    }
    let mut after = UserId(0);
    loop {
        if token.is_cancelled() {
            return Err(Error::Aborted);
        }
        let response = account
            .api
            .reaction_users(message.channel_id, message.id, &emoji_name, kind, after, token)
            .await?;
        if !response.is_success() {
            debug!(
                "[{}] reactors for {} {emoji_name} returned {}",
                account.name, message.id, response.status
            );
            return Ok(());
        }
        let users: Vec<User> = response.json()?;
        let Some(last) = users.last() else {
            return Ok(());
        };
        after = last.id;
        let short = users.len() < 100;

        let timing = Timing::now(false);
        let mut user_ids = Vec::with_capacity(users.len());
        for user in &users {
            state.db.add_user(UserRecord::from_wire(user), timing).await?;
            user_ids.push(user.id);
        }
        state
            .db
            .add_initial_reactions(message.id, reaction.emoji.clone(), kind, user_ids)
            .await?;

        if short {
            return Ok(());
        }
        response.reset_gate().await;
    }
}

/// a 403/404 in a backfill usually means a permission flux that the
/// permission-change path will resolve by aborting this operation; wait for
/// that abort, bounded by a ceiling so a missed event cannot wedge forever
async fn hang_until_aborted(
    account: &Arc<Account>,
    target: &MessageSyncTarget,
    token: &CancellationToken,
) -> Result<()> {
    debug!(
        "[{}] access to {} denied, waiting for handoff",
        account.name, target.channel_id
    );
    tokio::select! {
        _ = token.cancelled() => Err(Error::Aborted),
        _ = tokio::time::sleep(HANG_CEILING) => {
            warn!(
                "[{}] sync for {} hung for an hour without an abort, giving up",
                account.name, target.channel_id
            );
            Err(Error::Aborted)
        }
    }
}
