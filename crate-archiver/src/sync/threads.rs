//! archived-thread enumeration: page a channel's archived listing and
//! spawn a message sync for every thread it reveals

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use hagfish_types::{ArchivedThreadsPage, ChannelId, Timing};
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::ThreadInfo;
use crate::db::ChannelRecord;
use crate::error::{Error, Result};
use crate::rest::ArchivedScope;
use crate::sync::{list_registry, spawn_message_sync, State};
use crate::tracker::Account;

const HANG_CEILING: Duration = Duration::from_secs(60 * 60);

pub async fn run_thread_list_sync(
    state: Arc<State>,
    account: Arc<Account>,
    channel_id: ChannelId,
    scope: ArchivedScope,
    token: CancellationToken,
    op_id: u64,
) {
    let result = sync_thread_list(&state, &account, channel_id, scope, &token).await;

    list_registry(&account, scope).remove_if(&channel_id, |_, operation| operation.id == op_id);
    account.rest_ops.fetch_sub(1, Ordering::SeqCst);

    match result {
        Ok(()) => debug!(
            "[{}] {scope:?} thread enumeration for {channel_id} finished",
            account.name
        ),
        Err(Error::Aborted) => debug!(
            "[{}] {scope:?} thread enumeration for {channel_id} aborted",
            account.name
        ),
        Err(err) => {
            if !crate::sync::fail_fatal(&state, &err) {
                warn!(
                    "[{}] {scope:?} thread enumeration for {channel_id} failed: {err}",
                    account.name
                );
            }
        }
    }
}

async fn sync_thread_list(
    state: &Arc<State>,
    account: &Arc<Account>,
    channel_id: ChannelId,
    scope: ArchivedScope,
    token: &CancellationToken,
) -> Result<()> {
    // the cursor advances to the oldest thread id seen so far
    let mut before: Option<ChannelId> = None;
    loop {
        if token.is_cancelled() {
            return Err(Error::Aborted);
        }
        let response = account
            .api
            .archived_threads(channel_id, scope, before, token)
            .await?;
        if response.status == StatusCode::FORBIDDEN || response.status == StatusCode::NOT_FOUND {
            debug!(
                "[{}] archived listing for {channel_id} denied, waiting for handoff",
                account.name
            );
            return tokio::select! {
                _ = token.cancelled() => Err(Error::Aborted),
                _ = tokio::time::sleep(HANG_CEILING) => {
                    warn!(
                        "[{}] thread enumeration for {channel_id} hung without an abort, giving up",
                        account.name
                    );
                    Err(Error::Aborted)
                }
            };
        }
        if !response.is_success() {
            warn!(
                "[{}] unexpected status {} listing archived threads of {channel_id}",
                account.name, response.status
            );
            return Ok(());
        }

        let page: ArchivedThreadsPage = response.json()?;
        for thread in &page.threads {
            state
                .db
                .add_channel(ChannelRecord::from_wire(thread), Timing::now(false))
                .await?;
            if before.is_none_or(|b| thread.id < b) {
                before = Some(thread.id);
            }
            if let Some(info) = ThreadInfo::from_wire(thread) {
                spawn_message_sync(state, channel_id, Some(info));
            }
        }

        if !page.has_more {
            return Ok(());
        }
        response.reset_gate().await;
    }
}
