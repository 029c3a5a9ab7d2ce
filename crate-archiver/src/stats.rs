//! periodic progress line; the fancy renderer lives elsewhere

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::sync::State;

const INTERVAL: Duration = Duration::from_secs(30);

pub fn spawn(state: Arc<State>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let ongoing: usize = state.accounts.iter().map(|a| a.ongoing_count()).sum();
            let rest: usize = state
                .accounts
                .iter()
                .map(|a| a.rest_ops.load(Ordering::SeqCst))
                .sum();
            let gateway: usize = state
                .accounts
                .iter()
                .map(|a| a.gateway_ops.load(Ordering::SeqCst))
                .sum();
            info!(
                "guilds={} channels={} ongoing={ongoing} rest={rest} gateway={gateway}",
                state.guilds.len(),
                state.channels.len(),
            );
        }
    });
}
