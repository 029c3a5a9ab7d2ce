use std::process::ExitCode;
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::cli::Args;
use crate::codec::Transport;
use crate::config::Config;
use crate::db::Db;
use crate::gateway::Gateway;
use crate::rest::Api;
use crate::tracker::Account;

mod cache;
mod cli;
mod codec;
mod config;
mod db;
mod error;
mod gateway;
mod perms;
mod rate;
mod rest;
mod stats;
mod sync;
mod tracker;

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            use clap::error::ErrorKind;
            let _ = err.print();
            // usage errors exit 1, not clap's default 2
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            return ExitCode::from(code);
        }
    };
    let config = match Config::from_args(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(1);
        }
    };

    match run(args, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("fatal: {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args, config: Config) -> anyhow::Result<()> {
    let subscriber = Registry::default()
        .with(EnvFilter::from_str(args.log.directive())?)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr));
    tracing::subscriber::set_global_default(subscriber)?;

    let db = Db::open(&config.database).await?;
    info!("archive open at {}", config.database.display());

    // the rest pipelines observe the global shutdown token
    let shutdown = tokio_util::sync::CancellationToken::new();
    let accounts: Vec<Arc<Account>> = config
        .accounts
        .iter()
        .enumerate()
        .map(|(ix, account)| {
            Arc::new(Account::new(
                ix,
                account.name.clone(),
                account.credentials.clone(),
                Api::new(account.credentials.authorization(), shutdown.clone()),
            ))
        })
        .collect();
    let state = Arc::new(sync::State::new(config, db, accounts, shutdown));

    for account in &state.accounts {
        let (events_tx, mut events_rx) = mpsc::channel(256);
        let gateway = Gateway::connect(
            account.name.clone(),
            account.credentials.raw().to_owned(),
            Transport::JsonZlibStream,
            events_tx,
        );
        if account.gateway.set(gateway).is_err() {
            anyhow::bail!("gateway already connected for {}", account.name);
        }

        let state = state.clone();
        let ix = account.ix;
        tokio::spawn(async move {
            // sequential per account: dispatch order is processing order
            while let Some(event) = events_rx.recv().await {
                sync::handle_event(&state, ix, event).await;
            }
        });
    }

    if state.config.stats {
        stats::spawn(state.clone());
    }

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
        _ = sigterm.recv() => info!("terminated"),
        _ = state.shutdown.cancelled() => {}
    }

    sync::shutdown(&state).await;

    if state.fatal.load(Ordering::SeqCst) {
        anyhow::bail!("shut down after an unrecoverable error");
    }
    Ok(())
}
