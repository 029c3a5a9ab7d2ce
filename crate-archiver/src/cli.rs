use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Debug, Parser)]
#[command(name = "hagfish", version, about = "continuous archiver for discord")]
pub struct Args {
    /// account credential with its kind prefix, e.g. `bot:TOKEN` or
    /// `user:TOKEN` (repeatable)
    #[arg(short, long = "token", value_name = "KIND:TOKEN", required = true)]
    pub tokens: Vec<String>,

    /// log verbosity
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log: LogLevel,

    /// periodic progress reporting
    #[arg(long, value_enum, default_value_t = StatsMode::Auto)]
    pub stats: StatsMode,

    /// only archive these guilds (repeatable)
    #[arg(long = "guild", value_name = "ID")]
    pub guilds: Vec<u64>,

    /// disable history backfill; archive realtime events only
    #[arg(long)]
    pub no_sync: bool,

    /// disable reaction archival
    #[arg(long)]
    pub no_reactions: bool,

    /// path to the archive database
    pub database: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Verbose,
    Debug,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LogLevel::Error => "error",
            LogLevel::Warning => "warning",
            LogLevel::Info => "info",
            LogLevel::Verbose => "verbose",
            LogLevel::Debug => "debug",
        };
        f.write_str(name)
    }
}

impl LogLevel {
    /// the EnvFilter directive for this level
    pub fn directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warning => "warn",
            LogLevel::Info => "info",
            LogLevel::Verbose => "info,hagfish=debug",
            LogLevel::Debug => "debug,hagfish=trace",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StatsMode {
    Yes,
    No,
    Auto,
}

impl std::fmt::Display for StatsMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StatsMode::Yes => "yes",
            StatsMode::No => "no",
            StatsMode::Auto => "auto",
        };
        f.write_str(name)
    }
}
