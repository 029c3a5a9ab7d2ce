use std::collections::HashSet;
use std::io::IsTerminal;
use std::path::PathBuf;

use hagfish_types::GuildId;

use crate::cli::{Args, StatsMode};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub accounts: Vec<AccountConfig>,
    /// empty set means "archive everything"
    pub guild_filter: HashSet<GuildId>,
    pub backfill: bool,
    pub reactions: bool,
    pub stats: bool,
    pub database: PathBuf,
}

#[derive(Debug, Clone)]
pub struct AccountConfig {
    pub name: String,
    pub credentials: Credentials,
}

#[derive(Clone)]
pub enum Credentials {
    Bot(String),
    User(String),
}

impl Credentials {
    pub fn parse(raw: &str) -> Result<Credentials> {
        match raw.split_once(':') {
            Some(("bot", token)) if !token.is_empty() => Ok(Credentials::Bot(token.to_owned())),
            Some(("user", token)) if !token.is_empty() => Ok(Credentials::User(token.to_owned())),
            _ => Err(Error::BadStatic(
                "token must be prefixed with its kind: `bot:...` or `user:...`",
            )),
        }
    }

    /// the Authorization header value
    pub fn authorization(&self) -> String {
        match self {
            Credentials::Bot(token) => format!("Bot {token}"),
            Credentials::User(token) => token.clone(),
        }
    }

    /// the raw token, as IDENTIFY wants it
    pub fn raw(&self) -> &str {
        match self {
            Credentials::Bot(token) | Credentials::User(token) => token,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Credentials::Bot(_) => "bot",
            Credentials::User(_) => "user",
        }
    }
}

// never print tokens
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credentials({})", self.kind())
    }
}

impl Config {
    pub fn from_args(args: &Args) -> Result<Config> {
        let mut accounts = Vec::new();
        for (n, raw) in args.tokens.iter().enumerate() {
            let credentials = Credentials::parse(raw)?;
            accounts.push(AccountConfig {
                name: format!("{}{}", credentials.kind(), n + 1),
                credentials,
            });
        }

        let stats = match args.stats {
            StatsMode::Yes => true,
            StatsMode::No => false,
            StatsMode::Auto => std::io::stderr().is_terminal(),
        };

        Ok(Config {
            accounts,
            guild_filter: args.guilds.iter().copied().map(GuildId).collect(),
            backfill: !args.no_sync,
            reactions: !args.no_reactions,
            stats,
            database: args.database.clone(),
        })
    }

    pub fn wants_guild(&self, guild_id: GuildId) -> bool {
        self.guild_filter.is_empty() || self.guild_filter.contains(&guild_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_kinds() {
        let bot = Credentials::parse("bot:abc.def").unwrap();
        assert_eq!(bot.authorization(), "Bot abc.def");
        assert_eq!(bot.raw(), "abc.def");

        let user = Credentials::parse("user:xyz").unwrap();
        assert_eq!(user.authorization(), "xyz");

        assert!(Credentials::parse("abc").is_err());
        assert!(Credentials::parse("bot:").is_err());
    }
}
