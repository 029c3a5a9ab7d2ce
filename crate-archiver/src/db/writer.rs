use hagfish_types::{ChannelId, Emoji, GuildId, ImageHash, MessageId, ReactionKind, Timing, UserId};
use sqlx::sqlite::SqliteRow;
use sqlx::{Connection, Row, SqliteConnection};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::db::schema::WEBHOOK_USER_MAX;
use crate::db::{AddOutcome, EntityKind, MessagePatch, MessageRecord, Request, UserRecord};
use crate::error::{Error, Result};

const CDN_ATTACHMENT_PREFIX: &str = "https://cdn.discordapp.com/attachments/";

pub(crate) fn spawn(conn: SqliteConnection, rx: mpsc::Receiver<Request>) {
    tokio::spawn(Writer { conn, rx }.run());
}

/// a bound value for the runtime query builder; compared against stored
/// columns for the snapshot equality check
#[derive(Debug, Clone, PartialEq)]
enum Arg {
    Int(Option<i64>),
    Text(Option<String>),
    Blob(Option<Vec<u8>>),
}

impl Arg {
    fn int(v: i64) -> Arg {
        Arg::Int(Some(v))
    }

    fn text(v: impl Into<String>) -> Arg {
        Arg::Text(Some(v.into()))
    }

    fn image(hash: Option<&ImageHash>) -> Arg {
        match hash {
            Some(ImageHash::Compact(bytes)) => Arg::Blob(Some(bytes.to_vec())),
            Some(ImageHash::Text(text)) => Arg::Text(Some(text.clone())),
            None => Arg::Blob(None),
        }
    }
}

fn bind<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    arg: &Arg,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    match arg {
        Arg::Int(v) => query.bind(*v),
        Arg::Text(v) => query.bind(v.clone()),
        Arg::Blob(v) => query.bind(v.clone()),
    }
}

/// does the stored column hold the same value as the incoming one?
///
/// a type-affinity mismatch (e.g. an avatar stored as text, now arriving as
/// a compact blob) simply reads as "different".
fn column_matches(row: &SqliteRow, index: usize, arg: &Arg) -> bool {
    match arg {
        Arg::Int(v) => row.try_get::<Option<i64>, _>(index).map(|s| s == *v),
        Arg::Text(v) => row.try_get::<Option<String>, _>(index).map(|s| s == *v),
        Arg::Blob(v) => row.try_get::<Option<Vec<u8>>, _>(index).map(|s| s == *v),
    }
    .unwrap_or(false)
}

/// column layout of one snapshot table pair
struct TableSpec {
    entity: &'static str,
    keys: &'static [&'static str],
    cols: &'static [&'static str],
}

const GUILDS: TableSpec = TableSpec {
    entity: "guild",
    keys: &["id"],
    cols: &["name", "owner_id", "icon"],
};
const CHANNELS: TableSpec = TableSpec {
    entity: "channel",
    keys: &["id"],
    cols: &["guild_id", "kind", "name", "topic", "nsfw", "parent_id", "position", "overwrites"],
};
const ROLES: TableSpec = TableSpec {
    entity: "role",
    keys: &["id"],
    cols: &["guild_id", "name", "permissions", "color", "hoist", "position"],
};
const USERS: TableSpec = TableSpec {
    entity: "user",
    keys: &["id"],
    cols: &["username", "discriminator", "global_name", "avatar", "bot"],
};
const MEMBERS: TableSpec = TableSpec {
    entity: "member",
    keys: &["guild_id", "user_id"],
    cols: &["nick", "roles", "joined_at", "avatar"],
};
const MESSAGES: TableSpec = TableSpec {
    entity: "message",
    keys: &["id"],
    cols: &[
        "channel_id",
        "author_id",
        "kind",
        "content",
        "edited_timestamp",
        "flags",
        "pinned",
        "reference",
        "embeds",
        "components",
    ],
};

impl TableSpec {
    fn latest(&self) -> String {
        format!("latest_{}_snapshots", self.entity)
    }

    fn previous(&self) -> String {
        format!("previous_{}_snapshots", self.entity)
    }

    fn where_keys(&self) -> String {
        self.keys
            .iter()
            .map(|k| format!("{k} = ?"))
            .collect::<Vec<_>>()
            .join(" AND ")
    }
}

struct Writer {
    conn: SqliteConnection,
    rx: mpsc::Receiver<Request>,
}

impl Writer {
    async fn run(mut self) {
        let mut close_resp = None;
        while let Some(request) = self.rx.recv().await {
            match request {
                Request::Close(resp) => {
                    close_resp = Some(resp);
                    break;
                }
                other => self.handle(other).await,
            }
        }
        match close_resp {
            Some(resp) => {
                let result = self.conn.close().await.map_err(Error::from);
                let _ = resp.send(result);
            }
            None => debug!("database writer channel closed"),
        }
    }

    async fn handle(&mut self, request: Request) {
        match request {
            Request::Begin(resp) => {
                let _ = resp.send(self.exec("BEGIN").await);
            }
            Request::Commit(resp) => {
                let _ = resp.send(self.exec("COMMIT").await);
            }
            Request::Rollback => {
                // best-effort; an abandoned guard may race a finished tx
                if let Err(err) = self.exec("ROLLBACK").await {
                    debug!("rollback outside a transaction: {err}");
                }
            }
            Request::Optimize(resp) => {
                let _ = resp.send(self.exec("PRAGMA optimize").await);
            }
            Request::Close(_) => unreachable!("close is handled by the run loop"),
            Request::AddGuild(record, timing, resp) => {
                let keys = vec![Arg::int(record.id.into_inner() as i64)];
                let vals = vec![
                    Arg::text(record.name),
                    Arg::int(record.owner_id.into_inner() as i64),
                    Arg::image(record.icon.as_ref()),
                ];
                let _ = resp.send(self.snapshot_add(&GUILDS, &keys, &vals, timing).await);
            }
            Request::AddChannel(record, timing, resp) => {
                let keys = vec![Arg::int(record.id.into_inner() as i64)];
                let vals = vec![
                    Arg::Int(record.guild_id.map(|g| g.into_inner() as i64)),
                    Arg::int(record.kind as i64),
                    Arg::Text(record.name),
                    Arg::Text(record.topic),
                    Arg::int(record.nsfw as i64),
                    Arg::Int(record.parent_id.map(|p| p.into_inner() as i64)),
                    Arg::Int(record.position),
                    Arg::text(record.overwrites),
                ];
                let _ = resp.send(self.snapshot_add(&CHANNELS, &keys, &vals, timing).await);
            }
            Request::AddRole(record, timing, resp) => {
                let keys = vec![Arg::int(record.id.into_inner() as i64)];
                let vals = vec![
                    Arg::int(record.guild_id.into_inner() as i64),
                    Arg::text(record.name),
                    Arg::int(record.permissions as i64),
                    Arg::int(record.color as i64),
                    Arg::int(record.hoist as i64),
                    Arg::int(record.position),
                ];
                let _ = resp.send(self.snapshot_add(&ROLES, &keys, &vals, timing).await);
            }
            Request::AddUser(record, timing, resp) => {
                let _ = resp.send(self.add_user(record, timing).await);
            }
            Request::AddMember(record, timing, resp) => {
                let keys = vec![
                    Arg::int(record.guild_id.into_inner() as i64),
                    Arg::int(record.user_id.into_inner() as i64),
                ];
                let vals = vec![
                    Arg::Text(record.nick),
                    Arg::text(record.roles),
                    Arg::Text(record.joined_at),
                    Arg::image(record.avatar.as_ref()),
                ];
                let _ = resp.send(self.snapshot_add(&MEMBERS, &keys, &vals, timing).await);
            }
            Request::MemberLeave(guild_id, user_id, timing, resp) => {
                let keys = vec![
                    Arg::int(guild_id.into_inner() as i64),
                    Arg::int(user_id.into_inner() as i64),
                ];
                let vals = vec![Arg::Text(None), Arg::Text(None), Arg::Text(None), Arg::Blob(None)];
                let _ = resp.send(self.snapshot_add(&MEMBERS, &keys, &vals, timing).await);
            }
            Request::AddMessage(record, timing, resp) => {
                let _ = resp.send(self.add_message(*record, timing).await);
            }
            Request::PatchMessage(patch, timing, resp) => {
                let _ = resp.send(self.patch_message(*patch, timing).await);
            }
            Request::MarkDeleted(kind, id, timing, resp) => {
                let _ = resp.send(self.mark_deleted(kind, id, timing).await);
            }
            Request::AddReaction(message_id, emoji, kind, user_id, timing, resp) => {
                let _ = resp.send(
                    self.place_reaction(message_id, &emoji, kind, user_id, timing).await,
                );
            }
            Request::AddInitialReactions(message_id, emoji, kind, user_ids, resp) => {
                let mut result = Ok(());
                for user_id in user_ids {
                    result = self
                        .place_reaction(message_id, &emoji, kind, user_id, Timing::UNKNOWN)
                        .await;
                    if result.is_err() {
                        break;
                    }
                }
                let _ = resp.send(result);
            }
            Request::RemoveReaction(message_id, emoji, kind, user_id, timing, resp) => {
                let _ = resp.send(
                    self.remove_reaction(message_id, &emoji, Some((kind, user_id)), timing).await,
                );
            }
            Request::RemoveAllReactions(message_id, timing, resp) => {
                let result = sqlx::query(
                    "UPDATE reactions SET \"end\" = ? WHERE message_id = ? AND \"end\" IS NULL",
                )
                .bind(timing.into_inner())
                .bind(message_id.into_inner() as i64)
                .execute(&mut self.conn)
                .await
                .map(|_| ())
                .map_err(Error::from);
                let _ = resp.send(result);
            }
            Request::RemoveEmojiReactions(message_id, emoji, timing, resp) => {
                let _ = resp.send(self.remove_reaction(message_id, &emoji, None, timing).await);
            }
            Request::SyncGuildMembers(guild_id, user_ids, timing, resp) => {
                let ids: Vec<u64> = user_ids.iter().map(|u| u.into_inner()).collect();
                let result = sqlx::query(
                    "INSERT OR REPLACE INTO sync_guild_members (guild_id, _timestamp, user_ids) \
                     VALUES (?, ?, ?)",
                )
                .bind(guild_id.into_inner() as i64)
                .bind(timing.into_inner())
                .bind(serde_json::to_string(&ids).unwrap_or_default())
                .execute(&mut self.conn)
                .await
                .map(|_| ())
                .map_err(Error::from);
                let _ = resp.send(result);
            }
            Request::MaxMessageId(channel_id, resp) => {
                let result = sqlx::query(
                    "SELECT MAX(id) FROM latest_message_snapshots WHERE channel_id = ?",
                )
                .bind(channel_id.into_inner() as i64)
                .fetch_one(&mut self.conn)
                .await
                .map_err(Error::from)
                .and_then(|row| {
                    Ok(row
                        .try_get::<Option<i64>, _>(0)?
                        .map(|id| MessageId(id as u64)))
                });
                let _ = resp.send(result);
            }
            Request::SearchMessages(query, resp) => {
                let result = sqlx::query(
                    "SELECT rowid FROM message_fts WHERE message_fts MATCH ? ORDER BY rank",
                )
                .bind(query)
                .fetch_all(&mut self.conn)
                .await
                .map_err(Error::from)
                .and_then(|rows| {
                    rows.iter()
                        .map(|row| Ok(MessageId(row.try_get::<i64, _>(0)? as u64)))
                        .collect()
                });
                let _ = resp.send(result);
            }
            Request::GuildIds(resp) => {
                let result = sqlx::query("SELECT id FROM latest_guild_snapshots ORDER BY id")
                    .fetch_all(&mut self.conn)
                    .await
                    .map_err(Error::from)
                    .and_then(|rows| {
                        rows.iter()
                            .map(|row| Ok(GuildId(row.try_get::<i64, _>(0)? as u64)))
                            .collect()
                    });
                let _ = resp.send(result);
            }
            #[cfg(test)]
            Request::ScalarInt(sql, resp) => {
                let result = sqlx::query(&sql)
                    .fetch_one(&mut self.conn)
                    .await
                    .map_err(Error::from)
                    .and_then(|row| Ok(row.try_get::<Option<i64>, _>(0)?));
                let _ = resp.send(result);
            }
            #[cfg(test)]
            Request::ScalarText(sql, resp) => {
                let result = sqlx::query(&sql)
                    .fetch_one(&mut self.conn)
                    .await
                    .map_err(Error::from)
                    .and_then(|row| Ok(row.try_get::<Option<String>, _>(0)?));
                let _ = resp.send(result);
            }
            Request::ChannelIds(guild_id, resp) => {
                let result = sqlx::query(
                    "SELECT id FROM latest_channel_snapshots WHERE guild_id = ? ORDER BY id",
                )
                .bind(guild_id.into_inner() as i64)
                .fetch_all(&mut self.conn)
                .await
                .map_err(Error::from)
                .and_then(|rows| {
                    rows.iter()
                        .map(|row| Ok(ChannelId(row.try_get::<i64, _>(0)? as u64)))
                        .collect()
                });
                let _ = resp.send(result);
            }
        }
    }

    async fn exec(&mut self, sql: &str) -> Result<()> {
        sqlx::query(sql).execute(&mut self.conn).await?;
        Ok(())
    }

    /// the snapshot contract: insert on absence, no-op on equality,
    /// copy-then-update on change
    async fn snapshot_add(
        &mut self,
        table: &TableSpec,
        keys: &[Arg],
        vals: &[Arg],
        timing: Timing,
    ) -> Result<AddOutcome> {
        let select = format!(
            "SELECT {}, _timestamp, _deleted FROM {} WHERE {}",
            table.cols.join(", "),
            table.latest(),
            table.where_keys(),
        );
        let mut query = sqlx::query(&select);
        for key in keys {
            query = bind(query, key);
        }
        let existing = query.fetch_optional(&mut self.conn).await?;

        let Some(row) = existing else {
            self.snapshot_insert(table, keys, vals, timing).await?;
            return Ok(AddOutcome::FirstSnapshot);
        };

        let deleted: i64 = row.try_get(table.cols.len() + 1)?;
        let same = deleted == 0
            && vals
                .iter()
                .enumerate()
                .all(|(i, val)| column_matches(&row, i, val));
        if same {
            return Ok(AddOutcome::SameAsLatest);
        }

        let stored: i64 = row.try_get(table.cols.len())?;
        if timing.into_inner() <= stored {
            return Err(Error::TimestampRegression(format!(
                "{} {:?}",
                table.entity, keys
            )));
        }

        self.snapshot_supersede(table, keys, vals, timing).await?;
        Ok(AddOutcome::AnotherSnapshot)
    }

    async fn snapshot_insert(
        &mut self,
        table: &TableSpec,
        keys: &[Arg],
        vals: &[Arg],
        timing: Timing,
    ) -> Result<()> {
        let columns: Vec<&str> = table.keys.iter().chain(table.cols.iter()).copied().collect();
        let placeholders = vec!["?"; columns.len() + 1].join(", ");
        let insert = format!(
            "INSERT INTO {} ({}, _timestamp) VALUES ({})",
            table.latest(),
            columns.join(", "),
            placeholders,
        );
        let mut query = sqlx::query(&insert);
        for arg in keys.iter().chain(vals.iter()) {
            query = bind(query, arg);
        }
        query = query.bind(timing.into_inner());
        query.execute(&mut self.conn).await?;
        Ok(())
    }

    /// copy the latest row into history, then update it in place
    async fn snapshot_supersede(
        &mut self,
        table: &TableSpec,
        keys: &[Arg],
        vals: &[Arg],
        timing: Timing,
    ) -> Result<()> {
        let copy = format!(
            "INSERT INTO {} SELECT * FROM {} WHERE {}",
            table.previous(),
            table.latest(),
            table.where_keys(),
        );
        let mut query = sqlx::query(&copy);
        for key in keys {
            query = bind(query, key);
        }
        query.execute(&mut self.conn).await?;

        let sets = table
            .cols
            .iter()
            .map(|c| format!("{c} = ?"))
            .collect::<Vec<_>>()
            .join(", ");
        let update = format!(
            "UPDATE {} SET {}, _timestamp = ?, _deleted = 0 WHERE {}",
            table.latest(),
            sets,
            table.where_keys(),
        );
        let mut query = sqlx::query(&update);
        for val in vals {
            query = bind(query, val);
        }
        query = query.bind(timing.into_inner());
        for key in keys {
            query = bind(query, key);
        }
        query.execute(&mut self.conn).await?;
        Ok(())
    }

    async fn add_user(&mut self, record: UserRecord, timing: Timing) -> Result<AddOutcome> {
        let keys = vec![Arg::int(record.id.into_inner() as i64)];
        let vals = vec![
            Arg::text(record.username),
            Arg::Text(record.discriminator),
            Arg::Text(record.global_name),
            Arg::image(record.avatar.as_ref()),
            Arg::int(record.bot as i64),
        ];
        self.snapshot_add(&USERS, &keys, &vals, timing).await
    }

    async fn add_message(&mut self, record: MessageRecord, timing: Timing) -> Result<AddOutcome> {
        let author_id = match &record.webhook {
            Some(hook) => self.webhook_author(hook).await?,
            None => record.author_id.into_inner() as i64,
        };

        let keys = vec![Arg::int(record.id.into_inner() as i64)];
        let vals = vec![
            Arg::int(record.channel_id.into_inner() as i64),
            Arg::int(author_id),
            Arg::int(record.kind as i64),
            Arg::text(record.content),
            Arg::Text(record.edited_timestamp),
            Arg::Int(record.flags.map(|f| f as i64)),
            Arg::int(record.pinned as i64),
            Arg::Text(record.reference),
            Arg::text(record.embeds),
            Arg::text(record.components),
        ];
        let outcome = self.snapshot_add(&MESSAGES, &keys, &vals, timing).await?;

        // attachments are immutable; insert unconditionally
        for attachment in &record.attachments {
            if !attachment.url.starts_with(CDN_ATTACHMENT_PREFIX) {
                warn!(
                    "attachment {} has an unexpected url: {}",
                    attachment.id, attachment.url
                );
            }
            sqlx::query(
                "INSERT OR IGNORE INTO attachments \
                 (id, message_id, filename, size, url, content_type, width, height) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(attachment.id)
            .bind(record.id.into_inner() as i64)
            .bind(&attachment.filename)
            .bind(attachment.size as i64)
            .bind(&attachment.url)
            .bind(&attachment.content_type)
            .bind(attachment.width.map(|w| w as i64))
            .bind(attachment.height.map(|h| h as i64))
            .execute(&mut self.conn)
            .await?;
        }
        Ok(outcome)
    }

    async fn patch_message(&mut self, patch: MessagePatch, timing: Timing) -> Result<AddOutcome> {
        // an update without edited_timestamp is the platform unfurling
        // links; it mutates the latest snapshot in place
        if patch.edited_timestamp.is_none() {
            if patch.content.is_some()
                || patch.flags.is_some()
                || patch.components.is_some()
                || patch.attachments.is_some()
            {
                warn!(
                    "unedited update for message {} touches monitored fields, skipping",
                    patch.id
                );
                return Ok(AddOutcome::SameAsLatest);
            }
            let Some(embeds) = patch.embeds else {
                return Ok(AddOutcome::SameAsLatest);
            };
            let result = sqlx::query("UPDATE latest_message_snapshots SET embeds = ? WHERE id = ?")
                .bind(embeds)
                .bind(patch.id.into_inner() as i64)
                .execute(&mut self.conn)
                .await?;
            return Ok(if result.rows_affected() == 0 {
                AddOutcome::PartialNoSnapshot
            } else {
                AddOutcome::SameAsLatest
            });
        }

        let select = format!(
            "SELECT {} FROM latest_message_snapshots WHERE id = ?",
            MESSAGES.cols.join(", "),
        );
        let existing = sqlx::query(&select)
            .bind(patch.id.into_inner() as i64)
            .fetch_optional(&mut self.conn)
            .await?;

        let keys = vec![Arg::int(patch.id.into_inner() as i64)];
        let Some(row) = existing else {
            // no base to merge into: insert only if the patch carries the
            // required fields itself
            let Some(content) = patch.content else {
                return Ok(AddOutcome::PartialNoSnapshot);
            };
            let vals = vec![
                Arg::int(patch.channel_id.into_inner() as i64),
                Arg::Int(patch.author_id.map(|a| a.into_inner() as i64)),
                Arg::Int(None),
                Arg::text(content),
                Arg::Text(patch.edited_timestamp),
                Arg::Int(patch.flags.map(|f| f as i64)),
                Arg::Int(patch.pinned.map(|p| p as i64)),
                Arg::Text(None),
                Arg::Text(patch.embeds),
                Arg::Text(patch.components),
            ];
            self.snapshot_insert(&MESSAGES, &keys, &vals, timing).await?;
            return Ok(AddOutcome::FirstSnapshot);
        };

        // merge the patch over the stored base, then run the normal path
        let merge_text = |patched: Option<String>, index: usize| -> Result<Arg> {
            Ok(match patched {
                Some(v) => Arg::Text(Some(v)),
                None => Arg::Text(row.try_get(index)?),
            })
        };
        let vals = vec![
            Arg::int(patch.channel_id.into_inner() as i64),
            Arg::Int(row.try_get(1)?),
            Arg::Int(row.try_get(2)?),
            merge_text(patch.content, 3)?,
            merge_text(patch.edited_timestamp, 4)?,
            match patch.flags {
                Some(f) => Arg::int(f as i64),
                None => Arg::Int(row.try_get(5)?),
            },
            match patch.pinned {
                Some(p) => Arg::int(p as i64),
                None => Arg::Int(row.try_get(6)?),
            },
            Arg::Text(row.try_get(7)?),
            merge_text(patch.embeds, 8)?,
            merge_text(patch.components, 9)?,
        ];
        let outcome = self.snapshot_add(&MESSAGES, &keys, &vals, timing).await?;

        if let Some(attachments) = &patch.attachments {
            for attachment in attachments {
                sqlx::query(
                    "INSERT OR IGNORE INTO attachments \
                     (id, message_id, filename, size, url, content_type, width, height) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(attachment.id)
                .bind(patch.id.into_inner() as i64)
                .bind(&attachment.filename)
                .bind(attachment.size as i64)
                .bind(&attachment.url)
                .bind(&attachment.content_type)
                .bind(attachment.width.map(|w| w as i64))
                .bind(attachment.height.map(|h| h as i64))
                .execute(&mut self.conn)
                .await?;
            }
        }
        Ok(outcome)
    }

    async fn mark_deleted(&mut self, kind: EntityKind, id: i64, timing: Timing) -> Result<()> {
        let table = match kind {
            EntityKind::Guild => &GUILDS,
            EntityKind::Channel => &CHANNELS,
            EntityKind::Role => &ROLES,
            EntityKind::Message => &MESSAGES,
        };
        let select = format!(
            "SELECT _timestamp, _deleted FROM {} WHERE id = ?",
            table.latest(),
        );
        let Some(row) = sqlx::query(&select)
            .bind(id)
            .fetch_optional(&mut self.conn)
            .await?
        else {
            debug!("deletion of unknown {} {id}", table.entity);
            return Ok(());
        };
        if row.try_get::<i64, _>(1)? != 0 {
            return Ok(());
        }
        let stored: i64 = row.try_get(0)?;
        if timing.into_inner() <= stored {
            return Err(Error::TimestampRegression(format!("{} {id}", table.entity)));
        }

        let copy = format!(
            "INSERT INTO {} SELECT * FROM {} WHERE id = ?",
            table.previous(),
            table.latest(),
        );
        sqlx::query(&copy).bind(id).execute(&mut self.conn).await?;
        let update = format!(
            "UPDATE {} SET _timestamp = ?, _deleted = 1 WHERE id = ?",
            table.latest(),
        );
        sqlx::query(&update)
            .bind(timing.into_inner())
            .bind(id)
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    /// resolve a webhook message's synthetic author id, minting one when
    /// this (webhook, name, avatar) identity is new
    async fn webhook_author(&mut self, hook: &super::WebhookAuthor) -> Result<i64> {
        let existing = sqlx::query(
            "SELECT id FROM webhook_users WHERE webhook_id = ? AND name IS ? AND avatar IS ?",
        )
        .bind(hook.webhook_id.into_inner() as i64)
        .bind(&hook.name)
        .bind(&hook.avatar)
        .fetch_optional(&mut self.conn)
        .await?;
        if let Some(row) = existing {
            return Ok(row.try_get(0)?);
        }

        let result = sqlx::query(
            "INSERT INTO webhook_users (webhook_id, name, avatar) VALUES (?, ?, ?)",
        )
        .bind(hook.webhook_id.into_inner() as i64)
        .bind(&hook.name)
        .bind(&hook.avatar)
        .execute(&mut self.conn)
        .await?;
        let id = result.last_insert_rowid();
        if id >= WEBHOOK_USER_MAX {
            return Err(Error::BadStatic("webhook user ids exhausted the sentinel range"));
        }
        Ok(id)
    }

    async fn emoji_ref(&mut self, emoji: &Emoji) -> Result<i64> {
        let emoji_id = emoji.id.map(|e| e.into_inner() as i64);
        let existing =
            sqlx::query("SELECT ref FROM reaction_emojis WHERE emoji_id IS ? AND name IS ?")
                .bind(emoji_id)
                .bind(&emoji.name)
                .fetch_optional(&mut self.conn)
                .await?;
        if let Some(row) = existing {
            return Ok(row.try_get(0)?);
        }
        let result =
            sqlx::query("INSERT INTO reaction_emojis (emoji_id, name, animated) VALUES (?, ?, ?)")
                .bind(emoji_id)
                .bind(&emoji.name)
                .bind(emoji.animated as i64)
                .execute(&mut self.conn)
                .await?;
        Ok(result.last_insert_rowid())
    }

    /// insert a placement unless an open one already exists for the same
    /// (message, emoji, kind, user)
    async fn place_reaction(
        &mut self,
        message_id: MessageId,
        emoji: &Emoji,
        kind: ReactionKind,
        user_id: UserId,
        start: Timing,
    ) -> Result<()> {
        let emoji_ref = self.emoji_ref(emoji).await?;
        let open = sqlx::query(
            "SELECT 1 FROM reactions WHERE message_id = ? AND emoji_ref = ? AND kind = ? \
             AND user_id = ? AND \"end\" IS NULL",
        )
        .bind(message_id.into_inner() as i64)
        .bind(emoji_ref)
        .bind(kind.as_int())
        .bind(user_id.into_inner() as i64)
        .fetch_optional(&mut self.conn)
        .await?;
        if open.is_some() {
            return Ok(());
        }
        sqlx::query(
            "INSERT INTO reactions (message_id, emoji_ref, kind, user_id, start, \"end\") \
             VALUES (?, ?, ?, ?, ?, NULL)",
        )
        .bind(message_id.into_inner() as i64)
        .bind(emoji_ref)
        .bind(kind.as_int())
        .bind(user_id.into_inner() as i64)
        .bind(start.into_inner())
        .execute(&mut self.conn)
        .await?;
        Ok(())
    }

    /// close matching open placements; `who` narrows to one (kind, user)
    async fn remove_reaction(
        &mut self,
        message_id: MessageId,
        emoji: &Emoji,
        who: Option<(ReactionKind, UserId)>,
        timing: Timing,
    ) -> Result<()> {
        let emoji_ref = self.emoji_ref(emoji).await?;
        match who {
            Some((kind, user_id)) => {
                sqlx::query(
                    "UPDATE reactions SET \"end\" = ? WHERE message_id = ? AND emoji_ref = ? \
                     AND kind = ? AND user_id = ? AND \"end\" IS NULL",
                )
                .bind(timing.into_inner())
                .bind(message_id.into_inner() as i64)
                .bind(emoji_ref)
                .bind(kind.as_int())
                .bind(user_id.into_inner() as i64)
                .execute(&mut self.conn)
                .await?;
            }
            None => {
                sqlx::query(
                    "UPDATE reactions SET \"end\" = ? WHERE message_id = ? AND emoji_ref = ? \
                     AND \"end\" IS NULL",
                )
                .bind(timing.into_inner())
                .bind(message_id.into_inner() as i64)
                .bind(emoji_ref)
                .execute(&mut self.conn)
                .await?;
            }
        }
        Ok(())
    }
}
