//! archive schema: one `latest_*`/`previous_*` snapshot table pair per
//! entity kind, plus the side tables and the message full-text index
//!
//! the `previous_*` tables mirror the `latest_*` column order exactly so a
//! snapshot can be copied over with `INSERT INTO ... SELECT *`.

pub const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = OFF;

CREATE TABLE IF NOT EXISTS latest_guild_snapshots (
    id INTEGER PRIMARY KEY,
    name TEXT,
    owner_id INTEGER,
    icon BLOB,
    _timestamp INTEGER NOT NULL,
    _deleted INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS previous_guild_snapshots (
    id INTEGER NOT NULL,
    name TEXT,
    owner_id INTEGER,
    icon BLOB,
    _timestamp INTEGER NOT NULL,
    _deleted INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (id, _timestamp)
);

CREATE TABLE IF NOT EXISTS latest_channel_snapshots (
    id INTEGER PRIMARY KEY,
    guild_id INTEGER,
    kind INTEGER,
    name TEXT,
    topic TEXT,
    nsfw INTEGER,
    parent_id INTEGER,
    position INTEGER,
    overwrites TEXT,
    _timestamp INTEGER NOT NULL,
    _deleted INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS previous_channel_snapshots (
    id INTEGER NOT NULL,
    guild_id INTEGER,
    kind INTEGER,
    name TEXT,
    topic TEXT,
    nsfw INTEGER,
    parent_id INTEGER,
    position INTEGER,
    overwrites TEXT,
    _timestamp INTEGER NOT NULL,
    _deleted INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (id, _timestamp)
);

CREATE TABLE IF NOT EXISTS latest_role_snapshots (
    id INTEGER PRIMARY KEY,
    guild_id INTEGER,
    name TEXT,
    permissions INTEGER,
    color INTEGER,
    hoist INTEGER,
    position INTEGER,
    _timestamp INTEGER NOT NULL,
    _deleted INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS previous_role_snapshots (
    id INTEGER NOT NULL,
    guild_id INTEGER,
    name TEXT,
    permissions INTEGER,
    color INTEGER,
    hoist INTEGER,
    position INTEGER,
    _timestamp INTEGER NOT NULL,
    _deleted INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (id, _timestamp)
);

CREATE TABLE IF NOT EXISTS latest_user_snapshots (
    id INTEGER PRIMARY KEY,
    username TEXT,
    discriminator TEXT,
    global_name TEXT,
    avatar BLOB,
    bot INTEGER,
    _timestamp INTEGER NOT NULL,
    _deleted INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS previous_user_snapshots (
    id INTEGER NOT NULL,
    username TEXT,
    discriminator TEXT,
    global_name TEXT,
    avatar BLOB,
    bot INTEGER,
    _timestamp INTEGER NOT NULL,
    _deleted INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (id, _timestamp)
);

-- membership: a "leave" is a snapshot with every membership field null,
-- so a later rejoin remains representable
CREATE TABLE IF NOT EXISTS latest_member_snapshots (
    guild_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    nick TEXT,
    roles TEXT,
    joined_at TEXT,
    avatar BLOB,
    _timestamp INTEGER NOT NULL,
    _deleted INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (guild_id, user_id)
);
CREATE TABLE IF NOT EXISTS previous_member_snapshots (
    guild_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    nick TEXT,
    roles TEXT,
    joined_at TEXT,
    avatar BLOB,
    _timestamp INTEGER NOT NULL,
    _deleted INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (guild_id, user_id, _timestamp)
);

CREATE TABLE IF NOT EXISTS latest_message_snapshots (
    id INTEGER PRIMARY KEY,
    channel_id INTEGER,
    author_id INTEGER,
    kind INTEGER,
    content TEXT,
    edited_timestamp TEXT,
    flags INTEGER,
    pinned INTEGER,
    reference TEXT,
    embeds TEXT,
    components TEXT,
    _timestamp INTEGER NOT NULL,
    _deleted INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS previous_message_snapshots (
    id INTEGER NOT NULL,
    channel_id INTEGER,
    author_id INTEGER,
    kind INTEGER,
    content TEXT,
    edited_timestamp TEXT,
    flags INTEGER,
    pinned INTEGER,
    reference TEXT,
    embeds TEXT,
    components TEXT,
    _timestamp INTEGER NOT NULL,
    _deleted INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (id, _timestamp)
);
CREATE INDEX IF NOT EXISTS idx_latest_messages_channel
    ON latest_message_snapshots (channel_id, id);

CREATE TABLE IF NOT EXISTS attachments (
    id INTEGER PRIMARY KEY,
    message_id INTEGER NOT NULL,
    filename TEXT,
    size INTEGER,
    url TEXT,
    content_type TEXT,
    width INTEGER,
    height INTEGER
);

CREATE TABLE IF NOT EXISTS reaction_emojis (
    ref INTEGER PRIMARY KEY AUTOINCREMENT,
    emoji_id INTEGER,
    name TEXT,
    animated INTEGER NOT NULL DEFAULT 0,
    UNIQUE (emoji_id, name)
);

-- start = 0 means "existed since before archival"; end null means the
-- placement is still open
CREATE TABLE IF NOT EXISTS reactions (
    message_id INTEGER NOT NULL,
    emoji_ref INTEGER NOT NULL,
    kind INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    start INTEGER NOT NULL,
    "end" INTEGER
);
CREATE INDEX IF NOT EXISTS idx_reactions_message
    ON reactions (message_id, emoji_ref, kind, user_id);

-- synthetic authors for webhook messages; rowids stay far below the
-- 2^48 sentinel that separates them from real snowflakes
CREATE TABLE IF NOT EXISTS webhook_users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    webhook_id INTEGER NOT NULL,
    name TEXT,
    avatar TEXT,
    UNIQUE (webhook_id, name, avatar)
);

CREATE TABLE IF NOT EXISTS sync_guild_members (
    guild_id INTEGER NOT NULL,
    _timestamp INTEGER NOT NULL,
    user_ids TEXT NOT NULL,
    PRIMARY KEY (guild_id, _timestamp)
);

CREATE VIRTUAL TABLE IF NOT EXISTS message_fts USING fts5(
    content,
    content='latest_message_snapshots',
    content_rowid='id'
);
CREATE TRIGGER IF NOT EXISTS message_fts_insert
AFTER INSERT ON latest_message_snapshots BEGIN
    INSERT INTO message_fts (rowid, content) VALUES (new.id, new.content);
END;
CREATE TRIGGER IF NOT EXISTS message_fts_update
AFTER UPDATE OF content ON latest_message_snapshots BEGIN
    INSERT INTO message_fts (message_fts, rowid, content)
        VALUES ('delete', old.id, old.content);
    INSERT INTO message_fts (rowid, content) VALUES (new.id, new.content);
END;
"#;

/// the boundary separating synthetic webhook author ids from snowflakes
pub const WEBHOOK_USER_MAX: i64 = 1 << 48;
