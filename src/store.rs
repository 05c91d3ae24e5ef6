//! Persistent state: channels, membership, and message history.
//!
//! Backed by SQLite through `sqlx`. One pool, one file, `PRAGMA
//! journal_mode=WAL` so readers aren't blocked behind a writer's
//! transaction; `sqlx`'s own connection discipline is what keeps writes
//! serialized rather than a hand-rolled mutex.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, Row, SqlitePool};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

#[derive(Debug, Clone, FromRow)]
pub struct ChannelRow {
    pub channel_id: String,
    pub name: String,
    #[sqlx(rename = "type")]
    pub kind: String,
    pub owner_node_id: String,
    pub created_at: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct MemberRow {
    pub channel_id: String,
    pub node_id: String,
    pub role: String,
    pub joined_at: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct MessageRow {
    pub msg_id: String,
    pub channel_id: String,
    pub sender_id: String,
    pub timestamp: String,
    pub content: String,
    pub signature: String,
    pub is_encrypted: bool,
    pub nonce: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub channel_count: i64,
    pub member_count: i64,
    pub message_count: i64,
}

/// Open (creating if absent) the store file at `path` and bring its schema
/// up to date.
pub async fn open(path: &str) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))?
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new().max_connections(5).connect_with(options).await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// Create tables on first run, add columns on later runs. A reader must
/// tolerate any schema written by a prior version that shares the primary
/// keys, so every migration here is additive and errors from an
/// already-applied `ALTER TABLE` are swallowed.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::query("PRAGMA journal_mode=WAL;").execute(pool).await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS channels (
            channel_id      TEXT PRIMARY KEY,
            name            TEXT NOT NULL,
            type            TEXT NOT NULL,
            owner_node_id   TEXT NOT NULL,
            created_at      TEXT NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS channel_members (
            channel_id      TEXT NOT NULL,
            node_id         TEXT NOT NULL,
            role            TEXT NOT NULL,
            joined_at       TEXT NOT NULL,
            PRIMARY KEY (channel_id, node_id)
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            msg_id          TEXT PRIMARY KEY,
            channel_id      TEXT NOT NULL,
            sender_id       TEXT NOT NULL,
            timestamp       TEXT NOT NULL,
            content         TEXT NOT NULL,
            signature       TEXT NOT NULL,
            is_encrypted    INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    // `nonce` postdates the original schema (needed for private-channel
    // AEAD messages); added here rather than in CREATE TABLE so a store
    // opened against an older file picks it up too.
    let _ = sqlx::query("ALTER TABLE messages ADD COLUMN nonce TEXT")
        .execute(pool)
        .await;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_channel_ts ON messages(channel_id, timestamp DESC);")
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn put_channel(
    pool: &SqlitePool,
    channel_id: &str,
    name: &str,
    kind: &str,
    owner_node_id: &str,
    created_at: &str,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO channels (channel_id, name, type, owner_node_id, created_at)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(channel_id) DO NOTHING",
    )
    .bind(channel_id)
    .bind(name)
    .bind(kind)
    .bind(owner_node_id)
    .bind(created_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_channel(pool: &SqlitePool, channel_id: &str) -> Result<Option<ChannelRow>, StoreError> {
    let row = sqlx::query_as::<_, ChannelRow>("SELECT * FROM channels WHERE channel_id = ?")
        .bind(channel_id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn put_member(
    pool: &SqlitePool,
    channel_id: &str,
    node_id: &str,
    role: &str,
    joined_at: &str,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO channel_members (channel_id, node_id, role, joined_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(channel_id, node_id) DO UPDATE SET role = excluded.role",
    )
    .bind(channel_id)
    .bind(node_id)
    .bind(role)
    .bind(joined_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn members_of(pool: &SqlitePool, channel_id: &str) -> Result<Vec<MemberRow>, StoreError> {
    let rows = sqlx::query_as::<_, MemberRow>(
        "SELECT channel_id, node_id, role, joined_at FROM channel_members WHERE channel_id = ?",
    )
    .bind(channel_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Insert a message. Idempotent on `msg_id`; returns whether a new row was
/// actually inserted (`false` means this `msg_id` was already stored).
pub async fn put_message(
    pool: &SqlitePool,
    msg_id: &str,
    channel_id: &str,
    sender_id: &str,
    timestamp: &str,
    content: &str,
    signature: &str,
    is_encrypted: bool,
    nonce: Option<&str>,
    created_at: &str,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        "INSERT INTO messages (msg_id, channel_id, sender_id, timestamp, content, signature, is_encrypted, nonce, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(msg_id) DO NOTHING",
    )
    .bind(msg_id)
    .bind(channel_id)
    .bind(sender_id)
    .bind(timestamp)
    .bind(content)
    .bind(signature)
    .bind(is_encrypted)
    .bind(nonce)
    .bind(created_at)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Fetch the `n` most recent messages in `channel_id`, returned
/// oldest-first (the order a chat log displays in).
pub async fn recent(pool: &SqlitePool, channel_id: &str, n: i64) -> Result<Vec<MessageRow>, StoreError> {
    let mut rows = sqlx::query_as::<_, MessageRow>(
        "SELECT * FROM messages WHERE channel_id = ? ORDER BY timestamp DESC, msg_id DESC LIMIT ?",
    )
    .bind(channel_id)
    .bind(n)
    .fetch_all(pool)
    .await?;
    rows.reverse();
    Ok(rows)
}

pub async fn stats(pool: &SqlitePool) -> Result<StoreStats, StoreError> {
    let channel_count: i64 = sqlx::query("SELECT COUNT(*) AS c FROM channels")
        .fetch_one(pool)
        .await?
        .try_get("c")?;
    let member_count: i64 = sqlx::query("SELECT COUNT(*) AS c FROM channel_members")
        .fetch_one(pool)
        .await?
        .try_get("c")?;
    let message_count: i64 = sqlx::query("SELECT COUNT(*) AS c FROM messages")
        .fetch_one(pool)
        .await?
        .try_get("c")?;
    Ok(StoreStats { channel_count, member_count, message_count })
}

/// A point-in-time snapshot suitable for backup/restore between nodes.
#[derive(Debug, Clone, Default)]
pub struct ExportedRecords {
    pub channels: Vec<ChannelRow>,
    pub members: Vec<MemberRow>,
    pub messages: Vec<MessageRow>,
}

/// Export either one channel's rows (`channel_id = Some(..)`) or the whole
/// store (`None`).
pub async fn export(pool: &SqlitePool, channel_id: Option<&str>) -> Result<ExportedRecords, StoreError> {
    let (channels, members, messages) = match channel_id {
        Some(id) => {
            let channels = sqlx::query_as::<_, ChannelRow>("SELECT * FROM channels WHERE channel_id = ?")
                .bind(id)
                .fetch_all(pool)
                .await?;
            let members = members_of(pool, id).await?;
            let messages = sqlx::query_as::<_, MessageRow>(
                "SELECT * FROM messages WHERE channel_id = ? ORDER BY timestamp ASC",
            )
            .bind(id)
            .fetch_all(pool)
            .await?;
            (channels, members, messages)
        }
        None => {
            let channels = sqlx::query_as::<_, ChannelRow>("SELECT * FROM channels").fetch_all(pool).await?;
            let members = sqlx::query_as::<_, MemberRow>("SELECT * FROM channel_members").fetch_all(pool).await?;
            let messages = sqlx::query_as::<_, MessageRow>("SELECT * FROM messages ORDER BY timestamp ASC")
                .fetch_all(pool)
                .await?;
            (channels, members, messages)
        }
    };
    Ok(ExportedRecords { channels, members, messages })
}

/// Re-insert a previously exported snapshot. Every insert goes through the
/// same idempotent paths as live traffic, so importing a snapshot that
/// overlaps existing data is a no-op for the overlap.
pub async fn import(pool: &SqlitePool, records: &ExportedRecords) -> Result<(), StoreError> {
    for c in &records.channels {
        put_channel(pool, &c.channel_id, &c.name, &c.kind, &c.owner_node_id, &c.created_at).await?;
    }
    for m in &records.members {
        put_member(pool, &m.channel_id, &m.node_id, &m.role, &m.joined_at).await?;
    }
    for msg in &records.messages {
        put_message(
            pool,
            &msg.msg_id,
            &msg.channel_id,
            &msg.sender_id,
            &msg.timestamp,
            &msg.content,
            &msg.signature,
            msg.is_encrypted,
            msg.nonce.as_deref(),
            &msg.created_at,
        )
        .await?;
    }
    Ok(())
}
