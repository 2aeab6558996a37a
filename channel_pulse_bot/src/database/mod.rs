use std::{str::FromStr, sync::Arc};

pub use sqlx::Error;
use sqlx::{
    migrate::MigrateDatabase,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Executor, Row, Sqlite,
};
use tokio::sync::watch;

use crate::stats::{PostStats, StatsSnapshot};

type Pool = sqlx::Pool<Sqlite>;
const DB_PATH: &str = "sqlite:channel_pulse.sqlite";

/// A channel whose posts we keep statistics for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedChannel {
    pub username: String,
    pub subscribers: Option<u64>,
}

pub struct Database {
    pool: Pool,
    /// Closed when the database is dropped; background watchers subscribe
    /// to this to know when to stop.
    pub(crate) drop_watch: (watch::Sender<()>, watch::Receiver<()>),
}

impl Database {
    pub async fn new() -> Result<Arc<Database>, Error> {
        Self::open(DB_PATH).await
    }

    pub async fn open(db_path: &str) -> Result<Arc<Database>, Error> {
        if !Sqlite::database_exists(db_path).await.unwrap_or(false) {
            Sqlite::create_database(db_path).await?;
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(32)
            .connect_with(
                SqliteConnectOptions::from_str(db_path)?
                    .pragma("cache_size", "-32768")
                    .busy_timeout(std::time::Duration::from_secs(600)),
            )
            .await?;

        // Do some init. Create the tables...

        // CHANNELS:
        // username (unique primary key, normalized without @)
        // subscribers (last scraped count, null until first sync)
        // added_at (date+time in UTC)
        pool.execute(sqlx::query(
            "
                CREATE TABLE IF NOT EXISTS channels (
                    username TEXT PRIMARY KEY NOT NULL COLLATE NOCASE,
                    subscribers INTEGER NULL,
                    added_at TEXT NOT NULL DEFAULT (datetime('now'))
                ) STRICT;",
        ))
        .await?;

        // POSTS:
        // channel + message_id identify a published post
        // views/reactions are the legacy counters with no timestamp
        // scraping_stats/mtproto_stats hold one JSON snapshot each
        pool.execute(sqlx::query(
            "
                CREATE TABLE IF NOT EXISTS posts (
                    id INTEGER PRIMARY KEY,
                    channel TEXT NOT NULL COLLATE NOCASE,
                    message_id INTEGER NULL,
                    views INTEGER NULL,
                    reactions INTEGER NULL,
                    scraping_stats TEXT NULL,
                    mtproto_stats TEXT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(channel, message_id)
                ) STRICT;",
        ))
        .await?;

        Ok(Arc::new(Database {
            pool,
            drop_watch: watch::channel(()),
        }))
    }

    /// Start keeping statistics for a channel. Re-tracking an already
    /// tracked channel is a no-op.
    pub async fn track_channel(&self, username: &str) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO channels(username)
            VALUES (?)
        ON CONFLICT DO NOTHING;",
        )
        .bind(normalize_username(username))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Stop tracking a channel. Returns `false` if it wasn't tracked.
    /// Its recorded posts stay around.
    pub async fn untrack_channel(&self, username: &str) -> Result<bool, Error> {
        let result = sqlx::query("DELETE FROM channels WHERE username=?;")
            .bind(normalize_username(username))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn is_tracked(&self, username: &str) -> Result<bool, Error> {
        Ok(sqlx::query("SELECT 1 FROM channels WHERE username=?;")
            .bind(normalize_username(username))
            .fetch_optional(&self.pool)
            .await?
            .is_some())
    }

    pub async fn list_tracked_channels(&self) -> Result<Vec<TrackedChannel>, Error> {
        sqlx::query("SELECT username, subscribers FROM channels ORDER BY username;")
            .map(|row: SqliteRow| TrackedChannel {
                username: row.get("username"),
                subscribers: row
                    .get::<Option<i64>, _>("subscribers")
                    .and_then(|s| u64::try_from(s).ok()),
            })
            .fetch_all(&self.pool)
            .await
    }

    pub async fn update_subscriber_count(
        &self,
        username: &str,
        subscribers: u64,
    ) -> Result<(), Error> {
        sqlx::query("UPDATE channels SET subscribers=? WHERE username=?;")
            .bind(subscribers as i64)
            .bind(normalize_username(username))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remember that a post exists, so the sync job can pick it up.
    /// Recording the same (channel, message id) twice is a no-op.
    pub async fn record_post(&self, channel: &str, message_id: i64) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO posts(channel, message_id)
            VALUES (?, ?)
        ON CONFLICT DO NOTHING;",
        )
        .bind(normalize_username(channel))
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The channel's most recent posts that have a message id, newest
    /// first, snapshots parsed.
    pub async fn recent_posts(&self, channel: &str, limit: u32) -> Result<Vec<PostStats>, Error> {
        sqlx::query(
            "SELECT id, message_id, views, reactions, scraping_stats, mtproto_stats
            FROM posts
            WHERE channel=? AND message_id IS NOT NULL
            ORDER BY created_at DESC, id DESC
            LIMIT ?;",
        )
        .bind(normalize_username(channel))
        .bind(limit)
        .map(post_from_row)
        .fetch_all(&self.pool)
        .await
    }

    /// Store a fresh scraping snapshot, also refreshing the legacy
    /// counters the rest of the schema still reads.
    pub async fn update_scraping_stats(
        &self,
        post_id: i64,
        snapshot: &StatsSnapshot,
    ) -> Result<(), Error> {
        sqlx::query(
            "UPDATE posts
            SET scraping_stats=?, views=COALESCE(?, views), reactions=COALESCE(?, reactions)
            WHERE id=?;",
        )
        .bind(snapshot_json(snapshot))
        .bind(snapshot.views.map(|v| v as i64))
        .bind(snapshot.reactions.map(|r| r as i64))
        .bind(post_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Store an MTProto snapshot for a post, creating the post row if the
    /// feed got there before the channel-post handler did.
    pub async fn update_mtproto_stats(
        &self,
        channel: &str,
        message_id: i64,
        snapshot: &StatsSnapshot,
    ) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO posts(channel, message_id, mtproto_stats)
            VALUES (?, ?, ?)
        ON CONFLICT DO
            UPDATE SET mtproto_stats=?;",
        )
        .bind(normalize_username(channel))
        .bind(message_id)
        .bind(snapshot_json(snapshot))
        .bind(snapshot_json(snapshot))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn normalize_username(username: &str) -> String {
    username.trim_start_matches('@').to_lowercase()
}

fn snapshot_json(snapshot: &StatsSnapshot) -> String {
    serde_json::to_string(snapshot).expect("Serializing a snapshot never fails")
}

fn post_from_row(row: SqliteRow) -> PostStats {
    PostStats {
        id: row.get("id"),
        message_id: row.get("message_id"),
        views: row
            .get::<Option<i64>, _>("views")
            .and_then(|v| u64::try_from(v).ok()),
        reactions: row
            .get::<Option<i64>, _>("reactions")
            .and_then(|r| u64::try_from(r).ok()),
        scraping_stats: parse_snapshot_column(row.get("scraping_stats")),
        mtproto_stats: parse_snapshot_column(row.get("mtproto_stats")),
    }
}

/// A snapshot column that doesn't parse is treated as absent; stats reads
/// must never fail because one row holds garbage.
fn parse_snapshot_column(column: Option<String>) -> Option<StatsSnapshot> {
    let json = column?;
    match serde_json::from_str(&json) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            log::warn!("Ignoring an unparsable stats snapshot column: {}", e);
            None
        }
    }
}
