//! Ingesting MTProto statistics from the userbot collector.
//!
//! The collector runs as its own authenticated session elsewhere and drops
//! its results into a JSON-lines file next to the bot. This watcher picks
//! the file up whenever it changes and folds the records into the posts
//! table as `mtproto` snapshots.

use std::{path::Path, sync::Arc};

use chrono::Utc;
use notify::{RecursiveMode, Watcher};
use serde::Deserialize;

use crate::{database::Database, stats::StatsSnapshot};

static FEED_FILE: &str = "userbot_stats.jsonl";

/// One line of the drop file.
#[derive(Debug, Deserialize)]
struct FeedRecord {
    channel: String,
    message_id: i64,
    #[serde(flatten)]
    stats: StatsSnapshot,
}

pub async fn watch_userbot_feed(db_arc: Arc<Database>) {
    // First ingest whatever is already there...
    if let Err(e) = ingest_feed_to_database(&db_arc).await {
        log::warn!("Failed to ingest the userbot feed: {}", e);
    };

    let mut receiver = db_arc.drop_watch.0.subscribe();
    let database = Arc::downgrade(&db_arc);
    drop(db_arc);

    let update_notify = Arc::new(tokio::sync::Notify::new());
    let update_notify_watcher_clone = update_notify.clone();

    let mut watcher =
        notify::recommended_watcher(move |event: Result<notify::Event, notify::Error>| {
            let Ok(event) = event else {
                return;
            };
            let k = event.kind;
            if k.is_create() || k.is_modify() || k.is_other() {
                for path in &event.paths {
                    if path.ends_with(FEED_FILE) {
                        update_notify_watcher_clone.notify_waiters();
                        break;
                    }
                }
            }
        })
        .expect("Failed to create the feed watcher!");

    watcher
        .watch(Path::new("."), RecursiveMode::NonRecursive)
        .expect("Failed to watch the working directory!");

    loop {
        tokio::select! {
            _ = update_notify.notified() => {
                log::debug!("Userbot feed file changed!");
                let Some(database) = database.upgrade() else {
                    // The database was dropped.
                    break;
                };

                if let Err(e) = ingest_feed_to_database(&database).await {
                    log::warn!("Failed to ingest the userbot feed: {}", e);
                };
            },
            e = receiver.changed() => {
                // The sender only ever closes; it never sends.
                let Err(_e) = e else {
                    unreachable!();
                };

                break;
            }
        };
    }
}

async fn ingest_feed_to_database(database: &Database) -> std::io::Result<()> {
    use std::{
        fs::File,
        io::{BufRead, BufReader, Error, ErrorKind},
    };

    let file = match File::open(FEED_FILE) {
        Ok(file) => file,
        // The collector simply hasn't dropped anything yet.
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    let reader = BufReader::new(file);

    let mut ingested: u32 = 0;
    let mut error_counter: u8 = 0;

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let record = match parse_feed_line(&line) {
            Ok(record) => record,
            Err(e) => {
                error_counter = error_counter.saturating_add(1);
                if error_counter <= 3 {
                    log::warn!("Skipping a bad userbot feed line: {}", e);
                    if error_counter == 3 {
                        log::warn!("Suppressing further feed parse errors.");
                    }
                }
                continue;
            }
        };

        database
            .update_mtproto_stats(&record.channel, record.message_id, &record.stats)
            .await
            .map_err(|e| Error::new(ErrorKind::BrokenPipe, e))?;
        ingested += 1;
    }

    log::info!("Ingested {} userbot stat records", ingested);

    Ok(())
}

fn parse_feed_line(line: &str) -> Result<FeedRecord, serde_json::Error> {
    let mut record: FeedRecord = serde_json::from_str(line)?;

    // The collector is the MTProto session by definition; stamp the
    // snapshot accordingly if it didn't bother.
    if record.stats.method.is_none() {
        record.stats.method = Some("mtproto".to_string());
    }
    if record.stats.timestamp.is_none() {
        record.stats.timestamp = Some(Utc::now());
    }

    Ok(record)
}
