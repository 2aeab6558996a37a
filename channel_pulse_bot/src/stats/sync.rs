//! Background refresh of scraping statistics.
//!
//! The MTProto side has its own collector feeding us through a drop file;
//! this spinjob covers the scraping side, walking every tracked channel on
//! a fixed cadence.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use chrono::Utc;
use tokio::time::sleep;

use crate::{
    database::Database,
    stats::{
        scraping::{self, scraping_client},
        StatsSnapshot,
    },
};

/// How often the scraping pass runs.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// How many of a channel's most recent posts get refreshed per pass.
const POSTS_PER_PASS: u32 = 50;

pub async fn stats_sync_spinjob(database: Weak<Database>) {
    let client = match scraping_client() {
        Ok(client) => client,
        Err(e) => {
            log::error!("Failed to build the scraping client: {}", e);
            return;
        }
    };

    loop {
        sleep(SYNC_INTERVAL).await;

        let Some(database) = database.upgrade() else {
            return;
        };

        if let Err(e) = sync_all_channels(&database, &client).await {
            log::warn!("Stats sync pass failed: {}", e);
        }
    }
}

async fn sync_all_channels(
    database: &Arc<Database>,
    client: &reqwest::Client,
) -> Result<(), crate::database::Error> {
    let channels = database.list_tracked_channels().await?;
    log::debug!("Starting a scraping pass over {} channels", channels.len());

    for channel in channels {
        let posts = database
            .recent_posts(&channel.username, POSTS_PER_PASS)
            .await?;

        let mut updated: u32 = 0;
        for post in &posts {
            let Some(message_id) = post.message_id else {
                continue;
            };

            match scraping::fetch_post_stats(client, &channel.username, message_id).await {
                Ok(stats) => {
                    let snapshot = StatsSnapshot {
                        views: Some(stats.views),
                        reactions: Some(stats.reactions),
                        forwards: None,
                        timestamp: Some(Utc::now()),
                        method: Some("scraping".to_string()),
                    };
                    database.update_scraping_stats(post.id, &snapshot).await?;
                    updated += 1;
                }
                Err(e) => {
                    log::warn!(
                        "Could not scrape {}/{}: {}",
                        channel.username,
                        message_id,
                        e
                    );
                }
            }
        }

        match scraping::fetch_subscriber_count(client, &channel.username).await {
            Ok(Some(subscribers)) => {
                database
                    .update_subscriber_count(&channel.username, subscribers)
                    .await?;
            }
            Ok(None) => {}
            Err(e) => log::warn!(
                "Could not fetch subscriber count for {}: {}",
                channel.username,
                e
            ),
        }

        log::info!(
            "Refreshed {}/{} posts for @{}",
            updated,
            posts.len(),
            channel.username
        );

        // Be gentle with t.me between channels.
        sleep(Duration::from_secs(1)).await;
    }

    Ok(())
}
