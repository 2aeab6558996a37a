use std::{fs, sync::Arc};

use teloxide::{dptree::deps, prelude::*};

use crate::{
    checks::cache::BotChecksCache,
    database::Database,
    handlers::{generate_bot_commands, handle_channel_post, handle_message},
    limiter::RateLimiter,
    stats::{sync::stats_sync_spinjob, userbot_feed::watch_userbot_feed},
};

/// # Panics
///
/// Panics if there's no key file or the database can't be opened.
pub async fn entry() {
    let key = fs::read_to_string(match cfg!(debug_assertions) {
        true => "key_debug",
        false => "key",
    })
    .expect("Could not load bot key file!");

    let bot = Bot::new(key.trim());

    bot.set_my_commands(generate_bot_commands())
        .await
        .expect("Failed to set bot commands!");

    let database: Arc<Database> = Database::new().await.expect("Failed to open database!");

    // Every service is constructed here and handed down by reference;
    // none of them are globals, so tests can spin up their own.
    let limiter = RateLimiter::new();
    let checks_cache = BotChecksCache::new();

    tokio::spawn(stats_sync_spinjob(Arc::downgrade(&database)));
    tokio::spawn(watch_userbot_feed(database.clone()));

    log::info!("Creating the handler...");

    let handler = dptree::entry()
        .branch(Update::filter_message().branch(dptree::endpoint(handle_message)))
        .branch(Update::filter_channel_post().branch(dptree::endpoint(handle_channel_post)));

    log::info!("Dispatching the dispatcher!");

    Dispatcher::builder(bot, handler)
        .default_handler(|_| async {})
        .dependencies(deps![database, limiter, checks_cache])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    log::info!("Dispatcher stopped.");
}
