//! Source code for Channel Pulse Bot, a stats companion for channel
//! admins who repost content: it merges per-post statistics collected by
//! scraping and by an MTProto userbot, and checks the bot's standing in
//! target channels without tripping the Telegram API rate limit.

/// Queueing rate limiter for outbound Telegram API calls.
pub mod limiter;

/// Bot permission checks and their short-lived cache.
pub mod checks;

/// Statistics: collection, ingestion, and merging.
pub mod stats;

/// The database.
pub mod database;

/// Functions that handle events from Telegram.
mod handlers;

/// Entry function that starts the bot.
mod entry;
pub use entry::*;

use teloxide::types::UserId;

/// The bot's owner, allowed to manage the tracked channel list.
pub static OWNER_ID: UserId = UserId(491732363);
