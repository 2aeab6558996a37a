use std::sync::Arc;

use html_escape::encode_text;
use pulse_bot_commons::useful_methods::BotPulseSendMsg;
use teloxide::{
    prelude::*,
    types::{BotCommand, Me},
    Bot, RequestError,
};

use crate::{
    checks::{cache::BotChecksCache, check_bot_in_channel},
    database::Database,
    limiter::RateLimiter,
    stats::{format_update_time, is_stats_fresh, merge_stats},
    OWNER_ID,
};

pub fn generate_bot_commands() -> Vec<BotCommand> {
    vec![
        BotCommand::new("check", "Check the bot's rights in a channel"),
        BotCommand::new("stats", "Show merged stats for a tracked channel"),
        BotCommand::new("track", "Start tracking a channel (owner only)"),
        BotCommand::new("untrack", "Stop tracking a channel (owner only)"),
        BotCommand::new("queue", "Show limiter and cache diagnostics"),
        BotCommand::new("help", "Show usage"),
    ]
}

const HELP_TEXT: &str = "
This bot keeps an eye on the channels you repost to: how your posts \
perform (views, reactions, forwards) and whether the bot still has the \
rights it needs.

Commands:
/check &lt;channel&gt; — check that the bot is an admin of the channel
/stats &lt;channel&gt; — merged statistics for recent posts
/track &lt;channel&gt; — start tracking a channel
/untrack &lt;channel&gt; — stop tracking a channel
/queue — rate limiter and cache diagnostics

Statistics come from two collectors: public t.me scraping and an MTProto \
userbot session. Numbers shown are the best merge of the two.";

pub async fn handle_message(
    bot: Bot,
    me: Me,
    message: Message,
    database: Arc<Database>,
    limiter: Arc<RateLimiter>,
    checks_cache: Arc<BotChecksCache>,
) -> Result<(), RequestError> {
    // This is an admin tool; it only talks in private chats.
    if !message.chat.is_private() {
        return Ok(());
    }

    if handle_command(&bot, &me, &message, &database, &limiter, &checks_cache).await? {
        return Ok(());
    }

    bot.pulse_send_html(message.chat.id, HELP_TEXT).await?;
    Ok(())
}

/// Returns `true` if a command was parsed and responded to.
async fn handle_command(
    bot: &Bot,
    me: &Me,
    message: &Message,
    database: &Arc<Database>,
    limiter: &Arc<RateLimiter>,
    checks_cache: &Arc<BotChecksCache>,
) -> Result<bool, RequestError> {
    // Get text of the message.
    let Some(text) = message.text() else {
        return Ok(false);
    };
    // Check if it starts with "/", like how a command should.
    if !text.starts_with('/') {
        return Ok(false);
    }
    // Get first word in the message, the command itself.
    let Some(command) = text.split_whitespace().next() else {
        return Ok(false);
    };

    let command_full_len = command.len();

    // Trim the bot's username from the command and convert to lowercase.
    let username = format!("@{}", me.username());
    let command = command.trim_end_matches(username.as_str()).to_lowercase();
    let params = text[command_full_len..].trim_start();

    let is_owner = message.from().map(|user| user.id) == Some(OWNER_ID);

    let command_processed = match command.as_str() {
        "/check" => {
            handle_check(bot, message, limiter, checks_cache, params).await?;
            true
        }
        "/stats" => {
            handle_stats(bot, message, database, params).await?;
            true
        }
        "/track" | "/untrack" if !is_owner => {
            bot.pulse_send_html(
                message.chat.id,
                "Only the bot's owner can change the tracked channel list.",
            )
            .await?;
            true
        }
        "/track" => {
            handle_track(bot, message, database, params).await?;
            true
        }
        "/untrack" => {
            handle_untrack(bot, message, database, params).await?;
            true
        }
        "/queue" => {
            handle_queue(bot, message, limiter, checks_cache).await?;
            true
        }
        // "/start" and "/help" fall through to the help message.
        _ => false,
    };

    Ok(command_processed)
}

/// The first word of the params, if there is one.
fn channel_param(params: &str) -> Option<&str> {
    params.split_whitespace().next()
}

async fn handle_check(
    bot: &Bot,
    message: &Message,
    limiter: &Arc<RateLimiter>,
    checks_cache: &Arc<BotChecksCache>,
    params: &str,
) -> Result<(), RequestError> {
    let Some(channel) = channel_param(params) else {
        bot.pulse_send_html(message.chat.id, "Usage: /check &lt;channel&gt;")
            .await?;
        return Ok(());
    };

    let response = match check_bot_in_channel(bot, limiter, checks_cache, channel).await {
        Ok(outcome) => {
            let marker = if outcome.is_admin { "✅" } else { "❌" };
            format!("{} {}", marker, encode_text(&outcome.message))
        }
        Err(e) => {
            log::warn!("Check for {} failed: {}", channel, e);
            format!("⚠️ Could not reach Telegram: {}", encode_text(&e.to_string()))
        }
    };

    bot.pulse_send_html(message.chat.id, response.as_str()).await?;
    Ok(())
}

async fn handle_stats(
    bot: &Bot,
    message: &Message,
    database: &Arc<Database>,
    params: &str,
) -> Result<(), RequestError> {
    let Some(channel) = channel_param(params) else {
        bot.pulse_send_html(message.chat.id, "Usage: /stats &lt;channel&gt;")
            .await?;
        return Ok(());
    };

    if !database.is_tracked(channel).await.expect("Database died!") {
        bot.pulse_send_html(
            message.chat.id,
            "That channel isn't tracked. Use /track first.",
        )
        .await?;
        return Ok(());
    }

    let posts = database
        .recent_posts(channel, 10)
        .await
        .expect("Database died!");

    if posts.is_empty() {
        bot.pulse_send_html(
            message.chat.id,
            "No posts recorded for that channel yet.",
        )
        .await?;
        return Ok(());
    }

    let subscribers = database
        .list_tracked_channels()
        .await
        .expect("Database died!")
        .into_iter()
        .find(|c| c.username.eq_ignore_ascii_case(channel.trim_start_matches('@')))
        .and_then(|c| c.subscribers);

    let mut response = format!("📊 <b>@{}</b>", encode_text(channel.trim_start_matches('@')));
    if let Some(subscribers) = subscribers {
        response += &format!(" — {} subscribers", subscribers);
    }
    response += "\n\n";

    for post in &posts {
        let merged = merge_stats(post);
        let staleness = if is_stats_fresh(merged.last_updated) {
            String::new()
        } else {
            " (stale)".to_string()
        };

        response += &format!(
            "{} post {}: {} views, {} reactions, {} forwards — {}, {}{}\n",
            merged.source.icon(),
            post.message_id.unwrap_or(0),
            merged.views,
            merged.reactions,
            merged.forwards,
            merged.confidence.label(),
            format_update_time(merged.last_updated),
            staleness,
        );
    }

    bot.pulse_send_html(message.chat.id, response.as_str()).await?;
    Ok(())
}

async fn handle_track(
    bot: &Bot,
    message: &Message,
    database: &Arc<Database>,
    params: &str,
) -> Result<(), RequestError> {
    let Some(channel) = channel_param(params) else {
        bot.pulse_send_html(message.chat.id, "Usage: /track &lt;channel&gt;")
            .await?;
        return Ok(());
    };

    database
        .track_channel(channel)
        .await
        .expect("Database died!");

    bot.pulse_send_html(
        message.chat.id,
        format!(
            "Tracking @{}. Stats will appear after the next sync pass.",
            encode_text(channel.trim_start_matches('@'))
        )
        .as_str(),
    )
    .await?;
    Ok(())
}

async fn handle_untrack(
    bot: &Bot,
    message: &Message,
    database: &Arc<Database>,
    params: &str,
) -> Result<(), RequestError> {
    let Some(channel) = channel_param(params) else {
        bot.pulse_send_html(message.chat.id, "Usage: /untrack &lt;channel&gt;")
            .await?;
        return Ok(());
    };

    let removed = database
        .untrack_channel(channel)
        .await
        .expect("Database died!");

    let response = if removed {
        format!(
            "No longer tracking @{}.",
            encode_text(channel.trim_start_matches('@'))
        )
    } else {
        "That channel wasn't tracked.".to_string()
    };

    bot.pulse_send_html(message.chat.id, response.as_str()).await?;
    Ok(())
}

async fn handle_queue(
    bot: &Bot,
    message: &Message,
    limiter: &Arc<RateLimiter>,
    checks_cache: &Arc<BotChecksCache>,
) -> Result<(), RequestError> {
    let cache_stats = checks_cache.stats();
    let oldest_age = cache_stats
        .oldest_entry
        .map(|at| format!("{}s", at.elapsed().as_secs()))
        .unwrap_or_else(|| "n/a".to_string());

    let response = format!(
        "Limiter queue depth: {}\nAbandoned calls: {}\nCheck cache entries: {} (oldest {})",
        limiter.size(),
        limiter.abandoned_count(),
        cache_stats.size,
        oldest_age,
    );

    bot.pulse_send_html(message.chat.id, response.as_str()).await?;
    Ok(())
}

/// Posts in tracked channels get recorded so the sync job can keep their
/// stats fresh.
pub async fn handle_channel_post(
    message: Message,
    database: Arc<Database>,
) -> Result<(), RequestError> {
    let Some(username) = message.chat.username() else {
        // Private channel with no username; scraping can't see it anyway.
        return Ok(());
    };

    if !database.is_tracked(username).await.expect("Database died!") {
        return Ok(());
    }

    database
        .record_post(username, i64::from(message.id.0))
        .await
        .expect("Database died!");

    log::debug!("Recorded post {} in @{}", message.id.0, username);

    Ok(())
}
