//! Checking that the bot is actually inside a channel and allowed to do
//! its job there, without hammering the Telegram API on every page of the
//! setup flow.

pub mod cache;

use std::{fmt::Display, sync::Arc};

use teloxide::{
    prelude::*,
    types::{ChatId, ChatMember, Recipient, UserId},
    ApiError, Bot, RequestError,
};

use crate::limiter::{RateLimiter, SubmitError};
use cache::{BotChecksCache, CheckOutcome};

/// Failure of the check machinery itself. Outcomes like "the bot is not an
/// admin" are not errors; they come back as a [`CheckOutcome`].
#[derive(Debug)]
pub enum CheckError {
    /// The rate limiter queue dropped or timed out the call.
    Queue(SubmitError),
    /// Telegram rejected the call for a reason that says nothing about the
    /// channel itself, so the result is not cacheable.
    Api(RequestError),
}

impl Display for CheckError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckError::Queue(e) => write!(f, "check call never ran: {}", e),
            CheckError::Api(e) => write!(f, "check call failed: {}", e),
        }
    }
}

impl std::error::Error for CheckError {}

impl From<SubmitError> for CheckError {
    fn from(value: SubmitError) -> Self {
        CheckError::Queue(value)
    }
}

impl From<RequestError> for CheckError {
    fn from(value: RequestError) -> Self {
        CheckError::Api(value)
    }
}

/// Turn user input into something Telegram accepts as a chat target.
/// Numeric input is a chat ID; anything else is a username that needs an
/// `@` in front, whether or not the user typed one.
fn channel_recipient(channel: &str) -> Recipient {
    match channel.parse::<i64>() {
        Ok(id) => Recipient::Id(ChatId(id)),
        Err(_) => Recipient::ChannelUsername(format!("@{}", channel.trim_start_matches('@'))),
    }
}

/// The bot's own user ID, read off the token prefix. Telegram tokens are
/// `<bot id>:<secret>`.
fn bot_user_id(token: &str) -> Option<UserId> {
    token
        .split(':')
        .next()
        .and_then(|id| id.parse::<u64>().ok())
        .map(UserId)
}

/// Check whether the bot is a member and an admin of `channel`, going
/// through `limiter` for the actual API calls and memoizing conclusive
/// outcomes in `cache`.
///
/// Transport-level failures are returned as [`CheckError`] and are never
/// cached; everything Telegram actually answered becomes a cacheable
/// [`CheckOutcome`].
pub async fn check_bot_in_channel(
    bot: &Bot,
    limiter: &Arc<RateLimiter>,
    cache: &BotChecksCache,
    channel: &str,
) -> Result<CheckOutcome, CheckError> {
    let token = bot.token();

    if let Some(cached) = cache.get(token, channel) {
        log::debug!("Check for {} answered from cache", channel);
        return Ok(cached);
    }

    let Some(bot_id) = bot_user_id(token) else {
        // A token Telegram accepted but we can't parse. Should not happen,
        // but answering "not a member" beats panicking.
        log::error!("Bot token has no parsable numeric prefix!");
        return Ok(CheckOutcome {
            is_admin: false,
            is_member: false,
            message: "Could not determine the bot's own ID.".to_string(),
        });
    };

    let recipient = channel_recipient(channel);

    // getChatMember works even for private channels, so it goes first.
    let member = {
        let bot = bot.clone();
        let recipient = recipient.clone();
        limiter
            .submit(move || async move { bot.get_chat_member(recipient, bot_id).await })
            .await?
    };

    let outcome = match member {
        Err(RequestError::Api(ApiError::ChatNotFound)) => CheckOutcome {
            is_admin: false,
            is_member: false,
            message: "The bot is not in this channel. For a private channel, \
                      add the bot as an administrator first."
                .to_string(),
        },
        Err(e) => return Err(e.into()),
        Ok(ChatMember { kind, .. }) if !kind.is_present() => CheckOutcome {
            is_admin: false,
            is_member: false,
            message: "The bot was removed from or never joined this channel.".to_string(),
        },
        Ok(ChatMember { kind, .. }) if !kind.is_privileged() => CheckOutcome {
            is_admin: false,
            is_member: true,
            message: "The bot is in the channel but has no administrator \
                      rights. Promote it to administrator."
                .to_string(),
        },
        Ok(_) => {
            // The bot is an admin, so getChat is allowed now; make sure the
            // target is actually a channel and not something else.
            let chat_full = {
                let bot = bot.clone();
                limiter
                    .submit(move || async move { bot.get_chat(recipient).await })
                    .await??
            };

            if chat_full.is_channel() {
                CheckOutcome {
                    is_admin: true,
                    is_member: true,
                    message: "The bot is connected and has all the rights it needs."
                        .to_string(),
                }
            } else {
                let kind = if chat_full.is_group() {
                    "a group"
                } else if chat_full.is_supergroup() {
                    "a supergroup"
                } else if chat_full.is_private() {
                    "a private chat"
                } else {
                    "not a channel"
                };
                CheckOutcome {
                    is_admin: false,
                    is_member: true,
                    message: format!("This is {}, not a channel.", kind),
                }
            }
        }
    };

    cache.set(token, channel, outcome.clone());

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipients_from_user_input() {
        assert_eq!(
            channel_recipient("-1001234567890"),
            Recipient::Id(ChatId(-1001234567890))
        );
        assert_eq!(
            channel_recipient("@somechannel"),
            Recipient::ChannelUsername("@somechannel".to_string())
        );
        assert_eq!(
            channel_recipient("somechannel"),
            Recipient::ChannelUsername("@somechannel".to_string())
        );
    }

    #[test]
    fn bot_id_comes_from_token_prefix() {
        assert_eq!(
            bot_user_id("1234567:AAAA-secret-part"),
            Some(UserId(1234567))
        );
        assert_eq!(bot_user_id("garbage"), None);
    }
}
