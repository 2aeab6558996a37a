//! Pulling post statistics off public t.me pages.
//!
//! Telegram serves an embeddable preview for public channel posts that
//! includes a views counter and, sometimes, reaction counters. No
//! authentication involved, which also means no forwards counter and
//! "1.2K"-rounded numbers.

use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

/// Views counter in the embed page:
/// `<span class="tgme_widget_message_views">1.2K</span>`
static VIEWS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)tgme_widget_message_views[^>]*>([^<]+)<").expect("Bad views regex!")
});

/// Per-reaction counters, the usual markup.
static REACTION_SPAN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)tgme_widget_message_reaction_count[^>]*>([^<]+)<")
        .expect("Bad reaction span regex!")
});

/// Per-reaction counters, the data-attribute variant some layouts use.
static REACTION_DATA_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)data-reaction-count=["']([^"']+)["']"#).expect("Bad reaction data regex!")
});

/// Subscriber line on the channel page:
/// `<div class="tgme_page_extra">12 345 subscribers</div>`
static SUBSCRIBERS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)([\d\s.,]+[KM]?)\s*subscribers").expect("Bad subscribers regex!")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrapedPostStats {
    pub views: u64,
    pub reactions: u64,
}

/// Client suitable for scraping: honest-looking user agent, short timeouts.
pub fn scraping_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
        .timeout(Duration::from_secs(7))
        .connect_timeout(Duration::from_secs(7))
        .build()
}

/// Fetch and parse the stats of one public channel post.
pub async fn fetch_post_stats(
    client: &reqwest::Client,
    channel: &str,
    message_id: i64,
) -> Result<ScrapedPostStats, reqwest::Error> {
    let channel = channel.trim_start_matches('@');
    let url = format!("https://t.me/{}/{}?embed=1&mode=tme", channel, message_id);

    let html = client
        .get(&url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;

    Ok(parse_post_stats(&html))
}

/// Fetch the channel's subscriber count from its public page, if Telegram
/// shows one.
pub async fn fetch_subscriber_count(
    client: &reqwest::Client,
    channel: &str,
) -> Result<Option<u64>, reqwest::Error> {
    let channel = channel.trim_start_matches('@');
    let url = format!("https://t.me/{}", channel);

    let html = client
        .get(&url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;

    Ok(parse_subscriber_count(&html))
}

fn parse_post_stats(html: &str) -> ScrapedPostStats {
    let views = VIEWS_RE
        .captures(html)
        .map(|c| parse_count(&c[1]))
        .unwrap_or(0);

    // Reaction counters are one element per reaction type; sum them.
    let mut reactions: u64 = REACTION_SPAN_RE
        .captures_iter(html)
        .map(|c| parse_count(&c[1]))
        .sum();

    if reactions == 0 {
        reactions = REACTION_DATA_RE
            .captures_iter(html)
            .map(|c| parse_count(&c[1]))
            .sum();
    }

    ScrapedPostStats { views, reactions }
}

fn parse_subscriber_count(html: &str) -> Option<u64> {
    SUBSCRIBERS_RE.captures(html).map(|c| parse_count(&c[1]))
}

/// Parse Telegram's abbreviated counters: "1.2K" is 1200, "5.3M" is
/// 5 300 000, "12 345" is 12345. Anything unparsable is 0.
pub(crate) fn parse_count(text: &str) -> u64 {
    // Some locales write the decimal separator as a comma.
    let text = text.trim().to_uppercase().replace(',', ".");

    if let Some(number) = text.strip_suffix('K') {
        return (number.trim().parse::<f64>().unwrap_or(0.0) * 1_000.0).round() as u64;
    }
    if let Some(number) = text.strip_suffix('M') {
        return (number.trim().parse::<f64>().unwrap_or(0.0) * 1_000_000.0).round() as u64;
    }

    let digits: String = text.chars().filter(char::is_ascii_digit).collect();
    digits.parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abbreviated_counts() {
        assert_eq!(parse_count("1.2K"), 1200);
        assert_eq!(parse_count("5.3M"), 5_300_000);
        assert_eq!(parse_count("847"), 847);
        assert_eq!(parse_count("12 345"), 12345);
        assert_eq!(parse_count("2,5k"), 2500);
        assert_eq!(parse_count(""), 0);
        assert_eq!(parse_count("soon"), 0);
    }

    #[test]
    fn post_stats_from_embed_html() {
        let html = r#"
            <div class="tgme_widget_message_info">
                <span class="tgme_widget_message_views">14.7K</span>
                <span class="tgme_widget_message_meta">edited</span>
            </div>
            <span class="tgme_widget_message_reaction_count">12</span>
            <span class="tgme_widget_message_reaction_count">3</span>
        "#;

        assert_eq!(
            parse_post_stats(html),
            ScrapedPostStats {
                views: 14700,
                reactions: 15
            }
        );
    }

    #[test]
    fn reaction_data_attribute_fallback() {
        let html = r#"
            <span class="tgme_widget_message_views">100</span>
            <i class="reaction" data-reaction-count="4"></i>
            <i class="reaction" data-reaction-count="1"></i>
        "#;

        assert_eq!(
            parse_post_stats(html),
            ScrapedPostStats {
                views: 100,
                reactions: 5
            }
        );
    }

    #[test]
    fn missing_counters_parse_as_zero() {
        assert_eq!(
            parse_post_stats("<html><body>nothing here</body></html>"),
            ScrapedPostStats {
                views: 0,
                reactions: 0
            }
        );
    }

    #[test]
    fn subscribers_from_channel_html() {
        let html = r#"<div class="tgme_page_extra">32 154 subscribers</div>"#;
        assert_eq!(parse_subscriber_count(html), Some(32154));

        let html = r#"<div class="tgme_page_extra">1.2K subscribers</div>"#;
        assert_eq!(parse_subscriber_count(html), Some(1200));

        assert_eq!(parse_subscriber_count("<div>no counter</div>"), None);
    }
}
