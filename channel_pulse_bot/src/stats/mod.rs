//! Merging per-post statistics collected by two different methods.
//!
//! MTProto numbers come from an authenticated userbot session and are the
//! most trustworthy; scraping numbers come from public t.me pages and are
//! good but incomplete (no forwards). Old rows may only have a bare views
//! counter with no collection time at all. The merge always answers
//! something and labels how much the answer can be trusted.

/// Collecting stats from public t.me pages.
pub mod scraping;

/// Periodic background refresh of scraping snapshots.
pub mod sync;

/// Ingesting the userbot collector's drop file.
pub mod userbot_feed;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Stats younger than this count as fresh.
const FRESH_WINDOW_MINUTES: i64 = 60;

/// One collection pass over a post by a single method.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub views: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reactions: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwards: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

/// A post row as the merge sees it: the legacy counters plus whatever
/// snapshots the collectors have managed to write so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostStats {
    pub id: i64,
    pub message_id: Option<i64>,
    pub views: Option<u64>,
    pub reactions: Option<u64>,
    pub scraping_stats: Option<StatsSnapshot>,
    pub mtproto_stats: Option<StatsSnapshot>,
}

/// Which collection method(s) the merged numbers came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatsSource {
    Mtproto,
    Scraping,
    Combined,
}

impl StatsSource {
    pub fn icon(self) -> &'static str {
        match self {
            StatsSource::Mtproto => "👁",
            StatsSource::Scraping => "🌐",
            StatsSource::Combined => "⚡",
        }
    }
}

/// Coarse trust label, driven solely by which sources contributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn label(self) -> &'static str {
        match self {
            Confidence::High => "high accuracy",
            Confidence::Medium => "medium accuracy",
            Confidence::Low => "low accuracy",
        }
    }
}

/// The reconciled view of one post. Derived on every read, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergedStats {
    pub views: u64,
    pub reactions: u64,
    pub forwards: u64,
    pub source: StatsSource,
    pub confidence: Confidence,
    #[serde(rename = "lastUpdated")]
    pub last_updated: DateTime<Utc>,
    #[serde(rename = "hasBothMethods")]
    pub has_both_methods: bool,
}

/// A collector that has no data for a field reports it as zero, so zero
/// falls through to the next source in line.
fn reported(value: Option<u64>) -> Option<u64> {
    value.filter(|&v| v != 0)
}

/// Merge a post's snapshots into one answer, preferring MTProto numbers
/// over scraping numbers over the legacy stored counter.
pub fn merge_stats(post: &PostStats) -> MergedStats {
    match (&post.mtproto_stats, &post.scraping_stats) {
        // Both methods delivered; the best case.
        (Some(mtproto), Some(scraping)) => MergedStats {
            views: reported(mtproto.views)
                .or(reported(scraping.views))
                .or(reported(post.views))
                .unwrap_or(0),
            reactions: reported(mtproto.reactions)
                .or(reported(scraping.reactions))
                .unwrap_or(0),
            forwards: mtproto.forwards.unwrap_or(0),
            source: StatsSource::Combined,
            confidence: Confidence::High,
            last_updated: mtproto
                .timestamp
                .or(scraping.timestamp)
                .unwrap_or_else(Utc::now),
            has_both_methods: true,
        },

        (Some(mtproto), None) => MergedStats {
            views: reported(mtproto.views).or(reported(post.views)).unwrap_or(0),
            reactions: reported(mtproto.reactions).unwrap_or(0),
            forwards: mtproto.forwards.unwrap_or(0),
            source: StatsSource::Mtproto,
            confidence: Confidence::High,
            last_updated: mtproto.timestamp.unwrap_or_else(Utc::now),
            has_both_methods: false,
        },

        (None, Some(scraping)) => MergedStats {
            views: reported(scraping.views).or(reported(post.views)).unwrap_or(0),
            reactions: reported(scraping.reactions).unwrap_or(0),
            // Scraping cannot observe forwards at all.
            forwards: 0,
            source: StatsSource::Scraping,
            confidence: Confidence::Medium,
            last_updated: scraping.timestamp.unwrap_or_else(Utc::now),
            has_both_methods: false,
        },

        // Nothing but the legacy counter. There is no snapshot to take a
        // timestamp from, so the merge time is used; a never-synced post
        // therefore reports itself as current.
        (None, None) => MergedStats {
            views: post.views.unwrap_or(0),
            reactions: 0,
            forwards: 0,
            source: StatsSource::Scraping,
            confidence: Confidence::Low,
            last_updated: Utc::now(),
            has_both_methods: false,
        },
    }
}

/// Merge a whole listing. Each post is merged independently; order is
/// preserved.
pub fn merge_posts_stats(posts: &[PostStats]) -> Vec<MergedStats> {
    posts.iter().map(merge_stats).collect()
}

/// Whether merged stats are recent enough to display without a staleness
/// warning.
pub fn is_stats_fresh(last_updated: DateTime<Utc>) -> bool {
    Utc::now().signed_duration_since(last_updated) < Duration::minutes(FRESH_WINDOW_MINUTES)
}

/// "just now", "5 min ago", "3 h ago", "2 d ago".
pub fn format_update_time(last_updated: DateTime<Utc>) -> String {
    let minutes = Utc::now()
        .signed_duration_since(last_updated)
        .num_minutes();

    if minutes < 1 {
        return "just now".to_string();
    }
    if minutes < 60 {
        return format!("{} min ago", minutes);
    }
    let hours = minutes / 60;
    if hours < 24 {
        return format!("{} h ago", hours);
    }
    format!("{} d ago", hours / 24)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(
        views: Option<u64>,
        reactions: Option<u64>,
        forwards: Option<u64>,
        timestamp: Option<DateTime<Utc>>,
    ) -> StatsSnapshot {
        StatsSnapshot {
            views,
            reactions,
            forwards,
            timestamp,
            method: None,
        }
    }

    #[test]
    fn merge_both_sources() {
        let t1 = Utc::now() - Duration::minutes(5);
        let t2 = Utc::now() - Duration::minutes(30);
        let post = PostStats {
            id: 1,
            views: Some(5),
            mtproto_stats: Some(snapshot(Some(10), Some(3), Some(7), Some(t1))),
            scraping_stats: Some(snapshot(Some(8), Some(2), None, Some(t2))),
            ..Default::default()
        };

        let merged = merge_stats(&post);
        assert_eq!(merged.views, 10);
        assert_eq!(merged.reactions, 3);
        assert_eq!(merged.forwards, 7);
        assert_eq!(merged.source, StatsSource::Combined);
        assert_eq!(merged.confidence, Confidence::High);
        assert_eq!(merged.last_updated, t1);
        assert!(merged.has_both_methods);
    }

    #[test]
    fn merge_mtproto_only() {
        let t1 = Utc::now() - Duration::minutes(5);
        let post = PostStats {
            id: 1,
            views: Some(5),
            mtproto_stats: Some(snapshot(None, None, Some(2), Some(t1))),
            ..Default::default()
        };

        let merged = merge_stats(&post);
        // No MTProto views reported, so the legacy counter steps in.
        assert_eq!(merged.views, 5);
        assert_eq!(merged.reactions, 0);
        assert_eq!(merged.forwards, 2);
        assert_eq!(merged.source, StatsSource::Mtproto);
        assert_eq!(merged.confidence, Confidence::High);
        assert_eq!(merged.last_updated, t1);
        assert!(!merged.has_both_methods);
    }

    #[test]
    fn merge_scraping_only() {
        let t2 = Utc::now() - Duration::minutes(30);
        let post = PostStats {
            id: 1,
            views: Some(5),
            scraping_stats: Some(snapshot(Some(8), Some(2), None, Some(t2))),
            ..Default::default()
        };

        let merged = merge_stats(&post);
        assert_eq!(merged.views, 8);
        assert_eq!(merged.reactions, 2);
        assert_eq!(merged.forwards, 0);
        assert_eq!(merged.source, StatsSource::Scraping);
        assert_eq!(merged.confidence, Confidence::Medium);
        assert_eq!(merged.last_updated, t2);
        assert!(!merged.has_both_methods);
    }

    #[test]
    fn merge_neither_source() {
        let post = PostStats {
            id: 1,
            views: Some(5),
            ..Default::default()
        };

        let before = Utc::now();
        let merged = merge_stats(&post);
        let after = Utc::now();

        assert_eq!(merged.views, 5);
        assert_eq!(merged.reactions, 0);
        assert_eq!(merged.forwards, 0);
        assert_eq!(merged.source, StatsSource::Scraping);
        assert_eq!(merged.confidence, Confidence::Low);
        assert!(!merged.has_both_methods);
        // The known quirk: with no snapshot at all, the merge stamps the
        // current time, so the post looks freshly updated.
        assert!(merged.last_updated >= before && merged.last_updated <= after);
        assert!(is_stats_fresh(merged.last_updated));
    }

    #[test]
    fn zero_views_fall_through_to_the_next_source() {
        let t = Utc::now();
        let post = PostStats {
            id: 1,
            views: Some(5),
            mtproto_stats: Some(snapshot(Some(0), None, None, Some(t))),
            scraping_stats: Some(snapshot(Some(8), None, None, Some(t))),
            ..Default::default()
        };

        assert_eq!(merge_stats(&post).views, 8);
    }

    #[test]
    fn merge_is_idempotent() {
        let t = Utc::now() - Duration::minutes(10);
        let post = PostStats {
            id: 1,
            views: Some(5),
            mtproto_stats: Some(snapshot(Some(10), Some(1), Some(2), Some(t))),
            ..Default::default()
        };

        assert_eq!(merge_stats(&post), merge_stats(&post));
    }

    #[test]
    fn batch_merge_preserves_order() {
        let t = Utc::now();
        let posts = vec![
            PostStats {
                id: 1,
                mtproto_stats: Some(snapshot(Some(10), None, None, Some(t))),
                ..Default::default()
            },
            PostStats {
                id: 2,
                scraping_stats: Some(snapshot(Some(20), None, None, Some(t))),
                ..Default::default()
            },
        ];

        let merged = merge_posts_stats(&posts);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].views, 10);
        assert_eq!(merged[1].views, 20);
    }

    #[test]
    fn freshness_boundary() {
        assert!(is_stats_fresh(Utc::now() - Duration::minutes(59)));
        assert!(!is_stats_fresh(Utc::now() - Duration::minutes(61)));
    }

    #[test]
    fn relative_time_formatting() {
        assert_eq!(format_update_time(Utc::now()), "just now");
        assert_eq!(
            format_update_time(Utc::now() - Duration::minutes(5)),
            "5 min ago"
        );
        assert_eq!(
            format_update_time(Utc::now() - Duration::hours(3)),
            "3 h ago"
        );
        assert_eq!(
            format_update_time(Utc::now() - Duration::days(2)),
            "2 d ago"
        );
    }

    #[test]
    fn snapshot_json_shape() {
        let parsed: StatsSnapshot = serde_json::from_str(
            r#"{"views": 100, "reactions": 4, "timestamp": "2025-06-01T12:00:00Z", "method": "mtproto"}"#,
        )
        .unwrap();
        assert_eq!(parsed.views, Some(100));
        assert_eq!(parsed.reactions, Some(4));
        assert_eq!(parsed.forwards, None);
        assert_eq!(parsed.method.as_deref(), Some("mtproto"));

        // Unknown or missing fields never make parsing fail.
        let sparse: StatsSnapshot = serde_json::from_str(r#"{"views": 1}"#).unwrap();
        assert_eq!(sparse.reactions, None);
    }
}
