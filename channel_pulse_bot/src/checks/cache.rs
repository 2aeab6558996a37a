use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use tokio::time::Instant;

/// How long a check result stays valid.
pub const CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// How often the background sweep evicts stale entries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Outcome of checking the bot's standing in a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub is_admin: bool,
    pub is_member: bool,
    /// Human-readable explanation, suitable for showing to the user as-is.
    pub message: String,
}

struct CacheEntry {
    outcome: CheckOutcome,
    cached_at: Instant,
}

impl CacheEntry {
    /// The one staleness rule, shared by the read path and the sweep.
    fn is_stale(&self, now: Instant, ttl: Duration) -> bool {
        now.duration_since(self.cached_at) > ttl
    }
}

/// Point-in-time cache observability numbers. Instants are insertion times.
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub size: usize,
    pub oldest_entry: Option<Instant>,
    pub newest_entry: Option<Instant>,
}

/// Memoizes bot permission checks so repeated setup-screen refreshes don't
/// burn through the Telegram API quota.
///
/// Entries expire after [`CACHE_TTL`]; expired entries are dropped on
/// lookup, and a background sweep also clears them out periodically so the
/// map doesn't grow without read traffic. The sweep task holds a [`Weak`]
/// handle and dies together with the cache.
pub struct BotChecksCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl BotChecksCache {
    pub fn new() -> Arc<Self> {
        Self::with_ttl(CACHE_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Arc<Self> {
        let cache = Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        });

        tokio::spawn(sweep_spinjob(Arc::downgrade(&cache)));

        cache
    }

    /// Build the map key. Only the numeric bot ID before the colon goes in;
    /// the secret part of the token must never be stored anywhere.
    fn cache_key(bot_token: &str, channel_username: &str) -> String {
        let bot_id = bot_token.split(':').next().unwrap_or(bot_token);
        let channel = channel_username.trim_start_matches('@').to_lowercase();
        format!("{}:{}", bot_id, channel)
    }

    /// A cached outcome younger than the TTL, or `None`. Looking up a stale
    /// entry evicts it.
    pub fn get(&self, bot_token: &str, channel_username: &str) -> Option<CheckOutcome> {
        let key = Self::cache_key(bot_token, channel_username);
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("Checks cache lock poisoned!");

        match entries.get(&key) {
            Some(entry) if entry.is_stale(now, self.ttl) => {
                entries.remove(&key);
                None
            }
            Some(entry) => Some(entry.outcome.clone()),
            None => None,
        }
    }

    /// Insert or overwrite an outcome, stamped with the current time.
    pub fn set(&self, bot_token: &str, channel_username: &str, outcome: CheckOutcome) {
        let key = Self::cache_key(bot_token, channel_username);
        self.entries
            .lock()
            .expect("Checks cache lock poisoned!")
            .insert(
                key,
                CacheEntry {
                    outcome,
                    cached_at: Instant::now(),
                },
            );
    }

    /// Explicitly invalidate one entry.
    pub fn remove(&self, bot_token: &str, channel_username: &str) {
        let key = Self::cache_key(bot_token, channel_username);
        self.entries
            .lock()
            .expect("Checks cache lock poisoned!")
            .remove(&key);
    }

    /// Explicitly invalidate everything.
    pub fn clear(&self) {
        self.entries
            .lock()
            .expect("Checks cache lock poisoned!")
            .clear();
    }

    /// Drop all entries older than the TTL. Same rule as the read path.
    pub fn evict_stale(&self) {
        let now = Instant::now();
        self.entries
            .lock()
            .expect("Checks cache lock poisoned!")
            .retain(|_, entry| !entry.is_stale(now, self.ttl));
    }

    /// Size and insertion-time spread, for diagnostics. Does not touch
    /// entry lifetimes.
    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock().expect("Checks cache lock poisoned!");

        CacheStats {
            size: entries.len(),
            oldest_entry: entries.values().map(|e| e.cached_at).min(),
            newest_entry: entries.values().map(|e| e.cached_at).max(),
        }
    }
}

async fn sweep_spinjob(cache: Weak<BotChecksCache>) {
    loop {
        tokio::time::sleep(SWEEP_INTERVAL).await;

        let Some(cache) = cache.upgrade() else {
            // The cache was dropped; nothing left to sweep.
            return;
        };
        cache.evict_stale();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(message: &str) -> CheckOutcome {
        CheckOutcome {
            is_admin: true,
            is_member: true,
            message: message.to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hit_within_ttl_miss_after() {
        let cache = BotChecksCache::new();
        cache.set("123:secretpart", "somechannel", outcome("ok"));

        tokio::time::advance(Duration::from_secs(4 * 60)).await;
        assert_eq!(cache.get("123:secretpart", "somechannel"), Some(outcome("ok")));

        tokio::time::advance(Duration::from_secs(2 * 60)).await;
        assert_eq!(cache.get("123:secretpart", "somechannel"), None);
        // The stale entry was evicted by the lookup itself.
        assert_eq!(cache.stats().size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn key_uses_token_prefix_and_normalized_channel() {
        let cache = BotChecksCache::new();
        cache.set("123:secretpart", "@SomeChannel", outcome("ok"));

        // Same bot ID with a different secret, channel case-folded and
        // without the at sign: still the same entry.
        assert_eq!(
            cache.get("123:othersecret", "somechannel"),
            Some(outcome("ok"))
        );
        // Different bot ID: different entry.
        assert_eq!(cache.get("456:secretpart", "somechannel"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_only_stale_entries() {
        let cache = BotChecksCache::new();
        cache.set("123:a", "old", outcome("old"));

        tokio::time::advance(Duration::from_secs(6 * 60)).await;
        cache.set("123:a", "new", outcome("new"));
        cache.evict_stale();

        assert_eq!(cache.get("123:a", "old"), None);
        assert_eq!(cache.get("123:a", "new"), Some(outcome("new")));
        assert_eq!(cache.stats().size, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stats_do_not_mutate() {
        let cache = BotChecksCache::new();
        cache.set("123:a", "one", outcome("one"));
        tokio::time::advance(Duration::from_secs(60)).await;
        cache.set("123:a", "two", outcome("two"));

        let stats = cache.stats();
        assert_eq!(stats.size, 2);
        assert!(stats.oldest_entry.unwrap() < stats.newest_entry.unwrap());

        // Stale entries survive a stats call until something evicts them.
        tokio::time::advance(Duration::from_secs(6 * 60)).await;
        assert_eq!(cache.stats().size, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_invalidation() {
        let cache = BotChecksCache::new();
        cache.set("123:a", "one", outcome("one"));
        cache.set("123:a", "two", outcome("two"));

        cache.remove("123:a", "one");
        assert_eq!(cache.get("123:a", "one"), None);
        assert_eq!(cache.stats().size, 1);

        cache.clear();
        assert_eq!(cache.stats().size, 0);
    }
}
