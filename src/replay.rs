//! Seen-signature cache that turns a solved challenge into a one-shot ticket.
use moka::sync::Cache;

/// Remembers solved challenges until they expire.
pub trait ReplayCache: Send + Sync {
    /// Record `signature` as used until `expires_at` (unix seconds).
    ///
    /// Returns `false` if the signature was already recorded and has not
    /// expired at `now`.
    fn insert_if_absent(&self, signature: &str, expires_at: u64, now: u64) -> bool;
}

/// In-memory [`ReplayCache`] backed by `moka::sync::Cache` storing expiry timestamps.
#[derive(Debug, Clone)]
pub struct MokaReplayCache {
    inner: Cache<String, u64>,
}

impl MokaReplayCache {
    pub fn new(max_capacity: u64) -> Self {
        Self {
            inner: Cache::builder().max_capacity(max_capacity).build(),
        }
    }
}

impl ReplayCache for MokaReplayCache {
    fn insert_if_absent(&self, signature: &str, expires_at: u64, now: u64) -> bool {
        let entry = self.inner.entry_by_ref(signature).or_insert(expires_at);
        if entry.is_fresh() {
            return true;
        }
        if *entry.value() >= now {
            return false;
        }
        self.inner.insert(signature.to_owned(), expires_at);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_use_is_refused_until_expiry() {
        let cache = MokaReplayCache::new(16);
        assert!(cache.insert_if_absent("sig", 100, 50));
        assert!(!cache.insert_if_absent("sig", 100, 60));
        assert!(!cache.insert_if_absent("sig", 100, 100));
        assert!(cache.insert_if_absent("other", 100, 60));
        // Past its expiry the challenge fails verification anyway; the slot is reusable.
        assert!(cache.insert_if_absent("sig", 200, 101));
        assert!(!cache.insert_if_absent("sig", 200, 150));
    }
}
