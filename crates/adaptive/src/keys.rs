use std::num::NonZeroUsize;

use bytes::Bytes;
use lru::LruCache;
use url::Url;

/// Access-ordered cache of decryption keys, keyed by key URL.
///
/// An init segment and a media segment may be protected by different keys, so the
/// capacity is never below two.
pub struct KeyCache {
    inner: LruCache<Url, Bytes>,
}

impl KeyCache {
    pub const MIN_CAPACITY: usize = 2;

    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(Self::MIN_CAPACITY)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: LruCache::new(capacity),
        }
    }

    /// Returns the key and marks it as most recently used.
    pub fn get(&mut self, url: &Url) -> Option<Bytes> {
        self.inner.get(url).cloned()
    }

    /// Inserts a key, evicting the least recently used entry when full.
    pub fn put(&mut self, url: Url, key: Bytes) -> Option<(Url, Bytes)> {
        let evicted = self.inner.push(url, key);
        match evicted {
            Some((evicted_url, _)) if self.inner.contains(&evicted_url) => None,
            evicted => {
                if let Some((url, _)) = &evicted {
                    tracing::trace!(url = %url, "Evicted decryption key");
                }
                evicted
            }
        }
    }

    /// Takes a key out of the cache, forgetting its recency.
    pub fn remove(&mut self, url: &Url) -> Option<Bytes> {
        self.inner.pop(url)
    }

    pub fn contains(&self, url: &Url) -> bool {
        self.inner.contains(url)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.cap().get()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(i: usize) -> Url {
        Url::parse(&format!("https://example.com/key/{i}")).unwrap()
    }

    fn key(i: usize) -> Bytes {
        Bytes::from(vec![i as u8; 16])
    }

    #[test]
    fn test_capacity_floor() {
        assert_eq!(KeyCache::new(0).capacity(), 2);
        assert_eq!(KeyCache::new(1).capacity(), 2);
        assert_eq!(KeyCache::new(4).capacity(), 4);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let mut cache = KeyCache::new(4);
        for i in 0..4 {
            assert!(cache.put(url(i), key(i)).is_none());
        }
        // touch 0, so 1 becomes the eldest
        assert_eq!(cache.get(&url(0)), Some(key(0)));

        let evicted = cache.put(url(4), key(4));
        assert_eq!(evicted.map(|(u, _)| u), Some(url(1)));
        assert_eq!(cache.len(), 4);
        assert!(cache.contains(&url(0)));
        assert!(!cache.contains(&url(1)));
    }

    #[test]
    fn test_checkout_refreshes_recency() {
        let mut cache = KeyCache::new(2);
        cache.put(url(0), key(0));
        cache.put(url(1), key(1));

        let checked_out = cache.remove(&url(0)).unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.put(url(0), checked_out).is_none());

        // 1 is now the eldest
        cache.put(url(2), key(2));
        assert!(cache.contains(&url(0)));
        assert!(!cache.contains(&url(1)));
    }

    #[test]
    fn test_put_same_key_replaces_content() {
        let mut cache = KeyCache::new(2);
        cache.put(url(0), key(0));
        assert!(cache.put(url(0), key(9)).is_none());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&url(0)), Some(key(9)));
    }
}
