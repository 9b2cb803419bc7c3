//! A byte-budgeted store of encoded single-key responses.
//!
//! Values are kept in already-encoded wire form so a hit is a buffer copy
//! rather than a re-serialization. Every entry carries the configured TTL
//! ceiling, and the whole store never holds more than the configured number
//! of bytes; under pressure the least-recently-used entries are evicted, so
//! callers must treat any entry as free to vanish at any time. All failures
//! inside the cache degrade to a miss and are never surfaced to clients.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::debug;

use crate::protocol::Message;

/// An invalidation-coherent response cache for one upstream.
///
/// Internally synchronized: any number of tasks may call into it
/// concurrently through a shared reference.
pub struct Cache {
    inner: RwLock<Inner>,
    max_bytes: usize,
    ttl: Duration,
    /// Reference point for the atomic last-use stamps.
    epoch: Instant,
}

struct Inner {
    entries: HashMap<Vec<u8>, Entry>,
    total_bytes: usize,
}

struct Entry {
    data: Bytes,
    expires_at: Instant,
    /// Milliseconds since the cache epoch; bumped on every read so reads
    /// never need the write lock.
    last_used: AtomicU64,
}

impl Cache {
    pub fn new(max_bytes: usize, ttl: Duration) -> Cache {
        Cache {
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                total_bytes: 0,
            }),
            max_bytes,
            ttl,
            epoch: Instant::now(),
        }
    }

    /// Store a response message under the given positional key list.
    ///
    /// Error messages are never stored. Arrays are split element-wise and
    /// zipped with `keys`, so an `MGET` reply becomes one entry per key;
    /// anything else is stored whole under `keys[0]`.
    pub fn set(&self, keys: &[Bytes], message: &Message) {
        match message {
            Message::Error(_) => {}
            Message::Array(items) => {
                for (key, item) in keys.iter().zip(items) {
                    self.set(std::slice::from_ref(key), item);
                }
            }
            _ => {
                let key = match keys.first() {
                    Some(key) => key,
                    None => {
                        debug!("cache set with no key, dropping");
                        return;
                    }
                };
                self.insert(key, message.to_bytes());
            }
        }
    }

    /// Look up one key, decoding the stored response. Expired entries and
    /// decode failures are misses.
    pub fn get(&self, key: &[u8]) -> Option<Message> {
        let inner = match self.inner.read() {
            Ok(inner) => inner,
            Err(_) => return None,
        };
        let entry = inner.entries.get(key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        entry.last_used.store(self.now_millis(), Ordering::Relaxed);
        match Message::parse(&entry.data) {
            Ok(Some((message, used))) if used == entry.data.len() => Some(message),
            _ => {
                debug!("cache entry failed to decode, treating as miss");
                None
            }
        }
    }

    /// Look up every key, or nothing: a single absent key aborts the whole
    /// read so multi-key responses are never assembled from a partial hit.
    pub fn get_all(&self, keys: &[Bytes]) -> Option<Vec<Message>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key)?);
        }
        Some(values)
    }

    /// Remove one key. Removing an absent key is a no-op.
    pub fn delete(&self, key: &[u8]) {
        if let Ok(mut inner) = self.inner.write() {
            if let Some(entry) = inner.entries.remove(key) {
                inner.total_bytes -= entry.data.len();
            }
        }
    }

    /// Drop every entry.
    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.write() {
            inner.entries.clear();
            inner.total_bytes = 0;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, key: &Bytes, data: Bytes) {
        if data.len() > self.max_bytes {
            debug!(bytes = data.len(), "encoded response exceeds cache budget, not caching");
            return;
        }
        let mut inner = match self.inner.write() {
            Ok(inner) => inner,
            Err(_) => return,
        };
        if let Some(old) = inner.entries.remove(&key[..]) {
            inner.total_bytes -= old.data.len();
        }
        if inner.total_bytes + data.len() > self.max_bytes {
            self.evict(&mut inner, data.len());
        }
        inner.total_bytes += data.len();
        inner.entries.insert(
            key.to_vec(),
            Entry {
                data,
                expires_at: Instant::now() + self.ttl,
                last_used: AtomicU64::new(self.now_millis()),
            },
        );
    }

    /// Make room for `incoming` bytes: drop expired entries first, then the
    /// least recently used until the budget holds.
    fn evict(&self, inner: &mut Inner, incoming: usize) {
        let now = Instant::now();
        let expired: Vec<Vec<u8>> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            if let Some(entry) = inner.entries.remove(&key) {
                inner.total_bytes -= entry.data.len();
            }
        }

        if inner.total_bytes + incoming <= self.max_bytes {
            return;
        }
        let mut by_age: Vec<(u64, Vec<u8>)> = inner
            .entries
            .iter()
            .map(|(key, entry)| (entry.last_used.load(Ordering::Relaxed), key.clone()))
            .collect();
        by_age.sort_unstable();
        for (_, key) in by_age {
            if inner.total_bytes + incoming <= self.max_bytes {
                break;
            }
            if let Some(entry) = inner.entries.remove(&key) {
                inner.total_bytes -= entry.data.len();
            }
        }
    }

    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("max_bytes", &self.max_bytes)
            .field("ttl", &self.ttl)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(parts: &[&str]) -> Vec<Bytes> {
        parts
            .iter()
            .map(|p| Bytes::copy_from_slice(p.as_bytes()))
            .collect()
    }

    #[test]
    fn test_set_get_single() {
        let cache = Cache::new(1024, Duration::from_secs(60));
        cache.set(&keys(&["foo"]), &Message::bulk(&b"bar"[..]));
        assert_eq!(Some(Message::bulk(&b"bar"[..])), cache.get(b"foo"));
        assert_eq!(None, cache.get(b"baz"));
    }

    #[test]
    fn test_array_splits_positionally() {
        let cache = Cache::new(1024, Duration::from_secs(60));
        let reply = Message::Array(vec![
            Message::bulk(&b"1"[..]),
            Message::Null,
            Message::bulk(&b"3"[..]),
        ]);
        cache.set(&keys(&["a", "b", "c"]), &reply);
        assert_eq!(Some(Message::bulk(&b"1"[..])), cache.get(b"a"));
        assert_eq!(Some(Message::Null), cache.get(b"b"));
        assert_eq!(Some(Message::bulk(&b"3"[..])), cache.get(b"c"));
    }

    #[test]
    fn test_errors_never_cached() {
        let cache = Cache::new(1024, Duration::from_secs(60));
        cache.set(&keys(&["k"]), &Message::Error("ERR nope".into()));
        assert_eq!(None, cache.get(b"k"));

        let reply = Message::Array(vec![
            Message::bulk(&b"ok"[..]),
            Message::Error("ERR nope".into()),
        ]);
        cache.set(&keys(&["a", "b"]), &reply);
        assert_eq!(Some(Message::bulk(&b"ok"[..])), cache.get(b"a"));
        assert_eq!(None, cache.get(b"b"));
    }

    #[test]
    fn test_get_all_is_all_or_nothing() {
        let cache = Cache::new(1024, Duration::from_secs(60));
        cache.set(&keys(&["a"]), &Message::bulk(&b"1"[..]));
        assert_eq!(None, cache.get_all(&keys(&["a", "b"])));
        cache.set(&keys(&["b"]), &Message::bulk(&b"2"[..]));
        assert_eq!(
            Some(vec![Message::bulk(&b"1"[..]), Message::bulk(&b"2"[..])]),
            cache.get_all(&keys(&["a", "b"]))
        );
    }

    #[test]
    fn test_ttl_ceiling() {
        let cache = Cache::new(1024, Duration::from_millis(20));
        cache.set(&keys(&["foo"]), &Message::bulk(&b"bar"[..]));
        assert!(cache.get(b"foo").is_some());
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(None, cache.get(b"foo"));
    }

    #[test]
    fn test_delete_and_clear() {
        let cache = Cache::new(1024, Duration::from_secs(60));
        cache.set(&keys(&["a"]), &Message::bulk(&b"1"[..]));
        cache.set(&keys(&["b"]), &Message::bulk(&b"2"[..]));
        cache.delete(b"a");
        cache.delete(b"a");
        assert_eq!(None, cache.get(b"a"));
        assert!(cache.get(b"b").is_some());
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_memory_cap_evicts_lru() {
        // Each entry encodes to 11 bytes ($4\r\nvvvv\r\n is 10; use 4-byte
        // payloads: "$4\r\n0000\r\n" = 10 bytes).
        let cache = Cache::new(30, Duration::from_secs(60));
        cache.set(&keys(&["a"]), &Message::bulk(&b"0000"[..]));
        std::thread::sleep(Duration::from_millis(5));
        cache.set(&keys(&["b"]), &Message::bulk(&b"1111"[..]));
        std::thread::sleep(Duration::from_millis(5));
        cache.set(&keys(&["c"]), &Message::bulk(&b"2222"[..]));
        // Touch "a" so "b" is now the coldest entry.
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(b"a").is_some());
        std::thread::sleep(Duration::from_millis(5));
        cache.set(&keys(&["d"]), &Message::bulk(&b"3333"[..]));
        assert_eq!(None, cache.get(b"b"));
        assert!(cache.get(b"a").is_some());
        assert!(cache.get(b"c").is_some());
        assert!(cache.get(b"d").is_some());
    }

    #[test]
    fn test_oversized_value_not_cached() {
        let cache = Cache::new(8, Duration::from_secs(60));
        cache.set(&keys(&["big"]), &Message::bulk(&b"0123456789"[..]));
        assert_eq!(None, cache.get(b"big"));
        assert!(cache.is_empty());
    }
}
