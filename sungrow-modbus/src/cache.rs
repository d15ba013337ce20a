//! Time-bounded cache of raw register words, shared by every poller and writer.
//!
//! Entries are keyed by `"{device}:{register}"`. Expiry is lazy: an expired entry is treated as
//! absent immediately but only removed when it is next touched (or explicitly cleared).

use serde::Serialize;
use std::{collections::HashMap, sync::Mutex, time::Duration};
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CachedValue {
    pub value: u16,
    pub expires_at: Instant,
}

impl CachedValue {
    pub fn new(value: u16, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    /// Expired but not yet purged
    pub expired_entries: usize,
}

#[derive(Debug, Default)]
pub struct RegisterCache {
    entries: Mutex<HashMap<String, CachedValue>>,
}

fn key(device: &str, register: u16) -> String {
    format!("{device}:{register}")
}

fn span(start: u16, count: u16) -> impl Iterator<Item = u16> {
    (start as u32..start as u32 + count as u32).map_while(|r| u16::try_from(r).ok())
}

impl RegisterCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, CachedValue>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, device: &str, register: u16) -> Option<u16> {
        let key = key(device, register);
        let mut entries = self.entries();
        let cached = *entries.get(&key)?;
        if cached.is_expired(Instant::now()) {
            entries.remove(&key);
            return None;
        }
        Some(cached.value)
    }

    pub fn set(&self, device: &str, register: u16, value: u16, ttl: Duration) {
        self.entries()
            .insert(key(device, register), CachedValue::new(value, ttl));
    }

    /// All-or-nothing read of `count` registers. A single missing or expired member purges the
    /// whole span.
    pub fn get_range(&self, device: &str, start: u16, count: u16) -> Option<Vec<u16>> {
        let now = Instant::now();
        let mut entries = self.entries();

        let values: Option<Vec<u16>> = span(start, count)
            .map(|register| {
                entries
                    .get(&key(device, register))
                    .filter(|cached| !cached.is_expired(now))
                    .map(|cached| cached.value)
            })
            .collect();

        if values.is_none() {
            for register in span(start, count) {
                entries.remove(&key(device, register));
            }
        }
        values.filter(|values| values.len() == count as usize)
    }

    pub fn set_range(&self, device: &str, start: u16, values: &[u16], ttl: Duration) {
        let mut entries = self.entries();
        for (register, value) in span(start, values.len() as u16).zip(values) {
            entries.insert(key(device, register), CachedValue::new(*value, ttl));
        }
    }

    pub fn is_range_cached(&self, device: &str, start: u16, count: u16) -> bool {
        let now = Instant::now();
        let entries = self.entries();
        span(start, count).all(|register| {
            entries
                .get(&key(device, register))
                .is_some_and(|cached| !cached.is_expired(now))
        })
    }

    pub fn invalidate(&self, device: &str, register: u16) {
        self.entries().remove(&key(device, register));
    }

    pub fn invalidate_range(&self, device: &str, start: u16, count: u16) {
        let mut entries = self.entries();
        for register in span(start, count) {
            entries.remove(&key(device, register));
        }
    }

    /// Drops every entry, or only those of `device`.
    pub fn clear(&self, device: Option<&str>) {
        let mut entries = self.entries();
        match device {
            None => entries.clear(),
            Some(device) => {
                let prefix = format!("{device}:");
                entries.retain(|key, _| !key.starts_with(&prefix));
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let entries = self.entries();
        CacheStats {
            total_entries: entries.len(),
            expired_entries: entries.values().filter(|c| c.is_expired(now)).count(),
        }
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[cfg(test)]
const DEVICE: &str = "tcp:10.0.0.5:502_1";

#[cfg(test)]
const MINUTE: Duration = Duration::from_secs(60);

#[tokio::test(start_paused = true)]
async fn values_expire_and_are_purged_on_access() {
    let cache = RegisterCache::new();
    cache.set(DEVICE, 5000, 1234, MINUTE);
    assert_eq!(cache.get(DEVICE, 5000), Some(1234));

    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(cache.get(DEVICE, 5000), Some(1234));

    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(cache.stats(), CacheStats { total_entries: 1, expired_entries: 1 });
    assert_eq!(cache.get(DEVICE, 5000), None);
    assert_eq!(cache.stats(), CacheStats { total_entries: 0, expired_entries: 0 });
}

#[test]
fn missing_values() {
    let cache = RegisterCache::new();
    assert_eq!(cache.get(DEVICE, 5000), None);
    cache.invalidate(DEVICE, 5000);
    cache.invalidate_range(DEVICE, 5000, 10);
}

#[test]
fn ranges_are_all_or_nothing() {
    let cache = RegisterCache::new();
    cache.set_range(DEVICE, 5000, &[1, 2, 3], MINUTE);
    assert_eq!(cache.get_range(DEVICE, 5000, 3), Some(vec![1, 2, 3]));
    assert!(cache.is_range_cached(DEVICE, 5000, 3));
    assert!(!cache.is_range_cached(DEVICE, 5000, 4));
    assert!(!cache.is_range_cached(DEVICE, 5001, 3));

    // one register short purges the rest of the span too
    assert_eq!(cache.get_range(DEVICE, 5000, 4), None);
    assert_eq!(cache.get(DEVICE, 5000), None);
    assert_eq!(cache.stats().total_entries, 0);
}

#[tokio::test(start_paused = true)]
async fn partially_expired_range_is_a_miss() {
    let cache = RegisterCache::new();
    cache.set(DEVICE, 5000, 1, Duration::from_secs(10));
    cache.set(DEVICE, 5001, 2, MINUTE);

    tokio::time::advance(Duration::from_secs(11)).await;
    assert_eq!(cache.get_range(DEVICE, 5000, 2), None);
    assert_eq!(cache.get(DEVICE, 5001), None);
}

#[test]
fn invalidate_range_keeps_neighbours() {
    let cache = RegisterCache::new();
    cache.set_range(DEVICE, 5000, &[100, 200, 300, 400, 500], MINUTE);
    assert!(cache.is_range_cached(DEVICE, 5000, 5));

    cache.invalidate_range(DEVICE, 5001, 3);
    assert_eq!(cache.get(DEVICE, 5000), Some(100));
    assert_eq!(cache.get(DEVICE, 5004), Some(500));
    for register in 5001..5004 {
        assert_eq!(cache.get(DEVICE, register), None);
    }
}

#[test]
fn clear_all_or_one_device() {
    let cache = RegisterCache::new();
    cache.set(DEVICE, 5000, 1, MINUTE);
    cache.set(DEVICE, 5001, 2, MINUTE);
    cache.set("other", 5000, 200, MINUTE);
    // "tcp:10.0.0.5:502_10" must not be caught by a prefix of "..._1"
    cache.set("tcp:10.0.0.5:502_10", 5000, 3, MINUTE);

    cache.clear(Some(DEVICE));
    assert_eq!(cache.stats().total_entries, 2);
    assert_eq!(cache.get("other", 5000), Some(200));
    assert_eq!(cache.get("tcp:10.0.0.5:502_10", 5000), Some(3));

    cache.clear(None);
    assert_eq!(cache.stats().total_entries, 0);
}

#[test]
fn devices_are_isolated_and_values_overwrite() {
    let cache = RegisterCache::new();
    cache.set("a", 5000, 100, MINUTE);
    cache.set("b", 5000, 200, MINUTE);
    assert_eq!(cache.get("a", 5000), Some(100));
    assert_eq!(cache.get("b", 5000), Some(200));

    cache.set("a", 5000, 300, MINUTE);
    assert_eq!(cache.get("a", 5000), Some(300));
}
