use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::db::SharedStore;
use crate::models::DiscoveredEvent;
use crate::utils;

pub const CACHE_KEY_PREFIX: &str = "ballot:event-cache:";
pub const CACHE_VERSION: u32 = 1;
pub const DEFAULT_TTL: Duration = Duration::from_secs(12 * 60 * 60);

#[derive(Serialize, Deserialize)]
struct CacheEntry {
    location: String,
    events: Vec<DiscoveredEvent>,
    timestamp: i64,
    version: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedEvents {
    pub events: Vec<DiscoveredEvent>,
    pub age_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheInfo {
    pub exists: bool,
    pub age_ms: Option<i64>,
    pub is_valid: bool,
    pub event_count: usize,
}

/// Lowercase, whitespace runs to `-`, everything but `[a-z0-9-]` dropped.
pub fn normalize_location(location: &str) -> String {
    location
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .collect()
}

fn cache_key(location: &str) -> String {
    format!("{CACHE_KEY_PREFIX}{}", normalize_location(location))
}

#[derive(Clone)]
pub struct EventCache {
    store: SharedStore,
    ttl_ms: i64,
}

impl EventCache {
    pub fn new(store: SharedStore, ttl: Duration) -> Self {
        Self {
            store,
            ttl_ms: i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX),
        }
    }

    pub async fn get(&self, location: &str) -> Option<CachedEvents> {
        self.get_at(location, utils::now_ms()).await
    }

    pub async fn get_at(&self, location: &str, now_ms: i64) -> Option<CachedEvents> {
        let entry = self.load_entry(location).await?;
        let age_ms = now_ms - entry.timestamp;
        if age_ms >= self.ttl_ms {
            info!(location, age_min = age_ms / 60_000, "cache expired");
            return None;
        }
        info!(
            location,
            age_min = age_ms / 60_000,
            count = entry.events.len(),
            "cache hit"
        );
        Some(CachedEvents {
            events: entry.events,
            age_ms,
        })
    }

    pub async fn put(&self, location: &str, events: &[DiscoveredEvent]) {
        self.put_at(location, events, utils::now_ms()).await
    }

    pub async fn put_at(&self, location: &str, events: &[DiscoveredEvent], now_ms: i64) {
        let entry = CacheEntry {
            location: location.to_string(),
            events: events.to_vec(),
            timestamp: now_ms,
            version: CACHE_VERSION,
        };
        let payload = match serde_json::to_string(&entry) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(location, "failed to serialize cache entry: {err}");
                return;
            }
        };
        let key = cache_key(location);
        match self.store.run(move |store| store.put(&key, &payload)).await {
            Ok(()) => info!(location, count = events.len(), "cached events"),
            Err(err) => warn!(location, "failed to cache events: {err}"),
        }
    }

    pub async fn invalidate(&self, location: &str) {
        let key = cache_key(location);
        match self.store.run(move |store| store.remove(&key)).await {
            Ok(()) => debug!(location, "cleared cache"),
            Err(err) => warn!(location, "failed to clear cache: {err}"),
        }
    }

    pub async fn invalidate_all(&self) {
        match self
            .store
            .run(|store| store.remove_prefix(CACHE_KEY_PREFIX))
            .await
        {
            Ok(count) => info!(count, "cleared all event caches"),
            Err(err) => warn!("failed to clear event caches: {err}"),
        }
    }

    pub async fn info(&self, location: &str) -> CacheInfo {
        self.info_at(location, utils::now_ms()).await
    }

    pub async fn info_at(&self, location: &str, now_ms: i64) -> CacheInfo {
        match self.load_entry(location).await {
            Some(entry) => {
                let age_ms = now_ms - entry.timestamp;
                CacheInfo {
                    exists: true,
                    age_ms: Some(age_ms),
                    is_valid: age_ms < self.ttl_ms,
                    event_count: entry.events.len(),
                }
            }
            None => CacheInfo {
                exists: false,
                age_ms: None,
                is_valid: false,
                event_count: 0,
            },
        }
    }

    async fn load_entry(&self, location: &str) -> Option<CacheEntry> {
        let key = cache_key(location);
        let lookup_key = key.clone();
        let raw = match self.store.run(move |store| store.get(&lookup_key)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!(location, "no cache found");
                return None;
            }
            Err(err) => {
                warn!(location, "failed to load cached events: {err}");
                return None;
            }
        };

        match serde_json::from_str::<CacheEntry>(&raw) {
            Ok(entry) if entry.version == CACHE_VERSION => Some(entry),
            Ok(entry) => {
                warn!(location, version = entry.version, "unknown cache version, clearing");
                self.discard(key).await;
                None
            }
            Err(err) => {
                warn!(location, "invalid cache structure, clearing: {err}");
                self.discard(key).await;
                None
            }
        }
    }

    async fn discard(&self, key: String) {
        if let Err(err) = self.store.run(move |store| store.remove(&key)).await {
            warn!("failed to discard corrupt cache entry: {err}");
        }
    }
}

/// Human form of a cache age: "2d ago", "3h ago", "30min ago", "Just now".
pub fn format_cache_age(age_ms: i64) -> String {
    let minutes = age_ms.max(0) / 1000 / 60;
    let hours = minutes / 60;
    let days = hours / 24;

    if days > 0 {
        format!("{days}d ago")
    } else if hours > 0 {
        format!("{hours}h ago")
    } else if minutes > 0 {
        format!("{minutes}min ago")
    } else {
        "Just now".to_string()
    }
}
