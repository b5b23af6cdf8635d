use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    model::NormalizedWeather,
    provider::ProviderId,
    storage::{KeyValueStore, WEATHER_CACHE_KEY, load_json, save_json},
};

/// Different providers key the same place differently, so the provider is
/// part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub provider: ProviderId,
    pub location_key: String,
}

impl CacheKey {
    pub fn new(provider: ProviderId, location_key: impl Into<String>) -> Self {
        Self { provider, location_key: location_key.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub provider: ProviderId,
    pub location_key: String,
    pub payload: NormalizedWeather,
    pub fetched_at_epoch: i64,
}

impl CacheEntry {
    pub fn key(&self) -> CacheKey {
        CacheKey::new(self.provider, self.location_key.clone())
    }

    /// An interval of zero minutes means entries are never fresh.
    pub fn is_fresh(&self, now: i64, refresh_interval_minutes: u32) -> bool {
        now - self.fetched_at_epoch < i64::from(refresh_interval_minutes) * 60
    }
}

/// Last successful payload per `(provider, location)`.
///
/// Stale entries stay readable so the aggregator can fall back to them when
/// a refetch fails; they leave only when overwritten or invalidated.
#[derive(Debug, Default, Clone)]
pub struct WeatherCache {
    entries: HashMap<CacheKey, CacheEntry>,
}

impl WeatherCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the persisted cache. An unreadable payload yields an empty cache.
    pub fn load(store: &dyn KeyValueStore) -> Self {
        match load_json::<Vec<CacheEntry>>(store, WEATHER_CACHE_KEY) {
            Ok(entries) => entries.unwrap_or_default().into_iter().collect(),
            Err(err) => {
                tracing::warn!(error = %err, "discarding unreadable weather cache");
                Self::default()
            }
        }
    }

    pub fn persist(&self, store: &dyn KeyValueStore) -> Result<()> {
        let mut entries: Vec<&CacheEntry> = self.entries.values().collect();
        entries.sort_by(|a, b| {
            (a.provider, a.location_key.as_str()).cmp(&(b.provider, b.location_key.as_str()))
        });
        save_json(store, WEATHER_CACHE_KEY, &entries)
    }

    pub fn get(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn put(&mut self, entry: CacheEntry) {
        self.entries.insert(entry.key(), entry);
    }

    /// Drop every entry matching `predicate`; returns how many were removed.
    pub fn invalidate<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&CacheEntry) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !predicate(entry));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<CacheEntry> for WeatherCache {
    fn from_iter<I: IntoIterator<Item = CacheEntry>>(iter: I) -> Self {
        let mut cache = WeatherCache::new();
        for entry in iter {
            cache.put(entry);
        }
        cache
    }
}
