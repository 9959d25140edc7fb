//! Per-day cache between the pipeline and tracker plugins
//!
//! Every (vendor, device, date) triple is cached independently. A night that
//! lies in the past never changes once recorded, so its entry never expires;
//! today's entry expires after the configured TTL because the tracker may
//! still be uploading.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::error::DetectorError;
use crate::plugins::{Session, TrackerPlugin};
use crate::types::{CacheStats, RawSample, Vendor};

/// Persisted cache record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub date: NaiveDate,
    pub fetched_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    pub payload: Vec<RawSample>,
}

impl CacheEntry {
    /// Whether the entry may still be served at `now` given the current `today`
    pub fn is_fresh(&self, now: DateTime<Utc>, today: NaiveDate) -> bool {
        if self.date < today {
            return true;
        }
        let ttl = Duration::seconds(i64::try_from(self.ttl_seconds).unwrap_or(i64::MAX));
        match self.fetched_at.checked_add_signed(ttl) {
            Some(expires_at) => now <= expires_at,
            None => true,
        }
    }
}

/// Key-value persistence behind the cache
pub trait KeyValueStore: Send + Sync {
    /// `Ok(None)` when absent; `CacheCorrupt` when present but undecodable
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, DetectorError>;

    /// Insert or replace atomically
    fn put(&self, key: &str, entry: &CacheEntry) -> Result<(), DetectorError>;

    fn remove(&self, key: &str) -> Result<bool, DetectorError>;

    /// Keys of all decodable entries
    fn keys(&self) -> Result<Vec<String>, DetectorError>;

    /// Remove everything; returns the number of removed entries
    fn clear(&self) -> Result<usize, DetectorError>;

    /// Remove entries `keep` rejects along with undecodable records
    fn retain(&self, keep: &dyn Fn(&CacheEntry) -> bool) -> Result<usize, DetectorError>;

    fn len(&self) -> Result<usize, DetectorError>;

    fn is_empty(&self) -> Result<bool, DetectorError> {
        Ok(self.len()? == 0)
    }
}

/// Bound on keys loading at the same time
const MAX_IN_FLIGHT: u64 = 1_024;

/// Backstop lifetime of an in-flight slot
const IN_FLIGHT_TTL: std::time::Duration = std::time::Duration::from_secs(60);

/// TTL-aware read-through cache with per-process hit and miss counters
pub struct CacheStore {
    store: Box<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    ttl_seconds: u64,
    hits: AtomicU64,
    misses: AtomicU64,
    /// Loads in progress; concurrent callers for one key share a single load
    in_flight: Cache<String, Option<RawSample>>,
}

impl CacheStore {
    pub fn new(store: Box<dyn KeyValueStore>, clock: Arc<dyn Clock>, ttl_seconds: u64) -> Self {
        Self {
            store,
            clock,
            ttl_seconds,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            in_flight: Cache::builder()
                .max_capacity(MAX_IN_FLIGHT)
                .time_to_live(IN_FLIGHT_TTL)
                .build(),
        }
    }

    /// File-backed cache in the configured directory
    pub fn from_config(config: &CacheConfig, clock: Arc<dyn Clock>) -> Result<Self, DetectorError> {
        let store = FileStore::open(&config.dir)?;
        Ok(Self::new(Box::new(store), clock, config.ttl_seconds()))
    }

    /// Deterministic key for one device night
    pub fn key(vendor: Vendor, device_id: &str, date: NaiveDate) -> String {
        format!("{}:{}:{}", vendor.as_str(), device_id, date.format("%Y-%m-%d"))
    }

    /// Serve the night from cache, or fetch that single date from the plugin
    pub fn get_or_fetch(
        &self,
        plugin: &dyn TrackerPlugin,
        session: &Session,
        device_id: &str,
        date: NaiveDate,
    ) -> Result<Option<RawSample>, DetectorError> {
        self.get_or_fetch_with(plugin.vendor(), device_id, date, || {
            plugin.fetch_metrics(session, device_id, date, date)
        })
    }

    /// Like [`CacheStore::get_or_fetch`] with a caller-supplied upstream call.
    ///
    /// Concurrent callers for the same key share one load, so a miss results
    /// in one upstream call. The shared slot is dropped once the load settles;
    /// the store stays the only place results live.
    pub fn get_or_fetch_with<F>(
        &self,
        vendor: Vendor,
        device_id: &str,
        date: NaiveDate,
        fetch: F,
    ) -> Result<Option<RawSample>, DetectorError>
    where
        F: FnOnce() -> Result<Vec<RawSample>, DetectorError>,
    {
        let key = Self::key(vendor, device_id, date);
        let mut loaded_here = false;

        let result = self.in_flight.try_get_with(key.clone(), || {
            loaded_here = true;
            self.load(&key, date, fetch)
        });
        if loaded_here {
            self.in_flight.invalidate(&key);
        } else if result.is_ok() {
            // Served by a load another caller had in progress
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(%key, "cache hit (shared load)");
        }
        result.map_err(DetectorError::from_shared)
    }

    fn load<F>(&self, key: &str, date: NaiveDate, fetch: F) -> Result<Option<RawSample>, DetectorError>
    where
        F: FnOnce() -> Result<Vec<RawSample>, DetectorError>,
    {
        if let Some(entry) = self.lookup(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(%key, "cache hit");
            return Ok(pick(entry.payload, date));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(%key, "cache miss");
        let payload: Vec<RawSample> = fetch()?.into_iter().filter(|s| s.date == date).collect();

        // An empty payload means the vendor has no night yet; ask again next run
        if !payload.is_empty() {
            let entry = CacheEntry {
                key: key.to_string(),
                date,
                fetched_at: self.clock.now(),
                ttl_seconds: self.ttl_seconds,
                payload: payload.clone(),
            };
            if let Err(e) = self.store.put(key, &entry) {
                warn!(%key, error = %e, "failed to write cache entry");
            }
        }
        Ok(pick(payload, date))
    }

    fn lookup(&self, key: &str) -> Option<CacheEntry> {
        match self.store.get(key) {
            Ok(Some(entry)) if entry.is_fresh(self.clock.now(), self.clock.today()) => Some(entry),
            Ok(Some(_)) => {
                debug!(%key, "cache entry expired");
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!(%key, error = %e, "unreadable cache entry, refetching");
                None
            }
        }
    }

    /// Remove every entry
    pub fn clear(&self) -> Result<usize, DetectorError> {
        self.store.clear()
    }

    /// Remove entries that can no longer be served, and unreadable records
    pub fn prune_expired(&self) -> Result<usize, DetectorError> {
        let now = self.clock.now();
        let today = self.clock.today();
        self.store.retain(&|entry| entry.is_fresh(now, today))
    }

    /// Counters since this store was created
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.store.len().unwrap_or(0),
        }
    }
}

fn pick(payload: Vec<RawSample>, date: NaiveDate) -> Option<RawSample> {
    payload.into_iter().find(|s| s.date == date)
}
