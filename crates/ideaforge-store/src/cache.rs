//! Time-boxed read cache with in-flight request coalescing.
//!
//! Reads are keyed by [`CacheKey`]. A live entry is served without touching
//! the store; concurrent misses for the same key share one underlying
//! request; failures are never cached.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::{FetchOptions, Filters, Row, StoreError};

/// Default lifetime for cached row sets and single-row lookups.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5);

/// Cache tuning.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

/// Deterministic identity of a read: table, filters and result shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    table: String,
    encoded: String,
}

impl CacheKey {
    /// Key for a row-set read.
    pub fn rows(table: &str, filters: &Filters, options: &FetchOptions) -> Self {
        let mut encoded = format!("{}|rows|{}", table, encode_filters(filters));
        if let Some(select) = &options.select {
            encoded.push_str(&format!("|select={}", select));
        }
        if let Some(order) = &options.order {
            encoded.push_str(&format!("|order={}", order));
        }
        if let Some(limit) = options.limit {
            encoded.push_str(&format!("|limit={}", limit));
        }
        Self {
            table: table.to_string(),
            encoded,
        }
    }

    /// Key for a single-row lookup.
    pub fn single(table: &str, filters: &Filters) -> Self {
        Self {
            table: table.to_string(),
            encoded: format!("{}|single|{}", table, encode_filters(filters)),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn as_str(&self) -> &str {
        &self.encoded
    }
}

fn encode_filters(filters: &Filters) -> String {
    // Filters are a sorted map, so serialization is already canonical.
    serde_json::to_string(filters).unwrap_or_default()
}

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub forced: u64,
}

type SharedRead = Shared<BoxFuture<'static, Result<Arc<Vec<Row>>, StoreError>>>;

struct CacheEntry {
    rows: Arc<Vec<Row>>,
    stored_at: Instant,
    ttl: Duration,
    /// Issue sequence of the request that produced this entry.
    seq: u64,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        now.duration_since(self.stored_at) < self.ttl
    }
}

struct InFlight {
    seq: u64,
    read: SharedRead,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    forced: AtomicU64,
}

struct CacheInner {
    config: CacheConfig,
    entries: DashMap<CacheKey, CacheEntry>,
    in_flight: DashMap<CacheKey, InFlight>,
    /// Issue sequence at which each table was last invalidated.
    invalidated_at: DashMap<String, u64>,
    next_seq: AtomicU64,
    counters: Counters,
}

impl CacheInner {
    /// Store a settled result unless a later-issued request (or a later
    /// invalidation of the table) already got there.
    fn populate(&self, key: &CacheKey, seq: u64, ttl: Duration, rows: Arc<Vec<Row>>) {
        if let Some(at) = self.invalidated_at.get(key.table()) {
            if *at > seq {
                trace!(key = key.as_str(), "dropping result issued before invalidation");
                return;
            }
        }

        let entry = CacheEntry {
            rows,
            stored_at: Instant::now(),
            ttl,
            seq,
        };

        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut existing) => {
                if existing.get().seq <= seq {
                    existing.insert(entry);
                } else {
                    trace!(key = key.as_str(), "newer result already cached");
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(entry);
            }
        }
    }

    /// A live cached value, evicting the entry if it has expired.
    fn lookup(&self, key: &CacheKey) -> Option<Arc<Vec<Row>>> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.is_live(now) => return Some(Arc::clone(&entry.rows)),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, entry| !entry.is_live(now));
        }
        None
    }
}

/// Read cache and in-flight ledger.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ReadCache {
    inner: Arc<CacheInner>,
}

impl Default for ReadCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl ReadCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                config,
                entries: DashMap::new(),
                in_flight: DashMap::new(),
                invalidated_at: DashMap::new(),
                next_seq: AtomicU64::new(1),
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Serve `key` from cache, join an identical in-flight read, or run
    /// `fetch` and cache its result.
    ///
    /// With `force`, the cache and ledger are bypassed: `fetch` always runs
    /// and its result replaces whatever is cached when it settles, while any
    /// concurrent non-forced read settles independently.
    pub async fn read<F>(
        &self,
        key: CacheKey,
        ttl: Option<Duration>,
        force: bool,
        fetch: F,
    ) -> Result<Arc<Vec<Row>>, StoreError>
    where
        F: Future<Output = Result<Vec<Row>, StoreError>> + Send + 'static,
    {
        let ttl = ttl.unwrap_or(self.inner.config.default_ttl);

        if force {
            self.inner.counters.forced.fetch_add(1, Ordering::Relaxed);
            let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
            debug!(key = key.as_str(), "forced read");
            let rows = Arc::new(fetch.await?);
            self.inner.populate(&key, seq, ttl, Arc::clone(&rows));
            return Ok(rows);
        }

        if let Some(rows) = self.inner.lookup(&key) {
            self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
            trace!(key = key.as_str(), "cache hit");
            return Ok(rows);
        }

        let read = match self.inner.in_flight.entry(key.clone()) {
            Entry::Occupied(existing) => {
                self.inner.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(key = key.as_str(), "joining in-flight read");
                existing.get().read.clone()
            }
            Entry::Vacant(slot) => {
                self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
                let read = self.settling_read(key.clone(), seq, ttl, fetch);
                slot.insert(InFlight {
                    seq,
                    read: read.clone(),
                });
                read
            }
        };

        read.await
    }

    /// Wrap `fetch` so that, whoever polls it to completion, the result is
    /// cached on success and the ledger slot is released either way.
    fn settling_read<F>(&self, key: CacheKey, seq: u64, ttl: Duration, fetch: F) -> SharedRead
    where
        F: Future<Output = Result<Vec<Row>, StoreError>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        async move {
            let result = fetch.await.map(Arc::new);
            if let Ok(rows) = &result {
                inner.populate(&key, seq, ttl, Arc::clone(rows));
            }
            inner.in_flight.remove_if(&key, |_, flight| flight.seq == seq);
            result
        }
        .boxed()
        .shared()
    }

    /// Drop every cached entry for `table`. Reads already in flight for the
    /// table will not repopulate the cache when they settle.
    pub fn invalidate_table(&self, table: &str) {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        self.inner.invalidated_at.insert(table.to_string(), seq);
        self.inner.entries.retain(|key, _| key.table() != table);
        debug!(table, "invalidated cached reads");
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.inner.entries.clear();
    }

    /// Number of entries currently stored, live or not yet evicted.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Number of reads currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            forced: c.forced.load(Ordering::Relaxed),
        }
    }
}
