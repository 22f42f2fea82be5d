//! TTL read cache with per-record and per-collection invalidation.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use batchline_common::{Collection, ListPage, QueryOptions, Record, RecordId};

/// Shape of a cache key. Each key renders to exactly one shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum KeyShape {
    ById(RecordId),
    List(String),
    FullList(String),
}

/// Key of a cached read result.
///
/// Rendered as `<collection>:id:<id>`, `<collection>:list:<params>` or
/// `<collection>:full:<params>`, where `<params>` is the canonical JSON of
/// the query parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    shape: KeyShape,
    rendered: String,
}

impl CacheKey {
    /// Key of a single record.
    pub fn by_id(collection: &Collection, id: &RecordId) -> Self {
        Self::build(collection, KeyShape::ById(id.clone()))
    }

    /// Key of one page of a list read.
    pub fn list(collection: &Collection, page: u32, per_page: u32, options: &QueryOptions) -> Self {
        let mut params = canonical_params(options);
        params.insert("page".to_string(), Value::from(page));
        params.insert("perPage".to_string(), Value::from(per_page));
        Self::build(collection, KeyShape::List(render_params(params)))
    }

    /// Key of a full-collection read.
    pub fn full_list(collection: &Collection, options: &QueryOptions) -> Self {
        let mut params = canonical_params(options);
        params.insert("fullList".to_string(), Value::Bool(true));
        Self::build(collection, KeyShape::FullList(render_params(params)))
    }

    fn build(collection: &Collection, shape: KeyShape) -> Self {
        let rendered = match &shape {
            KeyShape::ById(id) => format!("{}:id:{}", collection, id),
            KeyShape::List(params) => format!("{}:list:{}", collection, params),
            KeyShape::FullList(params) => format!("{}:full:{}", collection, params),
        };
        Self {
            shape,
            rendered,
        }
    }

    /// Rendered string form.
    pub fn as_str(&self) -> &str {
        &self.rendered
    }

    fn accepts(&self, value: &CachedValue) -> bool {
        matches!(
            (&self.shape, value),
            (KeyShape::ById(_), CachedValue::Record(_))
                | (KeyShape::List(_), CachedValue::List(_))
                | (KeyShape::FullList(_), CachedValue::FullList(_))
        )
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

fn canonical_params(options: &QueryOptions) -> BTreeMap<String, Value> {
    options
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn render_params(params: BTreeMap<String, Value>) -> String {
    // BTreeMap iteration is sorted, so the object renders the same way
    // regardless of the order options were set in.
    Value::Object(params.into_iter().collect()).to_string()
}

/// A cached read result, tagged by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    /// A single record.
    Record(Record),
    /// One page of a list read.
    List(ListPage),
    /// An unordered full-collection snapshot.
    FullList(Vec<Record>),
}

/// One cached value with the time it was stored.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: CachedValue,
    pub stored_at: Instant,
}

impl CacheEntry {
    /// Check if the entry is still fresh at `now`.
    pub fn is_fresh(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) < ttl
    }
}

/// Statistics for cache monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Number of entries currently stored.
    pub entries: usize,
    /// Fresh lookups served from the cache.
    pub hits: u64,
    /// Lookups that found nothing usable.
    pub misses: u64,
    /// Write-triggered invalidation events.
    pub invalidations: u64,
}

/// In-memory cache of read results.
///
/// Not synchronized; the owner wraps it in a lock. Time is passed in by the
/// caller so the store never reads a clock itself.
#[derive(Debug, Default)]
pub struct CacheStore {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
    invalidations: u64,
}

impl CacheStore {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a fresh entry.
    ///
    /// Expired entries are removed on the spot. Entries whose shape does
    /// not match the key are never returned.
    pub fn get(&mut self, key: &CacheKey, ttl: Duration, now: Instant) -> Option<CachedValue> {
        let fresh = match self.entries.get(key.as_str()) {
            Some(entry) if !key.accepts(&entry.value) => {
                debug!("Cache shape mismatch for {}", key);
                None
            }
            Some(entry) if entry.is_fresh(ttl, now) => Some(entry.value.clone()),
            Some(_) => {
                debug!("Cache entry expired: {}", key);
                self.entries.remove(key.as_str());
                None
            }
            None => None,
        };

        if fresh.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        fresh
    }

    /// Look up a fresh single-record entry.
    pub fn get_record(&mut self, key: &CacheKey, ttl: Duration, now: Instant) -> Option<Record> {
        match self.get(key, ttl, now)? {
            CachedValue::Record(record) => Some(record),
            _ => None,
        }
    }

    /// Look up a fresh list page.
    pub fn get_list(&mut self, key: &CacheKey, ttl: Duration, now: Instant) -> Option<ListPage> {
        match self.get(key, ttl, now)? {
            CachedValue::List(page) => Some(page),
            _ => None,
        }
    }

    /// Look up a fresh full-list snapshot.
    pub fn get_full_list(
        &mut self,
        key: &CacheKey,
        ttl: Duration,
        now: Instant,
    ) -> Option<Vec<Record>> {
        match self.get(key, ttl, now)? {
            CachedValue::FullList(items) => Some(items),
            _ => None,
        }
    }

    /// Store a value, overwriting whatever was there.
    ///
    /// Values whose shape does not match the key are ignored.
    pub fn set(&mut self, key: &CacheKey, value: CachedValue, now: Instant) {
        if !key.accepts(&value) {
            debug!("Refusing to cache mismatched shape under {}", key);
            return;
        }
        self.entries.insert(
            key.as_str().to_string(),
            CacheEntry {
                value,
                stored_at: now,
            },
        );
    }

    /// Merge `patch` into a fresh cached record and restamp it.
    ///
    /// Returns the merged record, or `None` if the record is not cached.
    pub fn merge_record(
        &mut self,
        key: &CacheKey,
        patch: &Record,
        ttl: Duration,
        now: Instant,
    ) -> Option<Record> {
        let entry = self.entries.get_mut(key.as_str())?;
        if !entry.is_fresh(ttl, now) {
            return None;
        }
        let CachedValue::Record(record) = &mut entry.value else {
            return None;
        };

        for (field, value) in patch {
            record.insert(field.clone(), value.clone());
        }
        entry.stored_at = now;
        Some(record.clone())
    }

    /// Remove a single entry.
    pub fn delete_key(&mut self, key: &CacheKey) -> bool {
        self.entries.remove(key.as_str()).is_some()
    }

    /// Remove every entry of `collection`. Returns how many were removed.
    pub fn delete_by_collection_prefix(&mut self, collection: &Collection) -> usize {
        let prefix = format!("{}:", collection);
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(&prefix));
        before - self.entries.len()
    }

    /// Invalidate after a successful create: every list of the collection is stale.
    pub fn invalidate_collection(&mut self, collection: &Collection) {
        let removed = self.delete_by_collection_prefix(collection);
        self.invalidations += 1;
        debug!("Invalidated {} cache entries of {}", removed, collection);
    }

    /// Invalidate after a successful update/delete of a known record.
    ///
    /// Lists and full lists may embed the stale record, so they go too.
    pub fn invalidate_record(&mut self, collection: &Collection, id: &RecordId) {
        self.delete_key(&CacheKey::by_id(collection, id));
        let removed = self.delete_by_collection_prefix(collection);
        self.invalidations += 1;
        debug!(
            "Invalidated {}:{} and {} related cache entries",
            collection, id, removed
        );
    }

    /// Remove everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of stored entries, fresh or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the cache holds nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits,
            misses: self.misses,
            invalidations: self.invalidations,
        }
    }
}
