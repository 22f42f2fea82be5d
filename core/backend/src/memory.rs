//! In-memory backend for testing.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{Backend, BackendMethod};
use batchline_common::{Collection, Error, ListPage, QueryOptions, Record, RecordId, Result};

/// One call observed by the memory backend.
#[derive(Debug, Clone)]
pub struct BackendCall {
    /// Which operation was invoked.
    pub method: BackendMethod,
    /// Target collection, if any.
    pub collection: Option<String>,
    /// Target record id, if any.
    pub id: Option<String>,
    /// When the call arrived (tokio clock).
    pub at: Instant,
}

#[derive(Debug, Clone)]
struct StoredRecord {
    seq: u64,
    record: Record,
}

#[derive(Debug)]
struct State {
    collections: HashMap<String, BTreeMap<String, StoredRecord>>,
    next_seq: u64,
    authenticated: bool,
    cancel_reads: bool,
    latency: Duration,
    faults: HashMap<BackendMethod, VecDeque<Error>>,
    calls: Vec<BackendCall>,
}

/// In-memory backend.
///
/// Useful for testing and for the replay tool. Records are kept per
/// collection and lost on drop. Every call is logged, and failures can be
/// scripted per method.
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    /// Create a new empty, authenticated backend.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                collections: HashMap::new(),
                next_seq: 0,
                authenticated: true,
                cancel_reads: false,
                latency: Duration::ZERO,
                faults: HashMap::new(),
                calls: Vec::new(),
            })),
        }
    }

    /// Delay every call by `latency` before it is served.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state.lock().latency = latency;
        self
    }

    /// Toggle the authentication state reported by `ensure_authenticated`.
    pub fn set_authenticated(&self, authenticated: bool) {
        self.state.lock().authenticated = authenticated;
    }

    /// Make every read fail with `Error::Cancelled` while enabled.
    pub fn cancel_reads(&self, enabled: bool) {
        self.state.lock().cancel_reads = enabled;
    }

    /// Fail the next `times` calls of `method` with `error`.
    pub fn fail_next(&self, method: BackendMethod, times: usize, error: Error) {
        let mut state = self.state.lock();
        let queue = state.faults.entry(method).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    /// Number of calls made to `method` so far.
    pub fn calls(&self, method: BackendMethod) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.method == method)
            .count()
    }

    /// Full call log in arrival order.
    pub fn call_log(&self) -> Vec<BackendCall> {
        self.state.lock().calls.clone()
    }

    /// Per-method call counts.
    pub fn call_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for call in self.state.lock().calls.iter() {
            *counts.entry(call.method.to_string()).or_insert(0) += 1;
        }
        counts
    }

    /// Insert records directly, bypassing call accounting and faults.
    ///
    /// Records the store would reject on create (duplicate or non-string
    /// ids) are skipped with a warning. Returns how many were inserted.
    pub fn seed(
        &self,
        collection: &Collection,
        records: impl IntoIterator<Item = Record>,
    ) -> usize {
        let mut state = self.state.lock();
        let mut inserted = 0;
        for record in records {
            match state.insert(collection, record) {
                Ok(_) => inserted += 1,
                Err(err) => warn!("Skipping seed record for {}: {}", collection, err),
            }
        }
        inserted
    }

    /// Peek at a stored record without counting a call.
    pub fn record(&self, collection: &Collection, id: &RecordId) -> Option<Record> {
        self.state
            .lock()
            .collections
            .get(collection.as_str())
            .and_then(|records| records.get(id.as_str()))
            .map(|stored| stored.record.clone())
    }

    /// Number of records stored in `collection`.
    pub fn len(&self, collection: &Collection) -> usize {
        self.state
            .lock()
            .collections
            .get(collection.as_str())
            .map_or(0, BTreeMap::len)
    }

    /// Check if `collection` holds no records.
    pub fn is_empty(&self, collection: &Collection) -> bool {
        self.len(collection) == 0
    }

    /// Log the call, apply scripted faults, then wait out the latency.
    async fn enter(
        &self,
        method: BackendMethod,
        collection: Option<&Collection>,
        id: Option<&RecordId>,
    ) -> Result<()> {
        let latency = {
            let mut state = self.state.lock();
            state.calls.push(BackendCall {
                method,
                collection: collection.map(|c| c.to_string()),
                id: id.map(|i| i.to_string()),
                at: Instant::now(),
            });

            if let Some(err) = state.faults.get_mut(&method).and_then(VecDeque::pop_front) {
                debug!("Injected fault for {}: {}", method, err);
                return Err(err);
            }
            if method.is_read() && state.cancel_reads {
                debug!("Cancelling {}", method);
                return Err(Error::Cancelled(format!("{} superseded", method)));
            }
            state.latency
        };

        if !latency.is_zero() {
            sleep(latency).await;
        }
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    fn insert(&mut self, collection: &Collection, mut record: Record) -> Result<Record> {
        let id = match record.get("id") {
            Some(Value::String(id)) => RecordId::new(id.clone())?,
            Some(_) => return Err(Error::InvalidInput("Record id must be a string".to_string())),
            None => RecordId::new(Uuid::new_v4().simple().to_string()[..15].to_string())?,
        };

        let records = self.collections.entry(collection.to_string()).or_default();
        if records.contains_key(id.as_str()) {
            return Err(Error::InvalidInput(format!(
                "Record already exists: {}:{}",
                collection, id
            )));
        }

        let now = Value::String(Utc::now().to_rfc3339());
        record.insert("id".to_string(), Value::String(id.to_string()));
        record.entry("created").or_insert_with(|| now.clone());
        record.insert("updated".to_string(), now);

        self.next_seq += 1;
        records.insert(
            id.to_string(),
            StoredRecord {
                seq: self.next_seq,
                record: record.clone(),
            },
        );
        Ok(record)
    }

    fn query(&self, collection: &Collection, options: &QueryOptions) -> Result<Vec<Record>> {
        let Some(records) = self.collections.get(collection.as_str()) else {
            return Ok(Vec::new());
        };

        let filters = match options.get_str("filter") {
            Some(expr) => parse_filter(expr)?,
            None => Vec::new(),
        };

        let mut matched: Vec<&StoredRecord> = records
            .values()
            .filter(|stored| filters.iter().all(|f| f.matches(&stored.record)))
            .collect();
        matched.sort_by_key(|stored| stored.seq);

        if let Some(sort) = options.get_str("sort") {
            let keys: Vec<(&str, bool)> = sort
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(|k| match k.strip_prefix('-') {
                    Some(field) => (field, true),
                    None => (k.trim_start_matches('+'), false),
                })
                .collect();

            matched.sort_by(|a, b| {
                for (field, descending) in &keys {
                    let ord = compare_values(a.record.get(*field), b.record.get(*field));
                    let ord = if *descending { ord.reverse() } else { ord };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }

        Ok(matched.into_iter().map(|s| s.record.clone()).collect())
    }
}

/// One `field=value` / `field!=value` clause of a filter expression.
#[derive(Debug)]
struct FilterClause {
    field: String,
    value: Value,
    negate: bool,
}

impl FilterClause {
    fn matches(&self, record: &Record) -> bool {
        let equal = record.get(&self.field) == Some(&self.value);
        equal != self.negate
    }
}

/// Parse `a='x' && b!=3` style filters.
fn parse_filter(expr: &str) -> Result<Vec<FilterClause>> {
    expr.split("&&")
        .map(str::trim)
        .filter(|clause| !clause.is_empty())
        .map(|clause| {
            let (field, raw, negate) = if let Some((f, v)) = clause.split_once("!=") {
                (f, v, true)
            } else if let Some((f, v)) = clause.split_once('=') {
                (f, v, false)
            } else {
                return Err(Error::InvalidInput(format!(
                    "Unsupported filter clause: {}",
                    clause
                )));
            };
            Ok(FilterClause {
                field: field.trim().to_string(),
                value: parse_literal(raw.trim()),
                negate,
            })
        })
        .collect()
}

fn parse_literal(raw: &str) -> Value {
    let quoted = raw.len() >= 2
        && ((raw.starts_with('\'') && raw.ends_with('\''))
            || (raw.starts_with('"') && raw.ends_with('"')));
    if quoted {
        return Value::String(raw[1..raw.len() - 1].to_string());
    }
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" => Value::Null,
        _ => serde_json::from_str::<serde_json::Number>(raw)
            .map(Value::Number)
            .unwrap_or_else(|_| Value::String(raw.to_string())),
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn ensure_authenticated(&self) -> Result<bool> {
        self.enter(BackendMethod::Authenticate, None, None).await?;
        Ok(self.state.lock().authenticated)
    }

    async fn create(&self, collection: &Collection, data: Record) -> Result<Record> {
        self.enter(BackendMethod::Create, Some(collection), None)
            .await?;
        self.state.lock().insert(collection, data)
    }

    async fn update(
        &self,
        collection: &Collection,
        id: &RecordId,
        data: Record,
    ) -> Result<Record> {
        self.enter(BackendMethod::Update, Some(collection), Some(id))
            .await?;

        let mut state = self.state.lock();
        let stored = state
            .collections
            .get_mut(collection.as_str())
            .and_then(|records| records.get_mut(id.as_str()))
            .ok_or_else(|| Error::NotFound(format!("Record not found: {}:{}", collection, id)))?;

        for (key, value) in data {
            if key != "id" {
                stored.record.insert(key, value);
            }
        }
        stored.record.insert(
            "updated".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
        Ok(stored.record.clone())
    }

    async fn delete(&self, collection: &Collection, id: &RecordId) -> Result<bool> {
        self.enter(BackendMethod::Delete, Some(collection), Some(id))
            .await?;

        let mut state = self.state.lock();
        state
            .collections
            .get_mut(collection.as_str())
            .and_then(|records| records.remove(id.as_str()))
            .map(|_| true)
            .ok_or_else(|| Error::NotFound(format!("Record not found: {}:{}", collection, id)))
    }

    async fn get_one(&self, collection: &Collection, id: &RecordId) -> Result<Record> {
        self.enter(BackendMethod::GetOne, Some(collection), Some(id))
            .await?;
        self.record(collection, id)
            .ok_or_else(|| Error::NotFound(format!("Record not found: {}:{}", collection, id)))
    }

    async fn get_list(
        &self,
        collection: &Collection,
        page: u32,
        per_page: u32,
        options: &QueryOptions,
    ) -> Result<ListPage> {
        self.enter(BackendMethod::GetList, Some(collection), None)
            .await?;

        if page == 0 || per_page == 0 {
            return Err(Error::InvalidInput(
                "page and perPage must be at least 1".to_string(),
            ));
        }

        let all = self.state.lock().query(collection, options)?;
        let total_items = all.len() as u64;
        let total_pages = total_items.div_ceil(per_page as u64);
        let offset = (page as usize - 1) * per_page as usize;
        let items = all.into_iter().skip(offset).take(per_page as usize).collect();

        Ok(ListPage {
            page,
            per_page,
            total_items,
            total_pages,
            items,
        })
    }

    async fn get_full_list(
        &self,
        collection: &Collection,
        options: &QueryOptions,
    ) -> Result<Vec<Record>> {
        self.enter(BackendMethod::GetFullList, Some(collection), None)
            .await?;
        self.state.lock().query(collection, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn machines() -> Collection {
        Collection::new("machines").unwrap()
    }

    #[tokio::test]
    async fn test_create_assigns_id_and_timestamps() {
        let backend = MemoryBackend::new();
        let created = backend
            .create(&machines(), record(json!({"name": "Press 4"})))
            .await
            .unwrap();

        assert!(RecordId::of_record(&created).is_some());
        assert!(created.contains_key("created"));
        assert!(created.contains_key("updated"));
        assert_eq!(backend.len(&machines()), 1);
    }

    #[tokio::test]
    async fn test_create_duplicate_id_rejected() {
        let backend = MemoryBackend::new();
        let data = record(json!({"id": "m1", "name": "Press"}));
        backend.create(&machines(), data.clone()).await.unwrap();
        let err = backend.create(&machines(), data).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_seed_skips_rejected_records() {
        let backend = MemoryBackend::new();
        let inserted = backend.seed(
            &machines(),
            [
                record(json!({"id": "m1", "name": "Press"})),
                record(json!({"id": "m1", "name": "Duplicate"})),
                record(json!({"id": 7})),
                record(json!({"name": "Lathe"})),
            ],
        );

        assert_eq!(inserted, 2);
        assert_eq!(backend.len(&machines()), 2);
        let kept = backend.record(&machines(), &RecordId::new("m1").unwrap()).unwrap();
        assert_eq!(kept["name"], "Press");
        assert!(backend.call_log().is_empty());
    }

    #[tokio::test]
    async fn test_update_merges_fields() {
        let backend = MemoryBackend::new();
        backend.seed(&machines(), [record(json!({"id": "m1", "name": "Press", "line": 2}))]);
        let id = RecordId::new("m1").unwrap();

        let updated = backend
            .update(&machines(), &id, record(json!({"line": 3})))
            .await
            .unwrap();

        assert_eq!(updated["name"], "Press");
        assert_eq!(updated["line"], 3);
    }

    #[tokio::test]
    async fn test_update_missing_record() {
        let backend = MemoryBackend::new();
        let id = RecordId::new("nope").unwrap();
        let err = backend
            .update(&machines(), &id, Record::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete() {
        let backend = MemoryBackend::new();
        backend.seed(&machines(), [record(json!({"id": "m1"}))]);
        let id = RecordId::new("m1").unwrap();

        assert!(backend.delete(&machines(), &id).await.unwrap());
        assert!(backend.is_empty(&machines()));
        assert!(backend.delete(&machines(), &id).await.is_err());
    }

    #[tokio::test]
    async fn test_get_list_paging() {
        let backend = MemoryBackend::new();
        backend.seed(
            &machines(),
            (1..=5).map(|i| record(json!({"id": format!("m{}", i), "rank": i}))),
        );

        let page = backend
            .get_list(&machines(), 2, 2, &QueryOptions::new())
            .await
            .unwrap();

        assert_eq!(page.total_items, 5);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0]["id"], "m3");
    }

    #[tokio::test]
    async fn test_filter_and_sort() {
        let backend = MemoryBackend::new();
        backend.seed(
            &machines(),
            [
                record(json!({"id": "a", "status": "running", "hours": 10})),
                record(json!({"id": "b", "status": "idle", "hours": 30})),
                record(json!({"id": "c", "status": "running", "hours": 20})),
            ],
        );

        let options = QueryOptions::new().filter("status='running'").sort("-hours");
        let items = backend.get_full_list(&machines(), &options).await.unwrap();

        let ids: Vec<_> = items.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!("c"), json!("a")]);
    }

    #[tokio::test]
    async fn test_scripted_faults() {
        let backend = MemoryBackend::new();
        backend.fail_next(
            BackendMethod::Create,
            2,
            Error::Network("connection reset".to_string()),
        );

        assert!(backend.create(&machines(), Record::new()).await.is_err());
        assert!(backend.create(&machines(), Record::new()).await.is_err());
        assert!(backend.create(&machines(), Record::new()).await.is_ok());
        assert_eq!(backend.calls(BackendMethod::Create), 3);
    }

    #[tokio::test]
    async fn test_cancelled_reads() {
        let backend = MemoryBackend::new();
        backend.cancel_reads(true);
        let err = backend
            .get_full_list(&machines(), &QueryOptions::new())
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        // Writes are unaffected
        assert!(backend.create(&machines(), Record::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_authentication_toggle() {
        let backend = MemoryBackend::new();
        assert!(backend.ensure_authenticated().await.unwrap());
        backend.set_authenticated(false);
        assert!(!backend.ensure_authenticated().await.unwrap());
        assert_eq!(backend.call_counts()["authenticate"], 2);
    }
}
