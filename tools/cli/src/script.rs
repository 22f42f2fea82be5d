//! Replay scripts: a JSON array of store calls run against the in-memory
//! backend.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use batchline_backend::MemoryBackend;
use batchline_common::{Collection, QueryOptions, Record};
use batchline_sync::{BatchConfig, BatchedStore, CacheStats, FlushReport};

fn first_page() -> u32 {
    1
}

fn default_per_page() -> u32 {
    30
}

/// One scripted call.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Step {
    /// Put records straight into the backend, bypassing the store.
    Seed {
        collection: String,
        records: Vec<Record>,
    },
    Create {
        collection: String,
        data: Record,
    },
    Update {
        collection: String,
        id: String,
        data: Record,
    },
    Delete {
        collection: String,
        id: String,
    },
    Get {
        collection: String,
        id: String,
    },
    List {
        collection: String,
        #[serde(default = "first_page")]
        page: u32,
        #[serde(default = "default_per_page", rename = "perPage")]
        per_page: u32,
        #[serde(default)]
        options: QueryOptions,
    },
    FullList {
        collection: String,
        #[serde(default)]
        options: QueryOptions,
    },
    Flush,
    /// Wait on the store's clock.
    Sleep {
        ms: u64,
    },
    ClearCache {
        #[serde(default)]
        collection: Option<String>,
    },
}

impl Step {
    /// Name of the step as written in scripts.
    pub fn name(&self) -> &'static str {
        match self {
            Step::Seed { .. } => "seed",
            Step::Create { .. } => "create",
            Step::Update { .. } => "update",
            Step::Delete { .. } => "delete",
            Step::Get { .. } => "get",
            Step::List { .. } => "list",
            Step::FullList { .. } => "fullList",
            Step::Flush => "flush",
            Step::Sleep { .. } => "sleep",
            Step::ClearCache { .. } => "clearCache",
        }
    }
}

/// Parse a script from JSON text.
pub fn parse_script(json: &str) -> Result<Vec<Step>> {
    serde_json::from_str(json).context("Invalid replay script")
}

/// Read and parse a script file.
pub fn load_script(path: &Path) -> Result<Vec<Step>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read script {}", path.display()))?;
    parse_script(&json)
}

/// Read a configuration file, or fall back to the defaults.
pub fn load_config(path: Option<&Path>) -> Result<BatchConfig> {
    let Some(path) = path else {
        return Ok(BatchConfig::default());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    BatchConfig::from_json(&json)
        .with_context(|| format!("Invalid config {}", path.display()))
}

/// What a single step produced.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutcome {
    pub index: usize,
    pub op: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Everything a replay observed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayReport {
    pub steps: Vec<StepOutcome>,
    pub flushes: Vec<FlushReport>,
    pub shutdown: FlushReport,
    pub cache: CacheStats,
    pub backend_calls: BTreeMap<String, usize>,
    pub dropped_operations: Vec<String>,
}

/// Run `steps` against a fresh in-memory backend, then shut the store down.
///
/// A failing step is recorded in its outcome and does not stop the replay.
pub async fn replay(steps: Vec<Step>, config: BatchConfig) -> Result<ReplayReport> {
    let backend = Arc::new(MemoryBackend::new());
    let store = BatchedStore::from_arc(backend.clone(), config)
        .context("Failed to create store")?;

    let dropped: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = dropped.clone();
    store.on_failure(move |op, err| sink.lock().push(format!("{}: {}", op, err)));

    info!("Replaying {} steps", steps.len());
    let mut outcomes = Vec::with_capacity(steps.len());
    let mut flushes = Vec::new();

    for (index, step) in steps.into_iter().enumerate() {
        let op = step.name();
        debug!("Step {}: {}", index, op);
        let outcome = match run_step(&store, &backend, step, &mut flushes).await {
            Ok(result) => StepOutcome {
                index,
                op,
                result,
                error: None,
            },
            Err(err) => {
                warn!("Step {} ({}) failed: {}", index, op, err);
                StepOutcome {
                    index,
                    op,
                    result: None,
                    error: Some(err.to_string()),
                }
            }
        };
        outcomes.push(outcome);
    }

    let shutdown = store.shutdown().await;
    let dropped_operations = std::mem::take(&mut *dropped.lock());

    Ok(ReplayReport {
        steps: outcomes,
        flushes,
        shutdown,
        cache: store.cache_stats(),
        backend_calls: backend.call_counts(),
        dropped_operations,
    })
}

async fn run_step(
    store: &BatchedStore<MemoryBackend>,
    backend: &MemoryBackend,
    step: Step,
    flushes: &mut Vec<FlushReport>,
) -> batchline_common::Result<Option<Value>> {
    let value = match step {
        Step::Seed {
            collection,
            records,
        } => {
            let collection = Collection::new(collection)?;
            Some(Value::from(backend.seed(&collection, records)))
        }
        Step::Create { collection, data } => {
            Some(Value::Object(store.create(&collection, data)?))
        }
        Step::Update {
            collection,
            id,
            data,
        } => Some(Value::Object(store.update(&collection, &id, data)?)),
        Step::Delete { collection, id } => Some(Value::Bool(store.delete(&collection, &id)?)),
        Step::Get { collection, id } => Some(
            store
                .get_by_id(&collection, &id)
                .await?
                .map(Value::Object)
                .unwrap_or(Value::Null),
        ),
        Step::List {
            collection,
            page,
            per_page,
            options,
        } => {
            let list = store.get_list(&collection, page, per_page, &options).await?;
            Some(serde_json::to_value(list)?)
        }
        Step::FullList {
            collection,
            options,
        } => {
            let items = store.get_full_list(&collection, &options).await?;
            Some(Value::Array(items.into_iter().map(Value::Object).collect()))
        }
        Step::Flush => {
            let report = store.flush().await;
            flushes.push(report);
            Some(serde_json::to_value(report)?)
        }
        Step::Sleep { ms } => {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            None
        }
        Step::ClearCache { collection } => {
            store.clear_cache(collection.as_deref())?;
            None
        }
    };
    Ok(value)
}
