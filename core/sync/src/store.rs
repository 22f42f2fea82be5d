//! Batched store that coordinates queued writes and cached reads.

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use batchline_backend::Backend;
use batchline_common::{Collection, Error, ListPage, QueryOptions, Record, RecordId, Result};

use crate::cache::{CacheKey, CacheStats, CacheStore, CachedValue};
use crate::config::BatchConfig;
use crate::queue::{group_by_collection, Operation, OperationKind, OperationQueue};
use crate::retry::{RetryDecision, RetryManager};
use crate::scheduler::{Scheduler, TimerHandle, TokioScheduler};

/// Callback invoked when a write is dropped for good.
pub type FailureHook = Arc<dyn Fn(&Operation, &Error) + Send + Sync>;

/// Summary of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushReport {
    /// Operations sent to the backend.
    pub dispatched: usize,
    /// Operations the backend accepted.
    pub succeeded: usize,
    /// Operations the backend rejected.
    pub failed: usize,
    /// Failed operations parked for a retry.
    pub retried: usize,
    /// Failed operations given up on.
    pub dropped: usize,
    /// Operations put back because the session was not authenticated.
    pub requeued: usize,
    /// Collections touched.
    pub groups: usize,
}

impl FlushReport {
    /// Check if the flush did nothing at all.
    pub fn is_empty(&self) -> bool {
        self.dispatched == 0 && self.requeued == 0
    }
}

#[derive(Debug)]
enum DispatchOutcome {
    Succeeded,
    Retried,
    Dropped,
    /// The session expired mid-batch; the write goes back into the queue.
    Requeued(Operation),
}

struct IdleTimer {
    generation: u64,
    handle: TimerHandle,
}

struct Shared<B: Backend + ?Sized + 'static> {
    config: BatchConfig,
    scheduler: Arc<dyn Scheduler>,
    queue: Mutex<OperationQueue>,
    cache: Mutex<CacheStore>,
    idle_timer: Mutex<Option<IdleTimer>>,
    timer_generation: AtomicU64,
    retries: RetryManager,
    first_submitted: AtomicBool,
    closed: AtomicBool,
    failure_hook: Mutex<Option<FailureHook>>,
    backend: Arc<B>,
}

/// Write-coalescing, read-caching front for a [`Backend`].
///
/// Writes return optimistic results immediately and are dispatched later in
/// batches; reads are served from a TTL cache when possible. Cloning the
/// store is cheap and every clone shares the same queue and cache.
///
/// Write methods schedule timers and must be called from within a tokio
/// runtime.
pub struct BatchedStore<B: Backend + ?Sized + 'static> {
    shared: Arc<Shared<B>>,
}

impl<B: Backend + ?Sized + 'static> Clone for BatchedStore<B> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<B: Backend + 'static> BatchedStore<B> {
    /// Create a new store over `backend`.
    ///
    /// # Errors
    /// - Invalid configuration
    pub fn new(backend: B, config: BatchConfig) -> Result<Self> {
        Self::from_arc(Arc::new(backend), config)
    }
}

impl<B: Backend + ?Sized + 'static> BatchedStore<B> {
    /// Create a new store from an Arc-wrapped backend.
    pub fn from_arc(backend: Arc<B>, config: BatchConfig) -> Result<Self> {
        Self::with_scheduler(backend, config, Arc::new(TokioScheduler::new()))
    }

    /// Create a new store with a custom scheduler.
    pub fn with_scheduler(
        backend: Arc<B>,
        config: BatchConfig,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<Self> {
        config.validate()?;
        let retries = RetryManager::new(config.retry_policy());

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                scheduler,
                queue: Mutex::new(OperationQueue::new()),
                cache: Mutex::new(CacheStore::new()),
                idle_timer: Mutex::new(None),
                timer_generation: AtomicU64::new(0),
                retries,
                first_submitted: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                failure_hook: Mutex::new(None),
                backend,
            }),
        })
    }

    /// Register a callback for writes that are dropped after failing.
    pub fn on_failure(&self, hook: impl Fn(&Operation, &Error) + Send + Sync + 'static) {
        *self.shared.failure_hook.lock() = Some(Arc::new(hook));
    }

    /// The active configuration.
    pub fn config(&self) -> &BatchConfig {
        &self.shared.config
    }

    /// The wrapped backend.
    pub fn backend(&self) -> &Arc<B> {
        &self.shared.backend
    }

    /// Queue a create. Returns `data` as the optimistic result.
    ///
    /// # Errors
    /// - Invalid collection name
    /// - Store already shut down
    pub fn create(&self, collection: &str, data: Record) -> Result<Record> {
        let collection = Collection::new(collection)?;
        self.shared
            .enqueue(Operation::create(collection, data.clone()))?;
        Ok(data)
    }

    /// Queue an update.
    ///
    /// If the record is cached, `data` is merged into the cached copy right
    /// away and the merged record is returned. Otherwise the result is
    /// `{id, ...data}`.
    ///
    /// # Errors
    /// - Invalid collection name or id
    /// - Store already shut down
    pub fn update(&self, collection: &str, id: &str, data: Record) -> Result<Record> {
        let collection = Collection::new(collection)?;
        let id = RecordId::new(id)?;

        self.shared.enqueue(Operation::update(
            collection.clone(),
            id.clone(),
            data.clone(),
        ))?;

        let merged = self.shared.with_cache(|cache, ttl, now| {
            cache.merge_record(&CacheKey::by_id(&collection, &id), &data, ttl, now)
        });

        Ok(merged.unwrap_or_else(|| {
            let mut shape = Record::new();
            shape.insert("id".to_string(), Value::String(id.to_string()));
            shape.extend(data);
            shape
        }))
    }

    /// Queue a delete. Always reports success optimistically.
    ///
    /// # Errors
    /// - Invalid collection name or id
    /// - Store already shut down
    pub fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let collection = Collection::new(collection)?;
        let id = RecordId::new(id)?;
        self.shared.enqueue(Operation::delete(collection, id))?;
        Ok(true)
    }

    /// Read one record, from cache when fresh.
    ///
    /// Returns `Ok(None)` if the backend cancelled the request.
    ///
    /// # Errors
    /// - Invalid collection name or id
    /// - Not authenticated
    /// - Any backend failure other than cancellation
    pub async fn get_by_id(&self, collection: &str, id: &str) -> Result<Option<Record>> {
        let collection = Collection::new(collection)?;
        let id = RecordId::new(id)?;
        let key = CacheKey::by_id(&collection, &id);

        let cached = self
            .shared
            .with_cache(|cache, ttl, now| cache.get_record(&key, ttl, now));
        if let Some(record) = cached {
            debug!("Cache hit: {}", key);
            return Ok(Some(record));
        }

        self.shared.require_auth().await?;
        match self.shared.backend.get_one(&collection, &id).await {
            Ok(record) => {
                self.shared.remember(&key, CachedValue::Record(record.clone()));
                Ok(Some(record))
            }
            Err(err) if err.is_cancelled() => {
                debug!("Read of {} cancelled: {}", key, err);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Read one page of a collection, from cache when fresh.
    ///
    /// Returns an empty page if the backend cancelled the request.
    ///
    /// # Errors
    /// - Invalid collection name, `page` or `per_page` of zero
    /// - Not authenticated
    /// - Any backend failure other than cancellation
    pub async fn get_list(
        &self,
        collection: &str,
        page: u32,
        per_page: u32,
        options: &QueryOptions,
    ) -> Result<ListPage> {
        let collection = Collection::new(collection)?;
        if page == 0 || per_page == 0 {
            return Err(Error::InvalidInput(
                "page and perPage must be at least 1".to_string(),
            ));
        }
        let key = CacheKey::list(&collection, page, per_page, options);

        let cached = self
            .shared
            .with_cache(|cache, ttl, now| cache.get_list(&key, ttl, now));
        if let Some(list) = cached {
            debug!("Cache hit: {}", key);
            return Ok(list);
        }

        self.shared.require_auth().await?;
        match self
            .shared
            .backend
            .get_list(&collection, page, per_page, options)
            .await
        {
            Ok(list) => {
                self.shared.remember(&key, CachedValue::List(list.clone()));
                Ok(list)
            }
            Err(err) if err.is_cancelled() => {
                debug!("Read of {} cancelled: {}", key, err);
                Ok(ListPage::empty(page, per_page))
            }
            Err(err) => Err(err),
        }
    }

    /// Read every record of a collection, from cache when fresh.
    ///
    /// Returns an empty list if the backend cancelled the request.
    ///
    /// # Errors
    /// - Invalid collection name
    /// - Not authenticated
    /// - Any backend failure other than cancellation
    pub async fn get_full_list(
        &self,
        collection: &str,
        options: &QueryOptions,
    ) -> Result<Vec<Record>> {
        let collection = Collection::new(collection)?;
        let key = CacheKey::full_list(&collection, options);

        let cached = self
            .shared
            .with_cache(|cache, ttl, now| cache.get_full_list(&key, ttl, now));
        if let Some(items) = cached {
            debug!("Cache hit: {}", key);
            return Ok(items);
        }

        self.shared.require_auth().await?;
        match self.shared.backend.get_full_list(&collection, options).await {
            Ok(items) => {
                self.shared
                    .remember(&key, CachedValue::FullList(items.clone()));
                Ok(items)
            }
            Err(err) if err.is_cancelled() => {
                debug!("Read of {} cancelled: {}", key, err);
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }

    /// Dispatch everything queued right now and wait for it to settle.
    pub async fn flush(&self) -> FlushReport {
        self.shared.cancel_idle_timer();
        self.shared.flush_queue().await
    }

    /// Drop cached reads for one collection, or all of them.
    ///
    /// # Errors
    /// - Invalid collection name
    pub fn clear_cache(&self, collection: Option<&str>) -> Result<()> {
        match collection {
            Some(name) => {
                let collection = Collection::new(name)?;
                let removed = self
                    .shared
                    .cache
                    .lock()
                    .delete_by_collection_prefix(&collection);
                debug!("Cleared {} cache entries of {}", removed, collection);
            }
            None => {
                self.shared.cache.lock().clear();
                debug!("Cleared cache");
            }
        }
        Ok(())
    }

    /// Number of writes waiting for the next flush.
    pub fn pending_operations(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Check if any write is waiting for the next flush.
    pub fn has_pending_operations(&self) -> bool {
        !self.shared.queue.lock().is_empty()
    }

    /// Number of failed writes waiting out a backoff delay.
    pub fn pending_retries(&self) -> usize {
        self.shared.retries.pending()
    }

    /// Current cache statistics.
    pub fn cache_stats(&self) -> CacheStats {
        self.shared.cache.lock().stats()
    }

    /// Check if the store has been shut down.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Flush what is left and stop accepting writes.
    ///
    /// The idle timer is cancelled and writes waiting on a retry timer are
    /// pulled forward into this final flush. Failures during the final
    /// flush are not retried.
    pub async fn shutdown(&self) -> FlushReport {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return FlushReport::default();
        }

        self.shared.cancel_idle_timer();
        let parked = self.shared.retries.drain();
        if !parked.is_empty() {
            info!("Pulling {} pending retries into the final flush", parked.len());
            let now = self.shared.scheduler.now();
            let mut queue = self.shared.queue.lock();
            for op in parked {
                queue.push(op, now);
            }
        }

        let report = self.shared.flush_queue().await;
        let left = self.pending_operations();
        if left > 0 {
            warn!("Shut down with {} unsent operations", left);
        }
        info!(
            "Store shut down: {} dispatched, {} succeeded, {} dropped",
            report.dispatched, report.succeeded, report.dropped
        );
        report
    }
}

impl<B: Backend + ?Sized + 'static> Shared<B> {
    fn with_cache<T>(
        &self,
        f: impl FnOnce(&mut CacheStore, Duration, tokio::time::Instant) -> Option<T>,
    ) -> Option<T> {
        if !self.config.enable_cache {
            return None;
        }
        let now = self.scheduler.now();
        let mut cache = self.cache.lock();
        f(&mut cache, self.config.cache_ttl(), now)
    }

    fn remember(&self, key: &CacheKey, value: CachedValue) {
        if self.config.enable_cache {
            let now = self.scheduler.now();
            self.cache.lock().set(key, value, now);
        }
    }

    async fn require_auth(&self) -> Result<()> {
        if self.backend.ensure_authenticated().await? {
            Ok(())
        } else {
            Err(Error::Unauthenticated(format!(
                "{} backend session is not authenticated",
                self.backend.name()
            )))
        }
    }

    fn enqueue(self: &Arc<Self>, op: Operation) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed(format!("cannot queue {}", op.kind)));
        }

        let first = !self.first_submitted.swap(true, Ordering::SeqCst);
        let now = self.scheduler.now();
        let len = {
            let mut queue = self.queue.lock();
            queue.push(op, now)
        };
        debug!("Queued operation ({} pending)", len);

        if first && self.config.immediate_first_operation {
            debug!("Flushing first operation immediately");
            self.cancel_idle_timer();
            self.flush_soon();
        } else if len >= self.config.max_batch_size {
            debug!("Batch size {} reached, flushing", len);
            self.cancel_idle_timer();
            self.flush_soon();
        } else {
            self.arm_idle_timer();
        }
        Ok(())
    }

    fn arm_idle_timer(self: &Arc<Self>) {
        if self.idle_timer.lock().is_some() {
            return;
        }

        let generation = self.timer_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let weak = Arc::downgrade(self);
        let task: BoxFuture<'static, ()> = async move {
            if let Some(shared) = weak.upgrade() {
                shared.clear_idle_timer(generation);
                shared.flush_queue().await;
            }
        }
        .boxed();
        let handle = self.scheduler.after(self.config.batch_interval(), task);

        let mut slot = self.idle_timer.lock();
        if slot.is_some() {
            // Someone else armed one in the meantime
            drop(slot);
            handle.cancel();
        } else {
            *slot = Some(IdleTimer { generation, handle });
        }
    }

    fn clear_idle_timer(&self, generation: u64) {
        let mut slot = self.idle_timer.lock();
        if slot.as_ref().map(|t| t.generation) == Some(generation) {
            // Our own timer is firing; detach rather than cancel it.
            slot.take();
        }
    }

    fn cancel_idle_timer(&self) {
        let timer = self.idle_timer.lock().take();
        if let Some(timer) = timer {
            timer.handle.cancel();
        }
    }

    fn flush_soon(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let task: BoxFuture<'static, ()> = async move {
            if let Some(shared) = weak.upgrade() {
                shared.flush_queue().await;
            }
        }
        .boxed();
        // Detached: an immediate flush is never cancelled.
        drop(self.scheduler.after(Duration::ZERO, task));
    }

    async fn flush_queue(self: &Arc<Self>) -> FlushReport {
        let snapshot = self.queue.lock().take_all();
        if snapshot.is_empty() {
            return FlushReport::default();
        }

        let mut report = FlushReport::default();
        let authenticated = match self.backend.ensure_authenticated().await {
            Ok(authenticated) => authenticated,
            Err(err) => {
                warn!("Authentication check failed: {}", err);
                false
            }
        };
        if !authenticated {
            warn!(
                "Not authenticated, requeueing {} operations",
                snapshot.len()
            );
            report.requeued = snapshot.len();
            self.queue.lock().requeue_front(snapshot);
            if !self.closed.load(Ordering::SeqCst) {
                self.arm_idle_timer();
            }
            return report;
        }

        let groups = group_by_collection(snapshot);
        report.groups = groups.len();
        report.dispatched = groups.iter().map(|(_, ops)| ops.len()).sum();
        info!(
            "Flushing {} operations across {} collections",
            report.dispatched, report.groups
        );

        let outcomes = join_all(groups.into_iter().map(move |(collection, ops)| {
            debug!("Dispatching {} operations to {}", ops.len(), collection);
            join_all(ops.into_iter().map(move |op| self.dispatch(op)))
        }))
        .await;

        let mut expired = Vec::new();
        for outcome in outcomes.into_iter().flatten() {
            match outcome {
                DispatchOutcome::Succeeded => report.succeeded += 1,
                DispatchOutcome::Requeued(op) => {
                    report.failed += 1;
                    report.requeued += 1;
                    expired.push(op);
                }
                DispatchOutcome::Retried => {
                    report.failed += 1;
                    report.retried += 1;
                }
                DispatchOutcome::Dropped => {
                    report.failed += 1;
                    report.dropped += 1;
                }
            }
        }

        if !expired.is_empty() {
            warn!(
                "Session expired during flush, requeueing {} operations",
                expired.len()
            );
            expired.sort_by_key(|op| op.seq);
            self.queue.lock().requeue_front(expired);
            if !self.closed.load(Ordering::SeqCst) {
                self.arm_idle_timer();
            }
        }

        debug!(
            "Flush settled: {} succeeded, {} retried, {} dropped, {} requeued",
            report.succeeded, report.retried, report.dropped, report.requeued
        );
        report
    }

    async fn dispatch(self: &Arc<Self>, op: Operation) -> DispatchOutcome {
        match send_operation(self.backend.as_ref(), &op).await {
            Ok(()) => {
                self.invalidate_after(&op);
                debug!("Dispatched {}", op);
                DispatchOutcome::Succeeded
            }
            Err(err) => self.handle_failure(op, err),
        }
    }

    fn invalidate_after(&self, op: &Operation) {
        let mut cache = self.cache.lock();
        match (op.kind, op.id.as_ref()) {
            (OperationKind::Update | OperationKind::Delete, Some(id)) => {
                cache.invalidate_record(&op.collection, id)
            }
            _ => cache.invalidate_collection(&op.collection),
        }
    }

    fn handle_failure(self: &Arc<Self>, mut op: Operation, err: Error) -> DispatchOutcome {
        warn!("Dispatch of {} failed: {}", op, err);

        let closed = self.closed.load(Ordering::SeqCst);
        if matches!(err, Error::Unauthenticated(_)) && !closed {
            return DispatchOutcome::Requeued(op);
        }
        if !self.config.auto_retry || !err.is_transient() || closed {
            self.give_up(&op, &err, op.attempt + 1);
            return DispatchOutcome::Dropped;
        }

        match self.retries.policy().decide(&op) {
            RetryDecision::Retry { attempt, delay } => {
                warn!("Retrying {} in {:?} (attempt {})", op, delay, attempt);
                op.attempt = attempt;
                self.schedule_retry(op, delay);
                DispatchOutcome::Retried
            }
            RetryDecision::GiveUp { dispatches } => {
                self.give_up(&op, &err, dispatches);
                DispatchOutcome::Dropped
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, op: Operation, delay: Duration) {
        let ticket = self.retries.park(op);
        let weak = Arc::downgrade(self);
        let task: BoxFuture<'static, ()> = async move {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if let Some(op) = shared.retries.take(ticket) {
                let label = op.to_string();
                if let Err(err) = shared.enqueue(op) {
                    warn!("Could not requeue retry of {}: {}", label, err);
                }
            }
        }
        .boxed();
        let timer = self.scheduler.after(delay, task);
        self.retries.attach(ticket, timer);
    }

    fn give_up(&self, op: &Operation, err: &Error, dispatches: u32) {
        error!(
            "Dropping {} after {} failed dispatches: {}",
            op, dispatches, err
        );
        let hook = self.failure_hook.lock().clone();
        if let Some(hook) = hook {
            hook(op, err);
        }
    }
}

/// Send one queued write to the backend.
async fn send_operation<B: Backend + ?Sized>(backend: &B, op: &Operation) -> Result<()> {
    let payload = op.payload.clone().unwrap_or_default();
    match (op.kind, op.id.as_ref()) {
        (OperationKind::Create, _) => {
            backend.create(&op.collection, payload).await?;
        }
        (OperationKind::Update, Some(id)) => {
            backend.update(&op.collection, id, payload).await?;
        }
        (OperationKind::Delete, Some(id)) => {
            backend.delete(&op.collection, id).await?;
        }
        (kind, None) => {
            return Err(Error::InvalidInput(format!("{} without a record id", kind)));
        }
    }
    Ok(())
}

/// Best-effort dispatch of writes left behind by a dropped store.
///
/// Operations go out one by one in submission order. Nothing is cached or
/// retried any more; failures go to the hook.
async fn dispatch_orphans<B: Backend + ?Sized>(
    backend: Arc<B>,
    ops: Vec<Operation>,
    hook: Option<FailureHook>,
) {
    let give_up = |op: &Operation, err: &Error| {
        error!("Dropping {} left behind by a dropped store: {}", op, err);
        if let Some(hook) = &hook {
            hook(op, err);
        }
    };

    let authenticated = match backend.ensure_authenticated().await {
        Ok(true) => Ok(()),
        Ok(false) => Err(Error::Unauthenticated(format!(
            "{} backend session is not authenticated",
            backend.name()
        ))),
        Err(err) => Err(err),
    };
    if let Err(err) = authenticated {
        for op in &ops {
            give_up(op, &err);
        }
        return;
    }

    let mut succeeded = 0;
    for op in &ops {
        match send_operation(backend.as_ref(), op).await {
            Ok(()) => succeeded += 1,
            Err(err) => give_up(op, &err),
        }
    }
    info!(
        "Dispatched {} of {} operations left behind by a dropped store",
        succeeded,
        ops.len()
    );
}

impl<B: Backend + ?Sized + 'static> Drop for Shared<B> {
    fn drop(&mut self) {
        if let Some(timer) = self.idle_timer.get_mut().take() {
            timer.handle.cancel();
        }

        let mut ops = self.queue.get_mut().take_all();
        ops.extend(self.retries.drain());
        if ops.is_empty() {
            return;
        }
        ops.sort_by_key(|op| op.seq);

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                info!("Store dropped, dispatching {} pending operations", ops.len());
                let backend = Arc::clone(&self.backend);
                let hook = self.failure_hook.get_mut().clone();
                runtime.spawn(dispatch_orphans(backend, ops, hook));
            }
            Err(_) => {
                warn!(
                    "Store dropped outside a tokio runtime with {} unsent operations; call shutdown() to flush them",
                    ops.len()
                );
            }
        }
    }
}
