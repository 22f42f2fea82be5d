//! batchline sync layer
//!
//! This module mediates every write and read against the remote store:
//! - Write coalescing into time- or size-bounded batches
//! - TTL read cache with per-record and per-collection invalidation
//! - Optimistic results for writes and cached records
//! - Retry with exponential backoff for transient dispatch failures

pub mod cache;
pub mod config;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod store;

// Re-export main types
pub use cache::{CacheEntry, CacheKey, CacheStats, CacheStore, CachedValue};
pub use config::BatchConfig;
pub use queue::{group_by_collection, Operation, OperationKind, OperationQueue};
pub use retry::{RetryDecision, RetryManager, RetryPolicy};
pub use scheduler::{Scheduler, TimerHandle, TokioScheduler};
pub use store::{BatchedStore, FailureHook, FlushReport};
