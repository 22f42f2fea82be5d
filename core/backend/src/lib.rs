//! Remote data store abstraction for batchline.
//!
//! This module provides the collection-oriented operation surface every
//! batched write and cached read goes through, plus an in-memory
//! implementation used by tests and the replay CLI.
//!
//! # Design Principles
//! - Collection-keyed: every call names its collection explicitly
//! - Async operations: all calls are async and may suspend
//! - Unified error semantics: adapters map their failures onto the common `Error`

pub mod backend;
pub mod memory;

pub use backend::{Backend, BackendMethod};
pub use memory::{BackendCall, MemoryBackend};
