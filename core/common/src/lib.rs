//! Common utilities and types shared across batchline crates.
//!
//! This module provides the shared error type and the validated identifiers
//! (collection names, record ids) that every other crate builds on.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{Collection, ListPage, QueryOptions, Record, RecordId};
