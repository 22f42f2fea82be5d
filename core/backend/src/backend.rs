//! Backend adapter trait definition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use batchline_common::{Collection, ListPage, QueryOptions, Record, RecordId, Result};

/// The individual operations of the backend surface.
///
/// Used for call accounting and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackendMethod {
    Authenticate,
    Create,
    Update,
    Delete,
    GetOne,
    GetList,
    GetFullList,
}

impl BackendMethod {
    /// Whether this method only reads.
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            BackendMethod::GetOne | BackendMethod::GetList | BackendMethod::GetFullList
        )
    }
}

impl fmt::Display for BackendMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendMethod::Authenticate => "authenticate",
            BackendMethod::Create => "create",
            BackendMethod::Update => "update",
            BackendMethod::Delete => "delete",
            BackendMethod::GetOne => "getOne",
            BackendMethod::GetList => "getList",
            BackendMethod::GetFullList => "getFullList",
        };
        f.write_str(name)
    }
}

/// Collection-oriented remote store.
///
/// Implementations must handle their own transport and session renewal;
/// callers only see the common `Error` variants.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Get the adapter name (e.g., "memory", "http").
    fn name(&self) -> &str;

    /// Check that the current session is authenticated.
    ///
    /// Gates every batch dispatch and every cache-miss read.
    async fn ensure_authenticated(&self) -> Result<bool>;

    /// Create a record.
    ///
    /// # Postconditions
    /// - Returns the stored record, including any server-assigned `id`
    async fn create(&self, collection: &Collection, data: Record) -> Result<Record>;

    /// Merge `data` into an existing record.
    ///
    /// # Errors
    /// - Record not found
    async fn update(&self, collection: &Collection, id: &RecordId, data: Record)
        -> Result<Record>;

    /// Delete a record.
    ///
    /// # Errors
    /// - Record not found
    async fn delete(&self, collection: &Collection, id: &RecordId) -> Result<bool>;

    /// Fetch a single record.
    ///
    /// # Errors
    /// - Record not found
    /// - `Error::Cancelled` if the request was superseded
    async fn get_one(&self, collection: &Collection, id: &RecordId) -> Result<Record>;

    /// Fetch one page of a collection.
    ///
    /// # Preconditions
    /// - `page` and `per_page` are at least 1
    async fn get_list(
        &self,
        collection: &Collection,
        page: u32,
        per_page: u32,
        options: &QueryOptions,
    ) -> Result<ListPage>;

    /// Fetch every record of a collection matching `options`.
    async fn get_full_list(
        &self,
        collection: &Collection,
        options: &QueryOptions,
    ) -> Result<Vec<Record>>;
}
