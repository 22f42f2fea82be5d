//! Common types used throughout batchline.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// A single record as exchanged with the remote store.
pub type Record = serde_json::Map<String, Value>;

/// Name of a logical table/resource on the remote store.
///
/// Collection names are used as cache key prefixes, so they may not contain
/// the `:` separator or whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Collection(String);

impl Collection {
    /// Create a new collection name.
    ///
    /// # Errors
    /// - Returns error if `name` is empty, contains `:` or whitespace
    pub fn new(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Collection name cannot be empty".to_string(),
            ));
        }
        if name.contains(':') || name.chars().any(char::is_whitespace) {
            return Err(crate::Error::InvalidInput(format!(
                "Collection name cannot contain ':' or whitespace: {:?}",
                name
            )));
        }
        Ok(Self(name))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for Collection {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<&str> for Collection {
    type Error = crate::Error;

    fn try_from(value: &str) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl From<Collection> for String {
    fn from(value: Collection) -> Self {
        value.0
    }
}

/// Identifier of a record within a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordId(String);

impl RecordId {
    /// Create a new record id.
    ///
    /// # Errors
    /// - Returns error if `id` is empty or contains whitespace
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Record id cannot be empty".to_string(),
            ));
        }
        if id.chars().any(char::is_whitespace) {
            return Err(crate::Error::InvalidInput(format!(
                "Record id cannot contain whitespace: {:?}",
                id
            )));
        }
        Ok(Self(id))
    }

    /// Read the `id` field of a record, if it carries a valid one.
    pub fn of_record(record: &Record) -> Option<Self> {
        record
            .get("id")
            .and_then(Value::as_str)
            .and_then(|id| Self::new(id).ok())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for RecordId {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<&str> for RecordId {
    type Error = crate::Error;

    fn try_from(value: &str) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl From<RecordId> for String {
    fn from(value: RecordId) -> Self {
        value.0
    }
}

/// Query parameters for list reads (`filter`, `sort`, `expand`, ...).
///
/// Keys are kept sorted so the serialized form is deterministic and can be
/// used as part of a cache key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryOptions(BTreeMap<String, Value>);

impl QueryOptions {
    /// Create empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the filter expression.
    pub fn filter(self, filter: impl Into<String>) -> Self {
        self.with("filter", Value::String(filter.into()))
    }

    /// Set the sort expression (`field` ascending, `-field` descending).
    pub fn sort(self, sort: impl Into<String>) -> Self {
        self.with("sort", Value::String(sort.into()))
    }

    /// Set an arbitrary option.
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    /// Get an option by name.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Get a string option by name.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Iterate over all options in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Check if no options are set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<String, Value>> for QueryOptions {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

/// One page of a paginated list read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPage {
    /// 1-based page number.
    pub page: u32,
    /// Requested page size.
    pub per_page: u32,
    /// Total records matching the query.
    pub total_items: u64,
    /// Total pages for this page size.
    pub total_pages: u64,
    /// Records on this page.
    pub items: Vec<Record>,
}

impl ListPage {
    /// A page with no items, used as the neutral result of a cancelled read.
    pub fn empty(page: u32, per_page: u32) -> Self {
        Self {
            page,
            per_page,
            total_items: 0,
            total_pages: 0,
            items: Vec::new(),
        }
    }

    /// Check if the page holds no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_collection_creation() {
        let c = Collection::new("users").unwrap();
        assert_eq!(c.as_str(), "users");
        assert_eq!(c.to_string(), "users");
    }

    #[test]
    fn test_collection_rejects_separator() {
        assert!(Collection::new("").is_err());
        assert!(Collection::new("users:archive").is_err());
        assert!(Collection::new("plant orders").is_err());
    }

    #[test]
    fn test_record_id_validation() {
        assert!(RecordId::new("abc123").is_ok());
        assert!(RecordId::new("").is_err());
        assert!(RecordId::new("a b").is_err());
    }

    #[test]
    fn test_record_id_of_record() {
        let record = json!({"id": "r1", "name": "Pump"});
        let record = record.as_object().unwrap();
        assert_eq!(RecordId::of_record(record).unwrap().as_str(), "r1");

        let no_id = json!({"name": "Pump"});
        assert!(RecordId::of_record(no_id.as_object().unwrap()).is_none());
    }

    #[test]
    fn test_collection_deserialize_validates() {
        let ok: Collection = serde_json::from_str("\"orders\"").unwrap();
        assert_eq!(ok.as_str(), "orders");
        assert!(serde_json::from_str::<Collection>("\"a:b\"").is_err());
    }

    #[test]
    fn test_query_options_serialize_sorted() {
        let a = QueryOptions::new().sort("-created").filter("status='open'");
        let b = QueryOptions::new().filter("status='open'").sort("-created");
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
        assert_eq!(a.get_str("sort"), Some("-created"));
    }

    #[test]
    fn test_list_page_wire_format() {
        let page = ListPage::empty(2, 20);
        let value = serde_json::to_value(&page).unwrap();
        assert_eq!(value["perPage"], 20);
        assert_eq!(value["totalItems"], 0);
        assert!(page.is_empty());
    }

    proptest! {
        #[test]
        fn prop_collection_without_separator_is_valid(name in "[a-z_][a-z0-9_]{0,24}") {
            prop_assert!(Collection::new(name.clone()).is_ok());
            let with_sep = format!("{}:x", name);
            prop_assert!(Collection::new(with_sep).is_err());
        }

        #[test]
        fn prop_record_id_roundtrips_through_string(id in "[A-Za-z0-9]{1,15}") {
            let rid = RecordId::new(id.clone()).unwrap();
            prop_assert_eq!(String::from(rid), id);
        }
    }
}
