//! Core record types for reliefsync.
//!
//! This module defines the pending mutation queued while the registries are
//! unreachable, the storage partitions of the local store, and the keys that
//! address records inside them.

use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// HTTP verb of a queued mutation.
///
/// Only verbs that change server state can be queued; reads are never
/// replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// Create a record.
    Post,
    /// Replace a record.
    Put,
    /// Partially update a record.
    Patch,
    /// Remove a record.
    Delete,
}

impl HttpMethod {
    /// The canonical upper-case verb.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            _ => Err(Error::UnsupportedMethod(s.to_string())),
        }
    }
}

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

/// A write request waiting to be replayed against the live API.
///
/// Mutations are immutable once queued. They leave the queue only after the
/// API accepted the replayed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    /// Queue key (assigned by the local store).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,

    /// Target API endpoint, absolute or relative to the API base URL.
    pub url: String,

    /// HTTP verb to replay with.
    pub method: HttpMethod,

    /// Request body, sent verbatim as JSON.
    #[serde(default)]
    pub data: Value,

    /// Creation time in epoch milliseconds.
    pub timestamp: i64,
}

impl PendingMutation {
    /// Create a new mutation stamped with the current time.
    #[must_use]
    pub fn new(url: impl Into<String>, method: HttpMethod, data: Value) -> Self {
        Self {
            id: None,
            url: url.into(),
            method,
            data,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Order used when draining: oldest first, queue key breaks ties.
    #[must_use]
    pub fn fifo_key(&self) -> (i64, i64) {
        (self.timestamp, self.id.unwrap_or(i64::MAX))
    }
}

/// A named partition of the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    /// Mirrored domain records (donors, missing-person reports).
    Records,
    /// Secondary records attached to a domain record.
    Secondary,
    /// Pending mutations.
    SyncQueue,
}

impl Partition {
    /// The table backing this partition.
    #[must_use]
    pub fn table(&self) -> &'static str {
        match self {
            Self::Records => "records",
            Self::Secondary => "secondary_records",
            Self::SyncQueue => "sync_queue",
        }
    }

    /// Whether keys are assigned by the store rather than taken from the record.
    #[must_use]
    pub fn auto_keyed(&self) -> bool {
        matches!(self, Self::SyncQueue)
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table())
    }
}

/// Primary key of a stored record.
///
/// String and numeric record ids are different keys: `{"id": 42}` and
/// `{"id": "42"}` are two records.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordKey {
    /// Server-assigned string identifier of a cached record.
    Named(String),
    /// Server-assigned integer identifier of a cached record.
    Number(i64),
    /// Store-assigned sequence number of a queued mutation.
    Sequence(i64),
}

impl RecordKey {
    /// Extract the `id` field of a record.
    ///
    /// Non-empty strings and integers are keys. Fractional numbers are not;
    /// the registries only hand out string or integer ids.
    #[must_use]
    pub fn from_record(record: &Value) -> Option<Self> {
        match record.get("id")? {
            Value::String(s) if !s.is_empty() => Some(Self::Named(s.clone())),
            Value::Number(n) => n.as_i64().map(Self::Number),
            _ => None,
        }
    }

    /// The key as an `SQLite` value, keeping its type.
    #[must_use]
    pub fn to_sql_value(&self) -> rusqlite::types::Value {
        match self {
            Self::Named(s) => rusqlite::types::Value::Text(s.clone()),
            Self::Number(n) | Self::Sequence(n) => rusqlite::types::Value::Integer(*n),
        }
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Named(s) => write!(f, "{s:?}"),
            Self::Number(n) | Self::Sequence(n) => write!(f, "{n}"),
        }
    }
}

impl From<i64> for RecordKey {
    fn from(n: i64) -> Self {
        Self::Sequence(n)
    }
}

impl From<&str> for RecordKey {
    fn from(s: &str) -> Self {
        Self::Named(s.to_string())
    }
}
