//! Universal data types for the query engine.
//!
//! These types normalize what the connector backends return (schemas, row
//! batches, progress updates) and what the engine tracks per query and per
//! connection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a query, monotonically increasing within the
/// process. Ids are never reused, even for retries of the same statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryId(pub u64);

impl std::fmt::Display for QueryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a catalog update task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UpdateId(pub u64);

impl std::fmt::Display for UpdateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a query execution.
///
/// Transitions are linear and forward-only:
/// `Accepted → Started → ReceivedFirstResult → {Succeeded | Failed | Cancelled}`.
/// The declaration order matters; the reducer compares ranks to reject
/// backward transitions.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Accepted,
    Started,
    ReceivedFirstResult,
    Succeeded,
    Failed,
    Cancelled,
}

impl QueryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Health of a backend connection, tracked separately from any single
/// query's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionHealth {
    NotStarted,
    Connecting,
    Online,
    Failed,
    Cancelled,
}

/// Who issued a query and how to present it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub issuer: Option<String>,
    /// Authored by the user, as opposed to issued by the app itself.
    pub user_provided: bool,
}

/// Arguments for executing a query.
#[derive(Debug, Clone)]
pub struct QueryArgs {
    pub query: String,
    pub metadata: QueryMetadata,
}

impl QueryArgs {
    pub fn user_query(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            metadata: QueryMetadata {
                user_provided: true,
                ..Default::default()
            },
        }
    }
}

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

/// Resolved result schema.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Schema {
    pub columns: Vec<ColumnInfo>,
}

impl Schema {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

/// Universal value representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

/// A single row of data, indexed by column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub values: Vec<Value>,
}

/// One data-bearing message worth of rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowBatch {
    pub rows: Vec<Row>,
    /// Size of the encoded message this batch was decoded from.
    pub data_bytes: u64,
}

impl RowBatch {
    pub fn row_count(&self) -> u64 {
        self.rows.len() as u64
    }
}

/// A non-data progress message from the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryProgress {
    /// Whether the backend reports the query as queued.
    pub is_queued: Option<bool>,
    /// Backend-reported execution state, if any.
    pub state: Option<String>,
    pub rows_scanned: Option<u64>,
    pub bytes_scanned: Option<u64>,
}

/// What a result stream has observed so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetrics {
    pub bytes_received: u64,
    pub batches_received: u64,
    pub rows_received: u64,
    pub duration_until_first_batch_ms: Option<u64>,
}

/// Per-query metric counters, updated by the reducer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryMetrics {
    pub started_at: Option<DateTime<Utc>>,
    pub received_first_result_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_updated_at: Option<DateTime<Utc>>,
    pub query_duration_ms: Option<u64>,
    pub progress_updates_received: u64,
    pub stream: StreamMetrics,
}

/// Lifetime counters for one outcome bucket of a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionQueryMetrics {
    pub total_queries: u64,
    pub total_batches_received: u64,
    pub total_rows_received: u64,
    pub accumulated_time_until_first_batch_ms: u64,
    pub accumulated_query_duration_ms: u64,
}

impl ConnectionQueryMetrics {
    /// Folds one finished query into the bucket.
    pub fn merge_query(&mut self, query: &QueryMetrics) {
        self.total_queries += 1;
        self.total_batches_received += query.stream.batches_received;
        self.total_rows_received += query.stream.rows_received;
        self.accumulated_time_until_first_batch_ms +=
            query.stream.duration_until_first_batch_ms.unwrap_or(0);
        self.accumulated_query_duration_ms += query.query_duration_ms.unwrap_or(0);
    }
}

/// Aggregated lifetime metrics of a connection, bucketed by outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub successful_queries: ConnectionQueryMetrics,
    pub failed_queries: ConnectionQueryMetrics,
    pub cancelled_queries: ConnectionQueryMetrics,
}

impl ConnectionMetrics {
    pub fn total_queries(&self) -> u64 {
        self.successful_queries.total_queries
            + self.failed_queries.total_queries
            + self.cancelled_queries.total_queries
    }
}
