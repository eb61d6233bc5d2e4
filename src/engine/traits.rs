//! Connector and result-stream trait definitions.
//!
//! Every backend variant (tunnel database, data cloud, distributed SQL,
//! demo) implements `QueryConnector` to provide the uniform
//! "execute query → result stream" contract the executor drives.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::engine::error::EngineResult;
use crate::engine::types::{QueryProgress, QueryStatus, RowBatch, Schema, StreamMetrics};

/// A streaming query result, connector-agnostic.
///
/// One underlying stream is read by exactly one implementation instance.
/// Schema/batch consumption and progress consumption are two logical cursors
/// over the same message sequence; implementations route messages by tag and
/// must preserve arrival order within each category.
#[async_trait]
pub trait ResultStream: Send + Sync {
    /// Resolves once the first schema message arrives, or `None` if the
    /// stream terminates before any schema.
    async fn schema(&self) -> EngineResult<Option<Schema>>;

    /// The next data-bearing batch, or `None` at stream end.
    async fn next_record_batch(&self) -> EngineResult<Option<RowBatch>>;

    /// The next non-data progress message, or `None` at stream end.
    async fn next_progress_update(&self) -> EngineResult<Option<QueryProgress>>;

    /// The stream status observed so far.
    fn status(&self) -> QueryStatus;

    /// Counters observed so far, updated as a side effect of consumption.
    fn metrics(&self) -> StreamMetrics;

    /// Trailer metadata, populated once the stream completed.
    fn metadata(&self) -> HashMap<String, String>;

    /// Actively releases backend-side stream state. Dropping the stream is
    /// not enough for bridge-backed streams: the host keeps state per
    /// `(channelId, streamId)` until told otherwise.
    async fn tear_down(&self);
}

impl std::fmt::Debug for dyn ResultStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStream")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Per-backend implementation of "execute query → result stream".
///
/// Connection-specific context (attached databases, access tokens, call
/// metadata) is recomputed on every call so that token refresh and
/// attachment changes take effect on the next query without rebuilding the
/// connector.
#[async_trait]
pub trait QueryConnector: Send + Sync {
    /// Unique identifier for this connector type (e.g. "tunnel", "distsql").
    fn connector_id(&self) -> &'static str;

    /// Human-readable connector name.
    fn connector_name(&self) -> &'static str;

    /// Probes the backend without executing a query.
    async fn health_check(&self) -> EngineResult<()>;

    /// Submits a query and returns its result stream. The cancellation token
    /// is checked at every suspension point.
    async fn execute_query(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<Arc<dyn ResultStream>>;
}
