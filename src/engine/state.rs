//! Connection state and the query action reducer.
//!
//! The running/finished query maps and the aggregated metrics of a
//! connection are mutated only through `reduce_query_action`, so the
//! materialized state is the fold of the dispatched action history. Keeping
//! the reducer a plain function makes the single-writer invariant testable
//! without the executor.

use std::collections::HashMap;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::engine::catalog::{reduce_catalog_action, CatalogAction, CatalogSnapshot, CatalogUpdateTask};
use crate::engine::error::EngineError;
use crate::engine::types::{
    ConnectionHealth, ConnectionId, ConnectionMetrics, QueryId, QueryMetadata, QueryMetrics,
    QueryProgress, QueryStatus, RowBatch, Schema, StreamMetrics, UpdateId,
};

/// Everything the engine tracks for one query execution.
#[derive(Debug, Clone)]
pub struct QueryExecution {
    pub query_id: QueryId,
    pub metadata: QueryMetadata,
    pub status: QueryStatus,
    /// Shared with every suspension point in the query's call chain.
    pub cancellation: CancellationToken,
    pub metrics: QueryMetrics,
    pub latest_progress: Option<QueryProgress>,
    pub result_schema: Option<Schema>,
    pub result_batches: Vec<RowBatch>,
    /// Trailer metadata delivered with stream completion.
    pub result_metadata: HashMap<String, String>,
    /// The terminal error, if the query failed or was cancelled.
    pub error: Option<EngineError>,
}

impl QueryExecution {
    pub fn new(query_id: QueryId, metadata: QueryMetadata) -> Self {
        Self {
            query_id,
            metadata,
            status: QueryStatus::Accepted,
            cancellation: CancellationToken::new(),
            metrics: QueryMetrics::default(),
            latest_progress: None,
            result_schema: None,
            result_batches: Vec::new(),
            result_metadata: HashMap::new(),
            error: None,
        }
    }
}

/// One discrete, ordered step of a query's lifecycle.
#[derive(Debug)]
pub enum QueryAction {
    /// Registers the query in the running map, before any network call.
    Register(Box<QueryExecution>),
    Started(QueryId),
    ReceivedSchema(QueryId, Schema),
    ReceivedBatch(QueryId, RowBatch, StreamMetrics),
    ProgressUpdated(QueryId, QueryProgress),
    Succeeded(QueryId, HashMap<String, String>, StreamMetrics),
    Failed(QueryId, EngineError, Option<StreamMetrics>),
    Cancelled(QueryId, EngineError, Option<StreamMetrics>),
}

/// Per-connection state. Exclusively owned by its `Connection`; mutated only
/// by the reducer functions in this module and in `catalog`.
#[derive(Debug)]
pub struct ConnectionState {
    pub connection_id: ConnectionId,
    pub connector_id: String,
    pub health: ConnectionHealth,
    pub metrics: ConnectionMetrics,
    pub queries_running: HashMap<QueryId, QueryExecution>,
    pub queries_finished: HashMap<QueryId, QueryExecution>,
    /// Finished query ids in completion order.
    pub queries_finished_ordered: Vec<QueryId>,
    pub catalog: Option<CatalogSnapshot>,
    pub catalog_tasks_running: HashMap<UpdateId, CatalogUpdateTask>,
    pub catalog_tasks_finished: HashMap<UpdateId, CatalogUpdateTask>,
}

impl ConnectionState {
    pub fn new(connection_id: ConnectionId, connector_id: impl Into<String>) -> Self {
        Self {
            connection_id,
            connector_id: connector_id.into(),
            health: ConnectionHealth::NotStarted,
            metrics: ConnectionMetrics::default(),
            queries_running: HashMap::new(),
            queries_finished: HashMap::new(),
            queries_finished_ordered: Vec::new(),
            catalog: None,
            catalog_tasks_running: HashMap::new(),
            catalog_tasks_finished: HashMap::new(),
        }
    }

    /// Looks a query up in the running map first, then the finished map.
    pub fn query(&self, query_id: QueryId) -> Option<&QueryExecution> {
        self.queries_running
            .get(&query_id)
            .or_else(|| self.queries_finished.get(&query_id))
    }

    pub fn dispatch_query(&mut self, action: QueryAction) {
        reduce_query_action(self, action);
    }

    pub fn dispatch_catalog(&mut self, action: CatalogAction) {
        reduce_catalog_action(self, action);
    }
}

/// Applies one query action to the connection state.
///
/// Actions for unknown or already-finished queries are dropped: terminal
/// transitions happen exactly once, and late stream events after a
/// cancellation must not resurrect a query.
pub fn reduce_query_action(state: &mut ConnectionState, action: QueryAction) {
    let now = Utc::now();

    if let QueryAction::Register(query) = action {
        debug_assert_eq!(query.status, QueryStatus::Accepted);
        state.queries_running.insert(query.query_id, *query);
        return;
    }

    let query_id = match &action {
        QueryAction::Register(_) => unreachable!(),
        QueryAction::Started(id)
        | QueryAction::ReceivedSchema(id, _)
        | QueryAction::ReceivedBatch(id, _, _)
        | QueryAction::ProgressUpdated(id, _)
        | QueryAction::Succeeded(id, _, _)
        | QueryAction::Failed(id, _, _)
        | QueryAction::Cancelled(id, _, _) => *id,
    };
    let Some(query) = state.queries_running.get_mut(&query_id) else {
        warn!(%query_id, "dropping action for unknown or finished query");
        return;
    };

    match action {
        QueryAction::Register(_) => unreachable!(),
        QueryAction::Started(_) => {
            if query.status >= QueryStatus::Started {
                return;
            }
            query.status = QueryStatus::Started;
            query.metrics.started_at = Some(now);
            query.metrics.last_updated_at = Some(now);
        }
        QueryAction::ReceivedSchema(_, schema) => {
            query.result_schema = Some(schema);
            query.metrics.last_updated_at = Some(now);
        }
        QueryAction::ReceivedBatch(_, batch, stream_metrics) => {
            if query.metrics.received_first_result_at.is_none() {
                query.metrics.received_first_result_at = Some(now);
            }
            if query.status < QueryStatus::ReceivedFirstResult {
                query.status = QueryStatus::ReceivedFirstResult;
            }
            query.metrics.stream = stream_metrics;
            query.metrics.last_updated_at = Some(now);
            query.result_batches.push(batch);
        }
        QueryAction::ProgressUpdated(_, progress) => {
            query.latest_progress = Some(progress);
            query.metrics.progress_updates_received += 1;
            query.metrics.last_updated_at = Some(now);
        }
        QueryAction::Succeeded(_, metadata, stream_metrics) => {
            query.status = QueryStatus::Succeeded;
            query.result_metadata = metadata;
            query.metrics.stream = stream_metrics;
            finish_query(state, query_id, now);
        }
        QueryAction::Failed(_, error, stream_metrics) => {
            query.status = QueryStatus::Failed;
            query.error = Some(error);
            if let Some(stream_metrics) = stream_metrics {
                query.metrics.stream = stream_metrics;
            }
            finish_query(state, query_id, now);
        }
        QueryAction::Cancelled(_, error, stream_metrics) => {
            query.status = QueryStatus::Cancelled;
            query.error = Some(error);
            if let Some(stream_metrics) = stream_metrics {
                query.metrics.stream = stream_metrics;
            }
            finish_query(state, query_id, now);
        }
    }
}

/// Moves a query from the running to the finished map and folds its metrics
/// into the connection's outcome bucket. Runs exactly once per query.
fn finish_query(state: &mut ConnectionState, query_id: QueryId, now: chrono::DateTime<Utc>) {
    let Some(mut query) = state.queries_running.remove(&query_id) else {
        return;
    };
    query.metrics.finished_at = Some(now);
    query.metrics.last_updated_at = Some(now);
    let started = query.metrics.started_at.unwrap_or(now);
    query.metrics.query_duration_ms = Some((now - started).num_milliseconds().max(0) as u64);

    let bucket = match query.status {
        QueryStatus::Succeeded => &mut state.metrics.successful_queries,
        QueryStatus::Cancelled => &mut state.metrics.cancelled_queries,
        _ => &mut state.metrics.failed_queries,
    };
    bucket.merge_query(&query.metrics);

    state.queries_finished_ordered.push(query_id);
    state.queries_finished.insert(query_id, query);
}
