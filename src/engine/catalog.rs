//! Catalog refresh coordination.
//!
//! A refresh is an update task that spawns one or more queries (the
//! information-schema projection) on behalf of the connection. The task id
//! tracks every spawned query id, and the task resolves only once all of
//! them have left the running map. A failed or cancelled spawned query
//! fails the task but never hangs it; the previous catalog snapshot stays
//! in place in that case.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::executor::QueryExecutor;
use crate::engine::state::ConnectionState;
use crate::engine::types::{
    ConnectionId, QueryArgs, QueryId, QueryMetadata, RowBatch, Schema, UpdateId, Value,
};

/// The standard projection every connector is expected to answer.
pub const INFORMATION_SCHEMA_COLUMNS_QUERY: &str = "\
SELECT table_catalog, table_schema, table_name, column_name, ordinal_position, \
is_nullable, data_type \
FROM information_schema.columns";

/// Lifecycle of one catalog update task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogTaskStatus {
    Started,
    Succeeded,
    Failed,
    Cancelled,
}

impl CatalogTaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Started)
    }
}

/// One catalog refresh in flight, with the query ids it spawned.
#[derive(Debug, Clone)]
pub struct CatalogUpdateTask {
    pub task_id: UpdateId,
    pub status: CatalogTaskStatus,
    pub cancellation: CancellationToken,
    /// Ids of the queries issued on behalf of this refresh.
    pub queries: Vec<QueryId>,
    pub error: Option<EngineError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl CatalogUpdateTask {
    pub fn new(task_id: UpdateId) -> Self {
        Self {
            task_id,
            status: CatalogTaskStatus::Started,
            cancellation: CancellationToken::new(),
            queries: Vec::new(),
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// One column as described by `information_schema.columns`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogColumn {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub ordinal_position: u64,
}

/// Materialized catalog, derived from the latest successful refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogSnapshot {
    /// catalog name → schema name → table name → columns in ordinal order.
    pub catalogs: BTreeMap<String, BTreeMap<String, BTreeMap<String, Vec<CatalogColumn>>>>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl CatalogSnapshot {
    /// Folds an `information_schema.columns` result into the nested
    /// catalog/schema/table map. Rows with a malformed shape are skipped.
    pub fn from_query_result(schema: &Schema, batches: &[RowBatch]) -> Self {
        let mut snapshot = CatalogSnapshot {
            refreshed_at: Some(Utc::now()),
            ..Default::default()
        };
        let Some(columns) = ColumnIndices::resolve(schema) else {
            return snapshot;
        };
        for batch in batches {
            for row in &batch.rows {
                let Some(entry) = columns.read_row(&row.values) else {
                    continue;
                };
                snapshot
                    .catalogs
                    .entry(entry.catalog)
                    .or_default()
                    .entry(entry.schema)
                    .or_default()
                    .entry(entry.table)
                    .or_default()
                    .push(entry.column);
            }
        }
        for schemas in snapshot.catalogs.values_mut() {
            for tables in schemas.values_mut() {
                for columns in tables.values_mut() {
                    columns.sort_by_key(|c| c.ordinal_position);
                }
            }
        }
        snapshot
    }

    pub fn table_count(&self) -> usize {
        self.catalogs
            .values()
            .flat_map(|schemas| schemas.values())
            .map(|tables| tables.len())
            .sum()
    }
}

struct ColumnIndices {
    catalog: usize,
    schema: usize,
    table: usize,
    column: usize,
    ordinal: usize,
    nullable: usize,
    data_type: usize,
}

struct CatalogEntry {
    catalog: String,
    schema: String,
    table: String,
    column: CatalogColumn,
}

impl ColumnIndices {
    fn resolve(schema: &Schema) -> Option<Self> {
        Some(Self {
            catalog: schema.column_index("table_catalog")?,
            schema: schema.column_index("table_schema")?,
            table: schema.column_index("table_name")?,
            column: schema.column_index("column_name")?,
            ordinal: schema.column_index("ordinal_position")?,
            nullable: schema.column_index("is_nullable")?,
            data_type: schema.column_index("data_type")?,
        })
    }

    fn read_row(&self, values: &[Value]) -> Option<CatalogEntry> {
        Some(CatalogEntry {
            catalog: values.get(self.catalog)?.as_str()?.to_string(),
            schema: values.get(self.schema)?.as_str()?.to_string(),
            table: values.get(self.table)?.as_str()?.to_string(),
            column: CatalogColumn {
                name: values.get(self.column)?.as_str()?.to_string(),
                data_type: values.get(self.data_type)?.as_str()?.to_string(),
                nullable: values
                    .get(self.nullable)?
                    .as_str()
                    .map(|v| v.eq_ignore_ascii_case("yes"))
                    .unwrap_or(false),
                ordinal_position: values
                    .get(self.ordinal)?
                    .as_i64()
                    .map(|v| v.max(0) as u64)
                    .unwrap_or(0),
            },
        })
    }
}

/// One discrete step of a catalog update task's lifecycle.
#[derive(Debug)]
pub enum CatalogAction {
    /// Registers the task in the running map.
    RegisterTask(CatalogUpdateTask),
    /// Records a query id spawned on behalf of the task.
    RegisterQuery(UpdateId, QueryId),
    /// Installs the new snapshot and finishes the task.
    Succeeded(UpdateId, CatalogSnapshot),
    /// Finishes the task without touching the current snapshot.
    Failed(UpdateId, EngineError),
    Cancelled(UpdateId, EngineError),
}

/// Applies one catalog action to the connection state. Actions for unknown
/// or finished tasks are dropped, mirroring the query reducer.
pub fn reduce_catalog_action(state: &mut ConnectionState, action: CatalogAction) {
    if let CatalogAction::RegisterTask(task) = action {
        state.catalog_tasks_running.insert(task.task_id, task);
        return;
    }

    let task_id = match &action {
        CatalogAction::RegisterTask(_) => unreachable!(),
        CatalogAction::RegisterQuery(id, _)
        | CatalogAction::Succeeded(id, _)
        | CatalogAction::Failed(id, _)
        | CatalogAction::Cancelled(id, _) => *id,
    };
    let Some(task) = state.catalog_tasks_running.get_mut(&task_id) else {
        warn!(%task_id, "dropping action for unknown or finished catalog task");
        return;
    };

    match action {
        CatalogAction::RegisterTask(_) => unreachable!(),
        CatalogAction::RegisterQuery(_, query_id) => {
            task.queries.push(query_id);
        }
        CatalogAction::Succeeded(_, snapshot) => {
            task.status = CatalogTaskStatus::Succeeded;
            state.catalog = Some(snapshot);
            finish_catalog_task(state, task_id);
        }
        CatalogAction::Failed(_, error) => {
            task.status = CatalogTaskStatus::Failed;
            task.error = Some(error);
            finish_catalog_task(state, task_id);
        }
        CatalogAction::Cancelled(_, error) => {
            task.status = CatalogTaskStatus::Cancelled;
            task.error = Some(error);
            finish_catalog_task(state, task_id);
        }
    }
}

fn finish_catalog_task(state: &mut ConnectionState, task_id: UpdateId) {
    if let Some(mut task) = state.catalog_tasks_running.remove(&task_id) {
        task.finished_at = Some(Utc::now());
        state.catalog_tasks_finished.insert(task_id, task);
    }
}

/// Issues catalog refreshes through the executor and resolves them into
/// connection-level snapshots.
pub struct CatalogLoader {
    executor: Arc<QueryExecutor>,
    next_update_id: AtomicU64,
}

impl CatalogLoader {
    pub fn new(executor: Arc<QueryExecutor>) -> Self {
        Self {
            executor,
            next_update_id: AtomicU64::new(1),
        }
    }

    /// Starts a catalog refresh for the connection.
    ///
    /// The returned handle resolves once every query spawned by the task
    /// has reached a terminal state, whether or not the refresh succeeded.
    #[instrument(skip(self), fields(connection_id = %connection_id))]
    pub async fn refresh_catalog(
        &self,
        connection_id: ConnectionId,
    ) -> EngineResult<(UpdateId, JoinHandle<EngineResult<()>>)> {
        let connection = self.executor.registry().get(connection_id).await?;
        let update_id = UpdateId(self.next_update_id.fetch_add(1, Ordering::Relaxed));

        let task = CatalogUpdateTask::new(update_id);
        let task_cancel = task.cancellation.clone();
        connection
            .dispatch_catalog(CatalogAction::RegisterTask(task))
            .await;

        let args = QueryArgs {
            query: INFORMATION_SCHEMA_COLUMNS_QUERY.to_string(),
            metadata: QueryMetadata {
                title: Some("Collect table schemas".to_string()),
                issuer: Some("catalog update".to_string()),
                user_provided: false,
                ..Default::default()
            },
        };
        let (query_id, mut handle) = match self.executor.execute(connection_id, args).await {
            Ok(started) => started,
            Err(err) => {
                connection
                    .dispatch_catalog(CatalogAction::Failed(update_id, err.clone()))
                    .await;
                return Err(err);
            }
        };
        connection
            .dispatch_catalog(CatalogAction::RegisterQuery(update_id, query_id))
            .await;
        info!(%update_id, %query_id, "catalog refresh started");

        let executor = Arc::clone(&self.executor);
        let resolver = tokio::spawn(async move {
            // Route a task-level cancel to the spawned query, then keep
            // waiting for it to leave the running map.
            let joined = tokio::select! {
                biased;
                _ = task_cancel.cancelled() => {
                    let _ = executor.cancel(connection_id, query_id).await;
                    (&mut handle).await
                }
                joined = &mut handle => joined,
            };
            let outcome = match joined {
                Ok(result) => result,
                Err(join_err) => Err(EngineError::internal(format!(
                    "catalog query task panicked: {join_err}"
                ))),
            };

            match outcome {
                Ok(()) => {
                    let result = connection
                        .read(|state| {
                            state
                                .query(query_id)
                                .map(|q| (q.result_schema.clone(), q.result_batches.clone()))
                        })
                        .await;
                    let snapshot = match result {
                        Some((Some(schema), batches)) => {
                            CatalogSnapshot::from_query_result(&schema, &batches)
                        }
                        _ => CatalogSnapshot {
                            refreshed_at: Some(Utc::now()),
                            ..Default::default()
                        },
                    };
                    info!(%update_id, tables = snapshot.table_count(), "catalog refresh finished");
                    connection
                        .dispatch_catalog(CatalogAction::Succeeded(update_id, snapshot))
                        .await;
                    Ok(())
                }
                Err(err) if err.is_cancellation() => {
                    connection
                        .dispatch_catalog(CatalogAction::Cancelled(update_id, err.clone()))
                        .await;
                    Err(err)
                }
                Err(err) => {
                    warn!(%update_id, error = %err, "catalog refresh failed");
                    connection
                        .dispatch_catalog(CatalogAction::Failed(update_id, err.clone()))
                        .await;
                    Err(err)
                }
            }
        });
        Ok((update_id, resolver))
    }

    /// Requests cancellation of a running refresh and its spawned queries.
    pub async fn cancel_refresh(
        &self,
        connection_id: ConnectionId,
        update_id: UpdateId,
    ) -> EngineResult<()> {
        let connection = self.executor.registry().get(connection_id).await?;
        connection
            .read(|state| {
                if let Some(task) = state.catalog_tasks_running.get(&update_id) {
                    task.cancellation.cancel();
                    Ok(())
                } else if state.catalog_tasks_finished.contains_key(&update_id) {
                    Ok(())
                } else {
                    Err(EngineError::internal(format!(
                        "catalog update task not found: {update_id}"
                    )))
                }
            })
            .await
    }
}
