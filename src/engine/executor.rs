//! Query executor: the per-query state machine driver.
//!
//! The executor allocates query ids, dispatches to the connection's
//! connector, and drives `Accepted → Started → ReceivedFirstResult →
//! {Succeeded | Failed | Cancelled}`. `Accepted` is registered synchronously
//! before any network call so that a cancel issued immediately after
//! submission is never lost; the id is observable before I/O begins.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::registry::{Connection, ConnectionRegistry};
use crate::engine::state::{QueryAction, QueryExecution};
use crate::engine::traits::ResultStream;
use crate::engine::types::{ConnectionHealth, ConnectionId, QueryArgs, QueryId};

/// Executes queries against registered connections.
pub struct QueryExecutor {
    registry: Arc<ConnectionRegistry>,
    next_query_id: AtomicU64,
}

impl QueryExecutor {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            next_query_id: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Submits a query.
    ///
    /// Returns the allocated query id together with the completion handle.
    /// The id is registered in the connection's running map before this
    /// function returns; the returned handle resolves only after the query
    /// reached its terminal state and was folded into the connection
    /// metrics. Ids are never reused; a retry allocates a new id.
    #[instrument(skip(self, args), fields(connection_id = %connection_id))]
    pub async fn execute(
        &self,
        connection_id: ConnectionId,
        args: QueryArgs,
    ) -> EngineResult<(QueryId, JoinHandle<EngineResult<()>>)> {
        let connection = self.registry.get(connection_id).await?;
        let query_id = QueryId(self.next_query_id.fetch_add(1, Ordering::Relaxed));

        let execution = QueryExecution::new(query_id, args.metadata.clone());
        let cancel = execution.cancellation.clone();
        connection
            .dispatch_query(QueryAction::Register(Box::new(execution)))
            .await;
        info!(%query_id, user_provided = args.metadata.user_provided, "query accepted");

        let handle = tokio::spawn(run_query(connection, query_id, args.query, cancel));
        Ok((query_id, handle))
    }

    /// Requests cooperative cancellation of a running query.
    ///
    /// Cancelling an already finished query is a no-op; cancelling an
    /// unknown query id is an error.
    #[instrument(skip(self), fields(connection_id = %connection_id, query_id = %query_id))]
    pub async fn cancel(&self, connection_id: ConnectionId, query_id: QueryId) -> EngineResult<()> {
        let connection = self.registry.get(connection_id).await?;
        connection
            .read(|state| {
                if let Some(query) = state.queries_running.get(&query_id) {
                    query.cancellation.cancel();
                    Ok(())
                } else if state.queries_finished.contains_key(&query_id) {
                    Ok(())
                } else {
                    Err(EngineError::query_not_found(query_id.0))
                }
            })
            .await
    }
}

/// Drives one query from dispatch to its terminal state.
///
/// The cancellation token is checked at every suspension point. After the
/// stream is up, schema/batch consumption and progress consumption run as
/// two concurrently awaited loops over the same reader; both must complete
/// before the query is declared succeeded.
async fn run_query(
    connection: Arc<Connection>,
    query_id: QueryId,
    query_text: String,
    cancel: CancellationToken,
) -> EngineResult<()> {
    let mut stream: Option<Arc<dyn ResultStream>> = None;
    let outcome = drive_query(&connection, query_id, &query_text, &cancel, &mut stream).await;

    match outcome {
        Ok(()) => {
            // The stream is present whenever drive_query succeeded.
            let (metadata, metrics) = stream
                .as_ref()
                .map(|s| (s.metadata(), s.metrics()))
                .unwrap_or_default();
            connection
                .dispatch_query(QueryAction::Succeeded(query_id, metadata, metrics))
                .await;
            Ok(())
        }
        Err(err) => {
            // Actively release host-side stream state; abandoning the
            // reader would leave the bridge holding the stream until its
            // own timeout.
            if let Some(stream) = &stream {
                stream.tear_down().await;
            }
            let metrics = stream.as_ref().map(|s| s.metrics());
            if err.is_cancellation() {
                connection
                    .dispatch_query(QueryAction::Cancelled(query_id, err.clone(), metrics))
                    .await;
            } else {
                if matches!(err, EngineError::AuthenticationFailed { .. }) {
                    connection.set_health(ConnectionHealth::Failed).await;
                }
                connection
                    .dispatch_query(QueryAction::Failed(query_id, err.clone(), metrics))
                    .await;
            }
            Err(err)
        }
    }
}

async fn drive_query(
    connection: &Arc<Connection>,
    query_id: QueryId,
    query_text: &str,
    cancel: &CancellationToken,
    stream_slot: &mut Option<Arc<dyn ResultStream>>,
) -> EngineResult<()> {
    // A cancel that arrived before any work wins deterministically.
    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }

    let connector = Arc::clone(connection.connector());
    let stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        result = connector.execute_query(query_text, cancel) => result?,
    };
    *stream_slot = Some(Arc::clone(&stream));
    connection.dispatch_query(QueryAction::Started(query_id)).await;

    let batches = read_all_batches(connection, query_id, &stream, cancel);
    let progress = read_all_progress(connection, query_id, &stream, cancel);
    futures::try_join!(batches, progress)?;
    Ok(())
}

/// Consumes the schema and every record batch, dispatching each into the
/// connection state.
async fn read_all_batches(
    connection: &Arc<Connection>,
    query_id: QueryId,
    stream: &Arc<dyn ResultStream>,
    cancel: &CancellationToken,
) -> EngineResult<()> {
    let schema = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        schema = stream.schema() => schema?,
    };
    let Some(schema) = schema else {
        // Stream ended before a schema arrived; nothing to consume.
        return Ok(());
    };
    connection
        .dispatch_query(QueryAction::ReceivedSchema(query_id, schema))
        .await;

    loop {
        let batch = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            batch = stream.next_record_batch() => batch?,
        };
        let Some(batch) = batch else {
            return Ok(());
        };
        connection
            .dispatch_query(QueryAction::ReceivedBatch(query_id, batch, stream.metrics()))
            .await;
    }
}

/// Consumes every progress update until the stream ends.
async fn read_all_progress(
    connection: &Arc<Connection>,
    query_id: QueryId,
    stream: &Arc<dyn ResultStream>,
    cancel: &CancellationToken,
) -> EngineResult<()> {
    loop {
        let update = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            update = stream.next_progress_update() => update?,
        };
        let Some(update) = update else {
            return Ok(());
        };
        connection
            .dispatch_query(QueryAction::ProgressUpdated(query_id, update))
            .await;
    }
}
