//! In-memory demo connector.
//!
//! Generates a fixed schema and a configurable number of synthetic batches
//! without touching the network. Used as the zero-infrastructure backend and
//! by engine tests that need a real connector without a bridge.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::{QueryConnector, ResultStream};
use crate::engine::types::{
    ColumnInfo, QueryProgress, QueryStatus, Row, RowBatch, Schema, StreamMetrics, Value,
};

#[derive(Debug, Clone)]
pub struct DemoConfig {
    pub batch_count: u64,
    pub rows_per_batch: u64,
    /// Simulated backend latency per batch.
    pub batch_delay: Option<Duration>,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            batch_count: 3,
            rows_per_batch: 16,
            batch_delay: None,
        }
    }
}

pub struct DemoConnector {
    config: DemoConfig,
}

impl DemoConnector {
    pub fn new(config: DemoConfig) -> Self {
        Self { config }
    }

    fn schema() -> Schema {
        Schema {
            columns: vec![
                ColumnInfo {
                    name: "id".to_string(),
                    data_type: "bigint".to_string(),
                    nullable: false,
                },
                ColumnInfo {
                    name: "label".to_string(),
                    data_type: "varchar".to_string(),
                    nullable: false,
                },
                ColumnInfo {
                    name: "score".to_string(),
                    data_type: "double".to_string(),
                    nullable: true,
                },
            ],
        }
    }
}

impl Default for DemoConnector {
    fn default() -> Self {
        Self::new(DemoConfig::default())
    }
}

#[async_trait]
impl QueryConnector for DemoConnector {
    fn connector_id(&self) -> &'static str {
        "demo"
    }

    fn connector_name(&self) -> &'static str {
        "In-Memory Demo"
    }

    async fn health_check(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn execute_query(
        &self,
        _query: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<Arc<dyn ResultStream>> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Ok(Arc::new(DemoResultStream::new(
            self.config.clone(),
            cancel.clone(),
        )))
    }
}

struct DemoState {
    next_batch: u64,
    status: QueryStatus,
    metrics: StreamMetrics,
}

struct DemoResultStream {
    config: DemoConfig,
    cancel: CancellationToken,
    state: Mutex<DemoState>,
    started: Instant,
}

impl DemoResultStream {
    fn new(config: DemoConfig, cancel: CancellationToken) -> Self {
        Self {
            config,
            cancel,
            state: Mutex::new(DemoState {
                next_batch: 0,
                status: QueryStatus::Started,
                metrics: StreamMetrics::default(),
            }),
            started: Instant::now(),
        }
    }

    fn generate_batch(&self, index: u64) -> RowBatch {
        let rows = (0..self.config.rows_per_batch)
            .map(|i| {
                let id = index * self.config.rows_per_batch + i;
                Row {
                    values: vec![
                        Value::Int(id as i64),
                        Value::Text(format!("row-{id}")),
                        Value::Float((id as f64).sin()),
                    ],
                }
            })
            .collect::<Vec<_>>();
        // Rough wire-size estimate for the synthetic rows.
        let data_bytes = rows.len() as u64 * 24;
        RowBatch { rows, data_bytes }
    }
}

#[async_trait]
impl ResultStream for DemoResultStream {
    async fn schema(&self) -> EngineResult<Option<Schema>> {
        Ok(Some(DemoConnector::schema()))
    }

    async fn next_record_batch(&self) -> EngineResult<Option<RowBatch>> {
        // Cancellation is honored between batches.
        if self.cancel.is_cancelled() {
            let mut state = self.state.lock();
            if !state.status.is_terminal() {
                state.status = QueryStatus::Cancelled;
            }
            return Err(EngineError::Cancelled);
        }
        let index = {
            let mut state = self.state.lock();
            if state.next_batch >= self.config.batch_count {
                if !state.status.is_terminal() {
                    state.status = QueryStatus::Succeeded;
                }
                return Ok(None);
            }
            state.next_batch
        };
        if let Some(delay) = self.config.batch_delay {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.state.lock().status = QueryStatus::Cancelled;
                    return Err(EngineError::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let batch = self.generate_batch(index);
        let mut state = self.state.lock();
        state.next_batch = index + 1;
        state.metrics.batches_received += 1;
        state.metrics.rows_received += batch.row_count();
        state.metrics.bytes_received += batch.data_bytes;
        if state.metrics.duration_until_first_batch_ms.is_none() {
            state.metrics.duration_until_first_batch_ms =
                Some(self.started.elapsed().as_millis() as u64);
            state.status = QueryStatus::ReceivedFirstResult;
        }
        Ok(Some(batch))
    }

    async fn next_progress_update(&self) -> EngineResult<Option<QueryProgress>> {
        Ok(None)
    }

    fn status(&self) -> QueryStatus {
        self.state.lock().status
    }

    fn metrics(&self) -> StreamMetrics {
        self.state.lock().metrics
    }

    fn metadata(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    async fn tear_down(&self) {
        let mut state = self.state.lock();
        state.next_batch = self.config.batch_count;
        if !state.status.is_terminal() {
            state.status = QueryStatus::Cancelled;
        }
    }
}
