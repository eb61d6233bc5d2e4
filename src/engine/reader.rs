//! Streaming result reader over one bridge stream.
//!
//! The reader demultiplexes a single physical message sequence into a schema
//! event, data batches and progress updates. Schema/batch consumption and
//! progress consumption are two logical cursors that both pull from the one
//! stream under an async mutex; messages are routed by envelope tag into
//! per-category buffers, so order within a category always matches arrival
//! order while interleaving across categories is unspecified.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;

use crate::connectors::wire::{self, ResultMessage};
use crate::engine::error::EngineResult;
use crate::engine::traits::ResultStream;
use crate::engine::types::{QueryProgress, QueryStatus, RowBatch, Schema, StreamMetrics};
use crate::transport::{BridgeStream, ReadOptions};

/// What the reader has observed so far, readable without awaiting.
#[derive(Debug, Clone)]
struct Observed {
    status: QueryStatus,
    metrics: StreamMetrics,
    metadata: HashMap<String, String>,
}

struct ReaderInner {
    stream: BridgeStream,
    options: ReadOptions,
    schema: Option<Schema>,
    data: VecDeque<RowBatch>,
    progress: VecDeque<QueryProgress>,
    /// Set once a terminal batch event was consumed or the stream failed.
    done: bool,
}

/// Wraps a `BridgeStream` into the connector-agnostic `ResultStream`
/// contract. Exactly one reader owns the underlying stream.
pub struct StreamingResultReader {
    inner: tokio::sync::Mutex<ReaderInner>,
    observed: parking_lot::Mutex<Observed>,
    started: Instant,
}

impl StreamingResultReader {
    pub fn new(stream: BridgeStream, options: ReadOptions) -> Self {
        Self {
            inner: tokio::sync::Mutex::new(ReaderInner {
                stream,
                options,
                schema: None,
                data: VecDeque::new(),
                progress: VecDeque::new(),
                done: false,
            }),
            observed: parking_lot::Mutex::new(Observed {
                status: QueryStatus::Started,
                metrics: StreamMetrics::default(),
                metadata: HashMap::new(),
            }),
            started: Instant::now(),
        }
    }

    /// Pulls one physical batch and routes its messages. Returns `false`
    /// once the stream has ended.
    async fn pump(&self, inner: &mut ReaderInner) -> EngineResult<bool> {
        if inner.done {
            return Ok(false);
        }
        let batch = match inner.stream.next_batch(&inner.options).await {
            Ok(Some(batch)) => batch,
            Ok(None) => {
                inner.done = true;
                self.finish_observed();
                return Ok(false);
            }
            Err(err) => {
                inner.done = true;
                self.observed.lock().status = QueryStatus::Failed;
                return Err(err.into());
            }
        };

        for message in &batch.messages {
            match wire::decode_result_message(message) {
                Ok(ResultMessage::Header(schema)) => {
                    // First header wins; the backend must not send another.
                    if inner.schema.is_none() {
                        inner.schema = Some(schema);
                    }
                }
                Ok(ResultMessage::Progress(progress)) => {
                    inner.progress.push_back(progress);
                }
                Ok(ResultMessage::Data(mut data)) => {
                    data.data_bytes = message.len() as u64;
                    let mut observed = self.observed.lock();
                    observed.metrics.batches_received += 1;
                    observed.metrics.rows_received += data.row_count();
                    observed.metrics.bytes_received += data.data_bytes;
                    if observed.metrics.duration_until_first_batch_ms.is_none() {
                        observed.metrics.duration_until_first_batch_ms =
                            Some(self.started.elapsed().as_millis() as u64);
                        observed.status = QueryStatus::ReceivedFirstResult;
                    }
                    drop(observed);
                    inner.data.push_back(data);
                }
                Err(err) => {
                    inner.done = true;
                    self.observed.lock().status = QueryStatus::Failed;
                    return Err(err);
                }
            }
        }

        if !batch.trailers.is_empty() {
            self.observed.lock().metadata.extend(batch.trailers.clone());
        }
        if batch.event.is_terminal() {
            inner.done = true;
            self.finish_observed();
            debug!(
                batches = self.observed.lock().metrics.batches_received,
                "result stream finished"
            );
            return Ok(false);
        }
        Ok(true)
    }

    fn finish_observed(&self) {
        let mut observed = self.observed.lock();
        if !observed.status.is_terminal() {
            observed.status = QueryStatus::Succeeded;
        }
    }
}

#[async_trait]
impl ResultStream for StreamingResultReader {
    async fn schema(&self) -> EngineResult<Option<Schema>> {
        let mut inner = self.inner.lock().await;
        loop {
            if let Some(schema) = &inner.schema {
                return Ok(Some(schema.clone()));
            }
            if inner.done {
                return Ok(None);
            }
            self.pump(&mut inner).await?;
        }
    }

    async fn next_record_batch(&self) -> EngineResult<Option<RowBatch>> {
        let mut inner = self.inner.lock().await;
        loop {
            if let Some(batch) = inner.data.pop_front() {
                return Ok(Some(batch));
            }
            if inner.done {
                return Ok(None);
            }
            self.pump(&mut inner).await?;
        }
    }

    async fn next_progress_update(&self) -> EngineResult<Option<QueryProgress>> {
        let mut inner = self.inner.lock().await;
        loop {
            if let Some(progress) = inner.progress.pop_front() {
                return Ok(Some(progress));
            }
            if inner.done {
                return Ok(None);
            }
            self.pump(&mut inner).await?;
        }
    }

    fn status(&self) -> QueryStatus {
        self.observed.lock().status
    }

    fn metrics(&self) -> StreamMetrics {
        self.observed.lock().metrics
    }

    fn metadata(&self) -> HashMap<String, String> {
        self.observed.lock().metadata.clone()
    }

    async fn tear_down(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.done {
            inner.done = true;
            inner.stream.drop_stream().await;
        }
        let mut observed = self.observed.lock();
        if !observed.status.is_terminal() {
            observed.status = QueryStatus::Cancelled;
        }
    }
}
