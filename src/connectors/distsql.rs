//! Distributed SQL engine connector.
//!
//! This backend speaks a native REST protocol and bypasses the bridge
//! entirely, while still fulfilling the same `ResultStream` contract the
//! engine consumes. A statement POST returns the first page; the stream then
//! polls `nextUri` until the server stops handing one out. Columns translate
//! to a `Schema`, data pages to `RowBatch`es, stats to `QueryProgress`, and
//! an error object in any page fails the query.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::{QueryConnector, ResultStream};
use crate::engine::types::{
    ColumnInfo, QueryProgress, QueryStatus, Row, RowBatch, Schema, StreamMetrics, Value,
};

/// One page of a statement's result, as returned by the REST protocol.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementPage {
    pub id: String,
    pub next_uri: Option<String>,
    pub columns: Option<Vec<StatementColumn>>,
    pub data: Option<Vec<Vec<serde_json::Value>>>,
    pub stats: Option<StatementStats>,
    pub error: Option<StatementError>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementStats {
    #[serde(default)]
    pub queued: bool,
    pub state: Option<String>,
    pub processed_rows: Option<u64>,
    pub processed_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementError {
    pub message: String,
    pub error_code: Option<i64>,
    pub error_name: Option<String>,
}

/// The statement protocol seam; production uses reqwest, tests script pages.
#[async_trait]
pub trait StatementApi: Send + Sync {
    async fn post_statement(&self, query: &str) -> EngineResult<StatementPage>;
    async fn next_page(&self, next_uri: &str) -> EngineResult<StatementPage>;
    /// Best-effort cancel: DELETE on the statement's next uri.
    async fn cancel_statement(&self, next_uri: &str) -> EngineResult<()>;
}

#[derive(Debug, Clone)]
pub struct DistSqlConfig {
    pub endpoint: Url,
    pub user: String,
    pub catalog: Option<String>,
    pub schema: Option<String>,
}

/// REST client for the statement protocol.
pub struct ReqwestStatementApi {
    config: DistSqlConfig,
    client: reqwest::Client,
}

impl ReqwestStatementApi {
    pub fn new(config: DistSqlConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn statement_url(&self) -> EngineResult<Url> {
        self.config
            .endpoint
            .join("/v1/statement")
            .map_err(|e| EngineError::internal(format!("invalid statement endpoint: {e}")))
    }

    async fn decode(response: reqwest::Response) -> EngineResult<StatementPage> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::execution_error(format!(
                "statement request failed with {status}: {body}"
            )));
        }
        response
            .json::<StatementPage>()
            .await
            .map_err(|e| EngineError::execution_error(format!("malformed statement page: {e}")))
    }
}

#[async_trait]
impl StatementApi for ReqwestStatementApi {
    async fn post_statement(&self, query: &str) -> EngineResult<StatementPage> {
        let mut request = self
            .client
            .post(self.statement_url()?)
            .header("x-statement-user", &self.config.user)
            .body(query.to_string());
        if let Some(catalog) = &self.config.catalog {
            request = request.header("x-statement-catalog", catalog);
        }
        if let Some(schema) = &self.config.schema {
            request = request.header("x-statement-schema", schema);
        }
        let response = request
            .send()
            .await
            .map_err(|e| EngineError::execution_error(format!("statement post failed: {e}")))?;
        Self::decode(response).await
    }

    async fn next_page(&self, next_uri: &str) -> EngineResult<StatementPage> {
        let response = self
            .client
            .get(next_uri)
            .header("x-statement-user", &self.config.user)
            .send()
            .await
            .map_err(|e| EngineError::execution_error(format!("statement poll failed: {e}")))?;
        Self::decode(response).await
    }

    async fn cancel_statement(&self, next_uri: &str) -> EngineResult<()> {
        self.client
            .delete(next_uri)
            .header("x-statement-user", &self.config.user)
            .send()
            .await
            .map_err(|e| EngineError::execution_error(format!("statement cancel failed: {e}")))?;
        Ok(())
    }
}

pub struct DistSqlConnector {
    api: Arc<dyn StatementApi>,
}

impl DistSqlConnector {
    pub fn new(api: Arc<dyn StatementApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl QueryConnector for DistSqlConnector {
    fn connector_id(&self) -> &'static str {
        "distsql"
    }

    fn connector_name(&self) -> &'static str {
        "Distributed SQL"
    }

    async fn health_check(&self) -> EngineResult<()> {
        let page = self.api.post_statement("SELECT 1").await?;
        if let Some(error) = page.error {
            return Err(EngineError::execution_error(error.message));
        }
        // Do not leave the probe statement running server-side.
        if let Some(next_uri) = page.next_uri {
            let _ = self.api.cancel_statement(&next_uri).await;
        }
        Ok(())
    }

    #[instrument(skip(self, query, cancel))]
    async fn execute_query(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<Arc<dyn ResultStream>> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let first = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            page = self.api.post_statement(query) => page?,
        };
        debug!(statement_id = %first.id, "statement accepted");
        Ok(Arc::new(StatementResultStream::new(
            Arc::clone(&self.api),
            first,
        )))
    }
}

struct PageState {
    /// The page returned by the statement POST, not yet folded in.
    pending: Option<StatementPage>,
    next_uri: Option<String>,
    schema: Option<Schema>,
    data: VecDeque<RowBatch>,
    progress: VecDeque<QueryProgress>,
    done: bool,
}

struct Observed {
    status: QueryStatus,
    metrics: StreamMetrics,
}

/// Adapts the page-polling protocol to the engine's streaming contract.
pub struct StatementResultStream {
    api: Arc<dyn StatementApi>,
    statement_id: String,
    inner: tokio::sync::Mutex<PageState>,
    observed: parking_lot::Mutex<Observed>,
    started: Instant,
}

impl StatementResultStream {
    fn new(api: Arc<dyn StatementApi>, first: StatementPage) -> Self {
        let statement_id = first.id.clone();
        Self {
            api,
            statement_id,
            inner: tokio::sync::Mutex::new(PageState {
                pending: Some(first),
                next_uri: None,
                schema: None,
                data: VecDeque::new(),
                progress: VecDeque::new(),
                done: false,
            }),
            observed: parking_lot::Mutex::new(Observed {
                status: QueryStatus::Started,
                metrics: StreamMetrics::default(),
            }),
            started: Instant::now(),
        }
    }

    fn ingest_page(&self, inner: &mut PageState, page: StatementPage) -> EngineResult<()> {
        if let Some(error) = page.error {
            inner.done = true;
            self.observed.lock().status = QueryStatus::Failed;
            return Err(EngineError::execution_error(format!(
                "{}{}",
                error
                    .error_name
                    .map(|n| format!("{n}: "))
                    .unwrap_or_default(),
                error.message
            )));
        }

        if inner.schema.is_none() {
            if let Some(columns) = page.columns {
                inner.schema = Some(Schema {
                    columns: columns
                        .into_iter()
                        .map(|c| ColumnInfo {
                            name: c.name,
                            data_type: c.type_name,
                            nullable: true,
                        })
                        .collect(),
                });
            }
        }

        if let Some(stats) = page.stats {
            inner.progress.push_back(QueryProgress {
                is_queued: Some(stats.queued),
                state: stats.state,
                rows_scanned: stats.processed_rows,
                bytes_scanned: stats.processed_bytes,
            });
        }

        if let Some(data) = page.data {
            if !data.is_empty() {
                let data_bytes = serde_json::to_vec(&data)
                    .map(|encoded| encoded.len() as u64)
                    .unwrap_or(0);
                let batch = RowBatch {
                    rows: data
                        .into_iter()
                        .map(|values| Row {
                            values: values.into_iter().map(json_to_value).collect(),
                        })
                        .collect(),
                    data_bytes,
                };
                let mut observed = self.observed.lock();
                observed.metrics.batches_received += 1;
                observed.metrics.rows_received += batch.row_count();
                observed.metrics.bytes_received += batch.data_bytes;
                if observed.metrics.duration_until_first_batch_ms.is_none() {
                    observed.metrics.duration_until_first_batch_ms =
                        Some(self.started.elapsed().as_millis() as u64);
                    observed.status = QueryStatus::ReceivedFirstResult;
                }
                drop(observed);
                inner.data.push_back(batch);
            }
        }

        match page.next_uri {
            Some(uri) => inner.next_uri = Some(uri),
            None => {
                inner.next_uri = None;
                inner.done = true;
                let mut observed = self.observed.lock();
                if !observed.status.is_terminal() {
                    observed.status = QueryStatus::Succeeded;
                }
            }
        }
        Ok(())
    }

    async fn pump(&self, inner: &mut PageState) -> EngineResult<bool> {
        if inner.done {
            return Ok(false);
        }
        // The statement POST's page is folded in before any polling.
        if let Some(first) = inner.pending.take() {
            self.ingest_page(inner, first)?;
            return Ok(!inner.done);
        }
        let Some(next_uri) = inner.next_uri.clone() else {
            inner.done = true;
            return Ok(false);
        };
        let page = match self.api.next_page(&next_uri).await {
            Ok(page) => page,
            Err(err) => {
                inner.done = true;
                self.observed.lock().status = QueryStatus::Failed;
                return Err(err);
            }
        };
        self.ingest_page(inner, page)?;
        Ok(!inner.done)
    }
}

fn json_to_value(value: serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::Text(s),
        other => Value::Text(other.to_string()),
    }
}

#[async_trait]
impl ResultStream for StatementResultStream {
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
        HashMap::from([("statement-id".to_string(), self.statement_id.clone())])
    }

    async fn tear_down(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.done {
            inner.done = true;
            let next_uri = inner
                .next_uri
                .take()
                .or_else(|| inner.pending.take().and_then(|p| p.next_uri));
            if let Some(next_uri) = next_uri {
                if let Err(err) = self.api.cancel_statement(&next_uri).await {
                    warn!(statement_id = %self.statement_id, error = %err, "failed to cancel statement");
                }
            }
        }
        let mut observed = self.observed.lock();
        if !observed.status.is_terminal() {
            observed.status = QueryStatus::Cancelled;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct ScriptedApi {
        pages: Mutex<VecDeque<EngineResult<StatementPage>>>,
        cancels: Mutex<Vec<String>>,
    }

    impl ScriptedApi {
        fn new(pages: Vec<EngineResult<StatementPage>>) -> Arc<Self> {
            Arc::new(Self {
                pages: Mutex::new(pages.into()),
                cancels: Mutex::new(Vec::new()),
            })
        }

        fn pop(&self) -> EngineResult<StatementPage> {
            self.pages
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(EngineError::internal("no scripted page left")))
        }
    }

    #[async_trait]
    impl StatementApi for ScriptedApi {
        async fn post_statement(&self, _query: &str) -> EngineResult<StatementPage> {
            self.pop()
        }

        async fn next_page(&self, _next_uri: &str) -> EngineResult<StatementPage> {
            self.pop()
        }

        async fn cancel_statement(&self, next_uri: &str) -> EngineResult<()> {
            self.cancels.lock().push(next_uri.to_string());
            Ok(())
        }
    }

    fn page(next_uri: Option<&str>) -> StatementPage {
        StatementPage {
            id: "stmt-1".to_string(),
            next_uri: next_uri.map(str::to_string),
            ..Default::default()
        }
    }

    fn columns() -> Vec<StatementColumn> {
        vec![
            StatementColumn {
                name: "name".to_string(),
                type_name: "varchar".to_string(),
            },
            StatementColumn {
                name: "n".to_string(),
                type_name: "bigint".to_string(),
            },
        ]
    }

    #[tokio::test]
    async fn polls_next_uri_until_absent() {
        let api = ScriptedApi::new(vec![
            Ok(StatementPage {
                columns: Some(columns()),
                stats: Some(StatementStats {
                    queued: true,
                    state: Some("QUEUED".to_string()),
                    ..Default::default()
                }),
                ..page(Some("http://coord/v1/statement/stmt-1/1"))
            }),
            Ok(StatementPage {
                data: Some(vec![
                    vec![serde_json::json!("a"), serde_json::json!(1)],
                    vec![serde_json::json!("b"), serde_json::json!(2)],
                ]),
                ..page(Some("http://coord/v1/statement/stmt-1/2"))
            }),
            Ok(StatementPage {
                data: Some(vec![vec![serde_json::json!("c"), serde_json::json!(3)]]),
                ..page(None)
            }),
        ]);
        let connector = DistSqlConnector::new(api.clone());
        let cancel = CancellationToken::new();
        let stream = connector
            .execute_query("SELECT name, n FROM t", &cancel)
            .await
            .unwrap();

        let schema = stream.schema().await.unwrap().unwrap();
        assert_eq!(schema.columns.len(), 2);
        assert_eq!(schema.columns[1].data_type, "bigint");

        let b1 = stream.next_record_batch().await.unwrap().unwrap();
        assert_eq!(b1.rows.len(), 2);
        assert_eq!(b1.rows[0].values[0], Value::Text("a".to_string()));
        assert_eq!(b1.rows[1].values[1], Value::Int(2));
        let b2 = stream.next_record_batch().await.unwrap().unwrap();
        assert_eq!(b2.rows.len(), 1);
        assert!(stream.next_record_batch().await.unwrap().is_none());
        assert_eq!(stream.status(), QueryStatus::Succeeded);

        let progress = stream.next_progress_update().await.unwrap().unwrap();
        assert_eq!(progress.is_queued, Some(true));
        assert_eq!(progress.state.as_deref(), Some("QUEUED"));

        let metrics = stream.metrics();
        assert_eq!(metrics.batches_received, 2);
        assert_eq!(metrics.rows_received, 3);
    }

    #[tokio::test]
    async fn error_page_fails_the_stream() {
        let api = ScriptedApi::new(vec![
            Ok(StatementPage {
                columns: Some(columns()),
                ..page(Some("http://coord/next"))
            }),
            Ok(StatementPage {
                error: Some(StatementError {
                    message: "line 1: table 't' does not exist".to_string(),
                    error_code: Some(46),
                    error_name: Some("TABLE_NOT_FOUND".to_string()),
                }),
                ..page(None)
            }),
        ]);
        let connector = DistSqlConnector::new(api);
        let cancel = CancellationToken::new();
        let stream = connector.execute_query("SELECT 1", &cancel).await.unwrap();

        let err = stream.next_record_batch().await.unwrap_err();
        match err {
            EngineError::ExecutionError { message } => {
                assert!(message.contains("TABLE_NOT_FOUND"));
                assert!(message.contains("does not exist"));
            }
            other => panic!("expected execution error, got {other:?}"),
        }
        assert_eq!(stream.status(), QueryStatus::Failed);
    }

    #[tokio::test]
    async fn tear_down_cancels_the_statement() {
        let api = ScriptedApi::new(vec![Ok(StatementPage {
            columns: Some(columns()),
            ..page(Some("http://coord/next"))
        })]);
        let connector = DistSqlConnector::new(api.clone());
        let cancel = CancellationToken::new();
        let stream = connector.execute_query("SELECT 1", &cancel).await.unwrap();

        stream.tear_down().await;
        assert_eq!(stream.status(), QueryStatus::Cancelled);
        assert_eq!(api.cancels.lock().as_slice(), ["http://coord/next"]);
        assert!(stream.next_record_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn null_and_float_values_translate() {
        let api = ScriptedApi::new(vec![Ok(StatementPage {
            columns: Some(columns()),
            data: Some(vec![vec![serde_json::json!(null), serde_json::json!(1.5)]]),
            ..page(None)
        })]);
        let connector = DistSqlConnector::new(api);
        let cancel = CancellationToken::new();
        let stream = connector.execute_query("SELECT 1", &cancel).await.unwrap();
        let batch = stream.next_record_batch().await.unwrap().unwrap();
        assert_eq!(batch.rows[0].values[0], Value::Null);
        assert_eq!(batch.rows[0].values[1], Value::Float(1.5));
    }

    #[tokio::test]
    async fn health_check_cancels_its_probe() {
        let api = ScriptedApi::new(vec![Ok(page(Some("http://coord/probe")))]);
        let connector = DistSqlConnector::new(api.clone());
        connector.health_check().await.unwrap();
        assert_eq!(api.cancels.lock().len(), 1);
    }
}
