//! Direct-tunnel database connector.
//!
//! Talks to a database service whose gRPC surface is reachable only through
//! the host-local bridge. One connector owns one bridge channel; every query
//! starts a fresh server stream on the execute RPC and hands the stream to a
//! `StreamingResultReader`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::connectors::wire::{self, AttachedDatabase, ExecuteQueryRequest};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::reader::StreamingResultReader;
use crate::engine::traits::{QueryConnector, ResultStream};
use crate::transport::{BridgeChannel, BridgeClient, BridgeHttp, ReadOptions, StreamArgs};

/// The server-streaming RPC carrying query execution.
pub const EXECUTE_QUERY_PATH: &str = "/bridgeql.v1.QueryService/ExecuteQuery";

/// Per-call context the connector must not cache.
///
/// Attachment changes made between two queries take effect on the next
/// query, so the list is recomputed on every call instead of being captured
/// at connector construction.
pub trait TunnelContextProvider: Send + Sync {
    fn attached_databases(&self) -> Vec<AttachedDatabase>;
}

/// A fixed attachment list, for setups without dynamic attachments.
pub struct StaticTunnelContext(pub Vec<AttachedDatabase>);

impl TunnelContextProvider for StaticTunnelContext {
    fn attached_databases(&self) -> Vec<AttachedDatabase> {
        self.0.clone()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TunnelConfig {
    pub tls_client_key_path: Option<String>,
    pub tls_client_cert_path: Option<String>,
    pub tls_cacerts_path: Option<String>,
    pub read_options: Option<ReadOptions>,
}

pub struct TunnelConnector {
    channel: BridgeChannel,
    context: Arc<dyn TunnelContextProvider>,
    config: TunnelConfig,
}

impl TunnelConnector {
    /// Opens the bridge channel for this connection. A failed channel
    /// creation is the earliest point a broken bridge setup surfaces.
    pub async fn connect(
        http: Arc<dyn BridgeHttp>,
        context: Arc<dyn TunnelContextProvider>,
        config: TunnelConfig,
    ) -> EngineResult<Self> {
        let channel = BridgeClient::new(http).connect_channel().await?;
        debug!(channel_id = channel.channel_id(), "tunnel connector ready");
        Ok(Self {
            channel,
            context,
            config,
        })
    }

    fn stream_args(&self, body: bytes::Bytes) -> StreamArgs {
        StreamArgs {
            path: EXECUTE_QUERY_PATH.to_string(),
            body,
            tls_client_key_path: self.config.tls_client_key_path.clone(),
            tls_client_cert_path: self.config.tls_client_cert_path.clone(),
            tls_cacerts_path: self.config.tls_cacerts_path.clone(),
            metadata: Vec::new(),
        }
    }
}

#[async_trait]
impl QueryConnector for TunnelConnector {
    fn connector_id(&self) -> &'static str {
        "tunnel"
    }

    fn connector_name(&self) -> &'static str {
        "Direct Tunnel"
    }

    async fn health_check(&self) -> EngineResult<()> {
        // The channel handshake during connect already proved the bridge
        // and the backing service are reachable.
        Ok(())
    }

    #[instrument(skip(self, query, cancel), fields(channel_id = self.channel.channel_id()))]
    async fn execute_query(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<Arc<dyn ResultStream>> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let request = ExecuteQueryRequest {
            query: query.to_string(),
            attached_databases: self.context.attached_databases(),
        };
        let body = wire::encode_request(&request)?;

        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            stream = self.channel.start_server_stream(self.stream_args(body)) => stream?,
        };
        let options = self.config.read_options.unwrap_or_default();
        Ok(Arc::new(StreamingResultReader::new(stream, options)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::wire::{decode_request, encode_result_message, ResultMessage};
    use crate::engine::types::{ColumnInfo, QueryStatus, Row, Schema, Value};
    use crate::transport::frame::encode_frames;
    use crate::transport::http::{HttpRequest, HttpResponse};
    use crate::transport::{TransportError, TransportResult};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    struct ScriptedHttp {
        responses: Mutex<VecDeque<TransportResult<HttpResponse>>>,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedHttp {
        fn new(responses: Vec<TransportResult<HttpResponse>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl crate::transport::BridgeHttp for ScriptedHttp {
        async fn send(&self, request: HttpRequest) -> TransportResult<HttpResponse> {
            self.requests.lock().push(request);
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::network("no scripted response left")))
        }
    }

    fn ok_response(headers: &[(&str, &str)], body: Bytes) -> TransportResult<HttpResponse> {
        Ok(HttpResponse {
            status: 200,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body,
        })
    }

    fn result_batch(event: &str, messages: Vec<Bytes>) -> TransportResult<HttpResponse> {
        ok_response(
            &[
                ("bridge-batch-event", event),
                ("bridge-batch-messages", &messages.len().to_string()),
            ],
            encode_frames(&messages),
        )
    }

    struct ChangingContext(Mutex<Vec<AttachedDatabase>>);

    impl TunnelContextProvider for ChangingContext {
        fn attached_databases(&self) -> Vec<AttachedDatabase> {
            self.0.lock().clone()
        }
    }

    #[tokio::test]
    async fn execute_streams_decoded_result_rows() {
        let schema = Schema {
            columns: vec![ColumnInfo {
                name: "n".to_string(),
                data_type: "bigint".to_string(),
                nullable: false,
            }],
        };
        let messages = vec![
            encode_result_message(&ResultMessage::Header(schema)).unwrap(),
            encode_result_message(&ResultMessage::Data(crate::engine::types::RowBatch {
                rows: vec![Row {
                    values: vec![Value::Int(42)],
                }],
                data_bytes: 0,
            }))
            .unwrap(),
        ];
        let http = ScriptedHttp::new(vec![
            ok_response(&[("bridge-channel-id", "5")], Bytes::new()),
            ok_response(&[("bridge-stream-id", "8")], Bytes::new()),
            result_batch("FlushAfterClose", messages),
        ]);

        let connector = TunnelConnector::connect(
            http.clone(),
            Arc::new(StaticTunnelContext(Vec::new())),
            TunnelConfig::default(),
        )
        .await
        .unwrap();

        let cancel = CancellationToken::new();
        let stream = connector.execute_query("SELECT 42", &cancel).await.unwrap();
        let schema = stream.schema().await.unwrap().unwrap();
        assert_eq!(schema.columns[0].name, "n");
        let batch = stream.next_record_batch().await.unwrap().unwrap();
        assert_eq!(batch.rows[0].values[0], Value::Int(42));
        assert!(stream.next_record_batch().await.unwrap().is_none());
        assert_eq!(stream.status(), QueryStatus::Succeeded);

        // The stream-start request carried the encoded execute request.
        let requests = http.requests.lock().clone();
        assert_eq!(requests[1].path, "/grpc/channel/5/streams");
        let decoded = decode_request(&requests[1].body).unwrap();
        assert_eq!(decoded.query, "SELECT 42");
    }

    #[tokio::test]
    async fn attachments_are_recomputed_per_call() {
        let http = ScriptedHttp::new(vec![
            ok_response(&[("bridge-channel-id", "1")], Bytes::new()),
            ok_response(&[("bridge-stream-id", "1")], Bytes::new()),
            result_batch("StreamFinished", vec![]),
            ok_response(&[("bridge-stream-id", "2")], Bytes::new()),
            result_batch("StreamFinished", vec![]),
        ]);
        let context = Arc::new(ChangingContext(Mutex::new(Vec::new())));
        let connector = TunnelConnector::connect(
            http.clone(),
            context.clone(),
            TunnelConfig::default(),
        )
        .await
        .unwrap();

        let cancel = CancellationToken::new();
        let first = connector.execute_query("SELECT 1", &cancel).await.unwrap();
        assert!(first.schema().await.unwrap().is_none());

        // Attach a database between queries; the next call must see it.
        context.0.lock().push(AttachedDatabase {
            path: "s3://bucket/extra.db".to_string(),
            alias: Some("extra".to_string()),
        });
        let second = connector.execute_query("SELECT 2", &cancel).await.unwrap();
        assert!(second.schema().await.unwrap().is_none());

        let requests = http.requests.lock().clone();
        let first_req = decode_request(&requests[1].body).unwrap();
        let second_req = decode_request(&requests[3].body).unwrap();
        assert!(first_req.attached_databases.is_empty());
        assert_eq!(second_req.attached_databases.len(), 1);
        assert_eq!(second_req.attached_databases[0].alias.as_deref(), Some("extra"));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits_execute() {
        let http = ScriptedHttp::new(vec![ok_response(
            &[("bridge-channel-id", "1")],
            Bytes::new(),
        )]);
        let connector = TunnelConnector::connect(
            http.clone(),
            Arc::new(StaticTunnelContext(Vec::new())),
            TunnelConfig::default(),
        )
        .await
        .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = connector.execute_query("SELECT 1", &cancel).await.unwrap_err();
        assert!(err.is_cancellation());
        // No stream-start request was issued.
        assert_eq!(http.requests.lock().len(), 1);
    }

    #[tokio::test]
    async fn transport_failure_maps_into_engine_error() {
        let http = ScriptedHttp::new(vec![
            ok_response(&[("bridge-channel-id", "1")], Bytes::new()),
            Ok(HttpResponse {
                status: 404,
                headers: Default::default(),
                body: Bytes::from_static(b"unknown rpc"),
            }),
        ]);
        let connector = TunnelConnector::connect(
            http,
            Arc::new(StaticTunnelContext(Vec::new())),
            TunnelConfig::default(),
        )
        .await
        .unwrap();

        let cancel = CancellationToken::new();
        let err = connector.execute_query("SELECT 1", &cancel).await.unwrap_err();
        match err {
            EngineError::Transport(t) => {
                assert_eq!(t.status, 404);
                assert!(!t.is_retryable());
            }
            other => panic!("expected transport error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_args_carry_tls_references() {
        let http = ScriptedHttp::new(vec![
            ok_response(&[("bridge-channel-id", "1")], Bytes::new()),
            ok_response(&[("bridge-stream-id", "1")], Bytes::new()),
            result_batch("StreamFinished", vec![]),
        ]);
        let connector = TunnelConnector::connect(
            http.clone(),
            Arc::new(StaticTunnelContext(Vec::new())),
            TunnelConfig {
                tls_cacerts_path: Some("/certs/ca.pem".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let cancel = CancellationToken::new();
        let stream = connector.execute_query("SELECT 1", &cancel).await.unwrap();
        assert!(stream.schema().await.unwrap().is_none());

        let requests = http.requests.lock().clone();
        assert!(requests[1]
            .headers
            .contains(&("bridge-tls-cacerts".to_string(), "/certs/ca.pem".to_string())));
        assert!(requests[1]
            .headers
            .iter()
            .any(|(name, _)| name == "bridge-path"));
    }

    #[tokio::test]
    async fn health_check_is_cheap_after_connect() {
        let http = ScriptedHttp::new(vec![ok_response(
            &[("bridge-channel-id", "1")],
            Bytes::new(),
        )]);
        let connector = TunnelConnector::connect(
            http.clone(),
            Arc::new(StaticTunnelContext(Vec::new())),
            TunnelConfig::default(),
        )
        .await
        .unwrap();
        connector.health_check().await.unwrap();
        assert_eq!(http.requests.lock().len(), 1);
    }
}
