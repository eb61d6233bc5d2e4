//! Bridge client: channels, server streams and batched reads.
//!
//! The host process multiplexes gRPC-style calls over four HTTP routes:
//!
//! | Call           | Method | Path                                          |
//! |----------------|--------|-----------------------------------------------|
//! | Create channel | POST   | `/grpc/channels`                              |
//! | Start stream   | POST   | `/grpc/channel/{channelId}/streams`           |
//! | Read batch     | GET    | `/grpc/channels/{channelId}/stream/{streamId}`|
//! | Drop stream    | DELETE | `/grpc/channels/{channelId}/stream/{streamId}`|
//!
//! Stream ids are only meaningful together with their channel id; the bridge
//! holds server-side state per `(channelId, streamId)` until the stream is
//! dropped or times out on its own.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::transport::error::{TransportError, TransportResult};
use crate::transport::frame::decode_frames;
use crate::transport::http::{BridgeHttp, HttpMethod, HttpRequest};

pub const HEADER_CHANNEL_ID: &str = "bridge-channel-id";
pub const HEADER_STREAM_ID: &str = "bridge-stream-id";
pub const HEADER_PATH: &str = "bridge-path";
pub const HEADER_READ_TIMEOUT: &str = "bridge-read-timeout";
pub const HEADER_BATCH_TIMEOUT: &str = "bridge-batch-timeout";
pub const HEADER_BATCH_BYTES: &str = "bridge-batch-bytes";
pub const HEADER_BATCH_EVENT: &str = "bridge-batch-event";
pub const HEADER_BATCH_MESSAGES: &str = "bridge-batch-messages";
pub const HEADER_TLS_CLIENT_KEY: &str = "bridge-tls-client-key";
pub const HEADER_TLS_CLIENT_CERT: &str = "bridge-tls-client-cert";
pub const HEADER_TLS_CACERTS: &str = "bridge-tls-cacerts";

const TRAILER_PREFIX: &str = "bridge-trailer-";

const DEFAULT_READ_TIMEOUT_MS: u64 = 1000;
const DEFAULT_BATCH_TIMEOUT_MS: u64 = 100;
const DEFAULT_BATCH_BYTES: u64 = 8_000_000;

/// The flush policy outcome reported with every batch read.
///
/// The bridge emits the accumulated batch as soon as the server stream closes
/// (`FlushAfterClose`), else when the batching window elapses
/// (`FlushAfterTimeout`), else when the byte budget is exceeded
/// (`FlushAfterBytes`). If the timeout and the byte budget would fire in the
/// same instant, bytes takes precedence; both are plain flushes, so the
/// tie-break is not observable by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamBatchEvent {
    FlushAfterClose,
    FlushAfterTimeout,
    FlushAfterBytes,
    StreamFinished,
    StreamFailed,
}

impl StreamBatchEvent {
    /// Terminal events permit no further reads.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamBatchEvent::FlushAfterClose
                | StreamBatchEvent::StreamFinished
                | StreamBatchEvent::StreamFailed
        )
    }
}

impl FromStr for StreamBatchEvent {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FlushAfterClose" => Ok(Self::FlushAfterClose),
            "FlushAfterTimeout" => Ok(Self::FlushAfterTimeout),
            "FlushAfterBytes" => Ok(Self::FlushAfterBytes),
            "StreamFinished" => Ok(Self::StreamFinished),
            "StreamFailed" => Ok(Self::StreamFailed),
            other => Err(TransportError::with_status(
                502,
                format!("unknown batch event: {other}"),
            )),
        }
    }
}

/// One read's worth of framed messages plus the flush reason.
#[derive(Debug, Clone)]
pub struct StreamBatch {
    pub event: StreamBatchEvent,
    pub messages: Vec<Bytes>,
    pub trailers: HashMap<String, String>,
}

/// Tunables for one batch read, sent as request headers.
#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
    /// Maximum wait for any data at all.
    pub read_timeout_ms: u64,
    /// Maximum wait once data starts arriving, to coalesce messages.
    pub batch_timeout_ms: u64,
    /// Byte budget before the bridge flushes the accumulated batch.
    pub batch_max_bytes: u64,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            batch_timeout_ms: DEFAULT_BATCH_TIMEOUT_MS,
            batch_max_bytes: DEFAULT_BATCH_BYTES,
        }
    }
}

/// Arguments for starting a server-streaming call on a channel.
#[derive(Debug, Clone, Default)]
pub struct StreamArgs {
    /// The logical RPC path, e.g. `/bridgeql.v1.QueryService/ExecuteQuery`.
    pub path: String,
    /// The opaque serialized request message.
    pub body: Bytes,
    /// TLS material referenced by filesystem path, never inlined.
    pub tls_client_key_path: Option<String>,
    pub tls_client_cert_path: Option<String>,
    pub tls_cacerts_path: Option<String>,
    /// Per-call metadata forwarded verbatim as headers on the call, e.g.
    /// authorization tokens.
    pub metadata: Vec<(String, String)>,
}

/// Client for the bridge HTTP surface.
#[derive(Clone)]
pub struct BridgeClient {
    http: Arc<dyn BridgeHttp>,
}

impl BridgeClient {
    pub fn new(http: Arc<dyn BridgeHttp>) -> Self {
        Self { http }
    }

    /// Opens a logical channel. The bridge returns the channel id via a
    /// response header.
    pub async fn connect_channel(&self) -> TransportResult<BridgeChannel> {
        let request = HttpRequest::new(HttpMethod::Post, "/grpc/channels");
        let response = self.http.send(request).await?;
        if response.status != 200 {
            return Err(TransportError::with_status(
                response.status,
                String::from_utf8_lossy(&response.body).into_owned(),
            ));
        }
        let channel_id = response.require_integer_header(HEADER_CHANNEL_ID)?;
        debug!(channel_id, "opened bridge channel");
        Ok(BridgeChannel {
            http: Arc::clone(&self.http),
            channel_id,
        })
    }
}

/// A logical channel on the bridge, scoping one or more streams.
#[derive(Clone)]
pub struct BridgeChannel {
    http: Arc<dyn BridgeHttp>,
    channel_id: u64,
}

impl std::fmt::Debug for BridgeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeChannel")
            .field("channel_id", &self.channel_id)
            .finish_non_exhaustive()
    }
}

impl BridgeChannel {
    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    /// Starts a server-streaming call and returns the stream handle.
    pub async fn start_server_stream(&self, args: StreamArgs) -> TransportResult<BridgeStream> {
        let mut request = HttpRequest::new(
            HttpMethod::Post,
            format!("/grpc/channel/{}/streams", self.channel_id),
        )
        .header(HEADER_CHANNEL_ID, self.channel_id.to_string())
        .header(HEADER_PATH, &args.path)
        .body(args.body.clone());
        if let Some(path) = &args.tls_client_key_path {
            request = request.header(HEADER_TLS_CLIENT_KEY, path);
        }
        if let Some(path) = &args.tls_client_cert_path {
            request = request.header(HEADER_TLS_CLIENT_CERT, path);
        }
        if let Some(path) = &args.tls_cacerts_path {
            request = request.header(HEADER_TLS_CACERTS, path);
        }
        for (name, value) in &args.metadata {
            request = request.header(name, value);
        }

        let response = self.http.send(request).await?;
        if response.status != 200 {
            return Err(TransportError::with_status(
                response.status,
                String::from_utf8_lossy(&response.body).into_owned(),
            ));
        }
        let stream_id = response.require_integer_header(HEADER_STREAM_ID)?;
        debug!(channel_id = self.channel_id, stream_id, path = %args.path, "started server stream");
        Ok(BridgeStream {
            http: Arc::clone(&self.http),
            channel_id: self.channel_id,
            stream_id,
            reached_end: false,
        })
    }
}

/// One in-flight server-streaming call.
///
/// A stream must not be read concurrently by more than one reader; the
/// methods take `&mut self` to enforce the single-reader invariant.
pub struct BridgeStream {
    http: Arc<dyn BridgeHttp>,
    channel_id: u64,
    stream_id: u64,
    reached_end: bool,
}

impl BridgeStream {
    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    fn stream_path(&self) -> String {
        format!(
            "/grpc/channels/{}/stream/{}",
            self.channel_id, self.stream_id
        )
    }

    /// Issues one batch read.
    pub async fn read(&mut self, options: &ReadOptions) -> TransportResult<StreamBatch> {
        let request = HttpRequest::new(HttpMethod::Get, self.stream_path())
            .header(HEADER_READ_TIMEOUT, options.read_timeout_ms.to_string())
            .header(HEADER_BATCH_TIMEOUT, options.batch_timeout_ms.to_string())
            .header(HEADER_BATCH_BYTES, options.batch_max_bytes.to_string());
        let response = self.http.send(request).await?;
        if response.status != 200 {
            return Err(TransportError::with_status(
                response.status,
                String::from_utf8_lossy(&response.body).into_owned(),
            ));
        }

        let event: StreamBatchEvent = response.require_header(HEADER_BATCH_EVENT)?.parse()?;
        let declared = response.require_integer_header(HEADER_BATCH_MESSAGES)?;
        let messages = decode_frames(&response.body)?;

        // A count mismatch means the encoded response buffer is corrupt and
        // the stream's internal offset can no longer be trusted. Drop the
        // stream server-side before raising.
        if declared != messages.len() as u64 {
            self.reached_end = true;
            self.drop_stream().await;
            return Err(TransportError::corrupt("batch message count mismatch"));
        }

        let trailers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                name.strip_prefix(TRAILER_PREFIX)
                    .map(|key| (key.to_string(), value.clone()))
            })
            .collect();

        Ok(StreamBatch {
            event,
            messages,
            trailers,
        })
    }

    /// Reads the next batch, tracking stream end.
    ///
    /// Returns `Ok(None)` once a terminal event has been consumed. A
    /// `StreamFailed` event is surfaced as an error carrying the trailers.
    pub async fn next_batch(
        &mut self,
        options: &ReadOptions,
    ) -> TransportResult<Option<StreamBatch>> {
        if self.reached_end {
            return Ok(None);
        }
        let batch = self.read(options).await?;
        match batch.event {
            StreamBatchEvent::FlushAfterTimeout | StreamBatchEvent::FlushAfterBytes => {
                Ok(Some(batch))
            }
            StreamBatchEvent::FlushAfterClose | StreamBatchEvent::StreamFinished => {
                self.reached_end = true;
                Ok(Some(batch))
            }
            StreamBatchEvent::StreamFailed => {
                self.reached_end = true;
                Err(
                    TransportError::with_status(400, "server stream failed")
                        .with_trailers(batch.trailers),
                )
            }
        }
    }

    /// Best-effort DELETE so the bridge can reclaim the stream state.
    pub async fn drop_stream(&mut self) {
        self.reached_end = true;
        let request = HttpRequest::new(HttpMethod::Delete, self.stream_path());
        if let Err(err) = self.http.send(request).await {
            warn!(
                channel_id = self.channel_id,
                stream_id = self.stream_id,
                error = %err,
                "failed to drop bridge stream"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::frame::encode_frames;
    use crate::transport::http::HttpResponse;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Scripted bridge: pops canned responses and records every request.
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

        fn requests(&self) -> Vec<HttpRequest> {
            self.requests.lock().clone()
        }
    }

    #[async_trait::async_trait]
    impl BridgeHttp for ScriptedHttp {
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

    fn batch_response(event: &str, declared: usize, messages: &[Bytes]) -> TransportResult<HttpResponse> {
        ok_response(
            &[
                (HEADER_BATCH_EVENT, event),
                (HEADER_BATCH_MESSAGES, &declared.to_string()),
            ],
            encode_frames(messages),
        )
    }

    #[tokio::test]
    async fn connect_channel_parses_channel_id() {
        let http = ScriptedHttp::new(vec![ok_response(&[(HEADER_CHANNEL_ID, "7")], Bytes::new())]);
        let client = BridgeClient::new(http.clone());
        let channel = client.connect_channel().await.unwrap();
        assert_eq!(channel.channel_id(), 7);

        let requests = http.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, HttpMethod::Post);
        assert_eq!(requests[0].path, "/grpc/channels");
    }

    #[tokio::test]
    async fn connect_channel_surfaces_bridge_status() {
        let http = ScriptedHttp::new(vec![Ok(HttpResponse {
            status: 503,
            headers: HashMap::new(),
            body: Bytes::from_static(b"proxy starting up"),
        })]);
        let client = BridgeClient::new(http);
        let err = client.connect_channel().await.unwrap_err();
        assert_eq!(err.status, 503);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn start_server_stream_sends_path_and_tls_refs() {
        let http = ScriptedHttp::new(vec![
            ok_response(&[(HEADER_CHANNEL_ID, "3")], Bytes::new()),
            ok_response(&[(HEADER_STREAM_ID, "11")], Bytes::new()),
        ]);
        let client = BridgeClient::new(http.clone());
        let channel = client.connect_channel().await.unwrap();
        let stream = channel
            .start_server_stream(StreamArgs {
                path: "/svc/Execute".to_string(),
                body: Bytes::from_static(b"payload"),
                tls_cacerts_path: Some("/etc/certs/ca.pem".to_string()),
                metadata: vec![("authorization".to_string(), "Bearer t0k".to_string())],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(stream.stream_id(), 11);

        let requests = http.requests();
        assert_eq!(requests[1].path, "/grpc/channel/3/streams");
        assert!(requests[1]
            .headers
            .contains(&(HEADER_PATH.to_string(), "/svc/Execute".to_string())));
        assert!(requests[1]
            .headers
            .contains(&(HEADER_TLS_CACERTS.to_string(), "/etc/certs/ca.pem".to_string())));
        assert!(requests[1]
            .headers
            .contains(&("authorization".to_string(), "Bearer t0k".to_string())));
        assert_eq!(&requests[1].body[..], b"payload");
    }

    #[tokio::test]
    async fn read_decodes_batch_and_sends_tunables() {
        let http = ScriptedHttp::new(vec![batch_response(
            "FlushAfterTimeout",
            2,
            &[Bytes::from_static(b"one"), Bytes::from_static(b"two")],
        )]);
        let mut stream = BridgeStream {
            http: http.clone(),
            channel_id: 1,
            stream_id: 2,
            reached_end: false,
        };
        let batch = stream.read(&ReadOptions::default()).await.unwrap();
        assert_eq!(batch.event, StreamBatchEvent::FlushAfterTimeout);
        assert_eq!(batch.messages.len(), 2);

        let requests = http.requests();
        assert_eq!(requests[0].path, "/grpc/channels/1/stream/2");
        assert!(requests[0]
            .headers
            .contains(&(HEADER_READ_TIMEOUT.to_string(), "1000".to_string())));
        assert!(requests[0]
            .headers
            .contains(&(HEADER_BATCH_TIMEOUT.to_string(), "100".to_string())));
        assert!(requests[0]
            .headers
            .contains(&(HEADER_BATCH_BYTES.to_string(), "8000000".to_string())));
    }

    #[tokio::test]
    async fn count_mismatch_drops_stream_once_and_raises_fatal_error() {
        let http = ScriptedHttp::new(vec![
            // Declares two messages, body carries one.
            batch_response("FlushAfterTimeout", 2, &[Bytes::from_static(b"only")]),
            // The DELETE issued for the drop.
            ok_response(&[], Bytes::new()),
        ]);
        let mut stream = BridgeStream {
            http: http.clone(),
            channel_id: 4,
            stream_id: 9,
            reached_end: false,
        };
        let err = stream.read(&ReadOptions::default()).await.unwrap_err();
        assert_eq!(err.status, 500);
        assert_eq!(err.message, "batch message count mismatch");
        assert!(!err.is_retryable());

        let requests = http.requests();
        let deletes: Vec<_> = requests
            .iter()
            .filter(|r| r.method == HttpMethod::Delete)
            .collect();
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].path, "/grpc/channels/4/stream/9");

        // The stream is finished; no further reads hit the wire.
        assert!(stream
            .next_batch(&ReadOptions::default())
            .await
            .unwrap()
            .is_none());
        assert_eq!(http.requests().len(), 2);
    }

    #[tokio::test]
    async fn next_batch_tracks_terminal_events() {
        let http = ScriptedHttp::new(vec![
            batch_response("FlushAfterBytes", 1, &[Bytes::from_static(b"a")]),
            batch_response("FlushAfterClose", 1, &[Bytes::from_static(b"b")]),
        ]);
        let mut stream = BridgeStream {
            http,
            channel_id: 1,
            stream_id: 1,
            reached_end: false,
        };
        let options = ReadOptions::default();
        assert!(stream.next_batch(&options).await.unwrap().is_some());
        let last = stream.next_batch(&options).await.unwrap().unwrap();
        assert_eq!(last.event, StreamBatchEvent::FlushAfterClose);
        assert!(stream.next_batch(&options).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stream_failed_surfaces_trailers() {
        let http = ScriptedHttp::new(vec![ok_response(
            &[
                (HEADER_BATCH_EVENT, "StreamFailed"),
                (HEADER_BATCH_MESSAGES, "0"),
                ("bridge-trailer-grpc-status", "13"),
            ],
            Bytes::new(),
        )]);
        let mut stream = BridgeStream {
            http,
            channel_id: 1,
            stream_id: 1,
            reached_end: false,
        };
        let err = stream
            .next_batch(&ReadOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.status, 400);
        assert_eq!(err.trailers.get("grpc-status").map(String::as_str), Some("13"));
    }
}
