//! SaaS data-cloud connector.
//!
//! Same bridge tunnel as the direct connector, but every call must carry a
//! fresh access token. The token exchange itself (OAuth/PKCE) lives behind
//! the `TokenProvider` trait; only the auth state-machine shape is tracked
//! here: `NotStarted → TokenRequested → TokenReceived / Failed`. Tokens are
//! fetched per call and never cached in the adapter, so a rotated token takes
//! effect on the next query.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::connectors::wire::{self, ExecuteQueryRequest};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::reader::StreamingResultReader;
use crate::engine::traits::{QueryConnector, ResultStream};
use crate::transport::{BridgeChannel, BridgeClient, BridgeHttp, ReadOptions, StreamArgs};

/// The server-streaming RPC on the data-cloud query service.
pub const DATA_CLOUD_EXECUTE_PATH: &str = "/bridgeql.cloud.v1.QueryService/ExecuteQuery";

const HEADER_AUTHORIZATION: &str = "authorization";

/// Supplies a bearer token for one call.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> EngineResult<String>;
}

/// Where the last token exchange got to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    NotStarted,
    TokenRequested,
    TokenReceived,
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct DataCloudConfig {
    pub tls_cacerts_path: Option<String>,
    pub read_options: Option<ReadOptions>,
}

pub struct DataCloudConnector {
    channel: BridgeChannel,
    tokens: Arc<dyn TokenProvider>,
    config: DataCloudConfig,
    auth_state: Mutex<AuthState>,
}

impl DataCloudConnector {
    pub async fn connect(
        http: Arc<dyn BridgeHttp>,
        tokens: Arc<dyn TokenProvider>,
        config: DataCloudConfig,
    ) -> EngineResult<Self> {
        let channel = BridgeClient::new(http).connect_channel().await?;
        debug!(channel_id = channel.channel_id(), "data cloud connector ready");
        Ok(Self {
            channel,
            tokens,
            config,
            auth_state: Mutex::new(AuthState::NotStarted),
        })
    }

    pub fn auth_state(&self) -> AuthState {
        *self.auth_state.lock()
    }

    async fn fresh_token(&self) -> EngineResult<String> {
        *self.auth_state.lock() = AuthState::TokenRequested;
        match self.tokens.access_token().await {
            Ok(token) => {
                *self.auth_state.lock() = AuthState::TokenReceived;
                Ok(token)
            }
            Err(err) => {
                *self.auth_state.lock() = AuthState::Failed;
                warn!(error = %err, "token exchange failed");
                Err(EngineError::auth_failed(err.to_string()))
            }
        }
    }
}

#[async_trait]
impl QueryConnector for DataCloudConnector {
    fn connector_id(&self) -> &'static str {
        "datacloud"
    }

    fn connector_name(&self) -> &'static str {
        "Data Cloud"
    }

    async fn health_check(&self) -> EngineResult<()> {
        // Proves the token exchange works before the first user query.
        self.fresh_token().await.map(|_| ())
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
        let token = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            token = self.fresh_token() => token?,
        };

        let request = ExecuteQueryRequest {
            query: query.to_string(),
            attached_databases: Vec::new(),
        };
        let args = StreamArgs {
            path: DATA_CLOUD_EXECUTE_PATH.to_string(),
            body: wire::encode_request(&request)?,
            tls_cacerts_path: self.config.tls_cacerts_path.clone(),
            metadata: vec![(HEADER_AUTHORIZATION.to_string(), format!("Bearer {token}"))],
            ..Default::default()
        };

        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            stream = self.channel.start_server_stream(args) => stream?,
        };
        let options = self.config.read_options.unwrap_or_default();
        Ok(Arc::new(StreamingResultReader::new(stream, options)))
    }
}
