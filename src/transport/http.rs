//! Minimal HTTP abstraction for the bridge endpoint.
//!
//! The bridge surface is four calls against a host-local endpoint, so the
//! transport only needs method/path/headers/body. Putting a trait at this
//! seam lets tests script the bridge without a listening socket.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use crate::transport::error::{TransportError, TransportResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Delete,
}

/// One request against the bridge endpoint.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }
}

/// One response from the bridge endpoint. Header names are lowercased.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Reads a header the bridge is required to set.
    pub fn require_header(&self, name: &str) -> TransportResult<&str> {
        self.header(name).ok_or_else(|| {
            TransportError::with_status(502, format!("bridge response is missing header {name}"))
        })
    }

    /// Reads a required integer header.
    pub fn require_integer_header(&self, name: &str) -> TransportResult<u64> {
        let raw = self.require_header(name)?;
        raw.parse::<u64>().map_err(|_| {
            TransportError::with_status(
                502,
                format!("bridge header {name} is not an integer: {raw}"),
            )
        })
    }
}

/// The HTTP client seam for all bridge calls.
#[async_trait]
pub trait BridgeHttp: Send + Sync {
    async fn send(&self, request: HttpRequest) -> TransportResult<HttpResponse>;
}

/// Production client backed by reqwest.
pub struct ReqwestBridgeHttp {
    endpoint: Url,
    client: reqwest::Client,
}

impl ReqwestBridgeHttp {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            client: reqwest::Client::new(),
        }
    }

    fn resolve(&self, path: &str) -> TransportResult<Url> {
        let mut url = self.endpoint.clone();
        url.set_path(path);
        Ok(url)
    }
}

#[async_trait]
impl BridgeHttp for ReqwestBridgeHttp {
    async fn send(&self, request: HttpRequest) -> TransportResult<HttpResponse> {
        let url = self.resolve(&request.path)?;
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(url),
            HttpMethod::Post => self.client.post(url),
            HttpMethod::Delete => self.client.delete(url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransportError::network(e.to_string()))?;

        let status = response.status().as_u16();
        let mut headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_ascii_lowercase(), value.to_string());
            }
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::network(e.to_string()))?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
