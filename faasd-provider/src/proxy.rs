//! HTTP relay to a function's watchdog.
//!
//! The inbound request is rebuilt against the resolved endpoint: method,
//! query and headers are carried over, `X-Forwarded-Host`/`X-Forwarded-For`
//! are filled in when missing and redirects are returned to the caller
//! instead of followed. Dropping the returned future aborts the upstream
//! call, so a request handler that goes away takes its relay with it.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ConnectInfo;
use axum::http::header::{self, HeaderName};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::config::ProviderConfig;
use crate::error::{ProviderError, Result};
use crate::resolver::NetworkEndpoint;

const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Headers that describe the inbound connection rather than the request.
const CONNECTION_HEADERS: [HeaderName; 4] = [
    header::HOST,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
    header::CONNECTION,
];

/// Body to send upstream.
pub enum RelayBody {
    Empty,
    /// Already read by the caller, sent as-is.
    Buffered(Bytes),
    /// Streamed through without buffering.
    Streaming(axum::body::Body),
}

impl std::fmt::Debug for RelayBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayBody::Empty => f.write_str("Empty"),
            RelayBody::Buffered(bytes) => write!(f, "Buffered({} bytes)", bytes.len()),
            RelayBody::Streaming(_) => f.write_str("Streaming"),
        }
    }
}

/// The parts of an inbound request that are relayed.
#[derive(Debug)]
pub struct InboundRequest {
    pub method: Method,
    pub query: Option<String>,
    pub headers: HeaderMap,
    /// Host the caller addressed.
    pub host: Option<String>,
    pub remote_addr: Option<SocketAddr>,
    pub body: RelayBody,
}

impl InboundRequest {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            query: None,
            headers: HeaderMap::new(),
            host: None,
            remote_addr: None,
            body: RelayBody::Empty,
        }
    }

    pub fn from_parts(parts: &Parts, body: RelayBody) -> Self {
        let host = parts
            .headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .or_else(|| parts.uri.authority().map(|a| a.to_string()));
        let remote_addr = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        Self {
            method: parts.method.clone(),
            query: parts.uri.query().map(str::to_string),
            headers: parts.headers.clone(),
            host,
            remote_addr,
            body,
        }
    }

    /// Same request with the given method and no body, for fan-out reads.
    pub fn without_body(&self, method: Method) -> Self {
        Self {
            method,
            query: self.query.clone(),
            headers: self.headers.clone(),
            host: self.host.clone(),
            remote_addr: self.remote_addr,
            body: RelayBody::Empty,
        }
    }
}

/// Fully read watchdog response.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// URL the request was sent to.
    pub target: String,
}

impl UpstreamResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|source| ProviderError::BadUpstreamPayload {
            target: self.target.clone(),
            source,
        })
    }

    pub fn error_for_status(self, function: &str) -> Result<Self> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(ProviderError::Upstream {
                function: function.to_string(),
                target: self.target,
                reason: format!("status {}", self.status),
            })
        }
    }
}

#[async_trait]
pub trait Forward: Send + Sync {
    async fn forward(
        &self,
        inbound: InboundRequest,
        endpoint: &NetworkEndpoint,
        path: &str,
    ) -> Result<UpstreamResponse>;
}

/// reqwest-backed relay with bounded timeouts and no redirect following.
#[derive(Clone)]
pub struct WatchdogClient {
    client: reqwest::Client,
    watchdog_port: u16,
}

impl WatchdogClient {
    pub fn new(config: &ProviderConfig) -> std::result::Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .pool_max_idle_per_host(config.max_idle_conns_per_host)
            .pool_idle_timeout(config.idle_conn_timeout)
            .tcp_keepalive(Duration::from_secs(1))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            watchdog_port: config.watchdog_port,
        })
    }

    fn build_request(
        &self,
        inbound: InboundRequest,
        endpoint: &NetworkEndpoint,
        path: &str,
    ) -> Result<reqwest::Request> {
        let mut url = format!("http://{}{}", endpoint.authority(self.watchdog_port), path);
        if let Some(query) = inbound.query.as_deref().filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }

        let mut headers = inbound.headers.clone();
        for name in &CONNECTION_HEADERS {
            headers.remove(name);
        }
        if !headers.contains_key(&X_FORWARDED_HOST) {
            if let Some(value) = inbound
                .host
                .as_deref()
                .and_then(|host| HeaderValue::from_str(host).ok())
            {
                headers.insert(X_FORWARDED_HOST, value);
            }
        }
        if !headers.contains_key(&X_FORWARDED_FOR) {
            if let Some(value) = inbound
                .remote_addr
                .and_then(|addr| HeaderValue::from_str(&addr.to_string()).ok())
            {
                headers.insert(X_FORWARDED_FOR, value);
            }
        }

        let builder = self.client.request(inbound.method, &url).headers(headers);
        let builder = match inbound.body {
            RelayBody::Empty => builder,
            RelayBody::Buffered(bytes) => builder.body(bytes),
            RelayBody::Streaming(body) => {
                builder.body(reqwest::Body::wrap_stream(body.into_data_stream()))
            }
        };

        builder.build().map_err(|e| ProviderError::Upstream {
            function: endpoint.function.clone(),
            target: url,
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl Forward for WatchdogClient {
    async fn forward(
        &self,
        inbound: InboundRequest,
        endpoint: &NetworkEndpoint,
        path: &str,
    ) -> Result<UpstreamResponse> {
        let request = self.build_request(inbound, endpoint, path)?;
        let target = request.url().to_string();
        let upstream_error = |e: reqwest::Error| ProviderError::Upstream {
            function: endpoint.function.clone(),
            target: target.clone(),
            reason: e.to_string(),
        };

        debug!(function = %endpoint.function, method = %request.method(), target = %target, "Relaying to watchdog");
        let response = self.client.execute(request).await.map_err(upstream_error)?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(upstream_error)?;
        debug!(function = %endpoint.function, status = %status, bytes = body.len(), "Watchdog replied");

        Ok(UpstreamResponse {
            status,
            headers,
            body,
            target,
        })
    }
}
