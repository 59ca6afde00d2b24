// src/http/client.rs
//
// Copyright, 2025.  Signal65 / Futurum Group.
//
// reqwest-backed transport for the remote endpoint, with HTTP/2 support and
// per-endpoint tuning

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::ClientBuilder;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

use crate::constants::{DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_OPERATION_TIMEOUT_SECS};
use crate::error::{MirrorError, Result};
use crate::http::transport::{Exchange, Headers, HttpRequest, Transport, Verb};

/// HTTP client configuration for the remote endpoint
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Maximum number of idle connections kept per host
    pub max_connections_per_host: usize,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Whole-exchange timeout
    pub request_timeout: Duration,
    /// Enable HTTP/2 support
    pub enable_http2: bool,
    /// Force HTTP/2 prior knowledge (skip HTTP/1.1 upgrade)
    pub http2_prior_knowledge: bool,
    /// HTTP/2 keep alive interval
    pub http2_keep_alive_interval: Option<Duration>,
    /// TCP keepalive settings
    pub tcp_keepalive: Option<Duration>,
    /// Pool idle timeout
    pub pool_idle_timeout: Option<Duration>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            max_connections_per_host: 64,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(DEFAULT_OPERATION_TIMEOUT_SECS),
            enable_http2: false,
            http2_prior_knowledge: false,
            http2_keep_alive_interval: None,
            tcp_keepalive: Some(Duration::from_secs(60)),
            pool_idle_timeout: Some(Duration::from_secs(90)),
        }
    }
}

impl HttpClientConfig {
    /// Gateways on a local network that speak HTTP/2 without negotiation
    pub fn high_performance() -> Self {
        Self {
            max_connections_per_host: 128,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(180),
            enable_http2: true,
            http2_prior_knowledge: false,
            http2_keep_alive_interval: Some(Duration::from_secs(15)),
            tcp_keepalive: Some(Duration::from_secs(30)),
            pool_idle_timeout: Some(Duration::from_secs(60)),
        }
    }

    /// AWS S3 (HTTP/1.1 only)
    pub fn aws_s3() -> Self {
        Self {
            enable_http2: false,
            ..Self::default()
        }
    }

    /// Pick a profile from the endpoint URL
    pub fn auto_detect(endpoint: &str) -> Self {
        if endpoint.contains("amazonaws.com") || endpoint.contains("s3.") {
            Self::aws_s3()
        } else if endpoint.starts_with("https://") {
            Self::high_performance()
        } else {
            // plain http gateways rarely do h2c
            Self::default()
        }
    }

    fn build_client(&self) -> Result<reqwest::Client> {
        let mut builder = ClientBuilder::new()
            .pool_max_idle_per_host(self.max_connections_per_host)
            .connect_timeout(self.connect_timeout)
            .timeout(self.request_timeout);

        if self.enable_http2 {
            if self.http2_prior_knowledge {
                builder = builder.http2_prior_knowledge();
            }
            if let Some(interval) = self.http2_keep_alive_interval {
                builder = builder.http2_keep_alive_interval(interval);
            }
        } else {
            builder = builder.http1_only();
        }

        if let Some(keepalive) = self.tcp_keepalive {
            builder = builder.tcp_keepalive(keepalive);
        }
        if let Some(idle_timeout) = self.pool_idle_timeout {
            builder = builder.pool_idle_timeout(idle_timeout);
        }

        builder
            .tcp_nodelay(true)
            .use_rustls_tls()
            .build()
            .map_err(|e| MirrorError::transport(format!("failed to build HTTP client: {e}")))
    }
}

/// [`Transport`] over a pooled reqwest client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    config: HttpClientConfig,
}

impl ReqwestTransport {
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        let client = config.build_client()?;
        Ok(Self { client, config })
    }

    pub fn for_endpoint(endpoint: &str) -> Result<Self> {
        Self::new(HttpClientConfig::auto_detect(endpoint))
    }

    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }
}

fn map_reqwest_error(e: reqwest::Error) -> MirrorError {
    if e.is_timeout() {
        MirrorError::timeout(e.to_string())
    } else {
        MirrorError::transport(e.to_string())
    }
}

fn method_for(verb: Verb) -> reqwest::Method {
    match verb {
        Verb::Put => reqwest::Method::PUT,
        Verb::Get => reqwest::Method::GET,
        Verb::Delete => reqwest::Method::DELETE,
    }
}

fn to_header_map(headers: &Headers) -> Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_str(name)
            .map_err(|e| MirrorError::InvalidRequest(format!("bad header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| MirrorError::InvalidRequest(format!("bad value for header {name}: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<Box<dyn Exchange>> {
        let url = reqwest::Url::parse(&request.url)
            .map_err(|e| MirrorError::InvalidRequest(format!("bad url {:?}: {e}", request.url)))?;
        let headers = to_header_map(&request.headers)?;

        debug!("{} {}", request.verb, url);
        let response = self
            .client
            .request(method_for(request.verb), url)
            .headers(headers)
            .body(request.body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_ascii_lowercase(), v.to_string())))
            .collect();

        Ok(Box::new(ReqwestExchange { status, headers, response }))
    }
}

struct ReqwestExchange {
    status: u16,
    headers: Headers,
    response: reqwest::Response,
}

#[async_trait]
impl Exchange for ReqwestExchange {
    fn status(&self) -> u16 {
        self.status
    }

    fn headers(&self) -> &Headers {
        &self.headers
    }

    async fn chunk(&mut self) -> Result<Option<Bytes>> {
        self.response.chunk().await.map_err(map_reqwest_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transport_creation() {
        assert!(ReqwestTransport::new(HttpClientConfig::default()).is_ok());
    }

    #[test]
    fn test_profiles() {
        assert!(!HttpClientConfig::auto_detect("https://s3.us-east-1.amazonaws.com").enable_http2);
        assert!(HttpClientConfig::auto_detect("https://gateway.internal:8443").enable_http2);
        assert!(!HttpClientConfig::auto_detect("http://127.0.0.1:8000").enable_http2);
    }

    #[tokio::test]
    async fn test_refused_connection_is_transport_error() {
        let transport = ReqwestTransport::new(HttpClientConfig {
            connect_timeout: Duration::from_secs(2),
            ..HttpClientConfig::default()
        })
        .unwrap();
        let req = HttpRequest {
            verb: Verb::Get,
            // port 9 (discard) is closed on any sane test host
            url: "http://127.0.0.1:9/bucket".to_string(),
            headers: Headers::new(),
            body: Bytes::new(),
        };
        let err = transport.send(req).await.err().expect("send should fail");
        assert!(err.is_remote(), "{err:?}");
    }
}
