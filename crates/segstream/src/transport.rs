//! HTTP access used by every pipeline stage.
//!
//! The pipeline never talks to `reqwest` directly; it goes through
//! [`Transport`] so a session can run against any HTTP stack (or a scripted
//! one in tests).

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use tracing::trace;
use url::Url;

use crate::config::HttpConfig;
use crate::error::{StreamError, TransportError};
use crate::hls::manifest::ByteRange;

/// A single GET request issued by the pipeline.
#[derive(Debug, Clone)]
pub struct FetchRequest<'a> {
    pub url: &'a Url,
    pub range: Option<ByteRange>,
    pub timeout: Duration,
}

impl<'a> FetchRequest<'a> {
    pub fn new(url: &'a Url, timeout: Duration) -> Self {
        Self {
            url,
            range: None,
            timeout,
        }
    }

    pub fn with_range(mut self, range: Option<ByteRange>) -> Self {
        self.range = range;
        self
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs the request and returns the full body of a 2xx response.
    async fn get(&self, request: FetchRequest<'_>) -> Result<Bytes, TransportError>;
}

/// Builds the `reqwest` client used by [`ReqwestTransport`].
pub fn create_client(config: &HttpConfig) -> Result<Client, StreamError> {
    let redirect = if config.follow_redirects {
        reqwest::redirect::Policy::limited(10)
    } else {
        reqwest::redirect::Policy::none()
    };

    Client::builder()
        .user_agent(config.user_agent.as_str())
        .default_headers(config.headers.clone())
        .connect_timeout(config.connect_timeout)
        .redirect(redirect)
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .danger_accept_invalid_certs(config.danger_accept_invalid_certs)
        .build()
        .map_err(|e| StreamError::configuration(format!("failed to build HTTP client: {e}")))
}

pub struct ReqwestTransport {
    client: Client,
    params: Vec<(String, String)>,
}

impl ReqwestTransport {
    pub fn new(config: &HttpConfig) -> Result<Self, StreamError> {
        Ok(Self::with_client(create_client(config)?, config.params.clone()))
    }

    pub fn with_client(client: Client, params: Vec<(String, String)>) -> Self {
        Self { client, params }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, request: FetchRequest<'_>) -> Result<Bytes, TransportError> {
        let mut builder = self
            .client
            .get(request.url.clone())
            .timeout(request.timeout);
        if !self.params.is_empty() {
            builder = builder.query(&self.params);
        }
        if let Some(range) = request.range {
            builder = builder.header(reqwest::header::RANGE, range.header_value());
        }

        let response = builder.send().await?;
        let status = response.status();
        trace!(url = %request.url, %status, version = ?response.version(), "HTTP response");
        if !status.is_success() {
            return Err(TransportError::Status { status });
        }
        Ok(response.bytes().await?)
    }
}
