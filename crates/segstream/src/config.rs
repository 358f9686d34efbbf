use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::error::StreamError;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// HTTP options shared by manifest, segment and key requests.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// User agent string
    pub user_agent: String,

    /// Custom HTTP headers sent with every request
    pub headers: HeaderMap,

    /// Query parameters appended to every request
    pub params: Vec<(String, String)>,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Whether to follow redirects
    pub follow_redirects: bool,

    pub danger_accept_invalid_certs: bool,

    /// Maximum idle connections to keep per host
    pub pool_max_idle_per_host: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: HttpConfig::default_headers(),
            params: Vec::new(),
            connect_timeout: Duration::from_secs(30),
            follow_redirects: true,
            danger_accept_invalid_certs: false,
            pool_max_idle_per_host: 10,
        }
    }
}

impl HttpConfig {
    pub fn default_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );
        headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));
        headers
    }

    /// Adds or replaces a header, validating name and value.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, StreamError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| StreamError::configuration(format!("invalid header name `{name}`: {e}")))?;
        let value = HeaderValue::from_str(value).map_err(|e| {
            StreamError::configuration(format!("invalid value for header `{name}`: {e}"))
        })?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_header_overrides_default() {
        let config = HttpConfig::default()
            .with_header("accept", "application/vnd.apple.mpegurl")
            .unwrap();
        assert_eq!(
            config.headers.get(reqwest::header::ACCEPT).unwrap(),
            "application/vnd.apple.mpegurl"
        );
    }

    #[test]
    fn invalid_header_is_a_configuration_error() {
        let err = HttpConfig::default().with_header("bad header", "x").unwrap_err();
        assert!(matches!(err, StreamError::Configuration { .. }));
    }
}
