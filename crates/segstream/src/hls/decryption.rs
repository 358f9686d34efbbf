// HLS Decryption Service: resolves AES-128 keys through a single-flight cache and
// decrypts segment payloads.

use std::sync::Arc;
use std::time::Duration;

use aes::Aes128;
use bytes::Bytes;
use cbc::cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};
use moka::future::Cache;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use url::Url;

use crate::error::StreamError;
use crate::hls::config::{DecryptionConfig, FetcherConfig};
use crate::hls::manifest::{KeyMethod, KeyReference, KeySource};
use crate::hls::retry::{RetryAction, RetryPolicy, retry_with_backoff};
use crate::transport::{FetchRequest, Transport};

type Aes128CbcDec = cbc::Decryptor<Aes128>;

const KEY_LENGTH: usize = 16;

/// Default IV for a segment without an explicit one: the media sequence number
/// as a big-endian 128-bit integer.
pub fn u64_to_iv_bytes(val: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&val.to_be_bytes());
    iv
}

/// Rewrites `uri` with a template supporting `{url}`, `{scheme}`, `{netloc}`,
/// `{path}` and `{query}`.
pub fn apply_key_uri_override(template: &str, uri: &Url) -> Result<Url, StreamError> {
    let mut netloc = String::new();
    if !uri.username().is_empty() {
        netloc.push_str(uri.username());
        if let Some(password) = uri.password() {
            netloc.push(':');
            netloc.push_str(password);
        }
        netloc.push('@');
    }
    netloc.push_str(uri.host_str().unwrap_or_default());
    if let Some(port) = uri.port() {
        netloc.push_str(&format!(":{port}"));
    }

    let rewritten = template
        .replace("{url}", uri.as_str())
        .replace("{scheme}", uri.scheme())
        .replace("{netloc}", &netloc)
        .replace("{path}", uri.path())
        .replace("{query}", uri.query().unwrap_or_default());

    Url::parse(&rewritten).map_err(|e| StreamError::KeyUnreachable {
        url: rewritten.clone(),
        reason: format!("key URI override produced an invalid URL: {e}"),
        retryable: false,
    })
}

// --- DecryptionOffloader Struct ---
// Optionally moves AES work to tokio's blocking pool.

pub struct DecryptionOffloader {
    enabled: bool,
}

impl DecryptionOffloader {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub async fn decrypt(
        &self,
        data: Bytes,
        key: &[u8; 16],
        iv: &[u8; 16],
    ) -> Result<Bytes, String> {
        if !self.enabled {
            return Self::decrypt_sync(&data, key, iv);
        }
        let key = *key;
        let iv = *iv;
        tokio::task::spawn_blocking(move || Self::decrypt_sync(&data, &key, &iv))
            .await
            .map_err(|e| format!("decryption task failed: {e}"))?
    }

    pub fn decrypt_sync(data: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Result<Bytes, String> {
        let mut buffer = data.to_vec();
        let cipher = Aes128CbcDec::new_from_slices(key, iv)
            .map_err(|e| format!("failed to initialize AES decryptor: {e}"))?;
        let len = cipher
            .decrypt_padded_mut::<Pkcs7>(&mut buffer)
            .map_err(|e| format!("{e} (bad padding or block length)"))?
            .len();
        buffer.truncate(len);
        Ok(Bytes::from(buffer))
    }
}

/// Resolves keys and decrypts segments for one session.
///
/// Keys are cached by their (possibly overridden) URI. Concurrent requests for
/// a key that is not cached yet share a single fetch.
pub struct Decryptor {
    transport: Arc<dyn Transport>,
    keys: Cache<Url, [u8; 16]>,
    key_timeout: Duration,
    key_retry: RetryPolicy,
    key_uri_override: Option<String>,
    offloader: DecryptionOffloader,
    token: CancellationToken,
}

impl Decryptor {
    pub fn new(
        transport: Arc<dyn Transport>,
        fetcher_config: &FetcherConfig,
        decryption_config: &DecryptionConfig,
        token: CancellationToken,
    ) -> Self {
        Self {
            transport,
            keys: Cache::builder().max_capacity(64).build(),
            key_timeout: fetcher_config.key_download_timeout,
            key_retry: fetcher_config.key_retry.clone(),
            key_uri_override: decryption_config.key_uri_override.clone(),
            offloader: DecryptionOffloader::new(decryption_config.offload_decryption_to_cpu_pool),
            token,
        }
    }

    /// Decrypts `data` belonging to segment `sequence`.
    pub async fn decrypt(
        &self,
        sequence: u64,
        data: Bytes,
        key: &KeyReference,
    ) -> Result<Bytes, StreamError> {
        if let KeyMethod::Unsupported(method) = &key.method {
            return Err(StreamError::SegmentRejected {
                sequence,
                reason: format!("unsupported encryption method {method}"),
            });
        }

        let key_bytes = self.resolve_key(&key.source).await?;
        let iv = key.iv.unwrap_or_else(|| u64_to_iv_bytes(sequence));
        trace!(msn = sequence, iv = %hex::encode(iv), "Decrypting segment");

        self.offloader
            .decrypt(data, &key_bytes, &iv)
            .await
            .map_err(|reason| StreamError::decryption_failed(sequence, reason))
    }

    /// Returns the 16-byte key, fetching it at most once per URI.
    pub async fn resolve_key(&self, source: &KeySource) -> Result<[u8; 16], StreamError> {
        let uri = match source {
            KeySource::Inline(bytes) => return key_from_bytes("data:", bytes),
            KeySource::Uri(uri) => uri,
        };
        let uri = match &self.key_uri_override {
            Some(template) => apply_key_uri_override(template, uri)?,
            None => uri.clone(),
        };

        self.keys
            .try_get_with(uri.clone(), self.fetch_key(&uri))
            .await
            .map_err(|e: Arc<StreamError>| (*e).clone())
    }

    async fn fetch_key(&self, uri: &Url) -> Result<[u8; 16], StreamError> {
        debug!(%uri, "Fetching decryption key");
        let result = retry_with_backoff(&self.key_retry, &self.token, "key", move |_| async move {
            let fetched = self
                .transport
                .get(FetchRequest::new(uri, self.key_timeout))
                .await
                .map_err(|e| StreamError::KeyUnreachable {
                    url: uri.to_string(),
                    reason: e.to_string(),
                    retryable: e.is_retryable(),
                })
                .and_then(|bytes| key_from_bytes(uri.as_str(), &bytes));
            RetryAction::from(fetched)
        })
        .await;

        // Key retries are spent here; segment retries must not repeat them.
        result.map_err(|e| match e {
            StreamError::KeyUnreachable { url, reason, .. } => StreamError::KeyUnreachable {
                url,
                reason,
                retryable: false,
            },
            other => other,
        })
    }
}

fn key_from_bytes(url: &str, bytes: &[u8]) -> Result<[u8; 16], StreamError> {
    <[u8; KEY_LENGTH]>::try_from(bytes).map_err(|_| StreamError::KeyUnreachable {
        url: url.to_string(),
        reason: format!("key must be {KEY_LENGTH} bytes, got {}", bytes.len()),
        retryable: false,
    })
}
