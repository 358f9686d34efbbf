// HLS Playlist Fetcher: downloads and parses media playlists into manifest snapshots.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use url::Url;

use crate::error::StreamError;
use crate::hls::manifest::ManifestState;
use crate::transport::{FetchRequest, Transport};

#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// Fetches and parses the media playlist at `url`.
    async fn fetch(&self, url: &Url, token: &CancellationToken)
    -> Result<ManifestState, StreamError>;
}

/// [`ManifestSource`] backed by a [`Transport`].
pub struct ManifestFetcher {
    transport: Arc<dyn Transport>,
    timeout: Duration,
    /// Raw bytes and parse result of the previous fetch
    last: Mutex<Option<(Url, Bytes, ManifestState)>>,
}

impl ManifestFetcher {
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self {
            transport,
            timeout,
            last: Mutex::new(None),
        }
    }

    fn unchanged(&self, url: &Url, bytes: &Bytes) -> Option<ManifestState> {
        let last = self.last.lock();
        match last.as_ref() {
            // Same length first, full comparison only when it matches
            Some((last_url, last_bytes, state))
                if last_url == url && last_bytes.len() == bytes.len() && last_bytes == bytes =>
            {
                Some(state.clone())
            }
            _ => None,
        }
    }
}

#[async_trait]
impl ManifestSource for ManifestFetcher {
    async fn fetch(
        &self,
        url: &Url,
        token: &CancellationToken,
    ) -> Result<ManifestState, StreamError> {
        if token.is_cancelled() {
            return Err(StreamError::Cancelled);
        }

        let bytes = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(StreamError::Cancelled),
            result = self.transport.get(FetchRequest::new(url, self.timeout)) => {
                result.map_err(|e| StreamError::manifest_unreachable(url.as_str(), e))?
            }
        };

        if let Some(state) = self.unchanged(url, &bytes) {
            trace!(%url, "Playlist content unchanged");
            return Ok(state);
        }

        let state = ManifestState::parse(&bytes, url)?;
        debug!(
            %url,
            media_sequence = state.media_sequence_base,
            entries = state.entries.len(),
            endlist = state.is_endlist,
            "Parsed playlist"
        );
        *self.last.lock() = Some((url.clone(), bytes, state.clone()));
        Ok(state)
    }
}
