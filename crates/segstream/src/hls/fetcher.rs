// HLS Segment Fetcher: downloads, decrypts and assembles individual media
// segments with retry logic.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use moka::future::Cache;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::StreamError;
use crate::hls::config::FetcherConfig;
use crate::hls::decryption::Decryptor;
use crate::hls::manifest::{InitSection, SegmentDescriptor};
use crate::hls::output::{InitPayload, SegmentPayload};
use crate::hls::reconciler::FetchJob;
use crate::hls::retry::{RetryAction, RetryPolicy, retry_with_backoff};
use crate::transport::{FetchRequest, Transport};

#[async_trait]
pub trait SegmentDownloader: Send + Sync {
    /// Produces the payload for `job`, retrying transient failures.
    async fn download(&self, job: &FetchJob) -> Result<SegmentPayload, StreamError>;
}

pub struct SegmentFetcher {
    transport: Arc<dyn Transport>,
    decryptor: Arc<Decryptor>,
    /// Decrypted init sections keyed by URI and byte range
    init_sections: Cache<InitSection, Bytes>,
    timeout: Duration,
    retry: RetryPolicy,
    token: CancellationToken,
}

impl SegmentFetcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        decryptor: Arc<Decryptor>,
        config: &FetcherConfig,
        token: CancellationToken,
    ) -> Self {
        Self {
            transport,
            decryptor,
            init_sections: Cache::builder().max_capacity(16).build(),
            timeout: config.segment_download_timeout,
            retry: config.segment_retry.clone(),
            token,
        }
    }

    async fn fetch_once(&self, job: &FetchJob) -> Result<SegmentPayload, StreamError> {
        let segment = &job.segment;
        let init = match &segment.init {
            Some(section) => Some(InitPayload {
                section: section.clone(),
                data: self.init_section(section, segment).await?,
            }),
            None => None,
        };

        let request = FetchRequest::new(&segment.uri, self.timeout).with_range(segment.byte_range);
        let body = self
            .transport
            .get(request)
            .await
            .map_err(|e| StreamError::segment_unreachable(segment.sequence, &e))?;
        trace!(msn = segment.sequence, len = body.len(), "Segment downloaded");

        let body = match &segment.key {
            Some(key) => self.decryptor.decrypt(segment.sequence, body, key).await?,
            None => body,
        };

        Ok(SegmentPayload {
            sequence: segment.sequence,
            data: body,
            discontinuity: segment.discontinuity,
            init,
        })
    }

    /// Fetches (and decrypts, with the segment's key) an init section at most
    /// once per session.
    async fn init_section(
        &self,
        init: &InitSection,
        segment: &SegmentDescriptor,
    ) -> Result<Bytes, StreamError> {
        self.init_sections
            .try_get_with(init.clone(), self.load_init_section(init, segment))
            .await
            .map_err(|e: Arc<StreamError>| (*e).clone())
    }

    async fn load_init_section(
        &self,
        init: &InitSection,
        segment: &SegmentDescriptor,
    ) -> Result<Bytes, StreamError> {
        let sequence = segment.sequence;
        debug!(msn = sequence, uri = %init.uri, "Fetching init section");
        let request = FetchRequest::new(&init.uri, self.timeout).with_range(init.byte_range);
        let bytes = self
            .transport
            .get(request)
            .await
            .map_err(|e| StreamError::SegmentUnreachable {
                sequence,
                reason: format!("init section {}: {e}", init.uri),
                retryable: e.is_retryable(),
            })?;
        match &segment.key {
            Some(key) => self.decryptor.decrypt(sequence, bytes, key).await,
            None => Ok(bytes),
        }
    }
}

#[async_trait]
impl SegmentDownloader for SegmentFetcher {
    async fn download(&self, job: &FetchJob) -> Result<SegmentPayload, StreamError> {
        retry_with_backoff(&self.retry, &self.token, "segment", move |_| async move {
            RetryAction::from(self.fetch_once(job).await)
        })
        .await
    }
}
