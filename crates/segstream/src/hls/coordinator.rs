// HLS Stream Coordinator: wires the pipeline components together, runs one
// session to completion and reports how it ended.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use url::Url;

use crate::error::StreamError;
use crate::hls::config::StreamConfig;
use crate::hls::decryption::Decryptor;
use crate::hls::events::{EventSender, StreamEvent};
use crate::hls::fetcher::{SegmentDownloader, SegmentFetcher};
use crate::hls::output::{BufferStats, OrderedBuffer};
use crate::hls::playlist::{ManifestFetcher, ManifestSource};
use crate::hls::reconciler::{FetchJob, PlaylistReconciler};
use crate::hls::scheduler::SegmentScheduler;
use crate::hls::writer::StreamWriter;
use crate::transport::{ReqwestTransport, Transport};

/// How a session ended.
#[derive(Debug, Clone)]
pub enum SessionOutcome {
    /// Every segment was written or explicitly skipped and the sink was shut down
    Completed,
    /// Stopped through the session's cancellation token
    Cancelled,
    Failed(StreamError),
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    pub segments_written: u64,
    pub bytes_written: u64,
    pub skipped: u64,
    pub buffer: BufferStats,
}

impl SessionReport {
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, SessionOutcome::Completed)
    }

    pub fn error(&self) -> Option<&StreamError> {
        match &self.outcome {
            SessionOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }

    fn failed(err: StreamError) -> Self {
        Self {
            outcome: SessionOutcome::Failed(err),
            segments_written: 0,
            bytes_written: 0,
            skipped: 0,
            buffer: BufferStats::default(),
        }
    }
}

/// Entry point of the engine: one manifest URL in, one ordered byte stream out.
///
/// ```no_run
/// # async fn demo() -> Result<(), segstream::StreamError> {
/// use segstream::{StreamConfig, StreamSession};
///
/// let session = StreamSession::new(StreamConfig::default())?;
/// let report = session
///     .run("https://example.com/live/index.m3u8", tokio::io::stdout())
///     .await;
/// println!("{} segments written", report.segments_written);
/// # Ok(())
/// # }
/// ```
pub struct StreamSession {
    config: StreamConfig,
    transport: Arc<dyn Transport>,
    events: EventSender,
    token: CancellationToken,
}

impl StreamSession {
    /// Builds a session backed by a `reqwest` client configured from
    /// `config.http`.
    pub fn new(config: StreamConfig) -> Result<Self, StreamError> {
        let transport = Arc::new(ReqwestTransport::new(&config.http)?);
        Self::with_transport(config, transport)
    }

    pub fn with_transport(
        config: StreamConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, StreamError> {
        config.validate()?;
        Ok(Self {
            config,
            transport,
            events: EventSender::disabled(),
            token: CancellationToken::new(),
        })
    }

    /// Returns a receiver for the events of subsequent runs. Replaces any
    /// previous subscription.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (events, rx) = EventSender::channel();
        self.events = events;
        rx
    }

    /// Cancelling this token stops a running session; it reports
    /// [`SessionOutcome::Cancelled`].
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub async fn run<W>(&self, url: &str, sink: W) -> SessionReport
    where
        W: AsyncWrite + Unpin + Send,
    {
        let report = match Url::parse(url) {
            Ok(url) => {
                let span = info_span!("session", url = %url);
                self.run_pipeline(url, sink).instrument(span).await
            }
            Err(e) => {
                error!(url, error = %e, "Invalid manifest URL");
                SessionReport::failed(StreamError::configuration(format!(
                    "invalid manifest URL {url}: {e}"
                )))
            }
        };

        self.events.emit(StreamEvent::SessionEnded {
            segments_written: report.segments_written,
            bytes_written: report.bytes_written,
            skipped: report.skipped,
            error: report.error().cloned(),
        });
        report
    }

    async fn run_pipeline<W>(&self, url: Url, sink: W) -> SessionReport
    where
        W: AsyncWrite + Unpin + Send,
    {
        let config = &self.config;
        let token = self.token.child_token();
        info!("Starting stream session");

        let buffer = Arc::new(OrderedBuffer::new(config.output_config.buffer_capacity));
        let decryptor = Arc::new(Decryptor::new(
            Arc::clone(&self.transport),
            &config.fetcher_config,
            &config.decryption_config,
            token.clone(),
        ));
        let downloader: Arc<dyn SegmentDownloader> = Arc::new(SegmentFetcher::new(
            Arc::clone(&self.transport),
            decryptor,
            &config.fetcher_config,
            token.clone(),
        ));
        let source: Arc<dyn ManifestSource> = Arc::new(ManifestFetcher::new(
            Arc::clone(&self.transport),
            config.playlist_config.fetch_timeout,
        ));

        // Segment request buffer: enough headroom for the scheduler
        let concurrency = config.fetcher_config.download_concurrency;
        let (jobs_tx, jobs_rx) = mpsc::channel::<FetchJob>(concurrency * 2);

        let scheduler = SegmentScheduler::new(
            downloader,
            jobs_rx,
            Arc::clone(&buffer),
            concurrency,
            token.clone(),
        );
        let mut reconciler = PlaylistReconciler::new(
            source,
            url,
            config.playlist_config.clone(),
            Arc::clone(&buffer),
            jobs_tx,
            self.events.clone(),
            token.clone(),
        );

        let scheduler_handle = spawn_stage("segment scheduler", Arc::clone(&buffer), async move {
            scheduler.run().await;
            Ok(())
        });
        let reconciler_handle =
            spawn_stage("playlist reconciler", Arc::clone(&buffer), async move {
                let result = reconciler.run().await;
                debug!(state = ?reconciler.state(), "Playlist reconciler stopped");
                result
            });

        let writer = StreamWriter::new(sink, Arc::clone(&buffer), self.events.clone(), token.clone());
        let (stats, result) = writer.run().await;

        // Whatever ended the writer ends the pipeline.
        token.cancel();
        buffer.abort();
        let deadline = Instant::now() + config.shutdown_grace;
        join_stage("playlist reconciler", reconciler_handle, deadline).await;
        join_stage("segment scheduler", scheduler_handle, deadline).await;

        let outcome = match result {
            Ok(()) => SessionOutcome::Completed,
            Err(StreamError::Cancelled) => SessionOutcome::Cancelled,
            Err(e) => SessionOutcome::Failed(e),
        };
        match &outcome {
            SessionOutcome::Completed => info!(
                segments = stats.segments_written,
                bytes = stats.bytes_written,
                skipped = stats.skipped,
                "Stream session completed"
            ),
            SessionOutcome::Cancelled => info!("Stream session cancelled"),
            SessionOutcome::Failed(e) => error!(error = %e, "Stream session failed"),
        }

        SessionReport {
            outcome,
            segments_written: stats.segments_written,
            bytes_written: stats.bytes_written,
            skipped: stats.skipped,
            buffer: buffer.stats(),
        }
    }
}

/// Spawns a pipeline stage. A stage that fails (or panics) fails the buffer so
/// the writer delivers what is contiguous and then reports the error.
fn spawn_stage<F>(name: &'static str, buffer: Arc<OrderedBuffer>, stage: F) -> JoinHandle<()>
where
    F: Future<Output = Result<(), StreamError>> + Send + 'static,
{
    tokio::spawn(
        async move {
            match AssertUnwindSafe(stage).catch_unwind().await {
                Ok(Ok(())) | Ok(Err(StreamError::Cancelled)) => debug!("{name} task finished"),
                Ok(Err(e)) => buffer.fail(e),
                Err(_) => {
                    error!("{name} task panicked");
                    buffer.fail(StreamError::internal(format!("{name} panicked")));
                }
            }
        }
        .in_current_span(),
    )
}

async fn join_stage(name: &'static str, mut handle: JoinHandle<()>, deadline: Instant) {
    match tokio::time::timeout_at(deadline, &mut handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "{name} task did not complete"),
        Err(_) => {
            warn!("{name} did not stop within the shutdown grace period, aborting");
            handle.abort();
        }
    }
}
