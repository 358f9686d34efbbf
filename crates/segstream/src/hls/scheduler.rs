// HLS Segment Scheduler: runs a bounded pool of concurrent segment fetches and
// hands their results to the output buffer.

use std::sync::Arc;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::StreamError;
use crate::hls::fetcher::SegmentDownloader;
use crate::hls::output::{FetchResult, OrderedBuffer};
use crate::hls::reconciler::FetchJob;

pub struct SegmentScheduler {
    downloader: Arc<dyn SegmentDownloader>,
    jobs: mpsc::Receiver<FetchJob>,
    buffer: Arc<OrderedBuffer>,
    download_concurrency: usize,
    token: CancellationToken,
}

impl SegmentScheduler {
    pub fn new(
        downloader: Arc<dyn SegmentDownloader>,
        jobs: mpsc::Receiver<FetchJob>,
        buffer: Arc<OrderedBuffer>,
        download_concurrency: usize,
        token: CancellationToken,
    ) -> Self {
        Self {
            downloader,
            jobs,
            buffer,
            download_concurrency: download_concurrency.max(1),
            token,
        }
    }

    /// Downloads one job and submits the outcome. The concurrency slot stays
    /// taken while the buffer applies backpressure.
    async fn process(
        downloader: Arc<dyn SegmentDownloader>,
        buffer: Arc<OrderedBuffer>,
        job: FetchJob,
    ) {
        let sequence = job.sequence();
        let result = match downloader.download(&job).await {
            Ok(payload) => {
                trace!(msn = sequence, len = payload.data.len(), "Segment ready");
                FetchResult::ok(payload)
            }
            Err(StreamError::Cancelled) => return,
            Err(e) => {
                warn!(msn = sequence, uri = %job.segment.uri, error = %e, "Giving up on segment");
                FetchResult::err(sequence, e)
            }
        };
        buffer.submit(result).await;
    }

    /// Runs until the job queue is closed and drained, or the token is
    /// cancelled. In-flight fetches are dropped on cancellation.
    pub async fn run(mut self) {
        info!(
            concurrency = self.download_concurrency,
            "SegmentScheduler started"
        );
        let mut in_flight = FuturesUnordered::new();
        let mut queue_closed = false;

        loop {
            if queue_closed && in_flight.is_empty() {
                debug!("Job queue drained, SegmentScheduler stopping");
                break;
            }
            let can_accept_more = in_flight.len() < self.download_concurrency;

            tokio::select! {
                biased;

                _ = self.token.cancelled() => {
                    info!(in_flight = in_flight.len(), "Cancellation received, SegmentScheduler stopping");
                    break;
                }

                Some(()) = in_flight.next(), if !in_flight.is_empty() => {}

                job = self.jobs.recv(), if !queue_closed && can_accept_more => {
                    match job {
                        Some(job) => {
                            trace!(msn = job.sequence(), "Dispatching segment job");
                            in_flight.push(Self::process(
                                Arc::clone(&self.downloader),
                                Arc::clone(&self.buffer),
                                job,
                            ));
                        }
                        None => queue_closed = true,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hls::manifest::SegmentDescriptor;
    use crate::hls::output::{Delivery, SegmentPayload};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use url::Url;

    /// Completes jobs in reverse-ish order and records peak concurrency.
    struct SlowDownloader {
        active: AtomicUsize,
        peak: AtomicUsize,
        fail: Option<u64>,
    }

    impl SlowDownloader {
        fn new(fail: Option<u64>) -> Arc<Self> {
            Arc::new(Self {
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl SegmentDownloader for SlowDownloader {
        async fn download(&self, job: &FetchJob) -> Result<SegmentPayload, StreamError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let sequence = job.sequence();
            tokio::time::sleep(Duration::from_millis(50 - (sequence % 5) * 10)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            if self.fail == Some(sequence) {
                return Err(StreamError::SegmentRejected {
                    sequence,
                    reason: "HTTP 404".into(),
                });
            }
            Ok(SegmentPayload {
                sequence,
                data: Bytes::from(sequence.to_string()),
                discontinuity: false,
                init: None,
            })
        }
    }

    fn job(sequence: u64) -> FetchJob {
        FetchJob {
            segment: Arc::new(SegmentDescriptor {
                sequence,
                uri: Url::parse(&format!("https://cdn.example.com/{sequence}.ts")).unwrap(),
                byte_range: None,
                duration: 1.0,
                discontinuity: false,
                key: None,
                init: None,
            }),
        }
    }

    async fn drain(buffer: &OrderedBuffer) -> Vec<Delivery> {
        let mut out = Vec::new();
        loop {
            match buffer.next_ready().await.unwrap() {
                Delivery::Ended => return out,
                other => out.push(other),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn respects_concurrency_and_delivers_in_order() {
        let downloader = SlowDownloader::new(None);
        let buffer = Arc::new(OrderedBuffer::new(4));
        let (tx, rx) = mpsc::channel(4);
        let scheduler = SegmentScheduler::new(
            downloader.clone(),
            rx,
            buffer.clone(),
            3,
            CancellationToken::new(),
        );
        let handle = tokio::spawn(scheduler.run());

        buffer.begin(0);
        tokio::spawn(async move {
            for seq in 0..10 {
                tx.send(job(seq)).await.unwrap();
            }
        });
        buffer.set_final(Some(9));

        let delivered: Vec<u64> = drain(&buffer)
            .await
            .into_iter()
            .map(|d| match d {
                Delivery::Segment(p) => p.sequence,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(delivered, (0..10).collect::<Vec<_>>());
        assert!(downloader.peak.load(Ordering::SeqCst) <= 3);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_segment_becomes_skip() {
        let downloader = SlowDownloader::new(Some(2));
        let buffer = Arc::new(OrderedBuffer::new(4));
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(
            SegmentScheduler::new(downloader, rx, buffer.clone(), 2, CancellationToken::new())
                .run(),
        );
        buffer.begin(0);
        for seq in 0..5 {
            tx.send(job(seq)).await.unwrap();
        }
        drop(tx);
        buffer.set_final(Some(4));

        let delivered = drain(&buffer).await;
        assert_eq!(delivered.len(), 5);
        assert!(matches!(&delivered[2], Delivery::Skipped {
                sequence: 2,
                count: 1,
                ..
            }));
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_dispatching() {
        let downloader = SlowDownloader::new(None);
        let buffer = Arc::new(OrderedBuffer::new(4));
        let (tx, rx) = mpsc::channel(8);
        let token = CancellationToken::new();
        let handle = tokio::spawn(
            SegmentScheduler::new(downloader.clone(), rx, buffer.clone(), 2, token.clone())
                .run(),
        );
        for seq in 0..8 {
            tx.send(job(seq)).await.unwrap();
        }
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler should stop promptly")
            .unwrap();
        assert!(tx.send(job(9)).await.is_err());
    }
}
