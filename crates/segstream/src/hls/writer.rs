// HLS Stream Writer: drains the output buffer into the caller's sink.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::StreamError;
use crate::hls::events::{EventSender, StreamEvent};
use crate::hls::manifest::InitSection;
use crate::hls::output::{Delivery, OrderedBuffer, SegmentPayload};

/// Totals accumulated by a [`StreamWriter`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub segments_written: u64,
    pub bytes_written: u64,
    pub skipped: u64,
}

fn sink_closed(err: io::Error) -> StreamError {
    if err.kind() == io::ErrorKind::BrokenPipe {
        warn!("Broken pipe detected: consumer closed the connection");
        StreamError::SinkClosed {
            reason: "consumer closed the connection".to_string(),
        }
    } else {
        StreamError::SinkClosed {
            reason: err.to_string(),
        }
    }
}

pub struct StreamWriter<W> {
    sink: W,
    buffer: Arc<OrderedBuffer>,
    events: EventSender,
    token: CancellationToken,
    stats: WriterStats,
    /// Init section most recently written to the sink
    last_init: Option<InitSection>,
}

impl<W: AsyncWrite + Unpin + Send> StreamWriter<W> {
    pub fn new(
        sink: W,
        buffer: Arc<OrderedBuffer>,
        events: EventSender,
        token: CancellationToken,
    ) -> Self {
        Self {
            sink,
            buffer,
            events,
            token,
            stats: WriterStats::default(),
            last_init: None,
        }
    }

    /// Writes every delivery until the stream ends or fails. The sink is shut
    /// down on every path; a sink error cancels the whole pipeline.
    pub async fn run(mut self) -> (WriterStats, Result<(), StreamError>) {
        let mut result = self.drain().await;

        let shutdown = self.sink.shutdown().await;
        match (&result, shutdown) {
            (Ok(()), Err(e)) => result = Err(sink_closed(e)),
            (Err(_), Err(e)) => debug!(error = %e, "Sink shutdown failed"),
            (_, Ok(())) => {}
        }

        if let Err(StreamError::SinkClosed { .. }) = &result {
            self.token.cancel();
        }
        (self.stats, result)
    }

    async fn drain(&mut self) -> Result<(), StreamError> {
        loop {
            let delivery = tokio::select! {
                biased;
                _ = self.token.cancelled() => return Err(StreamError::Cancelled),
                delivery = self.buffer.next_ready() => delivery?,
            };

            match delivery {
                Delivery::Segment(payload) => {
                    if payload.discontinuity {
                        info!(msn = payload.sequence, "Discontinuity");
                        self.events.emit(StreamEvent::Discontinuity {
                            sequence: payload.sequence,
                        });
                    }
                    self.write_segment(payload).await?;
                }
                Delivery::Skipped {
                    sequence,
                    count,
                    reason,
                } => {
                    warn!(msn = sequence, count, %reason, "Segment skipped");
                    self.stats.skipped += count;
                    self.events.emit(StreamEvent::SegmentSkipped {
                        sequence,
                        count,
                        reason,
                    });
                }
                Delivery::Ended => {
                    self.sink.flush().await.map_err(sink_closed)?;
                    info!(
                        segments = self.stats.segments_written,
                        bytes = self.stats.bytes_written,
                        skipped = self.stats.skipped,
                        "Stream ended"
                    );
                    return Ok(());
                }
            }
        }
    }

    /// Writes the segment, preceded by its init section when that differs from
    /// the last one written.
    async fn write_segment(&mut self, payload: SegmentPayload) -> Result<(), StreamError> {
        if let Some(init) = &payload.init
            && self.last_init.as_ref() != Some(&init.section)
        {
            self.write_bytes(&init.data).await?;
            self.stats.bytes_written += init.data.len() as u64;
            self.last_init = Some(init.section.clone());
            debug!(msn = payload.sequence, uri = %init.section.uri, "Init section written");
        }

        self.write_bytes(&payload.data).await?;
        self.stats.segments_written += 1;
        self.stats.bytes_written += payload.data.len() as u64;
        debug!(msn = payload.sequence, len = payload.data.len(), "Segment written");
        Ok(())
    }

    async fn write_bytes(&mut self, data: &[u8]) -> Result<(), StreamError> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(StreamError::Cancelled),
            written = self.sink.write_all(data) => written.map_err(sink_closed),
        }
    }
}
