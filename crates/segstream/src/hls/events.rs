use tokio::sync::mpsc;

use crate::error::StreamError;

/// Non-fatal notifications emitted while a session runs.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    PlaylistRefreshed {
        media_sequence_base: u64,
        target_duration: f64,
        /// Sequences past the watermark found by this reload
        new_segments: usize,
    },
    /// `count` consecutive sequences starting at `sequence` will never be
    /// written. A fetch that exhausted its retries or a rejected entry covers
    /// one sequence; a playlist gap covers the whole missing range.
    SegmentSkipped {
        sequence: u64,
        count: u64,
        reason: String,
    },
    /// The segment carries a manifest-signalled discontinuity
    Discontinuity { sequence: u64 },
    ManifestReloadFailed {
        consecutive_failures: u32,
        error: StreamError,
    },
    StreamStalled { reloads: u32, waited_secs: f64 },
    SessionEnded {
        segments_written: u64,
        bytes_written: u64,
        skipped: u64,
        error: Option<StreamError>,
    },
}

/// Cloneable sending half handed to every pipeline stage.
///
/// Events are best effort: a dropped receiver never affects the session.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Option<mpsc::UnboundedSender<StreamEvent>>,
}

impl EventSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sender that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: StreamEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
