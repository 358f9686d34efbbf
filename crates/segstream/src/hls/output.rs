// HLS Output Buffer: reorders completed fetches by media sequence number and
// releases them strictly in order, applying backpressure to fetchers.

use std::collections::BTreeMap;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::error::StreamError;
use crate::hls::manifest::InitSection;

/// Media initialization bytes attached to every segment that declares a map.
/// The writer decides at release time whether they reach the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitPayload {
    pub section: InitSection,
    pub data: Bytes,
}

/// A decrypted segment body ready for the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentPayload {
    pub sequence: u64,
    pub data: Bytes,
    pub discontinuity: bool,
    pub init: Option<InitPayload>,
}

/// Outcome of one fetch task, consumed exactly once by the buffer.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub sequence: u64,
    pub outcome: Result<SegmentPayload, StreamError>,
}

impl FetchResult {
    pub fn ok(payload: SegmentPayload) -> Self {
        Self {
            sequence: payload.sequence,
            outcome: Ok(payload),
        }
    }

    pub fn err(sequence: u64, error: StreamError) -> Self {
        Self {
            sequence,
            outcome: Err(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Segment(SegmentPayload),
    /// Placeholder for `count` consecutive sequences starting at `sequence`
    /// that will never be delivered
    Skipped {
        sequence: u64,
        count: u64,
        reason: String,
    },
    /// The final sequence has been released
    Ended,
}

/// Counters for observability of the reorder buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub released: u64,
    pub skipped: u64,
    pub stale: u64,
    pub duplicates: u64,
    /// Results currently held
    pub held: usize,
}

#[derive(Debug)]
enum Slot {
    Ready(SegmentPayload),
    /// Covers `count` sequences from its key
    Skipped { reason: String, count: u64 },
}

impl Slot {
    fn span(&self) -> u64 {
        match self {
            Slot::Ready(_) => 1,
            Slot::Skipped { count, .. } => *count,
        }
    }
}

#[derive(Debug, Default)]
struct BufferState {
    /// Next sequence to release; `None` until the first manifest is known
    expected_next: Option<u64>,
    slots: BTreeMap<u64, Slot>,
    finished: bool,
    final_sequence: Option<u64>,
    terminal: Option<StreamError>,
    aborted: bool,
    stats: BufferStats,
}

impl BufferState {
    fn is_ended(&self) -> bool {
        if !self.finished {
            return false;
        }
        match (self.expected_next, self.final_sequence) {
            (_, None) => true,
            (Some(next), Some(last)) => next > last,
            (None, Some(_)) => false,
        }
    }

    fn is_stale(&self, sequence: u64) -> bool {
        self.expected_next.is_some_and(|next| sequence < next)
            || self.final_sequence.is_some_and(|last| sequence > last)
    }

    /// Whether `sequence` already falls inside a held slot.
    fn is_held(&self, sequence: u64) -> bool {
        self.slots
            .range(..=sequence)
            .next_back()
            .is_some_and(|(start, slot)| sequence - start < slot.span())
    }
}

/// Reorder buffer keyed by media sequence number.
///
/// `submit` may be called from many fetch tasks at once; a single consumer
/// drains it with [`OrderedBuffer::next_ready`].
pub struct OrderedBuffer {
    state: Mutex<BufferState>,
    capacity: usize,
    readable: Notify,
    writable: Notify,
}

impl OrderedBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(BufferState::default()),
            capacity: capacity.max(1),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    /// Sets the first sequence to release. Later calls are ignored.
    pub fn begin(&self, first_sequence: u64) {
        let mut state = self.state.lock();
        if state.expected_next.is_some() {
            return;
        }
        state.expected_next = Some(first_sequence);
        // Anything queued below the start can never be released.
        let kept = state.slots.split_off(&first_sequence);
        let dropped = std::mem::replace(&mut state.slots, kept).len();
        state.stats.stale += dropped as u64;
        drop(state);
        debug!(first_sequence, "Output buffer started");
        self.readable.notify_waiters();
    }

    /// Marks the last sequence of the stream. `None` means no segment will ever
    /// be released.
    pub fn set_final(&self, last_sequence: Option<u64>) {
        let mut state = self.state.lock();
        state.finished = true;
        state.final_sequence = last_sequence;
        drop(state);
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    /// Hands a completed fetch to the buffer.
    ///
    /// The next expected sequence is always admitted. Any other sequence waits
    /// while `capacity` results are already held.
    pub async fn submit(&self, result: FetchResult) {
        let sequence = result.sequence;
        let slot = match result.outcome {
            Ok(payload) => Slot::Ready(payload),
            Err(e) => Slot::Skipped {
                reason: e.to_string(),
                count: 1,
            },
        };

        let mut slot = Some(slot);
        loop {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.aborted || state.terminal.is_some() {
                    return;
                }
                if state.is_stale(sequence) {
                    state.stats.stale += 1;
                    trace!(msn = sequence, "Dropping stale segment");
                    return;
                }
                if state.is_held(sequence) {
                    state.stats.duplicates += 1;
                    trace!(msn = sequence, "Dropping duplicate segment");
                    return;
                }
                if state.expected_next == Some(sequence) || state.slots.len() < self.capacity {
                    if let Some(slot) = slot.take() {
                        state.slots.insert(sequence, slot);
                    }
                    state.stats.held = state.slots.len();
                    drop(state);
                    self.readable.notify_waiters();
                    return;
                }
            }

            trace!(msn = sequence, "Output buffer full, waiting for drain");
            notified.await;
        }
    }

    /// Records that `count` sequences starting at `sequence` will never be
    /// fetched. The whole range takes one slot. Never blocks.
    pub fn mark_skipped(&self, sequence: u64, count: u64, reason: impl Into<String>) {
        let mut state = self.state.lock();
        if count == 0 || state.aborted || state.is_stale(sequence) || state.is_held(sequence) {
            return;
        }
        let mut count = count;
        if let Some(last) = state.final_sequence {
            count = count.min((last - sequence).saturating_add(1));
        }
        // Clip at the next held slot so ranges never overlap.
        if let Some((&held, _)) = state.slots.range(sequence..).next() {
            count = count.min(held - sequence);
        }
        state.slots.insert(
            sequence,
            Slot::Skipped {
                reason: reason.into(),
                count,
            },
        );
        state.stats.held = state.slots.len();
        drop(state);
        self.readable.notify_waiters();
    }

    /// Waits for the next deliverable item in sequence order.
    ///
    /// After [`OrderedBuffer::fail`], contiguous results are still delivered
    /// before the error.
    pub async fn next_ready(&self) -> Result<Delivery, StreamError> {
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.aborted {
                    return Err(state.terminal.clone().unwrap_or(StreamError::Cancelled));
                }
                if let Some(next) = state.expected_next
                    && let Some(slot) = state.slots.remove(&next)
                {
                    state.expected_next = Some(next.saturating_add(slot.span()));
                    state.stats.held = state.slots.len();
                    let delivery = match slot {
                        Slot::Ready(payload) => {
                            state.stats.released += 1;
                            Delivery::Segment(payload)
                        }
                        Slot::Skipped { reason, count } => {
                            state.stats.skipped += count;
                            Delivery::Skipped {
                                sequence: next,
                                count,
                                reason,
                            }
                        }
                    };
                    drop(state);
                    self.writable.notify_waiters();
                    return Ok(delivery);
                }
                if state.is_ended() {
                    return Ok(Delivery::Ended);
                }
                if let Some(err) = &state.terminal {
                    return Err(err.clone());
                }
            }

            notified.await;
        }
    }

    /// Records a terminal error. Already-contiguous results are still delivered.
    pub fn fail(&self, err: StreamError) {
        let mut state = self.state.lock();
        if state.terminal.is_none() {
            warn!(error = %err, "Output buffer failed");
            state.terminal = Some(err);
        }
        drop(state);
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    /// Unblocks every waiter immediately; held results are discarded.
    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.aborted = true;
        state.slots.clear();
        state.stats.held = 0;
        drop(state);
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    pub fn stats(&self) -> BufferStats {
        self.state.lock().stats
    }
}
