// HLS Playlist Reconciler: turns successive manifest snapshots into fetch jobs
// and skip marks, and drives live playlist polling.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::StreamError;
use crate::hls::config::PlaylistConfig;
use crate::hls::events::{EventSender, StreamEvent};
use crate::hls::manifest::{ManifestEntry, ManifestState, SegmentDescriptor};
use crate::hls::output::OrderedBuffer;
use crate::hls::playlist::ManifestSource;
use crate::hls::retry::{RetryAction, retry_with_backoff};

/// A segment handed to the fetch pool.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchJob {
    pub segment: Arc<SegmentDescriptor>,
}

impl FetchJob {
    pub fn sequence(&self) -> u64 {
        self.segment.sequence
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipMark {
    pub sequence: u64,
    /// Consecutive sequences covered, starting at `sequence`
    pub count: u64,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerState {
    Initial,
    LivePolling,
    /// End of stream seen; no more reloads
    Draining,
    /// Every job of a drained stream has been dispatched
    Ended,
    Failed,
}

/// What one manifest snapshot contributes to the session.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReconcileOutcome {
    /// First sequence of the session, set on the first load only
    pub start_sequence: Option<u64>,
    pub enqueue: Vec<FetchJob>,
    pub skipped: Vec<SkipMark>,
    /// Manifest entries past the watermark (gaps excluded)
    pub new_entries: usize,
    pub ended: bool,
    /// Last sequence of the stream when `ended`; `None` if nothing was ever queued
    pub final_sequence: Option<u64>,
}

/// Pure state machine comparing each snapshot against the previous ones.
#[derive(Debug, Clone)]
pub struct Reconciler {
    state: ReconcilerState,
    /// Next sequence to enqueue; never decreases
    next_sequence: Option<u64>,
    start_sequence: Option<u64>,
    live_edge: usize,
    start_offset: Option<f64>,
    duration_limit: Option<f64>,
    enqueued_duration: f64,
}

impl Reconciler {
    pub fn new(config: &PlaylistConfig) -> Self {
        Self {
            state: ReconcilerState::Initial,
            next_sequence: None,
            start_sequence: None,
            live_edge: config.live_edge.max(1),
            start_offset: config.start_offset.map(|d| d.as_secs_f64()),
            duration_limit: config.duration_limit.map(|d| d.as_secs_f64()),
            enqueued_duration: 0.0,
        }
    }

    pub fn state(&self) -> ReconcilerState {
        self.state
    }

    pub fn next_sequence(&self) -> Option<u64> {
        self.next_sequence
    }

    pub fn fail(&mut self) {
        self.state = ReconcilerState::Failed;
    }

    pub fn finish(&mut self) {
        if self.state == ReconcilerState::Draining {
            self.state = ReconcilerState::Ended;
        }
    }

    fn limit_reached(&self) -> bool {
        self.duration_limit
            .is_some_and(|limit| self.enqueued_duration >= limit)
    }

    /// Index of the first entry to enqueue on the first load.
    fn initial_start(&self, manifest: &ManifestState) -> usize {
        if !manifest.is_endlist {
            return manifest.entries.len().saturating_sub(self.live_edge);
        }
        let Some(offset) = self.start_offset else {
            return 0;
        };
        let mut elapsed = 0.0;
        for (idx, entry) in manifest.entries.iter().enumerate() {
            if elapsed + entry.duration() > offset {
                return idx;
            }
            elapsed += entry.duration();
        }
        manifest.entries.len()
    }

    pub fn apply(&mut self, manifest: &ManifestState) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();
        if !matches!(
            self.state,
            ReconcilerState::Initial | ReconcilerState::LivePolling
        ) {
            return outcome;
        }

        let entries = &manifest.entries;
        let start_idx = match self.next_sequence {
            None => {
                let idx = self.initial_start(manifest);
                if let Some(first) = entries.get(idx).map(ManifestEntry::sequence) {
                    if idx > 0 {
                        debug!(first, skipped = idx, "Starting inside the playlist");
                    }
                    self.next_sequence = Some(first);
                    self.start_sequence = Some(first);
                    outcome.start_sequence = Some(first);
                }
                idx
            }
            Some(next) => {
                if let Some(first) = entries.first().map(ManifestEntry::sequence)
                    && first > next
                {
                    warn!(
                        from = next,
                        to = first - 1,
                        "Segments left the playlist before they could be fetched"
                    );
                    outcome.skipped.push(SkipMark {
                        sequence: next,
                        count: first - next,
                        reason: "segment left the playlist before it could be fetched"
                            .to_string(),
                    });
                    self.next_sequence = Some(first);
                }
                let next = self.next_sequence.unwrap_or(next);
                entries.partition_point(|entry| entry.sequence() < next)
            }
        };

        for entry in &entries[start_idx..] {
            if self.limit_reached() {
                info!("Duration limit reached, stopping");
                break;
            }
            outcome.new_entries += 1;
            match entry {
                ManifestEntry::Rejected(rejected) => outcome.skipped.push(SkipMark {
                    sequence: rejected.sequence,
                    count: 1,
                    reason: rejected.reason.clone(),
                }),
                ManifestEntry::Segment(segment) => outcome.enqueue.push(FetchJob {
                    segment: Arc::clone(segment),
                }),
            }
            self.enqueued_duration += entry.duration();
            self.next_sequence = Some(entry.sequence().saturating_add(1));
        }

        if manifest.is_endlist || self.limit_reached() {
            self.state = ReconcilerState::Draining;
            outcome.ended = true;
            outcome.final_sequence = match (self.start_sequence, self.next_sequence) {
                (Some(start), Some(next)) if next > start => Some(next - 1),
                _ => None,
            };
        } else if self.state == ReconcilerState::Initial {
            self.state = ReconcilerState::LivePolling;
        }
        outcome
    }
}

/// Consecutive reloads without new segments.
struct StallTracker {
    empty_reloads: u32,
    last_progress: Instant,
}

impl StallTracker {
    fn new() -> Self {
        Self {
            empty_reloads: 0,
            last_progress: Instant::now(),
        }
    }

    fn record(&mut self, new_entries: usize) {
        if new_entries > 0 {
            self.empty_reloads = 0;
            self.last_progress = Instant::now();
        } else {
            self.empty_reloads += 1;
        }
    }

    fn stalled(&self, config: &PlaylistConfig) -> Option<StreamError> {
        let waited = self.last_progress.elapsed();
        (self.empty_reloads >= config.stall_reload_count && waited >= config.stall_timeout).then(
            || StreamError::StreamStalled {
                reloads: self.empty_reloads,
                waited_secs: waited.as_secs_f64(),
            },
        )
    }
}

/// Drives the [`Reconciler`]: fetches the manifest, dispatches jobs and skip
/// marks, and reloads live playlists until end of stream.
pub struct PlaylistReconciler {
    source: Arc<dyn ManifestSource>,
    url: Url,
    config: PlaylistConfig,
    reconciler: Reconciler,
    buffer: Arc<OrderedBuffer>,
    jobs: mpsc::Sender<FetchJob>,
    events: EventSender,
    token: CancellationToken,
}

impl PlaylistReconciler {
    pub fn new(
        source: Arc<dyn ManifestSource>,
        url: Url,
        config: PlaylistConfig,
        buffer: Arc<OrderedBuffer>,
        jobs: mpsc::Sender<FetchJob>,
        events: EventSender,
        token: CancellationToken,
    ) -> Self {
        Self {
            reconciler: Reconciler::new(&config),
            source,
            url,
            config,
            buffer,
            jobs,
            events,
            token,
        }
    }

    /// State of the underlying [`Reconciler`], `Failed` once `run` returned a
    /// non-cancellation error.
    pub fn state(&self) -> ReconcilerState {
        self.reconciler.state()
    }

    pub async fn run(&mut self) -> Result<(), StreamError> {
        let result = self.drive().await;
        match &result {
            Ok(()) => debug!(url = %self.url, "Playlist reconciler finished"),
            Err(StreamError::Cancelled) => debug!(url = %self.url, "Playlist reconciler cancelled"),
            Err(e) => {
                self.reconciler.fail();
                error!(url = %self.url, error = %e, "Playlist reconciler failed");
            }
        }
        result
    }

    async fn drive(&mut self) -> Result<(), StreamError> {
        let mut manifest = self.initial_manifest().await?;
        let mut stall = StallTracker::new();
        let mut first_load = true;

        loop {
            let outcome = self.reconciler.apply(&manifest);
            self.events.emit(StreamEvent::PlaylistRefreshed {
                media_sequence_base: manifest.media_sequence_base,
                target_duration: manifest.target_duration,
                new_segments: outcome.new_entries,
            });
            stall.record(outcome.new_entries);

            if self.dispatch(outcome).await? {
                self.reconciler.finish();
                info!(url = %self.url, "End of stream, no more reloads");
                return Ok(());
            }
            if first_load {
                info!(url = %self.url, "Live playlist, polling for new segments");
                first_load = false;
            }

            if let Some(err) = stall.stalled(&self.config) {
                if let StreamError::StreamStalled {
                    reloads,
                    waited_secs,
                } = &err
                {
                    self.events.emit(StreamEvent::StreamStalled {
                        reloads: *reloads,
                        waited_secs: *waited_secs,
                    });
                }
                return Err(err);
            }

            let delay = manifest
                .reload_interval(self.config.reload_time, self.config.live_edge)
                .max(self.config.reload_floor);
            self.sleep(delay).await?;
            manifest = self.reload().await?;
        }
    }

    /// Hands one outcome to the buffer and the fetch pool. Returns whether the
    /// stream has ended.
    async fn dispatch(&self, outcome: ReconcileOutcome) -> Result<bool, StreamError> {
        if let Some(start) = outcome.start_sequence {
            self.buffer.begin(start);
        }
        for skip in outcome.skipped {
            debug!(
                msn = skip.sequence,
                count = skip.count,
                reason = %skip.reason,
                "Marking segments skipped"
            );
            self.buffer
                .mark_skipped(skip.sequence, skip.count, skip.reason);
        }
        for job in outcome.enqueue {
            let sequence = job.sequence();
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return Err(StreamError::Cancelled),
                sent = self.jobs.send(job) => sent.map_err(|_| {
                    StreamError::internal(format!("segment scheduler stopped before job {sequence}"))
                })?,
            }
        }
        if outcome.ended {
            self.buffer.set_final(outcome.final_sequence);
        }
        Ok(outcome.ended)
    }

    /// Malformed initial playlists are fatal; transient failures follow the
    /// playlist retry policy.
    async fn initial_manifest(&self) -> Result<ManifestState, StreamError> {
        let source = &self.source;
        let url = &self.url;
        let token = &self.token;
        let events = &self.events;
        retry_with_backoff(&self.config.retry, token, "playlist", move |attempt| async move {
            let result = source.fetch(url, token).await;
            if let Err(e) = &result
                && e.is_retryable()
            {
                events.emit(StreamEvent::ManifestReloadFailed {
                    consecutive_failures: attempt + 1,
                    error: e.clone(),
                });
            }
            RetryAction::from(result)
        })
        .await
    }

    /// Every reload failure, parse errors included, counts toward the limit.
    async fn reload(&self) -> Result<ManifestState, StreamError> {
        let mut failures = 0u32;
        loop {
            match self.source.fetch(&self.url, &self.token).await {
                Ok(manifest) => {
                    if failures > 0 {
                        info!(url = %self.url, failures, "Playlist reload recovered");
                    }
                    return Ok(manifest);
                }
                Err(StreamError::Cancelled) => return Err(StreamError::Cancelled),
                Err(e) => {
                    failures += 1;
                    warn!(
                        url = %self.url,
                        attempt = failures,
                        max = self.config.retry.max_retries,
                        error = %e,
                        "Playlist reload failed"
                    );
                    self.events.emit(StreamEvent::ManifestReloadFailed {
                        consecutive_failures: failures,
                        error: e.clone(),
                    });
                    if failures > self.config.retry.max_retries {
                        return Err(e);
                    }
                    self.sleep(self.config.retry.delay_for_attempt(failures - 1))
                        .await?;
                }
            }
        }
    }

    async fn sleep(&self, delay: Duration) -> Result<(), StreamError> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(StreamError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hls::manifest::RejectedSegment;
    use crate::hls::output::Delivery;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    fn url() -> Url {
        Url::parse("https://cdn.example.com/live.m3u8").unwrap()
    }

    fn descriptor(sequence: u64) -> Arc<SegmentDescriptor> {
        Arc::new(SegmentDescriptor {
            sequence,
            uri: url().join(&format!("seg{sequence}.ts")).unwrap(),
            byte_range: None,
            duration: 2.0,
            discontinuity: false,
            key: None,
            init: None,
        })
    }

    fn manifest(sequences: std::ops::Range<u64>, endlist: bool) -> ManifestState {
        ManifestState {
            entries: sequences
                .clone()
                .map(|seq| ManifestEntry::Segment(descriptor(seq)))
                .collect(),
            media_sequence_base: sequences.start,
            target_duration: 2.0,
            is_endlist: endlist,
            reload_uri: url(),
        }
    }

    fn sequences(outcome: &ReconcileOutcome) -> Vec<u64> {
        outcome.enqueue.iter().map(FetchJob::sequence).collect()
    }

    fn reconciler() -> Reconciler {
        Reconciler::new(&PlaylistConfig::default())
    }

    #[test]
    fn live_first_load_starts_at_live_edge() {
        let mut r = reconciler();
        let outcome = r.apply(&manifest(10..20, false));
        assert_eq!(sequences(&outcome), vec![17, 18, 19]);
        assert_eq!(outcome.start_sequence, Some(17));
        assert!(!outcome.ended);
        assert_eq!(r.state(), ReconcilerState::LivePolling);
    }

    #[test]
    fn on_demand_first_load_enqueues_everything_and_drains() {
        let mut r = reconciler();
        let outcome = r.apply(&manifest(0..5, true));
        assert_eq!(sequences(&outcome), vec![0, 1, 2, 3, 4]);
        assert!(outcome.ended);
        assert_eq!(outcome.final_sequence, Some(4));
        assert_eq!(r.state(), ReconcilerState::Draining);

        // Further snapshots are ignored once draining.
        assert_eq!(r.apply(&manifest(0..8, true)), ReconcileOutcome::default());
        r.finish();
        assert_eq!(r.state(), ReconcilerState::Ended);
    }

    #[test]
    fn reload_enqueues_only_past_watermark() {
        let mut r = reconciler();
        r.apply(&manifest(1..4, false));
        let outcome = r.apply(&manifest(2..6, false));
        assert_eq!(sequences(&outcome), vec![4, 5]);
        assert_eq!(outcome.new_entries, 2);
        assert!(outcome.skipped.is_empty());
        assert_eq!(r.next_sequence(), Some(6));
    }

    #[test]
    fn backward_reload_is_ignored() {
        let mut r = reconciler();
        r.apply(&manifest(10..13, false));
        let outcome = r.apply(&manifest(5..9, false));
        assert!(outcome.enqueue.is_empty());
        assert!(outcome.skipped.is_empty());
        assert_eq!(outcome.new_entries, 0);
        assert_eq!(r.next_sequence(), Some(13));
    }

    #[test]
    fn window_slip_records_one_range_of_k_skips() {
        let mut r = reconciler();
        r.apply(&manifest(1..4, false));
        let outcome = r.apply(&manifest(9..12, false));
        assert_eq!(
            outcome.skipped,
            vec![SkipMark {
                sequence: 4,
                count: 5,
                reason: "segment left the playlist before it could be fetched".into()
            }]
        );
        assert_eq!(sequences(&outcome), vec![9, 10, 11]);
    }

    #[test]
    fn huge_sequence_jump_is_a_single_mark() {
        let mut r = reconciler();
        r.apply(&manifest(1..4, false));
        let outcome = r.apply(&manifest(1_000_000_000..1_000_000_003, false));
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].sequence, 4);
        assert_eq!(outcome.skipped[0].count, 999_999_996);
        assert_eq!(
            sequences(&outcome),
            vec![1_000_000_000, 1_000_000_001, 1_000_000_002]
        );
        assert_eq!(r.next_sequence(), Some(1_000_000_003));
    }

    #[test]
    fn rejected_entries_become_skips() {
        let mut state = manifest(0..3, true);
        state.entries[1] = ManifestEntry::Rejected(RejectedSegment {
            sequence: 1,
            duration: 2.0,
            reason: "Missing BYTERANGE offset".into(),
        });
        let outcome = reconciler().apply(&state);
        assert_eq!(sequences(&outcome), vec![0, 2]);
        assert_eq!(
            outcome.skipped,
            vec![SkipMark {
                sequence: 1,
                count: 1,
                reason: "Missing BYTERANGE offset".into()
            }]
        );
        assert_eq!(outcome.final_sequence, Some(2));
    }

    #[test]
    fn start_offset_skips_leading_on_demand_segments() {
        let config = PlaylistConfig {
            start_offset: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let outcome = Reconciler::new(&config).apply(&manifest(0..5, true));
        // 2s segments: 0..2, 2..4 end before 5s; 4..6 contains it
        assert_eq!(sequences(&outcome), vec![2, 3, 4]);
        assert_eq!(outcome.start_sequence, Some(2));
    }

    #[test]
    fn start_offset_past_the_end_ends_empty() {
        let config = PlaylistConfig {
            start_offset: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        let outcome = Reconciler::new(&config).apply(&manifest(0..5, true));
        assert!(outcome.enqueue.is_empty());
        assert!(outcome.ended);
        assert_eq!(outcome.start_sequence, None);
        assert_eq!(outcome.final_sequence, None);
    }

    #[test]
    fn duration_limit_stops_enqueuing_and_drains() {
        let config = PlaylistConfig {
            duration_limit: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let mut r = Reconciler::new(&config);
        let outcome = r.apply(&manifest(0..2, false));
        assert!(!outcome.ended);
        let outcome = r.apply(&manifest(0..6, false));
        assert_eq!(sequences(&outcome), vec![2]);
        assert!(outcome.ended);
        assert_eq!(outcome.final_sequence, Some(2));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Adversarial reload windows never move the watermark backwards and
        /// never enqueue a sequence twice.
        #[test]
        fn prop_watermark_is_monotonic(
            windows in proptest::collection::vec((0u64..60, 0u64..8), 1..25),
        ) {
            let mut r = reconciler();
            let mut last_next = None;
            let mut seen = Vec::new();
            for (base, len) in windows {
                if len == 0 {
                    continue;
                }
                let outcome = r.apply(&manifest(base..base + len, false));
                seen.extend(sequences(&outcome));
                seen.extend(
                    outcome
                        .skipped
                        .iter()
                        .flat_map(|s| s.sequence..s.sequence + s.count),
                );
                let next = r.next_sequence();
                prop_assert!(next >= last_next);
                last_next = next;
            }
            let mut sorted = seen.clone();
            sorted.sort_unstable();
            sorted.dedup();
            prop_assert_eq!(sorted.len(), seen.len());
        }
    }

    struct ScriptedSource {
        responses: Mutex<VecDeque<Result<ManifestState, StreamError>>>,
    }

    #[async_trait]
    impl ManifestSource for ScriptedSource {
        async fn fetch(
            &self,
            _url: &Url,
            _token: &CancellationToken,
        ) -> Result<ManifestState, StreamError> {
            let mut responses = self.responses.lock();
            if responses.len() > 1 {
                responses.pop_front().unwrap()
            } else {
                responses.front().cloned().unwrap()
            }
        }
    }

    fn runner(
        responses: Vec<Result<ManifestState, StreamError>>,
        config: PlaylistConfig,
    ) -> (
        PlaylistReconciler,
        Arc<OrderedBuffer>,
        mpsc::Receiver<FetchJob>,
        tokio::sync::mpsc::UnboundedReceiver<StreamEvent>,
    ) {
        let source = Arc::new(ScriptedSource {
            responses: Mutex::new(responses.into()),
        });
        let buffer = Arc::new(OrderedBuffer::new(16));
        let (tx, rx) = mpsc::channel(64);
        let (events, events_rx) = EventSender::channel();
        let runner = PlaylistReconciler::new(
            source,
            url(),
            config,
            buffer.clone(),
            tx,
            events,
            CancellationToken::new(),
        );
        (runner, buffer, rx, events_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn live_reloads_until_endlist() {
        let (mut runner, buffer, mut jobs, _events) = runner(
            vec![Ok(manifest(1..4, false)), Ok(manifest(1..6, true))],
            PlaylistConfig::default(),
        );
        runner.run().await.unwrap();
        assert_eq!(runner.state(), ReconcilerState::Ended);

        let mut dispatched = Vec::new();
        while let Ok(job) = jobs.try_recv() {
            dispatched.push(job.sequence());
        }
        assert_eq!(dispatched, vec![1, 2, 3, 4, 5]);
        assert_eq!(buffer.stats().held, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_initial_manifest_is_fatal() {
        let (mut runner, _buffer, _jobs, _events) = runner(
            vec![Err(StreamError::manifest_malformed("u", "not a playlist"))],
            PlaylistConfig::default(),
        );
        assert!(matches!(
            runner.run().await,
            Err(StreamError::ManifestMalformed { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_reload_is_retried() {
        let (mut runner, _buffer, mut jobs, mut events) = runner(
            vec![
                Ok(manifest(1..3, false)),
                Err(StreamError::manifest_malformed("u", "truncated")),
                Ok(manifest(1..4, true)),
            ],
            PlaylistConfig::default(),
        );
        runner.run().await.unwrap();
        let mut dispatched = Vec::new();
        while let Ok(job) = jobs.try_recv() {
            dispatched.push(job.sequence());
        }
        assert_eq!(dispatched, vec![1, 2, 3]);

        let mut failures = 0;
        while let Ok(event) = events.try_recv() {
            if let StreamEvent::ManifestReloadFailed { .. } = event {
                failures += 1;
            }
        }
        assert_eq!(failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_reload_failure_is_fatal() {
        let config = PlaylistConfig::default();
        let max_retries = config.retry.max_retries;
        let (mut runner, _buffer, _jobs, mut events) = runner(
            vec![
                Ok(manifest(1..3, false)),
                Err(StreamError::manifest_unreachable("u", "HTTP 503")),
            ],
            config,
        );
        assert!(matches!(
            runner.run().await,
            Err(StreamError::ManifestUnreachable { .. })
        ));
        assert_eq!(runner.state(), ReconcilerState::Failed);
        let mut failures = 0;
        while let Ok(event) = events.try_recv() {
            if let StreamEvent::ManifestReloadFailed { .. } = event {
                failures += 1;
            }
        }
        assert_eq!(failures, max_retries + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_live_stream_fails() {
        let config = PlaylistConfig {
            stall_reload_count: 3,
            stall_timeout: Duration::from_secs(10),
            ..Default::default()
        };
        let (mut runner, buffer, _jobs, mut events) =
            runner(vec![Ok(manifest(1..3, false))], config);
        let err = runner.run().await.unwrap_err();
        assert_eq!(runner.state(), ReconcilerState::Failed);
        match err {
            StreamError::StreamStalled {
                reloads,
                waited_secs,
            } => {
                assert!(reloads >= 3);
                assert!(waited_secs >= 10.0);
            }
            other => panic!("expected stall, got {other:?}"),
        }
        let mut stalled = false;
        while let Ok(event) = events.try_recv() {
            stalled |= matches!(event, StreamEvent::StreamStalled { .. });
        }
        assert!(stalled);
        // The buffer is left to the session; nothing was marked final.
        buffer.fail(StreamError::Cancelled);
        assert!(matches!(buffer.next_ready().await, Err(StreamError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn gap_marks_are_delivered_as_skips() {
        let (mut runner, buffer, mut jobs, _events) = runner(
            vec![Ok(manifest(1..3, false)), Ok(manifest(6..8, true))],
            PlaylistConfig::default(),
        );
        runner.run().await.unwrap();
        let mut dispatched = Vec::new();
        while let Ok(job) = jobs.try_recv() {
            dispatched.push(job.sequence());
        }
        assert_eq!(dispatched, vec![1, 2, 6, 7]);
        assert_eq!(buffer.stats().held, 1);

        for seq in [1, 2, 6, 7] {
            buffer
                .submit(crate::hls::output::FetchResult::ok(
                    crate::hls::output::SegmentPayload {
                        sequence: seq,
                        data: bytes::Bytes::new(),
                        discontinuity: false,
                        init: None,
                    },
                ))
                .await;
        }
        let mut delivered = Vec::new();
        loop {
            match buffer.next_ready().await.unwrap() {
                Delivery::Segment(p) => delivered.push((p.sequence, None)),
                Delivery::Skipped {
                    sequence, count, ..
                } => delivered.push((sequence, Some(count))),
                Delivery::Ended => break,
            }
        }
        assert_eq!(
            delivered,
            vec![(1, None), (2, None), (3, Some(3)), (6, None), (7, None)]
        );
        assert_eq!(buffer.stats().skipped, 3);
    }
}
