use std::time::Duration;

use crate::config::HttpConfig;
use crate::error::StreamError;
use crate::hls::retry::RetryPolicy;

// --- Top-Level Configuration ---
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// HTTP options for every request of the session
    pub http: HttpConfig,
    pub playlist_config: PlaylistConfig,
    pub fetcher_config: FetcherConfig,
    pub decryption_config: DecryptionConfig,
    pub output_config: OutputConfig,
    /// How long tasks get to wind down after cancellation before being aborted
    pub shutdown_grace: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            playlist_config: PlaylistConfig::default(),
            fetcher_config: FetcherConfig::default(),
            decryption_config: DecryptionConfig::default(),
            output_config: OutputConfig::default(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.fetcher_config.download_concurrency == 0 {
            return Err(StreamError::configuration(
                "download_concurrency must be at least 1",
            ));
        }
        if self.output_config.buffer_capacity == 0 {
            return Err(StreamError::configuration(
                "buffer_capacity must be at least 1",
            ));
        }
        if self.playlist_config.live_edge == 0 {
            return Err(StreamError::configuration("live_edge must be at least 1"));
        }
        if self.playlist_config.stall_reload_count == 0 {
            return Err(StreamError::configuration(
                "stall_reload_count must be at least 1",
            ));
        }
        Ok(())
    }
}

// --- Playlist Configuration ---

/// How the delay between two live manifest reloads is derived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReloadTime {
    /// The manifest's target duration
    #[default]
    TargetDuration,
    /// The duration of the manifest's last segment
    LastSegment,
    /// The summed duration of the segments at the live edge
    LiveEdge,
    /// A fixed interval; a zero duration falls back to `TargetDuration`
    Fixed(Duration),
}

#[derive(Debug, Clone)]
pub struct PlaylistConfig {
    /// Number of segments taken from the end of a live manifest on first load
    pub live_edge: usize,
    pub reload_time: ReloadTime,
    /// Minimum interval between two reloads
    pub reload_floor: Duration,
    pub fetch_timeout: Duration,
    /// Backoff for failed manifest fetches. `max_retries` is the number of
    /// consecutive failures tolerated before the session fails.
    pub retry: RetryPolicy,
    /// Consecutive reloads without new segments before a stall may be declared
    pub stall_reload_count: u32,
    /// Minimum time without new segments before a stall may be declared
    pub stall_timeout: Duration,
    /// Skip leading on-demand segments that end before this offset
    pub start_offset: Option<Duration>,
    /// Stop enqueuing once this much media has been enqueued
    pub duration_limit: Option<Duration>,
}

impl Default for PlaylistConfig {
    fn default() -> Self {
        Self {
            live_edge: 3,
            reload_time: ReloadTime::default(),
            reload_floor: Duration::from_secs(1),
            fetch_timeout: Duration::from_secs(15),
            retry: RetryPolicy {
                max_retries: 5,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(10),
                jitter: true,
            },
            stall_reload_count: 8,
            stall_timeout: Duration::from_secs(60),
            start_offset: None,
            duration_limit: None,
        }
    }
}

// --- Fetcher Configuration ---
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Max concurrent segment downloads (default: 5)
    pub download_concurrency: usize,
    pub segment_download_timeout: Duration,
    pub segment_retry: RetryPolicy,
    pub key_download_timeout: Duration,
    pub key_retry: RetryPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            download_concurrency: 5,
            segment_download_timeout: Duration::from_secs(10),
            segment_retry: RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(8),
                jitter: true,
            },
            key_download_timeout: Duration::from_secs(5),
            key_retry: RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(200),
                max_delay: Duration::from_secs(5),
                jitter: true,
            },
        }
    }
}

// --- Decryption Configuration ---
#[derive(Debug, Clone, Default)]
pub struct DecryptionConfig {
    /// Template rewriting every key URI before it is fetched. Supports the
    /// `{url}`, `{scheme}`, `{netloc}`, `{path}` and `{query}` placeholders.
    pub key_uri_override: Option<String>,
    /// Whether to run AES on tokio's blocking pool
    pub offload_decryption_to_cpu_pool: bool,
}

// --- Output Configuration ---
#[derive(Debug, Clone)]
pub struct OutputConfig {
    /// Max number of completed out-of-order segments held by the reorder buffer
    pub buffer_capacity: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 20,
        }
    }
}
