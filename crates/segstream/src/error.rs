use reqwest::StatusCode;

/// Errors produced by the segment stream pipeline.
///
/// The type is `Clone` because a single failure can be observed by several
/// waiters (coalesced key fetches, the output buffer and the session report).
#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    #[error("manifest unreachable at {url}: {reason}")]
    ManifestUnreachable { url: String, reason: String },

    #[error("malformed manifest at {url}: {reason}")]
    ManifestMalformed { url: String, reason: String },

    #[error("manifest at {url} lists no segments")]
    ManifestEmpty { url: String },

    #[error("decryption key unreachable at {url}: {reason}")]
    KeyUnreachable {
        url: String,
        reason: String,
        retryable: bool,
    },

    #[error("failed to decrypt segment {sequence}: {reason}")]
    DecryptionFailed { sequence: u64, reason: String },

    #[error("segment {sequence} unreachable: {reason}")]
    SegmentUnreachable {
        sequence: u64,
        reason: String,
        retryable: bool,
    },

    #[error("segment {sequence} rejected: {reason}")]
    SegmentRejected { sequence: u64, reason: String },

    #[error("stream stalled: no new segments for {waited_secs:.1}s over {reloads} reloads")]
    StreamStalled { reloads: u32, waited_secs: f64 },

    #[error("output sink closed: {reason}")]
    SinkClosed { reason: String },

    #[error("stream session cancelled")]
    Cancelled,

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl StreamError {
    pub fn manifest_unreachable(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::ManifestUnreachable {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    pub fn manifest_malformed(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::ManifestMalformed {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    pub fn decryption_failed(sequence: u64, reason: impl ToString) -> Self {
        Self::DecryptionFailed {
            sequence,
            reason: reason.to_string(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Builds the error for a transport failure while fetching `sequence`.
    pub fn segment_unreachable(sequence: u64, err: &TransportError) -> Self {
        Self::SegmentUnreachable {
            sequence,
            reason: err.to_string(),
            retryable: err.is_retryable(),
        }
    }

    /// Whether another attempt at the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ManifestUnreachable { .. } | Self::ManifestEmpty { .. } => true,
            Self::KeyUnreachable { retryable, .. }
            | Self::SegmentUnreachable { retryable, .. } => *retryable,
            // A different key response on the next attempt can fix a bad padding.
            Self::DecryptionFailed { .. } => true,
            Self::ManifestMalformed { .. }
            | Self::SegmentRejected { .. }
            | Self::StreamStalled { .. }
            | Self::SinkClosed { .. }
            | Self::Cancelled
            | Self::Configuration { .. }
            | Self::Internal { .. } => false,
        }
    }
}

/// Failure reported by a [`crate::Transport`] implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP {status}")]
    Status { status: StatusCode },

    #[error("request timed out")]
    Timeout,

    #[error("network error: {reason}")]
    Network { reason: String, retryable: bool },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status } => {
                status.is_server_error()
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    || *status == StatusCode::REQUEST_TIMEOUT
            }
            Self::Timeout => true,
            Self::Network { retryable, .. } => *retryable,
            Self::InvalidRequest { .. } => false,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return Self::Timeout;
        }
        if let Some(status) = e.status() {
            return Self::Status { status };
        }
        if e.is_builder() {
            return Self::InvalidRequest {
                reason: e.to_string(),
            };
        }
        Self::Network {
            retryable: crate::hls::retry::is_retryable_reqwest_error(&e),
            reason: e.to_string(),
        }
    }
}
