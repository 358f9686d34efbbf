// HLS engine: manifest polling, concurrent segment fetch and ordered output

pub mod config;
mod coordinator;
mod decryption;
pub mod events;
mod fetcher;
pub mod manifest;
mod output;
mod playlist;
mod reconciler;
pub(crate) mod retry;
mod scheduler;
mod writer;

// Re-exports for easier access
pub use config::{
    DecryptionConfig, FetcherConfig, OutputConfig, PlaylistConfig, ReloadTime, StreamConfig,
};
pub use coordinator::{SessionOutcome, SessionReport, StreamSession};
pub use decryption::{Decryptor, apply_key_uri_override};
pub use events::{EventSender, StreamEvent};
pub use fetcher::{SegmentDownloader, SegmentFetcher};
pub use output::{
    BufferStats, Delivery, FetchResult, InitPayload, OrderedBuffer, SegmentPayload,
};
pub use playlist::{ManifestFetcher, ManifestSource};
pub use reconciler::{
    FetchJob, PlaylistReconciler, ReconcileOutcome, Reconciler, ReconcilerState, SkipMark,
};
pub use retry::RetryPolicy;
pub use scheduler::SegmentScheduler;
pub use writer::{StreamWriter, WriterStats};
