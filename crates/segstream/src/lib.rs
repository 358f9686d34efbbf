//! Reassembles segmented (HLS) live and on-demand streams into one ordered
//! byte stream.
//!
//! A [`StreamSession`] polls the media playlist, fetches segments
//! concurrently, decrypts AES-128 segments and writes them in media sequence
//! order to any [`tokio::io::AsyncWrite`] sink.

pub mod config;
pub mod error;
pub mod hls;
pub mod telemetry;
pub mod transport;

pub use config::HttpConfig;
pub use error::{StreamError, TransportError};
pub use hls::{
    SessionOutcome, SessionReport, StreamConfig, StreamEvent, StreamSession,
};
pub use transport::{FetchRequest, ReqwestTransport, Transport};
