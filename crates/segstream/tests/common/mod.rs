#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::StatusCode;
use segstream::hls::RetryPolicy;
use segstream::hls::manifest::ByteRange;
use segstream::{FetchRequest, StreamConfig, Transport, TransportError};
use tokio::io::AsyncWrite;
use url::Url;

pub const BASE: &str = "https://cdn.test/live/";

pub fn url(path: &str) -> String {
    Url::parse(BASE)
        .and_then(|base| base.join(path))
        .map(|u| u.to_string())
        .unwrap()
}

pub fn manifest_url() -> String {
    url("index.m3u8")
}

#[derive(Debug, Clone)]
pub enum Response {
    Body(Bytes),
    Status(u16),
}

#[derive(Default)]
struct Route {
    /// The last response repeats forever
    responses: VecDeque<Response>,
    delay: Option<Duration>,
}

/// In-memory CDN: scripted responses per URL, with request accounting.
#[derive(Default)]
pub struct ScriptedCdn {
    routes: Mutex<HashMap<String, Route>>,
    requests: Mutex<Vec<(String, Option<ByteRange>)>>,
}

impl ScriptedCdn {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, path: &str, body: impl Into<Bytes>) {
        self.script(path, vec![Response::Body(body.into())]);
    }

    /// Serves `responses` in order; the last one repeats.
    pub fn script(&self, path: &str, responses: Vec<Response>) {
        self.routes.lock().entry(url(path)).or_default().responses = responses.into();
    }

    /// Makes the next `times` requests for `path` fail with 503.
    pub fn fail_times(&self, path: &str, times: usize) {
        let mut routes = self.routes.lock();
        let route = routes.entry(url(path)).or_default();
        for _ in 0..times {
            route.responses.push_front(Response::Status(503));
        }
    }

    pub fn delay(&self, path: &str, delay: Duration) {
        self.routes.lock().entry(url(path)).or_default().delay = Some(delay);
    }

    pub fn requests_for(&self, path: &str) -> usize {
        let target = url(path);
        self.requests.lock().iter().filter(|(u, _)| *u == target).count()
    }

    pub fn total_requests(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn ranges_for(&self, path: &str) -> Vec<Option<ByteRange>> {
        let target = url(path);
        self.requests
            .lock()
            .iter()
            .filter(|(u, _)| *u == target)
            .map(|(_, range)| *range)
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedCdn {
    async fn get(&self, request: FetchRequest<'_>) -> Result<Bytes, TransportError> {
        let key = request.url.to_string();
        self.requests.lock().push((key.clone(), request.range));

        let (response, delay) = {
            let mut routes = self.routes.lock();
            match routes.get_mut(&key) {
                Some(route) => {
                    let response = if route.responses.len() > 1 {
                        route.responses.pop_front()
                    } else {
                        route.responses.front().cloned()
                    };
                    (response.unwrap_or(Response::Status(404)), route.delay)
                }
                None => (Response::Status(404), None),
            }
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match response {
            Response::Body(body) => match request.range {
                Some(range) => {
                    let end = (range.end() as usize).min(body.len());
                    Ok(body.slice(range.offset as usize..end))
                }
                None => Ok(body),
            },
            Response::Status(code) => Err(TransportError::Status {
                status: StatusCode::from_u16(code).unwrap(),
            }),
        }
    }
}

/// Builds a media playlist whose segments are `seg{n}.ts`.
pub fn playlist(first: u64, count: u64, target: u64, endlist: bool) -> String {
    let mut out = format!(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:{target}\n#EXT-X-MEDIA-SEQUENCE:{first}\n"
    );
    for seq in first..first + count {
        out.push_str(&format!("#EXTINF:{target}.0,\nseg{seq}.ts\n"));
    }
    if endlist {
        out.push_str("#EXT-X-ENDLIST\n");
    }
    out
}

pub fn segment_body(seq: u64) -> Bytes {
    Bytes::from(format!("<segment {seq}>"))
}

/// Serves `seg{n}.ts` for every sequence in `range`.
pub fn serve_segments(cdn: &ScriptedCdn, range: std::ops::Range<u64>) {
    for seq in range {
        cdn.serve(&format!("seg{seq}.ts"), segment_body(seq));
    }
}

pub fn expected_output(sequences: impl IntoIterator<Item = u64>) -> Vec<u8> {
    sequences
        .into_iter()
        .flat_map(|seq| segment_body(seq).to_vec())
        .collect()
}

/// Defaults with retry delays short enough for tests.
pub fn test_config() -> StreamConfig {
    let mut config = StreamConfig::default();
    let quick = RetryPolicy {
        max_retries: 3,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(80),
        jitter: false,
    };
    config.fetcher_config.segment_retry = quick.clone();
    config.fetcher_config.key_retry = quick.clone();
    config.playlist_config.retry = quick;
    config.playlist_config.reload_floor = Duration::from_millis(100);
    config.shutdown_grace = Duration::from_secs(1);
    config
}

/// Sink that accepts `writes_left` writes and then reports a broken pipe.
pub struct ClosingSink {
    pub written: Vec<u8>,
    pub writes_left: usize,
}

impl ClosingSink {
    pub fn new(writes_left: usize) -> Self {
        Self {
            written: Vec::new(),
            writes_left,
        }
    }
}

impl AsyncWrite for ClosingSink {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.writes_left == 0 {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        self.writes_left -= 1;
        self.written.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
