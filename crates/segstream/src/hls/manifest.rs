// Manifest data model: immutable segment descriptors and manifest snapshots
// parsed from HLS media playlists.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use m3u8_rs::{MediaPlaylist, MediaPlaylistType, parse_playlist_res};
use tracing::{debug, warn};
use url::Url;

use crate::error::StreamError;
use crate::hls::config::ReloadTime;

/// Reload interval used when the manifest gives no usable hint.
const FALLBACK_RELOAD_INTERVAL: Duration = Duration::from_secs(6);

/// An absolute byte range within a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    /// Value of the HTTP `Range` header selecting this range.
    pub fn header_value(&self) -> String {
        let last = self.end().saturating_sub(1).max(self.offset);
        format!("bytes={}-{}", self.offset, last)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyMethod {
    Aes128,
    /// Any method this engine cannot decrypt (e.g. `SAMPLE-AES`).
    Unsupported(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// Key fetched over HTTP and cached by URI.
    Uri(Url),
    /// Key embedded in the manifest as a `data:` URI.
    Inline(Bytes),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyReference {
    pub method: KeyMethod,
    pub source: KeySource,
    /// Explicit IV; when absent the segment's sequence number is used.
    pub iv: Option<[u8; 16]>,
}

/// Media initialization section (`EXT-X-MAP`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InitSection {
    pub uri: Url,
    pub byte_range: Option<ByteRange>,
}

/// One fetchable unit of the stream. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentDescriptor {
    pub sequence: u64,
    pub uri: Url,
    pub byte_range: Option<ByteRange>,
    /// Duration in seconds
    pub duration: f64,
    pub discontinuity: bool,
    pub key: Option<KeyReference>,
    pub init: Option<InitSection>,
}

/// A manifest entry that can never be fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedSegment {
    pub sequence: u64,
    pub duration: f64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ManifestEntry {
    Segment(Arc<SegmentDescriptor>),
    Rejected(RejectedSegment),
}

impl ManifestEntry {
    pub fn sequence(&self) -> u64 {
        match self {
            ManifestEntry::Segment(segment) => segment.sequence,
            ManifestEntry::Rejected(rejected) => rejected.sequence,
        }
    }

    pub fn duration(&self) -> f64 {
        match self {
            ManifestEntry::Segment(segment) => segment.duration,
            ManifestEntry::Rejected(rejected) => rejected.duration,
        }
    }
}

/// Snapshot of a media playlist. Replaced wholesale on every reload.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestState {
    /// Entries in ascending sequence order
    pub entries: Vec<ManifestEntry>,
    pub media_sequence_base: u64,
    /// Target duration in seconds (0 when absent)
    pub target_duration: f64,
    pub is_endlist: bool,
    pub reload_uri: Url,
}

impl ManifestState {
    /// Parses a media playlist fetched from `url`.
    pub fn parse(bytes: &[u8], url: &Url) -> Result<Self, StreamError> {
        let playlist = match parse_playlist_res(bytes) {
            Ok(m3u8_rs::Playlist::MediaPlaylist(playlist)) => playlist,
            Ok(m3u8_rs::Playlist::MasterPlaylist(_)) => {
                return Err(StreamError::manifest_malformed(
                    url.as_str(),
                    "expected a media playlist, got a variant (master) playlist",
                ));
            }
            Err(e) => return Err(StreamError::manifest_malformed(url.as_str(), e)),
        };

        if playlist.i_frames_only {
            return Err(StreamError::manifest_malformed(
                url.as_str(),
                "streams containing I-frames only are not playable",
            ));
        }

        let state = Self::from_playlist(&playlist, url);
        if state.entries.is_empty() && !state.is_endlist {
            return Err(StreamError::ManifestEmpty {
                url: url.to_string(),
            });
        }
        Ok(state)
    }

    fn from_playlist(playlist: &MediaPlaylist, url: &Url) -> Self {
        let playlist_map = playlist_level_map(playlist);
        let mut builder = EntryBuilder::new(url, playlist_map.as_ref());
        let mut entries = Vec::with_capacity(playlist.segments.len());
        for (idx, segment) in playlist.segments.iter().enumerate() {
            // Every entry needs a representable successor.
            let Some(sequence) = playlist
                .media_sequence
                .checked_add(idx as u64)
                .filter(|sequence| *sequence < u64::MAX)
            else {
                warn!(
                    media_sequence = playlist.media_sequence,
                    dropped = playlist.segments.len() - idx,
                    "Media sequence overflows, dropping trailing entries"
                );
                break;
            };
            entries.push(builder.build(sequence, segment));
        }

        Self {
            entries,
            media_sequence_base: playlist.media_sequence,
            target_duration: playlist.target_duration as f64,
            is_endlist: playlist.end_list
                || matches!(playlist.playlist_type, Some(MediaPlaylistType::Vod)),
            reload_uri: url.clone(),
        }
    }

    pub fn first_sequence(&self) -> Option<u64> {
        self.entries.first().map(ManifestEntry::sequence)
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.entries.last().map(ManifestEntry::sequence)
    }

    /// Delay until the next reload, before any floor is applied.
    pub fn reload_interval(&self, mode: ReloadTime, live_edge: usize) -> Duration {
        let target = positive_secs(self.target_duration);
        let last_segment = self.entries.last().and_then(|e| positive_secs(e.duration()));
        let edge = {
            let count = live_edge.saturating_sub(1).max(1);
            let skip = self.entries.len().saturating_sub(count);
            positive_secs(self.entries[skip..].iter().map(ManifestEntry::duration).sum())
        };

        let chosen = match mode {
            ReloadTime::Fixed(interval) if !interval.is_zero() => Some(interval),
            ReloadTime::Fixed(_) | ReloadTime::TargetDuration => target.or(edge),
            ReloadTime::LastSegment => last_segment.or(target),
            ReloadTime::LiveEdge => edge.or(target),
        };
        chosen.unwrap_or(FALLBACK_RELOAD_INTERVAL)
    }
}

fn positive_secs(secs: f64) -> Option<Duration> {
    (secs.is_finite() && secs > 0.0).then(|| Duration::from_secs_f64(secs))
}

/// Carries the tag state that applies across segments while walking a playlist.
struct EntryBuilder<'a> {
    base: &'a Url,
    key: Option<Result<KeyReference, String>>,
    map: Option<Result<InitSection, String>>,
    previous_range_end: Option<u64>,
}

impl<'a> EntryBuilder<'a> {
    fn new(base: &'a Url, playlist_map: Option<&m3u8_rs::Map>) -> Self {
        let mut builder = Self {
            base,
            key: None,
            map: None,
            previous_range_end: None,
        };
        if let Some(map) = playlist_map {
            builder.map = Some(builder.resolve_map(map));
        }
        builder
    }

    fn build(&mut self, sequence: u64, segment: &m3u8_rs::MediaSegment) -> ManifestEntry {
        let duration = segment.duration as f64;
        let reject = |reason: String| {
            warn!(msn = sequence, %reason, "Rejecting manifest entry");
            ManifestEntry::Rejected(RejectedSegment {
                sequence,
                duration,
                reason,
            })
        };

        // Key and map tags stay in effect for every following segment.
        if let Some(key) = &segment.key {
            self.key = self.resolve_key(key);
        }
        if let Some(map) = &segment.map {
            self.map = Some(self.resolve_map(map));
        }

        let byte_range = match &segment.byte_range {
            Some(range) => match range.offset.or(self.previous_range_end) {
                Some(offset) => {
                    let range = ByteRange {
                        offset,
                        length: range.length,
                    };
                    self.previous_range_end = Some(range.end());
                    if range.length == 0 {
                        return reject("Zero-length BYTERANGE".to_string());
                    }
                    Some(range)
                }
                None => {
                    self.previous_range_end = None;
                    return reject("Missing BYTERANGE offset".to_string());
                }
            },
            None => {
                self.previous_range_end = None;
                None
            }
        };

        if segment.uri.trim().is_empty() {
            return reject("segment has an empty URI".to_string());
        }
        let uri = match self.base.join(segment.uri.trim()) {
            Ok(uri) => uri,
            Err(e) => return reject(format!("invalid segment URI `{}`: {e}", segment.uri)),
        };

        let key = match &self.key {
            Some(Ok(key)) => Some(key.clone()),
            Some(Err(reason)) => return reject(reason.clone()),
            None => None,
        };
        let init = match &self.map {
            Some(Ok(init)) => Some(init.clone()),
            Some(Err(reason)) => return reject(reason.clone()),
            None => None,
        };

        ManifestEntry::Segment(Arc::new(SegmentDescriptor {
            sequence,
            uri,
            byte_range,
            duration,
            discontinuity: segment.discontinuity,
            key,
            init,
        }))
    }

    /// `None` clears encryption (`METHOD=NONE`).
    fn resolve_key(&self, key: &m3u8_rs::Key) -> Option<Result<KeyReference, String>> {
        let method = match &key.method {
            m3u8_rs::KeyMethod::None => return None,
            m3u8_rs::KeyMethod::AES128 => KeyMethod::Aes128,
            m3u8_rs::KeyMethod::SampleAES => KeyMethod::Unsupported("SAMPLE-AES".to_string()),
            m3u8_rs::KeyMethod::Other(name) => KeyMethod::Unsupported(name.clone()),
        };

        Some(self.key_reference(method, key))
    }

    fn key_reference(&self, method: KeyMethod, key: &m3u8_rs::Key) -> Result<KeyReference, String> {
        let uri = key
            .uri
            .as_deref()
            .filter(|uri| !uri.trim().is_empty())
            .ok_or_else(|| "Missing URI for decryption key".to_string())?;
        let source = parse_key_source(self.base, uri)?;
        let iv = key.iv.as_deref().map(parse_iv).transpose()?;
        Ok(KeyReference { method, source, iv })
    }

    fn resolve_map(&self, map: &m3u8_rs::Map) -> Result<InitSection, String> {
        let byte_range = match &map.byte_range {
            Some(range) if range.length == 0 => {
                return Err("Zero-length BYTERANGE for init section".to_string());
            }
            Some(range) => Some(ByteRange {
                offset: range
                    .offset
                    .ok_or_else(|| "Missing BYTERANGE offset for init section".to_string())?,
                length: range.length,
            }),
            None => None,
        };
        let uri = self
            .base
            .join(&map.uri)
            .map_err(|e| format!("invalid init section URI `{}`: {e}", map.uri))?;
        debug!(%uri, "Init section");
        Ok(InitSection { uri, byte_range })
    }
}

fn parse_key_source(base: &Url, uri: &str) -> Result<KeySource, String> {
    if let Some(data) = uri.strip_prefix("data:") {
        let (meta, payload) = data
            .split_once(',')
            .ok_or_else(|| "malformed data URI for decryption key".to_string())?;
        let bytes = if meta.ends_with(";base64") {
            base64::engine::general_purpose::STANDARD
                .decode(payload.trim())
                .map_err(|e| format!("invalid base64 key data: {e}"))?
        } else {
            payload.as_bytes().to_vec()
        };
        return Ok(KeySource::Inline(Bytes::from(bytes)));
    }
    base.join(uri)
        .map(KeySource::Uri)
        .map_err(|e| format!("invalid key URI `{uri}`: {e}"))
}

/// Parses an `IV` attribute (`0x`-prefixed hexadecimal, up to 128 bits).
pub fn parse_iv(iv: &str) -> Result<[u8; 16], String> {
    let digits = iv
        .strip_prefix("0x")
        .or_else(|| iv.strip_prefix("0X"))
        .unwrap_or(iv);
    u128::from_str_radix(digits, 16)
        .map(u128::to_be_bytes)
        .map_err(|e| format!("invalid IV `{iv}`: {e}"))
}

/// `EXT-X-MAP` tags placed before the first segment are not attached to any
/// `MediaSegment` by m3u8-rs; they end up as unknown playlist tags ("X-MAP").
fn playlist_level_map(playlist: &MediaPlaylist) -> Option<m3u8_rs::Map> {
    let ext = playlist
        .unknown_tags
        .iter()
        .rev()
        .find(|t| t.tag == "X-MAP")?;
    let attributes = split_attributes(ext.rest.as_deref()?);

    let uri = attributes.get("URI")?.clone();
    let byte_range = attributes.get("BYTERANGE").and_then(|value| {
        let (length, offset) = value.split_once('@').unwrap_or((value, ""));
        Some(m3u8_rs::ByteRange {
            length: length.trim().parse().ok()?,
            offset: offset.trim().parse().ok(),
        })
    });
    Some(m3u8_rs::Map {
        uri,
        byte_range,
        other_attributes: HashMap::new(),
    })
}

/// Splits an attribute list on commas outside quotes. Keys are upper-cased
/// and surrounding quotes are stripped from values.
fn split_attributes(rest: &str) -> HashMap<String, String> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (idx, ch) in rest.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&rest[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&rest[start..]);

    parts
        .into_iter()
        .filter_map(|part| part.split_once('='))
        .map(|(key, value)| {
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            (key.trim().to_ascii_uppercase(), value.to_string())
        })
        .collect()
}
