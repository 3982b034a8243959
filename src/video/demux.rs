// Multipart frame demuxer
//
// A push parser for multipart/x-mixed-replace streams. Chunks are appended to
// an accumulation buffer; every time a boundary token shows up, the bytes in
// front of it form one candidate part. A part becomes a frame only if it has
// a header block, a plausibly sized body and the right magic bytes. Anything
// else is dropped with a warning and parsing carries on with the next part.

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use serde::Serialize;

use super::{Frame, FrameWarning, MediaType};

/// Default boundary token, including the leading dashes
pub const DEFAULT_BOUNDARY: &str = "--BOUNDARY";

/// Bodies this size or smaller are never real frames
pub const DEFAULT_MIN_FRAME_BYTES: usize = 100;

/// Upper bound on bytes buffered while waiting for a boundary
pub const DEFAULT_MAX_PART_BYTES: usize = 8 * 1024 * 1024;

const HEADER_SEPARATOR: &[u8] = b"\r\n\r\n";
const CRLF: &[u8] = b"\r\n";
const CLOSE_DELIMITER_SUFFIX: &[u8] = b"--";

/// Parsing parameters for one stream
#[derive(Debug, Clone)]
pub struct DemuxOptions {
    /// Boundary token as it appears in the body (e.g. `--BOUNDARY`)
    pub boundary: String,
    /// A body must be strictly larger than this to be accepted
    pub min_frame_bytes: usize,
    /// Buffer cap; exceeding it discards the buffer and re-syncs
    pub max_part_bytes: usize,
    /// Media type every accepted frame must match
    pub media_type: MediaType,
}

impl Default for DemuxOptions {
    fn default() -> Self {
        Self {
            boundary: DEFAULT_BOUNDARY.to_string(),
            min_frame_bytes: DEFAULT_MIN_FRAME_BYTES,
            max_part_bytes: DEFAULT_MAX_PART_BYTES,
            media_type: MediaType::Jpeg,
        }
    }
}

/// Counters for one demuxed connection
#[derive(Debug, Default, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DemuxStats {
    pub bytes_received: u64,
    pub parts_seen: u64,
    pub frames_accepted: u64,
    pub parts_rejected: u64,
}

/// Multipart stream parser.
///
/// One instance serves exactly one connection; a reconnect needs a fresh
/// demuxer because the buffer may hold a partial part from the old one.
pub struct FrameDemuxer {
    boundary: Vec<u8>,
    options: DemuxOptions,
    buffer: BytesMut,
    /// Offset to resume the boundary search from, so bytes already scanned
    /// are not scanned again on the next chunk
    scan_from: usize,
    sequence: u64,
    stats: DemuxStats,
    last_warning: Option<FrameWarning>,
}

impl FrameDemuxer {
    pub fn new(options: DemuxOptions) -> Self {
        let boundary = if options.boundary.is_empty() {
            DEFAULT_BOUNDARY.as_bytes().to_vec()
        } else {
            options.boundary.as_bytes().to_vec()
        };

        Self {
            boundary,
            options,
            buffer: BytesMut::with_capacity(128 * 1024),
            scan_from: 0,
            sequence: 0,
            stats: DemuxStats::default(),
            last_warning: None,
        }
    }

    pub fn stats(&self) -> DemuxStats {
        self.stats
    }

    /// Most recent rejection, if any
    pub fn last_warning(&self) -> Option<&FrameWarning> {
        self.last_warning.as_ref()
    }

    /// Bytes currently held waiting for a boundary
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Append a chunk and return every frame it completed, in stream order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.stats.bytes_received += chunk.len() as u64;
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();

        loop {
            // The buffer normally starts with the boundary that opened the
            // current part; never match that one again.
            let skip = if self.buffer.starts_with(&self.boundary) {
                self.boundary.len()
            } else {
                0
            };
            let from = skip.max(self.scan_from);

            match find(&self.buffer[from..], &self.boundary) {
                Some(pos) => {
                    let part = self.buffer.split_to(from + pos).freeze();
                    self.scan_from = 0;

                    if let Some(frame) = self.take_part(part) {
                        frames.push(frame);
                    }
                }
                None => {
                    if self.buffer.len() > self.options.max_part_bytes {
                        let warning = FrameWarning::Oversized {
                            buffered: self.buffer.len(),
                            limit: self.options.max_part_bytes,
                        };
                        self.reject(warning);
                        self.buffer.clear();
                        self.scan_from = 0;
                    } else {
                        // A boundary may straddle this chunk and the next one
                        let tail = self.buffer.len().saturating_sub(self.boundary.len() - 1);
                        self.scan_from = tail.max(skip);
                    }
                    break;
                }
            }
        }

        frames
    }

    /// End of data: judge whatever is left in the buffer and release it.
    ///
    /// The last part of a stream is not followed by another boundary, so it
    /// is only accepted if it is visibly complete.
    pub fn finish(&mut self) -> Option<Frame> {
        let rest = self.buffer.split().freeze();
        self.scan_from = 0;

        if rest.is_empty() {
            return None;
        }

        let body = match self.part_body(&rest) {
            Ok(Some(body)) => body,
            Ok(None) => return None,
            Err(_) => {
                log::debug!("[Demux] Dropping {} trailing bytes without headers", rest.len());
                return None;
            }
        };

        if !self.options.media_type.looks_complete(&body) {
            log::debug!("[Demux] Dropping truncated trailing part ({} bytes)", body.len());
            return None;
        }

        self.stats.parts_seen += 1;
        match self.validate(body) {
            Ok(frame) => Some(frame),
            Err(warning) => {
                self.reject(warning);
                None
            }
        }
    }

    /// Drop any partially received part without judging it.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.scan_from = 0;
    }

    fn take_part(&mut self, part: Bytes) -> Option<Frame> {
        if part.is_empty() {
            return None;
        }

        let body = match self.part_body(&part) {
            Ok(Some(body)) => body,
            Ok(None) => return None,
            Err(warning) => {
                self.stats.parts_seen += 1;
                self.reject(warning);
                return None;
            }
        };

        self.stats.parts_seen += 1;
        match self.validate(body) {
            Ok(frame) => Some(frame),
            Err(warning) => {
                self.reject(warning);
                None
            }
        }
    }

    /// Extract the body of one part. `Ok(None)` means the part carries no
    /// payload at all (the closing `--boundary--` delimiter).
    fn part_body(&self, part: &Bytes) -> Result<Option<Bytes>, FrameWarning> {
        let content = if part.starts_with(&self.boundary) {
            part.slice(self.boundary.len()..)
        } else {
            part.clone()
        };

        if content.starts_with(CLOSE_DELIMITER_SUFFIX) {
            return Ok(None);
        }

        let Some(sep) = find(&content, HEADER_SEPARATOR) else {
            return Err(FrameWarning::MissingHeaderSeparator {
                part_len: part.len(),
            });
        };

        let mut body = content.slice(sep + HEADER_SEPARATOR.len()..);
        if body.ends_with(CRLF) {
            body.truncate(body.len() - CRLF.len());
        }

        Ok(Some(body))
    }

    fn validate(&mut self, body: Bytes) -> Result<Frame, FrameWarning> {
        if body.len() <= self.options.min_frame_bytes || body.len() < 2 {
            return Err(FrameWarning::TooSmall {
                len: body.len(),
                min: self.options.min_frame_bytes,
            });
        }

        let expected = self.options.media_type.magic();
        let found = [body[0], body[1]];
        if found != expected {
            return Err(FrameWarning::BadMagic { found, expected });
        }

        let frame = Frame {
            data: body,
            media_type: self.options.media_type,
            sequence: self.sequence,
            received_at: Utc::now(),
        };
        self.sequence += 1;
        self.stats.frames_accepted += 1;

        Ok(frame)
    }

    fn reject(&mut self, warning: FrameWarning) {
        log::warn!("[Demux] Dropped part: {}", warning);
        self.stats.parts_rejected += 1;
        self.last_warning = Some(warning);
    }
}

/// Position of the first occurrence of `needle` in `haystack`
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
