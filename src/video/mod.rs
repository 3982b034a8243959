// Live video stream module
//
// Turns a camera's multipart HTTP stream (multipart/x-mixed-replace) into
// discrete, validated still frames. The parser (`demux`) is synchronous and
// transport-agnostic; `mjpeg` drives it from an async byte stream.

pub mod demux;
pub mod mjpeg;

pub use demux::{DemuxOptions, DemuxStats, FrameDemuxer};
pub use mjpeg::{boundary_from_content_type, HttpFrameStream, MjpegStream};

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Image formats a demuxed part may carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MediaType {
    #[serde(rename = "image/jpeg")]
    Jpeg,
    #[serde(rename = "image/png")]
    Png,
}

impl MediaType {
    /// First two bytes every valid body of this type starts with
    pub fn magic(&self) -> [u8; 2] {
        match self {
            MediaType::Jpeg => [0xFF, 0xD8],
            MediaType::Png => [0x89, 0x50],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Jpeg => "image/jpeg",
            MediaType::Png => "image/png",
        }
    }

    /// Whether `body` ends the way a complete image of this type does.
    /// Only used to judge a trailing part that was never closed by a boundary.
    pub fn looks_complete(&self, body: &[u8]) -> bool {
        match self {
            MediaType::Jpeg => body.ends_with(&[0xFF, 0xD9]),
            // IEND chunk type followed by its CRC
            MediaType::Png => body.len() >= 8 && &body[body.len() - 8..body.len() - 4] == b"IEND",
        }
    }
}

impl Default for MediaType {
    fn default() -> Self {
        Self::Jpeg
    }
}

/// A single still frame extracted from a live stream.
///
/// Frames are owned by whoever pulled them and are never retained by the
/// demuxer once handed out.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Image bytes, exactly as sent by the camera
    pub data: Bytes,
    /// Validated media type
    pub media_type: MediaType,
    /// Index of this frame among the frames accepted on this connection
    pub sequence: u64,
    /// Wall-clock time the frame was completed
    pub received_at: DateTime<Utc>,
}

impl Frame {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A multipart part that was dropped instead of becoming a frame.
///
/// These are not errors: the stream keeps going after each one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameWarning {
    #[error("part of {part_len} bytes has no header separator")]
    MissingHeaderSeparator { part_len: usize },

    #[error("frame body of {len} bytes is below the {min} byte minimum")]
    TooSmall { len: usize, min: usize },

    #[error("frame body starts with {found:02X?}, expected {expected:02X?}")]
    BadMagic { found: [u8; 2], expected: [u8; 2] },

    #[error("discarded {buffered} buffered bytes without a boundary (limit {limit})")]
    Oversized { buffered: usize, limit: usize },
}

/// Error type for live stream operations
#[derive(Debug, thiserror::Error)]
pub enum VideoError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("No frame received within {0:?}")]
    Timeout(Duration),

    #[error("Stream ended before a valid frame arrived")]
    NoFrame,
}

/// Connect to a camera stream and return its first valid frame.
///
/// The connection is cancelled as soon as the frame is in hand.
pub async fn grab_frame(
    client: &reqwest::Client,
    url: &str,
    options: DemuxOptions,
    timeout: Duration,
) -> Result<Frame, VideoError> {
    let mut stream = mjpeg::connect(client, url, options).await?;

    let result = tokio::time::timeout(timeout, stream.next_frame()).await;
    stream.cancel();

    match result {
        Ok(Ok(Some(frame))) => Ok(frame),
        Ok(Ok(None)) => Err(VideoError::NoFrame),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(VideoError::Timeout(timeout)),
    }
}
