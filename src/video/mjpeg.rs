// MJPEG live stream reader
//
// Drives a FrameDemuxer from an async byte stream (normally the body of an
// HTTP multipart/x-mixed-replace response). Frames are produced lazily, one
// `next_frame()` call at a time, and the sequence ends when the camera closes
// the connection or the reader is cancelled.

use std::collections::VecDeque;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use super::demux::{DemuxOptions, DemuxStats, FrameDemuxer};
use super::{Frame, VideoError};

/// Reader over a live HTTP camera stream
pub type HttpFrameStream = MjpegStream<BoxStream<'static, reqwest::Result<Bytes>>>;

/// Lazy frame sequence over one connection.
///
/// Not restartable: once the source ends, errors, or is cancelled, every
/// further `next_frame()` returns `Ok(None)`.
pub struct MjpegStream<S> {
    /// Dropped (and with it the underlying connection) on end or cancel
    source: Option<S>,
    demuxer: FrameDemuxer,
    pending: VecDeque<Frame>,
    cancel: CancellationToken,
}

impl<S, E> MjpegStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    pub fn new(source: S, options: DemuxOptions) -> Self {
        Self {
            source: Some(source),
            demuxer: FrameDemuxer::new(options),
            pending: VecDeque::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Token that cancels this reader from another task
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop reading now and release the connection and any partial frame.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.release();
    }

    pub fn is_finished(&self) -> bool {
        self.source.is_none() && self.pending.is_empty()
    }

    pub fn stats(&self) -> DemuxStats {
        self.demuxer.stats()
    }

    /// Wait for the next valid frame.
    ///
    /// Malformed parts are skipped inside the demuxer; only transport
    /// failures surface as errors.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, VideoError> {
        loop {
            if self.cancel.is_cancelled() {
                self.release();
                return Ok(None);
            }

            if let Some(frame) = self.pending.pop_front() {
                return Ok(Some(frame));
            }

            let cancel = self.cancel.clone();
            let next = {
                let Some(source) = self.source.as_mut() else {
                    return Ok(None);
                };
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    item = source.next() => Some(item),
                }
            };

            match next {
                None => {
                    self.release();
                    return Ok(None);
                }
                Some(Some(Ok(chunk))) => {
                    let frames = self.demuxer.push(&chunk);
                    self.pending.extend(frames);
                }
                Some(Some(Err(e))) => {
                    self.release();
                    return Err(VideoError::Stream(e.to_string()));
                }
                Some(None) => {
                    // End of data: the final part has no closing boundary
                    self.source = None;
                    if let Some(frame) = self.demuxer.finish() {
                        self.pending.push_back(frame);
                    }
                    log::debug!("[Demux] Stream ended: {:?}", self.demuxer.stats());
                }
            }
        }
    }

    fn release(&mut self) {
        self.source = None;
        self.pending.clear();
        self.demuxer.reset();
    }
}

/// Open an HTTP camera stream.
///
/// The boundary announced in the response's Content-Type wins over the one
/// in `options`.
pub async fn connect(
    client: &reqwest::Client,
    url: &str,
    mut options: DemuxOptions,
) -> Result<HttpFrameStream, VideoError> {
    let response = client.get(url).send().await?.error_for_status()?;

    if let Some(boundary) = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(boundary_from_content_type)
    {
        options.boundary = boundary;
    }

    log::debug!("[Demux] Connected to {} (boundary {:?})", url, options.boundary);

    Ok(MjpegStream::new(response.bytes_stream().boxed(), options))
}

/// Extract the body boundary token from a multipart Content-Type value.
///
/// Returns the delimiter as it appears in the body: `--` followed by the
/// parameter, even when the parameter itself starts with dashes.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    let mut params = content_type.split(';');
    let mime = params.next()?.trim().to_ascii_lowercase();
    if !mime.starts_with("multipart/") {
        return None;
    }

    params
        .filter_map(|p| p.split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, v)| v.trim().trim_matches('"'))
        .filter(|v| !v.is_empty())
        .map(|v| format!("--{}", v))
}
