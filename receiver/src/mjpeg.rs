use std::future::Future;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use camrelay_common::codec::FrameCodec;
use camrelay_common::frame::EncodedPayload;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::decode::DecodePool;
use crate::ReceiverError;

const HEADER_END: &[u8] = b"\r\n\r\n";
/// A section that grows past this without a closing boundary is treated as a
/// broken stream rather than buffered forever.
const MAX_SECTION_BYTES: usize = 32 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum DemuxError {
    #[error("boundary token must not be empty")]
    EmptyBoundary,
    #[error("stream ended")]
    StreamEnded,
    #[error("stream read failed: {0}")]
    Read(String),
    #[error("no boundary within {0} bytes")]
    SectionTooLarge(usize),
}

/// Splits a `multipart/x-mixed-replace` body into per-part payloads.
///
/// The buffer always starts at a boundary token once the first one has been
/// seen. Each call reads until the next token shows up, emits the bytes
/// between the part's header terminator and that token, and drops everything
/// before it. Read errors and end of stream are terminal.
pub struct MjpegDemuxer<S> {
    source: S,
    boundary: Vec<u8>,
    buffer: BytesMut,
    /// True once `buffer` starts with a boundary token.
    aligned: bool,
    bytes_read: u64,
}

impl<S, E> MjpegDemuxer<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    pub fn new(source: S, boundary: &[u8]) -> Result<Self, DemuxError> {
        if boundary.is_empty() {
            return Err(DemuxError::EmptyBoundary);
        }
        Ok(Self {
            source,
            boundary: boundary.to_vec(),
            buffer: BytesMut::with_capacity(256 * 1024),
            aligned: false,
            bytes_read: 0,
        })
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Next payload in wire order.
    pub async fn next_payload(&mut self) -> Result<EncodedPayload, DemuxError> {
        let token_len = self.boundary.len();
        loop {
            if !self.aligned {
                self.align().await?;
            }

            // Search strictly after the leading token; bytes already scanned
            // are never scanned again, except a tail that may hold a split token.
            let mut scan_from = token_len;
            let next = loop {
                if self.buffer.len() > scan_from {
                    if let Some(rel) = find_subsequence(&self.buffer[scan_from..], &self.boundary) {
                        break scan_from + rel;
                    }
                    scan_from = self
                        .buffer
                        .len()
                        .saturating_sub(token_len - 1)
                        .max(token_len);
                }
                if self.buffer.len() > MAX_SECTION_BYTES {
                    return Err(DemuxError::SectionTooLarge(MAX_SECTION_BYTES));
                }
                self.fill().await?;
            };

            // `buffer` now starts at the next token.
            let section = self.buffer.split_to(next).freeze();
            match find_subsequence(&section[token_len..], HEADER_END) {
                Some(pos) => {
                    let start = token_len + pos + HEADER_END.len();
                    return Ok(EncodedPayload::new(section.slice(start..)));
                }
                None => {
                    warn!(
                        bytes = section.len(),
                        "multipart section has no header terminator, skipping"
                    );
                }
            }
        }
    }

    /// Discard bytes up to the first boundary token.
    async fn align(&mut self) -> Result<(), DemuxError> {
        let keep = self.boundary.len() - 1;
        loop {
            if let Some(pos) = find_subsequence(&self.buffer, &self.boundary) {
                self.buffer.advance(pos);
                self.aligned = true;
                return Ok(());
            }
            // Keep the last few bytes in case the token spans reads.
            if self.buffer.len() > keep {
                let preamble = self.buffer.len() - keep;
                self.buffer.advance(preamble);
            }
            self.fill().await?;
        }
    }

    async fn fill(&mut self) -> Result<(), DemuxError> {
        match self.source.next().await {
            Some(Ok(chunk)) => {
                self.bytes_read += chunk.len() as u64;
                self.buffer.extend_from_slice(&chunk);
                Ok(())
            }
            Some(Err(e)) => Err(DemuxError::Read(e.to_string())),
            None => Err(DemuxError::StreamEnded),
        }
    }
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// The `boundary` parameter of a multipart `Content-Type` header value.
fn boundary_param(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("boundary")
            .then(|| value.trim().trim_matches('"'))
    })
}

/// Whether a header boundary parameter names the same token as `token`
/// (which includes the leading dashes).
fn boundary_matches(param: &str, token: &str) -> bool {
    let bare = token.strip_prefix("--").unwrap_or(token);
    param == bare || param == token
}

/// First wait before reconnecting; doubled after each failed attempt.
const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Consume the MJPEG stream at `url` and feed payloads to the decode pool.
/// Reconnects with exponential backoff on failure when `reconnect` is set,
/// otherwise the first failure is returned.
pub async fn run_mjpeg_receiver<C: FrameCodec>(
    url: &str,
    boundary: &str,
    reconnect: bool,
    pool: &mut DecodePool<C>,
    cancel: &CancellationToken,
) -> Result<(), ReceiverError> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(ReceiverError::HttpConnect)?;
    let client = &client;

    supervise(boundary, reconnect, pool, cancel, move || {
        open_stream(client, url, boundary)
    })
    .await
}

/// Connection loop around `connect`. Every stream it yields is demuxed into
/// the pool until it fails. The backoff starts over after a connection that
/// delivered at least one payload. Cancellation always ends the loop with
/// `Ok`.
pub async fn supervise<C, F, Fut, S, E>(
    boundary: &str,
    reconnect: bool,
    pool: &mut DecodePool<C>,
    cancel: &CancellationToken,
    mut connect: F,
) -> Result<(), ReceiverError>
where
    C: FrameCodec,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<S, ReceiverError>>,
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let dispatched_before = pool.dispatched();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            outcome = consume(connect(), boundary, pool) => outcome,
        };
        let received = pool.dispatched() - dispatched_before;

        let Err(e) = outcome else { continue };
        if !reconnect {
            error!(error = %e, received, "stream failed");
            return Err(e);
        }
        if received > 0 {
            backoff = INITIAL_BACKOFF;
        }
        warn!(error = %e, received, "stream error, reconnecting in {:?}", backoff);
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn consume<C, S, E>(
    connecting: impl Future<Output = Result<S, ReceiverError>>,
    boundary: &str,
    pool: &mut DecodePool<C>,
) -> Result<(), ReceiverError>
where
    C: FrameCodec,
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut demuxer = MjpegDemuxer::new(connecting.await?, boundary.as_bytes())?;
    loop {
        let payload = demuxer.next_payload().await?;
        debug!(
            bytes = payload.len(),
            total_read = demuxer.bytes_read(),
            "payload extracted"
        );
        pool.dispatch(payload).await;
    }
}

/// GET `url` and hand back its body once the response looks like an MJPEG
/// stream.
async fn open_stream(
    client: &reqwest::Client,
    url: &str,
    boundary: &str,
) -> Result<BoxStream<'static, reqwest::Result<Bytes>>, ReceiverError> {
    info!(url, "connecting to MJPEG stream");
    let response = client
        .get(url)
        .send()
        .await
        .map_err(ReceiverError::HttpConnect)?;

    if !response.status().is_success() {
        return Err(ReceiverError::HttpStatus(response.status().as_u16()));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    match boundary_param(&content_type) {
        Some(param) if !boundary_matches(param, boundary) => {
            warn!(
                header = param,
                configured = boundary,
                "server announces a different multipart boundary"
            );
        }
        Some(_) => {}
        None => debug!(content_type, "response has no multipart boundary parameter"),
    }

    info!(status = %response.status(), content_type, "connected to MJPEG stream");
    Ok(response.bytes_stream().boxed())
}
