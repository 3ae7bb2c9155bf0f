//! Live MJPEG over HTTP: encodes the live channel and serves the latest JPEG
//! to every connected client as `multipart/x-mixed-replace`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use camrelay_common::channel::{FrameReceiver, Recv};
use camrelay_common::codec::FrameCodec;
use camrelay_common::multipart::{self, format_part};
use futures_util::Stream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Holds the most recent JPEG and hands it to HTTP clients.
///
/// Each `update` replaces the previous image; clients that fall behind only
/// ever see the newest one.
#[derive(Clone)]
pub struct MultipartSink {
    latest: Arc<watch::Sender<Option<Bytes>>>,
    boundary: Arc<str>,
    closed: CancellationToken,
}

impl MultipartSink {
    /// `boundary` is the full token written before each part, dashes included.
    pub fn new(boundary: &str) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            latest: Arc::new(latest),
            boundary: boundary.into(),
            closed: CancellationToken::new(),
        }
    }

    pub fn update(&self, jpeg: Bytes) {
        self.latest.send_replace(Some(jpeg));
    }

    pub fn latest(&self) -> Option<Bytes> {
        self.latest.borrow().clone()
    }

    /// End every open client stream.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Value of the `Content-Type` header for the multipart stream.
    pub fn content_type(&self) -> String {
        multipart::content_type(&self.boundary)
    }

    /// Multipart parts for one client, one per update from now on.
    pub fn parts(&self) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
        let rx = self.latest.subscribe();
        let boundary = self.boundary.clone();
        let closed = self.closed.clone();
        futures_util::stream::unfold(rx, move |mut rx| {
            let boundary = boundary.clone();
            let closed = closed.clone();
            async move {
                loop {
                    tokio::select! {
                        _ = closed.cancelled() => return None,
                        changed = rx.changed() => changed.ok()?,
                    }
                    let jpeg = rx.borrow_and_update().clone();
                    if let Some(jpeg) = jpeg {
                        return Some((Ok(format_part(&boundary, &jpeg)), rx));
                    }
                }
            }
        })
    }
}

pub fn router(sink: MultipartSink) -> Router {
    Router::new()
        .route("/", get(stream_mjpeg))
        .route("/frame.jpg", get(latest_frame))
        .layer(TraceLayer::new_for_http())
        .with_state(sink)
}

async fn stream_mjpeg(State(sink): State<MultipartSink>) -> Response {
    info!("client connected to MJPEG stream");
    (
        [
            (header::CONTENT_TYPE, sink.content_type()),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate".to_string()),
        ],
        Body::from_stream(sink.parts()),
    )
        .into_response()
}

async fn latest_frame(State(sink): State<MultipartSink>) -> Response {
    match sink.latest() {
        Some(jpeg) => ([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "no frame captured yet").into_response(),
    }
}

/// Encode frames from `rx` and publish them to `sink` until end-of-stream.
/// Frames that fail to encode are skipped. Returns the number published.
pub async fn run_stream_encoder<C: FrameCodec>(
    mut rx: FrameReceiver,
    codec: Arc<C>,
    sink: MultipartSink,
) -> u64 {
    let mut published = 0u64;
    loop {
        let frame = match rx.pop().await {
            Recv::Frame(frame) => frame,
            Recv::EndOfStream | Recv::Closed => break,
        };
        let codec = codec.clone();
        match tokio::task::spawn_blocking(move || codec.encode(&frame)).await {
            Ok(Ok(jpeg)) => {
                sink.update(Bytes::from(jpeg));
                published += 1;
            }
            Ok(Err(e)) => warn!(error = %e, "failed to encode frame"),
            Err(e) => warn!(error = %e, "encode task failed"),
        }
        if published % 300 == 0 && published > 0 {
            debug!(published, "stream encoder progress");
        }
    }
    info!(published, "stream encoder stopped");
    published
}

#[cfg(test)]
mod tests {
    use super::*;
    use camrelay_common::channel::frame_channel;
    use camrelay_common::codec::JpegCodec;
    use camrelay_common::frame::RawFrame;
    use futures_util::StreamExt;
    use std::time::Duration;

    #[test]
    fn content_type_drops_leading_dashes() {
        let sink = MultipartSink::new("--MJPEGBOUNDARY");
        assert_eq!(
            sink.content_type(),
            "multipart/x-mixed-replace; boundary=MJPEGBOUNDARY"
        );
    }

    #[test]
    fn update_replaces_previous_image() {
        let sink = MultipartSink::new("--B");
        assert_eq!(sink.latest(), None);
        sink.update(Bytes::from_static(b"one"));
        sink.update(Bytes::from_static(b"two"));
        assert_eq!(sink.latest(), Some(Bytes::from_static(b"two")));
    }

    #[tokio::test]
    async fn slow_client_only_sees_newest_image() {
        let sink = MultipartSink::new("--B");
        let mut parts = Box::pin(sink.parts());

        sink.update(Bytes::from_static(b"old"));
        sink.update(Bytes::from_static(b"new"));
        let part = parts.next().await.unwrap().unwrap();
        assert_eq!(part, format_part("--B", b"new"));

        sink.close();
        assert!(parts.next().await.is_none());
    }

    #[tokio::test]
    async fn latest_frame_is_unavailable_before_first_image() {
        let sink = MultipartSink::new("--B");
        let response = latest_frame(State(sink.clone())).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        sink.update(Bytes::from_static(b"\xFF\xD8\xFF\xD9"));
        let response = latest_frame(State(sink)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");
    }

    #[tokio::test]
    async fn stream_response_announces_boundary() {
        let sink = MultipartSink::new("--MJPEGBOUNDARY");
        let response = stream_mjpeg(State(sink)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "multipart/x-mixed-replace; boundary=MJPEGBOUNDARY"
        );
    }

    #[tokio::test]
    async fn encoder_publishes_jpegs_until_end_of_stream() {
        let (tx, rx) = frame_channel(4);
        let sink = MultipartSink::new("--B");
        let encoder = tokio::spawn(run_stream_encoder(
            rx,
            Arc::new(JpegCodec::default()),
            sink.clone(),
        ));

        tx.push(RawFrame::blank(32, 24)).await.unwrap();
        tx.push(RawFrame::new(4, 4, vec![0; 7])).await.unwrap();
        tx.push(RawFrame::blank(16, 8)).await.unwrap();
        tx.end_of_stream().await.unwrap();

        let published = tokio::time::timeout(Duration::from_secs(5), encoder)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(published, 2);
        let jpeg = sink.latest().unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }
}
