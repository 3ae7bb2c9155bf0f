use std::process::Stdio;

use async_trait::async_trait;
use camrelay_common::channel::FrameSender;
use camrelay_common::config::InputCodec;
use camrelay_common::frame::RawFrame;
use camrelay_common::overlay::stamp_timestamp;
use chrono::Local;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("failed to open capture device {0}: {1}")]
    Open(u32, String),
    #[error("failed to read frame: {0}")]
    Read(String),
    #[error("capture device stopped producing frames")]
    Ended,
}

/// A camera handing out one frame per read.
#[async_trait]
pub trait CaptureDevice: Send {
    /// `Ok(None)` is an empty grab; the caller skips it and reads again.
    async fn read(&mut self) -> Result<Option<RawFrame>, CaptureError>;

    async fn close(self: Box<Self>);
}

/// Camera capture through an ffmpeg subprocess emitting rgb24 rawvideo on
/// stdout.
pub struct FfmpegCapture {
    child: Child,
    stdout: ChildStdout,
    width: u32,
    height: u32,
}

impl FfmpegCapture {
    pub fn open(
        device_id: u32,
        codec: InputCodec,
        width: u32,
        height: u32,
        fps: f64,
    ) -> Result<Self, CaptureError> {
        let size = format!("{width}x{height}");
        let fps_str = fps.to_string();

        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-hide_banner", "-nostats", "-loglevel", "error"]);
        if cfg!(target_os = "linux") {
            cmd.args([
                "-f", "v4l2",
                "-input_format", codec.ffmpeg_input_format(),
                "-video_size", &size,
                "-framerate", &fps_str,
            ])
            .arg("-i")
            .arg(format!("/dev/video{device_id}"));
        } else {
            cmd.args([
                "-f", "avfoundation",
                "-video_size", &size,
                "-framerate", &fps_str,
            ])
            .arg("-i")
            .arg(device_id.to_string());
        }
        cmd.args([
            "-f", "rawvideo",
            "-pix_fmt", "rgb24",
            "-s", &size,
            "pipe:1",
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| CaptureError::Open(device_id, e.to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::Open(device_id, "could not get stdout handle".into()))?;

        debug!(
            device_id,
            input_format = codec.ffmpeg_input_format(),
            size,
            fps,
            "ffmpeg capture started"
        );
        Ok(Self {
            child,
            stdout,
            width,
            height,
        })
    }
}

#[async_trait]
impl CaptureDevice for FfmpegCapture {
    async fn read(&mut self) -> Result<Option<RawFrame>, CaptureError> {
        let mut data = vec![0u8; RawFrame::expected_len(self.width, self.height)];
        match self.stdout.read_exact(&mut data).await {
            Ok(_) => Ok(Some(RawFrame::new(self.width, self.height, data))),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(CaptureError::Ended),
            Err(e) => Err(CaptureError::Read(e.to_string())),
        }
    }

    async fn close(mut self: Box<Self>) {
        if let Err(e) = self.child.kill().await {
            debug!(error = %e, "capture process already gone");
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CaptureStats {
    pub captured: u64,
}

/// Read, stamp and fan out frames until cancelled or the device fails.
///
/// Every frame goes to `live`; when `record` is set a copy follows it there.
/// Pushes are sequential, so a full recording channel holds up the next
/// read. Both channels get an end-of-stream marker on the way out.
pub async fn run_capture(
    device: &mut dyn CaptureDevice,
    live: FrameSender,
    record: Option<FrameSender>,
    cancel: CancellationToken,
) -> Result<CaptureStats, CaptureError> {
    let mut stats = CaptureStats::default();

    let result = loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            read = device.read() => read,
        };
        let mut frame = match read {
            Ok(Some(frame)) if !frame.is_empty() => frame,
            Ok(_) => {
                trace!("empty grab, retrying");
                continue;
            }
            Err(e) => break Err(e),
        };
        stamp_timestamp(&mut frame, &Local::now());
        stats.captured += 1;

        let copy = record.as_ref().map(|_| frame.clone());
        if live.push(frame).await.is_err() {
            info!("live channel closed, stopping capture");
            break Ok(());
        }
        if let (Some(record), Some(copy)) = (&record, copy) {
            if record.push(copy).await.is_err() {
                info!("recording channel closed, stopping capture");
                break Ok(());
            }
        }
        if stats.captured % 300 == 0 {
            debug!(captured = stats.captured, "capture progress");
        }
    };

    for tx in std::iter::once(&live).chain(record.as_ref()) {
        if tx.end_of_stream().await.is_err() {
            debug!("consumer gone before end of stream");
        }
    }

    match result {
        Ok(()) => {
            info!(captured = stats.captured, "capture stopped");
            Ok(stats)
        }
        Err(e) => {
            warn!(captured = stats.captured, error = %e, "capture failed");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camrelay_common::channel::{frame_channel, FrameReceiver, Recv};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Plays back a script of grabs, then either fails or loops forever.
    struct ScriptedCamera {
        script: VecDeque<Option<RawFrame>>,
        endless: bool,
        reads: Arc<AtomicUsize>,
    }

    impl ScriptedCamera {
        fn new(script: Vec<Option<RawFrame>>, endless: bool) -> (Self, Arc<AtomicUsize>) {
            let reads = Arc::new(AtomicUsize::new(0));
            let camera = Self {
                script: script.into(),
                endless,
                reads: reads.clone(),
            };
            (camera, reads)
        }
    }

    #[async_trait]
    impl CaptureDevice for ScriptedCamera {
        async fn read(&mut self) -> Result<Option<RawFrame>, CaptureError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if let Some(grab) = self.script.pop_front() {
                return Ok(grab);
            }
            if self.endless {
                tokio::task::yield_now().await;
                return Ok(Some(RawFrame::blank(16, 16)));
            }
            Err(CaptureError::Ended)
        }

        async fn close(self: Box<Self>) {}
    }

    async fn drain(rx: &mut FrameReceiver) -> Vec<RawFrame> {
        let mut frames = Vec::new();
        loop {
            match rx.pop().await {
                Recv::Frame(f) => frames.push(f),
                Recv::EndOfStream | Recv::Closed => return frames,
            }
        }
    }

    #[tokio::test]
    async fn live_only_when_recording_disabled() {
        let script = vec![Some(RawFrame::blank(16, 16)); 3];
        let (mut camera, _) = ScriptedCamera::new(script, false);
        let (live_tx, mut live_rx) = frame_channel(8);

        let result = run_capture(&mut camera, live_tx, None, CancellationToken::new()).await;
        assert!(matches!(result, Err(CaptureError::Ended)));

        let frames = drain(&mut live_rx).await;
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.captured_at_ms.is_some()));
    }

    #[tokio::test]
    async fn recording_gets_an_identical_copy() {
        let script = vec![Some(RawFrame::blank(16, 16)); 4];
        let (mut camera, _) = ScriptedCamera::new(script, false);
        let (live_tx, mut live_rx) = frame_channel(8);
        let (rec_tx, mut rec_rx) = frame_channel(8);

        let _ = run_capture(&mut camera, live_tx, Some(rec_tx), CancellationToken::new()).await;

        let live = drain(&mut live_rx).await;
        let recorded = drain(&mut rec_rx).await;
        assert_eq!(live.len(), 4);
        assert_eq!(live, recorded);
    }

    #[tokio::test]
    async fn empty_grabs_are_skipped() {
        let script = vec![
            None,
            Some(RawFrame::blank(16, 16)),
            Some(RawFrame::new(0, 0, vec![])),
            None,
            Some(RawFrame::blank(16, 16)),
        ];
        let (mut camera, reads) = ScriptedCamera::new(script, false);
        let (live_tx, mut live_rx) = frame_channel(8);

        let _ = run_capture(&mut camera, live_tx, None, CancellationToken::new()).await;

        assert_eq!(drain(&mut live_rx).await.len(), 2);
        assert_eq!(reads.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn full_recording_channel_stalls_capture() {
        let (mut camera, reads) = ScriptedCamera::new(vec![], true);
        let (live_tx, mut live_rx) = frame_channel(64);
        let (rec_tx, mut rec_rx) = frame_channel(2);
        let cancel = CancellationToken::new();

        let stop = cancel.clone();
        let capture = tokio::spawn(async move {
            run_capture(&mut camera, live_tx, Some(rec_tx), stop).await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        // Two copies fill the recording channel; the third waits for room
        // and nothing further is read.
        assert_eq!(reads.load(Ordering::SeqCst), 3);

        cancel.cancel();
        let recorded = drain(&mut rec_rx).await;
        assert!(recorded.len() >= 3);
        let stats = capture.await.unwrap().unwrap();
        assert_eq!(stats.captured as usize, recorded.len());
        assert_eq!(drain(&mut live_rx).await.len(), recorded.len());
    }

    #[tokio::test]
    async fn cancellation_ends_both_channels() {
        let (mut camera, _) = ScriptedCamera::new(vec![], true);
        let (live_tx, mut live_rx) = frame_channel(4);
        let (rec_tx, mut rec_rx) = frame_channel(4);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let stats = run_capture(&mut camera, live_tx, Some(rec_tx), cancel)
            .await
            .unwrap();
        assert_eq!(stats.captured, 0);
        assert!(matches!(live_rx.pop().await, Recv::EndOfStream));
        assert!(matches!(rec_rx.pop().await, Recv::EndOfStream));
    }
}
