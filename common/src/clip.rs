use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use chrono::Local;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::channel::{FrameReceiver, Recv};
use crate::frame::RawFrame;
use crate::keys::ClipNamer;

/// An open output file receiving frames.
#[async_trait]
pub trait ClipSink: Send {
    async fn write_frame(&mut self, frame: &RawFrame) -> Result<(), ClipError>;

    /// Flush and finalize the container.
    async fn finish(self: Box<Self>) -> Result<FinishedClip, ClipError>;
}

/// Opens a [`ClipSink`] at a path.
#[async_trait]
pub trait ClipFactory: Send + Sync {
    async fn open(&self, path: &Path) -> Result<Box<dyn ClipSink>, ClipError>;
}

#[derive(Debug, Clone)]
pub struct FinishedClip {
    pub path: PathBuf,
    pub frame_count: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ClipError {
    #[error("failed to spawn ffmpeg: {0}")]
    Spawn(String),
    #[error("failed to write frame to ffmpeg stdin: {0}")]
    Write(String),
    #[error("failed to wait for ffmpeg: {0}")]
    Wait(String),
    #[error("ffmpeg exited with non-zero status: {0}")]
    FfmpegFailed(String),
    #[error("{0} clip(s) failed to finalize")]
    Finalize(u64),
    #[error("frame is {got_width}x{got_height}, clip expects {width}x{height}")]
    FrameSize {
        width: u32,
        height: u32,
        got_width: u32,
        got_height: u32,
    },
}

/// Video container writer backed by an ffmpeg subprocess fed rgb24 rawvideo
/// on stdin.
#[derive(Debug, Clone)]
pub struct FfmpegClipFactory {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub video_codec: String,
}

#[async_trait]
impl ClipFactory for FfmpegClipFactory {
    async fn open(&self, path: &Path) -> Result<Box<dyn ClipSink>, ClipError> {
        let clip = FfmpegClip::start(path, self.width, self.height, self.fps, &self.video_codec)?;
        Ok(Box::new(clip))
    }
}

pub struct FfmpegClip {
    child: Child,
    stdin: ChildStdin,
    path: PathBuf,
    width: u32,
    height: u32,
    frame_count: u64,
}

impl FfmpegClip {
    pub fn start(
        path: &Path,
        width: u32,
        height: u32,
        fps: f64,
        video_codec: &str,
    ) -> Result<Self, ClipError> {
        let size = format!("{width}x{height}");
        let fps_str = fps.to_string();

        let mut cmd = Command::new("ffmpeg");
        cmd.args([
            "-hide_banner",
            "-nostats",
            "-loglevel", "error",
            "-f", "rawvideo",
            "-pix_fmt", "rgb24",
            "-s", &size,
            "-r", &fps_str,
            "-i", "pipe:0",
            "-c:v", video_codec,
            "-pix_fmt", "yuv420p",
            "-y",
        ])
        .arg(path)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| ClipError::Spawn(e.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ClipError::Spawn("could not get stdin handle".into()))?;

        debug!(
            codec = video_codec,
            fps,
            size,
            output = %path.display(),
            "ffmpeg clip writer started"
        );

        Ok(Self {
            child,
            stdin,
            path: path.to_path_buf(),
            width,
            height,
            frame_count: 0,
        })
    }
}

#[async_trait]
impl ClipSink for FfmpegClip {
    async fn write_frame(&mut self, frame: &RawFrame) -> Result<(), ClipError> {
        if !frame.has_size(self.width, self.height) {
            return Err(ClipError::FrameSize {
                width: self.width,
                height: self.height,
                got_width: frame.width,
                got_height: frame.height,
            });
        }
        self.stdin
            .write_all(&frame.data)
            .await
            .map_err(|e| ClipError::Write(e.to_string()))?;
        self.frame_count += 1;
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<FinishedClip, ClipError> {
        let FfmpegClip {
            child,
            stdin,
            path,
            frame_count,
            ..
        } = *self;
        // Closing stdin tells ffmpeg there are no more frames.
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ClipError::Wait(e.to_string()))?;

        if frame_count == 0 {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to remove empty clip");
                }
            }
            return Ok(FinishedClip { path, frame_count });
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(stderr = %stderr, path = %path.display(), "ffmpeg exited with error");
            return Err(ClipError::FfmpegFailed(stderr.into_owned()));
        }

        Ok(FinishedClip { path, frame_count })
    }
}

/// Clips holding at least one frame, and the frames written across them.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RotationSummary {
    pub clips: u64,
    pub frames: u64,
}

/// The writer gives up once this many finalizations in a row have failed.
const MAX_CONSECUTIVE_FINALIZE_FAILURES: u64 = 3;

/// Outcome of background clip finalizations.
#[derive(Debug, Default)]
struct Finalized {
    clips: u64,
    failed: u64,
    failed_in_a_row: u64,
}

impl Finalized {
    fn record(&mut self, joined: Result<Result<FinishedClip, ClipError>, tokio::task::JoinError>) {
        match joined {
            Ok(Ok(done)) => {
                self.failed_in_a_row = 0;
                if done.frame_count > 0 {
                    self.clips += 1;
                    info!(path = %done.path.display(), frames = done.frame_count, "clip finalized");
                } else {
                    debug!(path = %done.path.display(), "empty clip discarded");
                }
            }
            Ok(Err(e)) => {
                self.failed += 1;
                self.failed_in_a_row += 1;
                error!(error = %e, failed = self.failed, "failed to finalize clip");
            }
            Err(e) => {
                self.failed += 1;
                self.failed_in_a_row += 1;
                error!(error = %e, "clip finalizer panicked");
            }
        }
    }
}

enum ClipEnd {
    Full,
    EndOfStream,
    Closed,
    Failed(ClipError),
}

/// Drains a frame channel into successive clips of at most `target_frames`
/// frames each.
pub struct RotatingClipWriter<F> {
    factory: F,
    namer: ClipNamer,
    target_frames: u64,
}

impl<F: ClipFactory> RotatingClipWriter<F> {
    pub fn new(factory: F, namer: ClipNamer, target_frames: u64) -> Self {
        Self {
            factory,
            namer,
            target_frames: target_frames.max(1),
        }
    }

    pub fn target_frames(&self) -> u64 {
        self.target_frames
    }

    /// Rotate clips until the channel closes. A clip is closed when it holds
    /// `target_frames` frames or when an end-of-stream marker arrives, and a
    /// fresh clip is opened right after. Clips are finalized in the
    /// background; all of them are finished before this returns, and any
    /// finalization failure turns the result into [`ClipError::Finalize`].
    /// Writing stops early after repeated finalization failures.
    pub async fn run(mut self, mut rx: FrameReceiver) -> Result<RotationSummary, ClipError> {
        let mut finalizing = JoinSet::new();
        let mut finalized = Finalized::default();
        let mut frames = 0u64;

        let result = loop {
            while let Some(joined) = finalizing.try_join_next() {
                finalized.record(joined);
            }
            if finalized.failed_in_a_row >= MAX_CONSECUTIVE_FINALIZE_FAILURES {
                error!(
                    failed = finalized.failed_in_a_row,
                    "clips keep failing to finalize, stopping recording"
                );
                break Ok(());
            }

            let path = self.namer.next_path(&Local::now());
            let mut clip = match self.factory.open(&path).await {
                Ok(c) => c,
                Err(e) => {
                    error!(path = %path.display(), error = %e, "failed to open clip");
                    break Err(e);
                }
            };
            info!(path = %path.display(), target_frames = self.target_frames, "clip opened");

            let (written, end) = self.fill_clip(clip.as_mut(), &mut rx).await;
            frames += written;
            debug!(path = %path.display(), written, "closing clip");
            finalizing.spawn(clip.finish());

            match end {
                ClipEnd::Full | ClipEnd::EndOfStream => continue,
                ClipEnd::Closed => break Ok(()),
                ClipEnd::Failed(e) => {
                    error!(path = %path.display(), error = %e, "clip write failed");
                    break Err(e);
                }
            }
        };

        while let Some(joined) = finalizing.join_next().await {
            finalized.record(joined);
        }

        result?;
        if finalized.failed > 0 {
            return Err(ClipError::Finalize(finalized.failed));
        }
        Ok(RotationSummary {
            clips: finalized.clips,
            frames,
        })
    }

    async fn fill_clip(&self, clip: &mut dyn ClipSink, rx: &mut FrameReceiver) -> (u64, ClipEnd) {
        let mut written = 0u64;
        while written < self.target_frames {
            match rx.pop().await {
                Recv::Frame(frame) => match clip.write_frame(&frame).await {
                    Ok(()) => written += 1,
                    Err(e @ ClipError::FrameSize { .. }) => {
                        warn!(error = %e, "skipping frame");
                    }
                    Err(e) => return (written, ClipEnd::Failed(e)),
                },
                Recv::EndOfStream => return (written, ClipEnd::EndOfStream),
                Recv::Closed => return (written, ClipEnd::Closed),
            }
        }
        (written, ClipEnd::Full)
    }
}

/// Check whether ffmpeg is available on PATH. Logs a warning if not found.
pub async fn check_ffmpeg_available() {
    match Command::new("ffmpeg").arg("-version").output().await {
        Ok(out) if out.status.success() => {
            debug!("ffmpeg is available");
        }
        Ok(_) => {
            warn!("ffmpeg returned non-zero for -version; capture and recording may fail");
        }
        Err(e) => {
            warn!(
                error = %e,
                "ffmpeg not found on PATH; capture, recording and display will fail"
            );
        }
    }
}
