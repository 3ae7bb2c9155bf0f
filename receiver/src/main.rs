mod decode;
mod display;
mod mjpeg;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use camrelay_common::channel::{frame_channel, FrameReceiver};
use camrelay_common::clip::{check_ffmpeg_available, FfmpegClipFactory, RotatingClipWriter};
use camrelay_common::codec::JpegCodec;
use camrelay_common::config::{parse_duration, Config};
use camrelay_common::keys::ClipNamer;
use clap::Parser;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, thiserror::Error)]
pub enum ReceiverError {
    #[error("HTTP connection failed: {0}")]
    HttpConnect(reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("demux error: {0}")]
    Demux(#[from] mjpeg::DemuxError),
    #[error("clip writer error: {0}")]
    Clip(#[from] camrelay_common::clip::ClipError),
    #[error("display error: {0}")]
    Display(#[from] display::DisplayError),
    #[error("failed to create output dir {0}: {1}")]
    OutputDir(String, std::io::Error),
}

/// Receive an MJPEG stream and record it to rotating clips or show it live.
#[derive(Debug, Parser)]
#[command(name = "camrelay-receiver", version)]
struct Args {
    /// TOML config file; built-in defaults are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Stream URL.
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    fps: Option<f64>,
    /// Frame width.
    #[arg(long = "w")]
    width: Option<u32>,
    /// Frame height.
    #[arg(long = "h")]
    height: Option<u32>,
    /// Clip length, e.g. 1h, 90s, 1h30m.
    #[arg(long, value_parser = parse_duration)]
    clip: Option<Duration>,
    /// Show frames in a window instead of recording them.
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    onscreen: Option<bool>,
    /// Reconnect with backoff when the stream drops.
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    reconnect: Option<bool>,
    /// Multipart boundary token, leading dashes included.
    #[arg(long)]
    boundary: Option<String>,
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(host) = self.host {
            config.receiver.url = host;
        }
        if let Some(fps) = self.fps {
            config.video.fps = fps;
        }
        if let Some(width) = self.width {
            config.video.width = width;
        }
        if let Some(height) = self.height {
            config.video.height = height;
        }
        if let Some(clip) = self.clip {
            config.recording.clip = clip;
        }
        if let Some(onscreen) = self.onscreen {
            config.receiver.onscreen = onscreen;
        }
        if let Some(reconnect) = self.reconnect {
            config.receiver.reconnect = reconnect;
        }
        if let Some(boundary) = self.boundary {
            config.stream.boundary = boundary;
        }
        if let Some(dir) = self.output_dir {
            config.recording.output_dir = dir;
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut config = match Config::load_or_default(args.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };
    args.apply(&mut config);
    if let Err(e) = config.validate() {
        eprintln!("{e}");
        std::process::exit(1);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        url = config.receiver.url,
        boundary = config.stream.boundary,
        width = config.video.width,
        height = config.video.height,
        fps = config.video.fps,
        clip = ?config.recording.clip,
        onscreen = config.receiver.onscreen,
        reconnect = config.receiver.reconnect,
        "starting camrelay receiver"
    );

    if let Err(e) = run(config).await {
        error!(error = %e, "receiver failed");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), ReceiverError> {
    check_ffmpeg_available().await;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            ctrl_c.cancel();
        }
    });

    let (frames_tx, frames_rx) = frame_channel(config.stream.channel_capacity);
    let sink = spawn_sink(&config, frames_rx, cancel.clone()).await?;

    let workers = decode::resolve_workers(config.receiver.decode_workers);
    info!(workers, "decode pool started");
    let codec = Arc::new(JpegCodec::new(config.stream.jpeg_quality));
    let (mut pool, forwarder) = decode::spawn_decode_pool(codec, workers, frames_tx);

    let received = mjpeg::run_mjpeg_receiver(
        &config.receiver.url,
        &config.stream.boundary,
        config.receiver.reconnect,
        &mut pool,
        &cancel,
    )
    .await;

    // Dropping the pool lets the forwarder drain and signal end-of-stream.
    drop(pool);
    if let Ok(stats) = forwarder.await {
        info!(forwarded = stats.forwarded, dropped = stats.dropped, "frames delivered");
    }
    let sunk = match sink.await {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "sink task panicked");
            Ok(())
        }
    };

    received?;
    sunk
}

/// Start the consumer of decoded frames: a window when onscreen, clips
/// otherwise. The sink cancels `cancel` when it stops on its own.
async fn spawn_sink(
    config: &Config,
    rx: FrameReceiver,
    cancel: CancellationToken,
) -> Result<JoinHandle<Result<(), ReceiverError>>, ReceiverError> {
    let video = &config.video;

    if config.receiver.onscreen {
        let window =
            display::FfplayWindow::open(video.width, video.height, video.fps, display::WINDOW_TITLE)?;
        return Ok(tokio::spawn(async move {
            display::run_display_sink(Box::new(window), rx).await;
            cancel.cancel();
            Ok(())
        }));
    }

    let recording = &config.recording;
    tokio::fs::create_dir_all(&recording.output_dir)
        .await
        .map_err(|e| ReceiverError::OutputDir(recording.output_dir.display().to_string(), e))?;
    let factory = FfmpegClipFactory {
        width: video.width,
        height: video.height,
        fps: video.fps,
        video_codec: recording.video_codec.clone(),
    };
    let namer = ClipNamer::new(&recording.output_dir, &recording.container);
    let writer = RotatingClipWriter::new(factory, namer, config.clip_target_frames());
    info!(
        dir = %recording.output_dir.display(),
        target_frames = writer.target_frames(),
        "recording clips"
    );

    Ok(tokio::spawn(async move {
        let result = writer.run(rx).await;
        cancel.cancel();
        let summary = result?;
        info!(clips = summary.clips, frames = summary.frames, "recording finished");
        Ok(())
    }))
}
