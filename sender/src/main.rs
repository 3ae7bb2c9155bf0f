mod capture;
mod stream;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use camrelay_common::channel::frame_channel;
use camrelay_common::clip::{check_ffmpeg_available, FfmpegClipFactory, RotatingClipWriter};
use camrelay_common::codec::JpegCodec;
use camrelay_common::config::{parse_duration, Config, InputCodec};
use camrelay_common::keys::ClipNamer;
use capture::{CaptureDevice, FfmpegCapture};
use clap::Parser;
use stream::MultipartSink;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, thiserror::Error)]
pub enum SenderError {
    #[error("capture error: {0}")]
    Capture(#[from] capture::CaptureError),
    #[error("clip writer error: {0}")]
    Clip(#[from] camrelay_common::clip::ClipError),
    #[error("failed to bind {0}: {1}")]
    Bind(String, std::io::Error),
    #[error("HTTP server error: {0}")]
    Serve(std::io::Error),
    #[error("failed to create output dir {0}: {1}")]
    OutputDir(String, std::io::Error),
}

/// Capture a camera, serve it as MJPEG over HTTP and optionally record clips.
#[derive(Debug, Parser)]
#[command(name = "camrelay-sender", version)]
struct Args {
    /// TOML config file; built-in defaults are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Capture device index.
    #[arg(long)]
    id: Option<u32>,
    /// Listen address.
    #[arg(long)]
    host: Option<String>,
    /// Device pixel format: MJPG or YUYV.
    #[arg(long)]
    codec: Option<InputCodec>,
    /// Frame width.
    #[arg(long = "w")]
    width: Option<u32>,
    /// Frame height.
    #[arg(long = "h")]
    height: Option<u32>,
    #[arg(long)]
    fps: Option<f64>,
    /// Clip length, e.g. 1h, 90s, 1h30m.
    #[arg(long, value_parser = parse_duration)]
    clip: Option<Duration>,
    /// Also record captured frames to rotating clips.
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    save: Option<bool>,
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(id) = self.id {
            config.sender.device_id = id;
        }
        if let Some(host) = self.host {
            config.sender.listen = host;
        }
        if let Some(codec) = self.codec {
            config.sender.input_codec = codec;
        }
        if let Some(width) = self.width {
            config.video.width = width;
        }
        if let Some(height) = self.height {
            config.video.height = height;
        }
        if let Some(fps) = self.fps {
            config.video.fps = fps;
        }
        if let Some(clip) = self.clip {
            config.recording.clip = clip;
        }
        if let Some(save) = self.save {
            config.sender.save = save;
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
        device_id = config.sender.device_id,
        listen = config.sender.listen,
        input_codec = ?config.sender.input_codec,
        width = config.video.width,
        height = config.video.height,
        fps = config.video.fps,
        save = config.sender.save,
        "starting camrelay sender"
    );

    if let Err(e) = run(config).await {
        error!(error = %e, "sender failed");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), SenderError> {
    check_ffmpeg_available().await;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            ctrl_c.cancel();
        }
    });

    let video = &config.video;
    let mut device = FfmpegCapture::open(
        config.sender.device_id,
        config.sender.input_codec,
        video.width,
        video.height,
        video.fps,
    )?;

    let listener = tokio::net::TcpListener::bind(&config.sender.listen)
        .await
        .map_err(|e| SenderError::Bind(config.sender.listen.clone(), e))?;
    println!(
        "Capturing. Point your browser to http://{}/",
        config.sender.listen
    );

    let sink = MultipartSink::new(&config.stream.boundary);
    let server_cancel = cancel.clone();
    let app = stream::router(sink.clone());
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
    });

    let (live_tx, live_rx) = frame_channel(config.stream.channel_capacity);
    let codec = Arc::new(JpegCodec::new(config.stream.jpeg_quality));
    let encoder = tokio::spawn(stream::run_stream_encoder(live_rx, codec, sink.clone()));

    let (record_tx, recorder) = if config.sender.save {
        let recording = &config.recording;
        tokio::fs::create_dir_all(&recording.output_dir)
            .await
            .map_err(|e| SenderError::OutputDir(recording.output_dir.display().to_string(), e))?;
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
        let (tx, rx) = frame_channel(config.stream.channel_capacity);
        let recorder_cancel = cancel.clone();
        let recorder = tokio::spawn(async move {
            let result = writer.run(rx).await;
            recorder_cancel.cancel();
            result
        });
        (Some(tx), Some(recorder))
    } else {
        (None, None)
    };

    let captured = capture::run_capture(&mut device, live_tx, record_tx, cancel.clone()).await;
    Box::new(device).close().await;

    if let Ok(published) = encoder.await {
        info!(published, "live stream finished");
    }
    sink.close();
    cancel.cancel();

    let served = match server.await {
        Ok(result) => result.map_err(SenderError::Serve),
        Err(e) => {
            error!(error = %e, "HTTP server task panicked");
            Ok(())
        }
    };

    let recorded = match recorder {
        Some(handle) => match handle.await {
            Ok(result) => result.map(|summary| {
                info!(clips = summary.clips, frames = summary.frames, "recording finished");
            }),
            Err(e) => {
                error!(error = %e, "recording task panicked");
                Ok(())
            }
        },
        None => Ok(()),
    };

    captured?;
    served?;
    recorded?;
    Ok(())
}
