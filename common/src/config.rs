use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub video: VideoConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub receiver: ReceiverConfig,
    #[serde(default)]
    pub sender: SenderConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Full boundary token as it appears on the wire, leading dashes included.
    #[serde(default = "default_boundary")]
    pub boundary: String,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VideoConfig {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordingConfig {
    #[serde(
        default = "default_clip_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub clip: Duration,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_container")]
    pub container: String,
    #[serde(default = "default_video_codec")]
    pub video_codec: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReceiverConfig {
    #[serde(default = "default_source_url")]
    pub url: String,
    #[serde(default)]
    pub onscreen: bool,
    #[serde(default)]
    pub reconnect: bool,
    /// Concurrent decodes; 0 means one per available CPU.
    #[serde(default)]
    pub decode_workers: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SenderConfig {
    #[serde(default)]
    pub device_id: u32,
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub input_codec: InputCodec,
    #[serde(default)]
    pub save: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Pixel format requested from the capture device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum InputCodec {
    #[default]
    #[serde(rename = "MJPG", alias = "mjpg")]
    Mjpg,
    #[serde(rename = "YUYV", alias = "yuyv")]
    Yuyv,
}

impl InputCodec {
    /// Name of the matching ffmpeg `-input_format`.
    pub fn ffmpeg_input_format(&self) -> &'static str {
        match self {
            InputCodec::Mjpg => "mjpeg",
            InputCodec::Yuyv => "yuyv422",
        }
    }
}

impl FromStr for InputCodec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MJPG" => Ok(InputCodec::Mjpg),
            "YUYV" => Ok(InputCodec::Yuyv),
            _ => Err(ConfigError::Invalid(format!(
                "unknown input codec {s:?}, expected MJPG or YUYV"
            ))),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            boundary: default_boundary(),
            channel_capacity: default_channel_capacity(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            clip: default_clip_duration(),
            output_dir: default_output_dir(),
            container: default_container(),
            video_codec: default_video_codec(),
        }
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            url: default_source_url(),
            onscreen: false,
            reconnect: false,
            decode_workers: 0,
        }
    }
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            listen: default_listen(),
            input_codec: InputCodec::default(),
            save: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Load from `path` when given, otherwise start from built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stream.boundary.is_empty() {
            return Err(ConfigError::Invalid("boundary token must not be empty".into()));
        }
        if self.stream.channel_capacity == 0 {
            return Err(ConfigError::Invalid("channel capacity must be at least 1".into()));
        }
        if !(1..=100).contains(&self.stream.jpeg_quality) {
            return Err(ConfigError::Invalid(format!(
                "jpeg quality {} out of range 1..=100",
                self.stream.jpeg_quality
            )));
        }
        if self.video.width == 0 || self.video.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "frame size {}x{} must be non-zero",
                self.video.width, self.video.height
            )));
        }
        if !(self.video.fps.is_finite() && self.video.fps > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "fps must be positive, got {}",
                self.video.fps
            )));
        }
        if self.clip_target_frames() == 0 {
            return Err(ConfigError::Invalid(format!(
                "clip of {:?} at {} fps holds no frames",
                self.recording.clip, self.video.fps
            )));
        }
        Ok(())
    }

    /// Frames per clip: floor(clip seconds x fps).
    pub fn clip_target_frames(&self) -> u64 {
        clip_target_frames(self.recording.clip, self.video.fps)
    }
}

pub fn clip_target_frames(clip: Duration, fps: f64) -> u64 {
    (clip.as_secs_f64() * fps).floor() as u64
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid duration {0:?}")]
    Duration(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Parse a duration such as `1h`, `90s`, `1h30m` or `1.5m`.
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let bad = || ConfigError::Duration(input.to_string());
    let s = input.trim();
    if s.is_empty() {
        return Err(bad());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total_nanos = 0.0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(bad)?;
        if num_len == 0 {
            return Err(bad());
        }
        let value: f64 = rest[..num_len].parse().map_err(|_| bad())?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit_nanos = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return Err(bad()),
        };
        rest = &rest[unit_len..];
        total_nanos += value * unit_nanos;
    }

    if !total_nanos.is_finite() || total_nanos >= u64::MAX as f64 {
        return Err(bad());
    }
    Ok(Duration::from_nanos(total_nanos.round() as u64))
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}

// Default value functions
fn default_boundary() -> String {
    "--MJPEGBOUNDARY".into()
}
fn default_channel_capacity() -> usize {
    30
}
fn default_jpeg_quality() -> u8 {
    80
}
fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    480
}
fn default_fps() -> f64 {
    30.0
}
fn default_clip_duration() -> Duration {
    Duration::from_secs(3600)
}
fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_container() -> String {
    "mkv".into()
}
fn default_video_codec() -> String {
    "libx264".into()
}
fn default_source_url() -> String {
    "http://0.0.0.0:3000".into()
}
fn default_listen() -> String {
    "0.0.0.0:3000".into()
}
fn default_log_level() -> String {
    "info".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_cli_surface() {
        let config = Config::default();
        assert_eq!(config.stream.boundary, "--MJPEGBOUNDARY");
        assert_eq!(config.stream.channel_capacity, 30);
        assert_eq!(config.video.width, 640);
        assert_eq!(config.video.height, 480);
        assert_eq!(config.video.fps, 30.0);
        assert_eq!(config.recording.clip, Duration::from_secs(3600));
        assert_eq!(config.receiver.url, "http://0.0.0.0:3000");
        assert_eq!(config.sender.listen, "0.0.0.0:3000");
        assert_eq!(config.sender.input_codec, InputCodec::Mjpg);
        assert!(!config.receiver.onscreen);
        assert!(!config.sender.save);
        config.validate().unwrap();
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [video]
            fps = 10.0

            [recording]
            clip = "2s"

            [sender]
            input_codec = "YUYV"
            "#,
        )
        .unwrap();
        assert_eq!(config.video.fps, 10.0);
        assert_eq!(config.video.width, 640);
        assert_eq!(config.recording.clip, Duration::from_secs(2));
        assert_eq!(config.recording.container, "mkv");
        assert_eq!(config.sender.input_codec, InputCodec::Yuyv);
        assert_eq!(config.clip_target_frames(), 20);
    }

    #[test]
    fn bad_clip_string_is_a_parse_error() {
        let result: Result<Config, _> = toml::from_str("[recording]\nclip = \"soon\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1.5m").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn parse_duration_rejects_garbage() {
        for bad in ["", "h", "10", "5x", "1h-3m", "..s"] {
            assert!(parse_duration(bad).is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn target_frames_floors() {
        assert_eq!(clip_target_frames(Duration::from_secs(2), 10.0), 20);
        assert_eq!(clip_target_frames(Duration::from_millis(1500), 29.97), 44);
        assert_eq!(clip_target_frames(Duration::from_millis(10), 30.0), 0);
    }

    #[test]
    fn validate_rejects_malformed() {
        let mut config = Config::default();
        config.stream.channel_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.video.fps = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.stream.boundary.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.recording.clip = Duration::from_millis(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn input_codec_from_str() {
        assert_eq!("mjpg".parse::<InputCodec>().unwrap(), InputCodec::Mjpg);
        assert_eq!("YUYV".parse::<InputCodec>().unwrap(), InputCodec::Yuyv);
        assert!("H264".parse::<InputCodec>().is_err());
        assert_eq!(InputCodec::Yuyv.ffmpeg_input_format(), "yuyv422");
    }
}
