use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use camrelay_common::channel::{FrameReceiver, Recv};
use camrelay_common::frame::RawFrame;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, info, warn};

pub const WINDOW_TITLE: &str = "Live Camera View";
const POLL_TIMEOUT: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowEvent {
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum DisplayError {
    #[error("failed to spawn ffplay: {0}")]
    Spawn(String),
    #[error("failed to write frame to ffplay: {0}")]
    Write(String),
    #[error("display window closed")]
    Closed,
    #[error("frame is {got_width}x{got_height}, window expects {width}x{height}")]
    FrameSize {
        width: u32,
        height: u32,
        got_width: u32,
        got_height: u32,
    },
}

/// A window frames are rendered into.
#[async_trait]
pub trait DisplaySurface: Send {
    async fn show(&mut self, frame: &RawFrame) -> Result<(), DisplayError>;

    /// Wait up to `timeout` for a window event.
    async fn poll_event(&mut self, timeout: Duration) -> Option<WindowEvent>;

    async fn close(self: Box<Self>);
}

/// An ffplay window fed rgb24 rawvideo on stdin.
pub struct FfplayWindow {
    child: Child,
    stdin: Option<ChildStdin>,
    width: u32,
    height: u32,
}

impl FfplayWindow {
    pub fn open(width: u32, height: u32, fps: f64, title: &str) -> Result<Self, DisplayError> {
        let size = format!("{width}x{height}");
        let fps_str = fps.to_string();

        let mut child = Command::new("ffplay")
            .args([
                "-hide_banner",
                "-loglevel", "error",
                "-f", "rawvideo",
                "-pixel_format", "rgb24",
                "-video_size", &size,
                "-framerate", &fps_str,
                "-window_title", title,
                "-i", "pipe:0",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DisplayError::Spawn(e.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DisplayError::Spawn("could not get stdin handle".into()))?;

        debug!(size, fps, title, "ffplay window opened");
        Ok(Self {
            child,
            stdin: Some(stdin),
            width,
            height,
        })
    }
}

#[async_trait]
impl DisplaySurface for FfplayWindow {
    async fn show(&mut self, frame: &RawFrame) -> Result<(), DisplayError> {
        if !frame.has_size(self.width, self.height) {
            return Err(DisplayError::FrameSize {
                width: self.width,
                height: self.height,
                got_width: frame.width,
                got_height: frame.height,
            });
        }
        let stdin = self.stdin.as_mut().ok_or(DisplayError::Closed)?;
        stdin.write_all(&frame.data).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                DisplayError::Closed
            } else {
                DisplayError::Write(e.to_string())
            }
        })
    }

    async fn poll_event(&mut self, timeout: Duration) -> Option<WindowEvent> {
        // ffplay exits when its window is closed or q/Esc is pressed.
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(_) => Some(WindowEvent::Closed),
            Err(_) => None,
        }
    }

    async fn close(mut self: Box<Self>) {
        drop(self.stdin.take());
        if let Err(e) = self.child.kill().await {
            debug!(error = %e, "ffplay already gone");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayEnd {
    EndOfStream,
    Closed,
    WindowClosed,
}

/// Render frames until end-of-stream, channel close, or the user closes the
/// window. Owns the surface and closes it on return.
pub async fn run_display_sink(
    mut surface: Box<dyn DisplaySurface>,
    mut rx: FrameReceiver,
) -> DisplayEnd {
    let mut shown = 0u64;
    let end = loop {
        let frame = match rx.pop().await {
            Recv::Frame(f) => f,
            Recv::EndOfStream => break DisplayEnd::EndOfStream,
            Recv::Closed => break DisplayEnd::Closed,
        };
        match surface.show(&frame).await {
            Ok(()) => shown += 1,
            Err(DisplayError::Closed) => break DisplayEnd::WindowClosed,
            Err(e) => warn!(error = %e, "failed to show frame"),
        }
        if surface.poll_event(POLL_TIMEOUT).await == Some(WindowEvent::Closed) {
            break DisplayEnd::WindowClosed;
        }
    };
    info!(shown, reason = ?end, "display sink stopped");
    surface.close().await;
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use camrelay_common::channel::frame_channel;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Screen {
        shown: Vec<u32>,
        closed: bool,
    }

    struct FakeWindow {
        screen: Arc<Mutex<Screen>>,
        close_after: Option<usize>,
    }

    #[async_trait]
    impl DisplaySurface for FakeWindow {
        async fn show(&mut self, frame: &RawFrame) -> Result<(), DisplayError> {
            self.screen.lock().unwrap().shown.push(frame.width);
            Ok(())
        }

        async fn poll_event(&mut self, _timeout: Duration) -> Option<WindowEvent> {
            let shown = self.screen.lock().unwrap().shown.len();
            match self.close_after {
                Some(n) if shown >= n => Some(WindowEvent::Closed),
                _ => None,
            }
        }

        async fn close(self: Box<Self>) {
            self.screen.lock().unwrap().closed = true;
        }
    }

    fn window(close_after: Option<usize>) -> (Box<dyn DisplaySurface>, Arc<Mutex<Screen>>) {
        let screen = Arc::new(Mutex::new(Screen::default()));
        let surface = FakeWindow {
            screen: screen.clone(),
            close_after,
        };
        (Box::new(surface), screen)
    }

    #[tokio::test]
    async fn shows_frames_until_end_of_stream() {
        let (tx, rx) = frame_channel(8);
        for w in 1..=3 {
            tx.push(RawFrame::blank(w, 1)).await.unwrap();
        }
        tx.end_of_stream().await.unwrap();
        tx.push(RawFrame::blank(9, 1)).await.unwrap();

        let (surface, screen) = window(None);
        assert_eq!(run_display_sink(surface, rx).await, DisplayEnd::EndOfStream);

        let screen = screen.lock().unwrap();
        assert_eq!(screen.shown, vec![1, 2, 3]);
        assert!(screen.closed);
    }

    #[tokio::test]
    async fn closing_the_window_stops_the_sink() {
        let (tx, rx) = frame_channel(8);
        for w in 1..=5 {
            tx.push(RawFrame::blank(w, 1)).await.unwrap();
        }

        let (surface, screen) = window(Some(2));
        assert_eq!(run_display_sink(surface, rx).await, DisplayEnd::WindowClosed);
        assert_eq!(screen.lock().unwrap().shown, vec![1, 2]);
    }

    #[tokio::test]
    async fn dropped_producer_closes_the_sink() {
        let (tx, rx) = frame_channel(2);
        tx.push(RawFrame::blank(4, 1)).await.unwrap();
        drop(tx);

        let (surface, screen) = window(None);
        assert_eq!(run_display_sink(surface, rx).await, DisplayEnd::Closed);
        assert_eq!(screen.lock().unwrap().shown, vec![4]);
    }
}
