use tokio::sync::mpsc;
use tracing::trace;

use crate::frame::RawFrame;

/// What travels through a frame channel.
#[derive(Debug)]
pub enum FrameMsg {
    Frame(RawFrame),
    /// No more frames follow from this producer.
    EndOfStream,
}

/// Result of popping from a frame channel.
#[derive(Debug)]
pub enum Recv {
    Frame(RawFrame),
    /// The producer pushed an end-of-stream marker.
    EndOfStream,
    /// Every sender is gone and the queue is drained.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("frame channel closed: receiver dropped")]
pub struct ChannelClosed;

/// Create a bounded FIFO of capacity `capacity` (at least 1).
///
/// `push` waits while the channel is full and `pop` waits while it is empty.
pub fn frame_channel(capacity: usize) -> (FrameSender, FrameReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (FrameSender { tx }, FrameReceiver { rx })
}

#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<FrameMsg>,
}

impl FrameSender {
    /// Push one frame, waiting for room. Empty frames are dropped here so they
    /// can never be mistaken for content or for end-of-stream downstream.
    pub async fn push(&self, frame: RawFrame) -> Result<(), ChannelClosed> {
        if frame.is_empty() {
            trace!("dropping empty frame at channel push");
            return Ok(());
        }
        self.tx
            .send(FrameMsg::Frame(frame))
            .await
            .map_err(|_| ChannelClosed)
    }

    /// Push the end-of-stream marker, waiting for room.
    pub async fn end_of_stream(&self) -> Result<(), ChannelClosed> {
        self.tx
            .send(FrameMsg::EndOfStream)
            .await
            .map_err(|_| ChannelClosed)
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Messages currently queued.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug)]
pub struct FrameReceiver {
    rx: mpsc::Receiver<FrameMsg>,
}

impl FrameReceiver {
    pub async fn pop(&mut self) -> Recv {
        match self.rx.recv().await {
            Some(FrameMsg::Frame(frame)) => Recv::Frame(frame),
            Some(FrameMsg::EndOfStream) => Recv::EndOfStream,
            None => Recv::Closed,
        }
    }
}
