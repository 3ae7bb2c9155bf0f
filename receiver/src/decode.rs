use std::collections::BTreeMap;
use std::sync::Arc;

use camrelay_common::channel::FrameSender;
use camrelay_common::codec::FrameCodec;
use camrelay_common::frame::{EncodedPayload, RawFrame};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// A decoded (or dropped) payload plus the slot it occupies in the pool.
struct Decoded {
    seq: u64,
    frame: Option<RawFrame>,
    _permit: OwnedSemaphorePermit,
}

/// Dispatches payloads to blocking decode workers.
///
/// At most `workers` payloads are between dispatch and forwarding at any
/// time; `dispatch` waits for a free slot. Dropping the pool lets the
/// forwarder drain and then push end-of-stream downstream.
pub struct DecodePool<C> {
    codec: Arc<C>,
    slots: Arc<Semaphore>,
    results: mpsc::Sender<Decoded>,
    next_seq: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ForwardStats {
    pub forwarded: u64,
    pub dropped: u64,
}

/// Number of decode workers: the configured value, or one per CPU when 0.
pub fn resolve_workers(configured: usize) -> usize {
    if configured > 0 {
        return configured;
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Start a pool of `workers` decoders feeding `out` in dispatch order.
pub fn spawn_decode_pool<C: FrameCodec>(
    codec: Arc<C>,
    workers: usize,
    out: FrameSender,
) -> (DecodePool<C>, JoinHandle<ForwardStats>) {
    let workers = workers.max(1);
    let (results_tx, results_rx) = mpsc::channel(workers);
    let pool = DecodePool {
        codec,
        slots: Arc::new(Semaphore::new(workers)),
        results: results_tx,
        next_seq: 0,
    };
    let forwarder = tokio::spawn(forward_in_order(results_rx, out));
    (pool, forwarder)
}

impl<C: FrameCodec> DecodePool<C> {
    /// Payloads dispatched so far.
    pub fn dispatched(&self) -> u64 {
        self.next_seq
    }

    pub async fn dispatch(&mut self, payload: EncodedPayload) {
        let Ok(permit) = self.slots.clone().acquire_owned().await else {
            return;
        };
        let seq = self.next_seq;
        self.next_seq += 1;

        let codec = self.codec.clone();
        let results = self.results.clone();
        tokio::spawn(async move {
            let decoded = tokio::task::spawn_blocking(move || codec.decode(&payload.data)).await;
            let frame = match decoded {
                Ok(Ok(frame)) => frame,
                Ok(Err(e)) => {
                    warn!(seq, error = %e, "dropping undecodable payload");
                    None
                }
                Err(e) => {
                    warn!(seq, error = %e, "decode worker failed");
                    None
                }
            };
            // The forwarder only disappears once downstream is gone.
            let _ = results
                .send(Decoded {
                    seq,
                    frame,
                    _permit: permit,
                })
                .await;
        });
    }
}

async fn forward_in_order(mut results: mpsc::Receiver<Decoded>, out: FrameSender) -> ForwardStats {
    let mut order = Reorderer::new();
    let mut stats = ForwardStats::default();
    let mut downstream_open = true;

    while let Some(decoded) = results.recv().await {
        order.insert(decoded.seq, decoded);
        while let Some(ready) = order.pop_ready() {
            match ready.frame {
                Some(frame) if downstream_open => {
                    if out.push(frame).await.is_err() {
                        debug!("decoded frame channel closed");
                        downstream_open = false;
                    } else {
                        stats.forwarded += 1;
                    }
                }
                _ => stats.dropped += 1,
            }
        }
        if order.pending() > 0 {
            trace!(pending = order.pending(), "waiting for an earlier payload");
        }
    }

    if downstream_open {
        let _ = out.end_of_stream().await;
    }
    info!(
        forwarded = stats.forwarded,
        dropped = stats.dropped,
        "decode pool drained"
    );
    stats
}

/// Releases items strictly in sequence order starting from 0.
#[derive(Debug)]
pub struct Reorderer<T> {
    next: u64,
    pending: BTreeMap<u64, T>,
}

impl<T> Reorderer<T> {
    pub fn new() -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, seq: u64, item: T) {
        if seq < self.next {
            return;
        }
        self.pending.insert(seq, item);
    }

    /// The item for the next expected sequence number, if it has arrived.
    pub fn pop_ready(&mut self) -> Option<T> {
        let item = self.pending.remove(&self.next)?;
        self.next += 1;
        Some(item)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl<T> Default for Reorderer<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use camrelay_common::channel::{frame_channel, Recv};
    use camrelay_common::codec::CodecError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Payload byte 0 is the frame id, byte 1 a decode delay in ms.
    /// An empty payload decodes to nothing and 0xFF fails.
    #[derive(Default)]
    struct ScriptedCodec {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl FrameCodec for ScriptedCodec {
        fn decode(&self, data: &[u8]) -> Result<Option<RawFrame>, CodecError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = data.get(1) {
                std::thread::sleep(Duration::from_millis(*delay as u64));
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            match data.first() {
                None => Ok(None),
                Some(0xFF) => Err(CodecError::Decode("scripted failure".into())),
                Some(id) => Ok(Some(RawFrame::blank(*id as u32, 1))),
            }
        }

        fn encode(&self, _frame: &RawFrame) -> Result<Vec<u8>, CodecError> {
            unreachable!("decode only")
        }
    }

    fn payload(bytes: &[u8]) -> EncodedPayload {
        EncodedPayload::new(Bytes::copy_from_slice(bytes))
    }

    async fn collect(rx: &mut camrelay_common::channel::FrameReceiver) -> Vec<u32> {
        let mut ids = Vec::new();
        loop {
            match rx.pop().await {
                Recv::Frame(f) => ids.push(f.width),
                Recv::EndOfStream => return ids,
                Recv::Closed => panic!("closed without end of stream"),
            }
        }
    }

    #[test]
    fn reorderer_releases_in_sequence() {
        let mut r = Reorderer::new();
        r.insert(2, "c");
        r.insert(1, "b");
        assert_eq!(r.pop_ready(), None);
        r.insert(0, "a");
        assert_eq!(r.pop_ready(), Some("a"));
        assert_eq!(r.pop_ready(), Some("b"));
        assert_eq!(r.pop_ready(), Some("c"));
        assert_eq!(r.pop_ready(), None);
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn reorderer_ignores_stale_sequence() {
        let mut r = Reorderer::new();
        r.insert(0, 10);
        assert_eq!(r.pop_ready(), Some(10));
        r.insert(0, 11);
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn zero_workers_means_one_per_cpu() {
        assert_eq!(resolve_workers(3), 3);
        assert!(resolve_workers(0) >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn output_keeps_dispatch_order_despite_uneven_decode_times() {
        let codec = Arc::new(ScriptedCodec::default());
        let (tx, mut rx) = frame_channel(64);
        let (mut pool, forwarder) = spawn_decode_pool(codec, 4, tx);

        let delays = [40u8, 5, 30, 0, 20, 10, 0, 35, 1, 15];
        for (i, delay) in delays.iter().enumerate() {
            pool.dispatch(payload(&[i as u8 + 1, *delay])).await;
        }
        assert_eq!(pool.dispatched(), 10);
        drop(pool);

        assert_eq!(collect(&mut rx).await, (1..=10).collect::<Vec<_>>());
        let stats = forwarder.await.unwrap();
        assert_eq!(stats, ForwardStats { forwarded: 10, dropped: 0 });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn empty_and_failed_payloads_are_dropped() {
        let codec = Arc::new(ScriptedCodec::default());
        let (tx, mut rx) = frame_channel(16);
        let (mut pool, forwarder) = spawn_decode_pool(codec, 2, tx);

        pool.dispatch(payload(&[1])).await;
        pool.dispatch(payload(&[])).await;
        pool.dispatch(payload(&[0xFF])).await;
        pool.dispatch(payload(&[2])).await;
        drop(pool);

        assert_eq!(collect(&mut rx).await, vec![1, 2]);
        assert_eq!(forwarder.await.unwrap().dropped, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_decodes_never_exceed_worker_count() {
        let codec = Arc::new(ScriptedCodec::default());
        let (tx, mut rx) = frame_channel(64);
        let (mut pool, forwarder) = spawn_decode_pool(codec.clone(), 3, tx);

        for i in 0..24u8 {
            pool.dispatch(payload(&[i + 1, 5])).await;
        }
        drop(pool);

        assert_eq!(collect(&mut rx).await.len(), 24);
        forwarder.await.unwrap();
        let peak = codec.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak concurrency {peak}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn full_downstream_stalls_dispatch() {
        let codec = Arc::new(ScriptedCodec::default());
        let (tx, mut rx) = frame_channel(1);
        let (mut pool, _forwarder) = spawn_decode_pool(codec, 2, tx);

        // One frame fills the channel, two more occupy both slots.
        for i in 0..3u8 {
            pool.dispatch(payload(&[i + 1])).await;
        }
        let stalled =
            tokio::time::timeout(Duration::from_millis(100), pool.dispatch(payload(&[9]))).await;
        assert!(stalled.is_err(), "dispatch must wait while downstream is full");

        assert!(matches!(rx.pop().await, Recv::Frame(_)));
    }
}
