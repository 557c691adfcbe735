//! Color sinks: where a rendered frame goes.
//!
//! A device renders into exactly one source mode at a time:
//! - [`ColorSource::Local`]: its own render loop writes through [`HidSink`];
//! - [`ColorSource::External`]: frames from the external target arrive
//!   through [`ExternalSink`]'s bounded queue and are drained to the HID sink;
//! - [`ColorSource::Cluster`]: the cluster aggregator calls [`ClusterSink`].
//!
//! Every path ends in the device's framer, so HID writes stay serialized by
//! the transport mutex regardless of the source.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::color;
use crate::framer::Framer;
use crate::task;

/// Queue depth between the external target and the device.
pub const EXTERNAL_QUEUE_CAPACITY: usize = 10;

/// Pause between two drained external frames.
pub const EXTERNAL_DRAIN_INTERVAL: Duration = Duration::from_millis(20);

/// Where a device's frames come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorSource {
    Local,
    External,
    Cluster,
}

/// Consumer of color frames.
pub trait ColorSink: Send + Sync {
    /// Accept one frame of `R,G,B` bytes for `channel`. Returns false when the
    /// frame was not delivered.
    fn write(&self, buffer: &[u8], channel: u8) -> bool;
}

/// The device's HID color endpoint.
pub struct HidSink {
    framer: Arc<Framer>,
}

impl HidSink {
    pub fn new(framer: Arc<Framer>) -> Self {
        Self { framer }
    }
}

impl ColorSink for HidSink {
    fn write(&self, buffer: &[u8], _channel: u8) -> bool {
        self.framer.write_frame(buffer)
    }
}

/// Device brightness in `[0, 1]` while it is in cluster mode, `None` once
/// it left.
pub type ClusterGate = Arc<dyn Fn() -> Option<f64> + Send + Sync>;

/// Write path registered with the cluster aggregator. Slices are scaled by
/// the device's own brightness and dropped once it leaves cluster mode; the
/// gate runs under the transport lock so a concurrent toggle cannot
/// interleave with a write.
pub struct ClusterSink {
    framer: Arc<Framer>,
    gate: ClusterGate,
}

impl ClusterSink {
    pub fn new(framer: Arc<Framer>, gate: ClusterGate) -> Self {
        Self { framer, gate }
    }
}

impl ColorSink for ClusterSink {
    fn write(&self, buffer: &[u8], _channel: u8) -> bool {
        self.framer
            .write_frame_with(|| (self.gate)().map(|b| color::scale_bytes(buffer, b)))
    }
}

/// Non-blocking producer side of the external-target queue.
#[derive(Clone)]
pub struct ExternalSink {
    tx: mpsc::Sender<Vec<u8>>,
    dropped: Arc<AtomicU64>,
}

impl ExternalSink {
    /// Sink plus the receiver to hand to [`drain_external`].
    pub fn channel() -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(EXTERNAL_QUEUE_CAPACITY);
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Frames dropped because the queue was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl ColorSink for ExternalSink {
    fn write(&self, buffer: &[u8], _channel: u8) -> bool {
        match self.tx.try_send(buffer.to_vec()) {
            Ok(()) => true,
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(error = %e, "external frame dropped");
                false
            }
        }
    }
}

/// Forward queued external frames to `target`, one every
/// [`EXTERNAL_DRAIN_INTERVAL`], until cancelled or the queue closes.
pub async fn drain_external(
    mut rx: mpsc::Receiver<Vec<u8>>,
    target: Arc<dyn ColorSink>,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            frame = rx.recv() => frame,
            _ = task::cancelled(&mut cancel) => None,
        };
        let Some(frame) = frame else {
            break;
        };
        let sink = Arc::clone(&target);
        if tokio::task::spawn_blocking(move || sink.write(&frame, 0))
            .await
            .is_err()
        {
            break;
        }
        if !task::sleep_or_cancel(EXTERNAL_DRAIN_INTERVAL, &mut cancel).await {
            break;
        }
    }
    rx.close();
    debug!("external queue drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{descriptor, pids, VENDOR_ID};
    use crate::task::Shutdown;
    use crate::transport::mock::MockTransport;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl ColorSink for Recorder {
        fn write(&self, buffer: &[u8], _channel: u8) -> bool {
            self.frames.lock().push(buffer.to_vec());
            true
        }
    }

    #[test]
    fn external_queue_drops_newest_when_full() {
        let (sink, _rx) = ExternalSink::channel();
        for i in 0..EXTERNAL_QUEUE_CAPACITY {
            assert!(sink.write(&[i as u8], 0));
        }
        assert!(!sink.write(&[0xFF], 0));
        assert_eq!(sink.dropped(), 1);
    }

    #[tokio::test]
    async fn drain_forwards_in_order_and_stops_on_close() {
        let (sink, rx) = ExternalSink::channel();
        let recorder = Arc::new(Recorder::default());
        let shutdown = Shutdown::new();
        sink.write(&[1, 1, 1], 0);
        sink.write(&[2, 2, 2], 0);
        drop(sink);
        drain_external(rx, recorder.clone(), shutdown.subscribe()).await;
        assert_eq!(*recorder.frames.lock(), vec![vec![1, 1, 1], vec![2, 2, 2]]);
    }

    #[tokio::test]
    async fn drain_stops_on_cancel() {
        let (_sink, rx) = ExternalSink::channel();
        let shutdown = Shutdown::new();
        let task = tokio::spawn(drain_external(
            rx,
            Arc::new(Recorder::default()),
            shutdown.subscribe(),
        ));
        shutdown.trigger();
        task.await.unwrap();
    }

    #[test]
    fn cluster_sink_respects_gate() {
        let mock = MockTransport::new();
        let desc = descriptor(VENDOR_ID, pids::MM700_RGB).unwrap();
        let framer = Arc::new(Framer::new(Box::new(mock.clone()), desc));
        let flag = Arc::new(AtomicBool::new(false));
        let gate = Arc::clone(&flag);
        let sink = ClusterSink::new(
            framer.clone(),
            Arc::new(move || gate.load(Ordering::SeqCst).then_some(0.5)),
        );
        assert!(!sink.write(&[0; 9], 0));
        assert!(mock.written().is_empty());
        flag.store(true, Ordering::SeqCst);
        assert!(sink.write(&[200, 100, 0, 0, 0, 0, 0, 0, 0], 0));
        assert_eq!(mock.written().len(), 3);
        // Length prefix and data type precede the colors.
        assert_eq!(&mock.written()[2][8..11], &[100, 50, 0]);

        let hid = HidSink::new(framer);
        assert!(hid.write(&[0; 9], 0));
        assert_eq!(mock.written().len(), 6);
    }
}
