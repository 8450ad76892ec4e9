//! Tracking session lifecycle and the detection worker loop.
//!
//! At most one worker is live at a time. Each `start` supersedes the previous
//! worker: its cancellation channel is dropped, the result board moves to a
//! fresh generation, and a new worker is spawned immediately without waiting
//! for the old one to unwind. The generation check on publish keeps a
//! superseded worker that is still finishing an in-flight detection from
//! overwriting its replacement's results.

use std::{
    sync::{Arc, Mutex},
    thread::JoinHandle,
    time::Instant,
};

use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded};
use saliency::{HandDetection, HandDetector};
use tracing::{debug, error};

use crate::tracking::{
    data::ResultBoard,
    handoff::FrameReceiver,
    rate::RateMeter,
    telemetry,
    watchdog::{HealthComponent, PipelineHealth},
};

/// Builds the detector inside the worker thread, keeping expensive model
/// loading off the calling context.
pub(crate) type DetectorFactory = Box<dyn FnOnce() -> anyhow::Result<Box<dyn HandDetector>> + Send>;

/// Owns the lifecycle of the single tracking worker.
pub(crate) struct TrackingSession {
    board: Arc<ResultBoard>,
    rate: Arc<Mutex<RateMeter>>,
    frames: FrameReceiver,
    health: Arc<PipelineHealth>,
    current: Option<WorkerHandle>,
}

struct WorkerHandle {
    cancel_tx: Sender<()>,
    thread: JoinHandle<()>,
}

impl TrackingSession {
    pub(crate) fn new(
        board: Arc<ResultBoard>,
        rate: Arc<Mutex<RateMeter>>,
        frames: FrameReceiver,
        health: Arc<PipelineHealth>,
    ) -> Self {
        Self {
            board,
            rate,
            frames,
            health,
            current: None,
        }
    }

    /// Launch a fresh worker, superseding any previous one. Returns the
    /// superseded worker's handle, already cancelled, for callers that want
    /// to observe its termination; dropping it just detaches the thread.
    ///
    /// Live tracking and replay delivery are mutually exclusive; callers
    /// running a replay feed stop it before starting a session here.
    pub(crate) fn start(&mut self, factory: DetectorFactory) -> Option<JoinHandle<()>> {
        let superseded = self.stop();
        let generation = self.board.begin_generation();

        let (cancel_tx, cancel_rx) = bounded::<()>(0);
        let board = Arc::clone(&self.board);
        let rate = Arc::clone(&self.rate);
        let health = Arc::clone(&self.health);
        let frames = self.frames.clone();
        let thread = telemetry::spawn_thread("tracking-worker", move || {
            worker_loop(factory, board, rate, frames, cancel_rx, health, generation);
        })
        .expect("failed to spawn tracking worker");

        self.current = Some(WorkerHandle { cancel_tx, thread });
        superseded
    }

    /// Signal cancellation and release the worker handle without joining, so
    /// an in-flight detection never blocks the caller. The worker observes
    /// the signal at its next loop check or blocking-take wake-up.
    pub(crate) fn stop(&mut self) -> Option<JoinHandle<()>> {
        self.current.take().map(|worker| {
            drop(worker.cancel_tx);
            worker.thread
        })
    }

    pub(crate) fn is_active(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|worker| !worker.thread.is_finished())
    }
}

impl Drop for TrackingSession {
    fn drop(&mut self) {
        if let Some(handle) = self.stop() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    factory: DetectorFactory,
    board: Arc<ResultBoard>,
    rate: Arc<Mutex<RateMeter>>,
    frames: FrameReceiver,
    cancel_rx: Receiver<()>,
    health: Arc<PipelineHealth>,
    generation: u64,
) {
    let mut detector = match factory() {
        Ok(detector) => detector,
        Err(err) => {
            error!("failed to construct hand detector: {err:?}");
            return;
        }
    };
    debug!(generation, "tracking worker started");

    loop {
        if cancelled(&cancel_rx) {
            break;
        }
        let Some(packet) = frames.take_until(&cancel_rx) else {
            break;
        };
        // A cancellation that raced the take wins; the packet is stale work.
        if cancelled(&cancel_rx) {
            break;
        }

        let detect_start = Instant::now();
        let detection = match detector.detect(&packet.depth, &packet.color, packet.skeleton.as_ref())
        {
            Ok(detection) => detection,
            Err(err) => {
                error!("detection failed on frame {}: {err}", packet.frame_number);
                metrics::counter!("tracking_detect_failures_total").increment(1);
                HandDetection::empty()
            }
        };
        metrics::histogram!("tracking_detect_latency_seconds")
            .record(detect_start.elapsed().as_secs_f64());

        if !board.publish(generation, detection, packet.frame_number) {
            debug!(generation, "superseded by a newer session; exiting");
            break;
        }
        health.beat(HealthComponent::Worker);

        let now = Instant::now();
        let fps = {
            let mut rate = rate.lock().unwrap();
            rate.record(now);
            rate.current_rate(now)
        };
        metrics::gauge!("tracking_worker_fps").set(fps);
    }

    debug!(generation, "tracking worker stopped");
}

fn cancelled(cancel_rx: &Receiver<()>) -> bool {
    !matches!(cancel_rx.try_recv(), Err(TryRecvError::Empty))
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicU64, Ordering},
        thread,
        time::Duration,
    };

    use depth_ingest::SkeletonSnapshot;
    use saliency::{BoundingBox, DetectError};

    use super::*;
    use crate::tracking::{
        data::FramePacket,
        handoff::{FrameSender, frame_handoff},
    };

    fn packet(frame_number: u64) -> FramePacket {
        FramePacket {
            color: Arc::from(Vec::new().into_boxed_slice()),
            depth: Arc::from(Vec::new().into_boxed_slice()),
            skeleton: None,
            frame_number,
        }
    }

    fn session() -> (TrackingSession, FrameSender, Arc<ResultBoard>) {
        let (tx, rx) = frame_handoff(8);
        let board = Arc::new(ResultBoard::new());
        let session = TrackingSession::new(
            Arc::clone(&board),
            Arc::new(Mutex::new(RateMeter::new())),
            rx,
            Arc::new(PipelineHealth::new()),
        );
        (session, tx, board)
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    struct CountingDetector {
        calls: Arc<AtomicU64>,
    }

    impl HandDetector for CountingDetector {
        fn detect(
            &mut self,
            _depth: &[u8],
            _color: &[u8],
            _skeleton: Option<&SkeletonSnapshot>,
        ) -> Result<HandDetection, DetectError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(HandDetection {
                bounding_box: BoundingBox {
                    x: 0,
                    y: 0,
                    width: 1,
                    height: 1,
                },
                smoothed_depth: Vec::new(),
            })
        }
    }

    fn counting_factory(calls: Arc<AtomicU64>) -> DetectorFactory {
        Box::new(move || Ok(Box::new(CountingDetector { calls }) as Box<dyn HandDetector>))
    }

    /// Blocks inside `detect` until released, to model an in-flight
    /// detection during a session restart.
    struct BlockingDetector {
        entered_tx: Sender<()>,
        release_rx: Receiver<()>,
    }

    impl HandDetector for BlockingDetector {
        fn detect(
            &mut self,
            _depth: &[u8],
            _color: &[u8],
            _skeleton: Option<&SkeletonSnapshot>,
        ) -> Result<HandDetection, DetectError> {
            let _ = self.entered_tx.send(());
            let _ = self.release_rx.recv();
            Ok(HandDetection::empty())
        }
    }

    struct FailingDetector;

    impl HandDetector for FailingDetector {
        fn detect(
            &mut self,
            depth: &[u8],
            _color: &[u8],
            _skeleton: Option<&SkeletonSnapshot>,
        ) -> Result<HandDetection, DetectError> {
            Err(DetectError::DepthBufferSize {
                got: depth.len(),
                expected: 1,
            })
        }
    }

    #[test]
    fn worker_processes_enqueued_packets_in_order() {
        let (mut session, tx, board) = session();
        let calls = Arc::new(AtomicU64::new(0));
        session.start(counting_factory(Arc::clone(&calls)));

        for i in 1..=3 {
            assert!(tx.try_enqueue(packet(i)));
        }
        assert!(wait_until(Duration::from_secs(2), || {
            board.snapshot().map(|d| d.frame_number) == Some(3)
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let handle = session.stop().unwrap();
        assert!(handle.join().is_ok());
    }

    #[test]
    fn stop_wakes_a_worker_blocked_on_the_queue() {
        let (mut session, _tx, _board) = session();
        session.start(counting_factory(Arc::new(AtomicU64::new(0))));
        assert!(session.is_active());

        let handle = session.stop().unwrap();
        assert!(wait_until(Duration::from_secs(2), || handle.is_finished()));
        assert!(!session.is_active());
    }

    #[test]
    fn queue_closure_terminates_the_worker() {
        let (mut session, tx, board) = session();
        session.start(counting_factory(Arc::new(AtomicU64::new(0))));
        assert!(tx.try_enqueue(packet(1)));
        assert!(wait_until(Duration::from_secs(2), || {
            board.snapshot().is_some()
        }));

        drop(tx);
        assert!(wait_until(Duration::from_secs(2), || !session.is_active()));
        // The last published result survives teardown for readers.
        assert_eq!(board.snapshot().map(|d| d.frame_number), Some(1));
    }

    #[test]
    fn restart_supersedes_the_previous_worker() {
        let (mut session, tx, board) = session();

        let (entered_tx, entered_rx) = bounded::<()>(1);
        let (release_tx, release_rx) = bounded::<()>(1);
        session.start(Box::new(move || {
            Ok(Box::new(BlockingDetector {
                entered_tx,
                release_rx,
            }) as Box<dyn HandDetector>)
        }));

        // First worker is mid-detection when the restart happens.
        assert!(tx.try_enqueue(packet(1)));
        assert!(entered_rx.recv_timeout(Duration::from_secs(2)).is_ok());

        let calls = Arc::new(AtomicU64::new(0));
        let superseded = session.start(counting_factory(Arc::clone(&calls))).unwrap();

        // Release the stale worker; its publish must be suppressed and the
        // thread must wind down.
        release_tx.send(()).unwrap();
        assert!(wait_until(Duration::from_secs(2), || superseded.is_finished()));
        assert!(board.snapshot().is_none());

        // The replacement keeps processing under the new generation.
        assert!(tx.try_enqueue(packet(2)));
        assert!(wait_until(Duration::from_secs(2), || {
            board.snapshot().map(|d| d.frame_number) == Some(2)
        }));
        assert!(session.is_active());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn detect_failures_do_not_terminate_the_loop() {
        let (mut session, tx, board) = session();
        session.start(Box::new(|| {
            Ok(Box::new(FailingDetector) as Box<dyn HandDetector>)
        }));

        assert!(tx.try_enqueue(packet(1)));
        assert!(tx.try_enqueue(packet(2)));
        assert!(wait_until(Duration::from_secs(2), || {
            board.snapshot().map(|d| d.frame_number) == Some(2)
        }));
        // Failures publish as "no detection this frame".
        let latest = board.snapshot().unwrap();
        assert!(latest.detection.bounding_box.is_empty());
        assert!(session.is_active());
    }

    #[test]
    fn session_restarts_after_stop() {
        let (mut session, tx, board) = session();
        let calls = Arc::new(AtomicU64::new(0));

        session.start(counting_factory(Arc::clone(&calls)));
        let stopped = session.stop().unwrap();
        assert!(stopped.join().is_ok());
        assert!(!session.is_active());

        session.start(counting_factory(Arc::clone(&calls)));
        assert!(tx.try_enqueue(packet(9)));
        assert!(wait_until(Duration::from_secs(2), || {
            board.snapshot().map(|d| d.frame_number) == Some(9)
        }));
        assert!(session.is_active());
    }

    #[test]
    fn failed_detector_construction_ends_the_worker() {
        let (mut session, tx, board) = session();
        session.start(Box::new(|| anyhow::bail!("model file missing")));
        assert!(tx.try_enqueue(packet(1)));
        assert!(wait_until(Duration::from_secs(2), || !session.is_active()));
        assert!(board.snapshot().is_none());

        // A later start recovers.
        let calls = Arc::new(AtomicU64::new(0));
        session.start(counting_factory(Arc::clone(&calls)));
        assert!(tx.try_enqueue(packet(2)));
        assert!(wait_until(Duration::from_secs(2), || {
            board.snapshot().map(|d| d.frame_number) == Some(2)
        }));
    }
}
