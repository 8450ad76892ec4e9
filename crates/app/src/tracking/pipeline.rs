//! Pipeline controller and the supervisor run loop.
//!
//! The controller is the per-frame façade: a synchronous stability update on
//! the delivery path plus a non-blocking handoff to the tracking worker,
//! never anything that can block frame delivery. The supervisor wires a frame
//! source into the controller, keeps watchdog state in sync, and restarts the
//! pipeline when a stage stalls or the source fails.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, Once,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use depth_ingest::{SensorFrame, SyntheticSourceConfig, TrackingState, spawn_synthetic_source};
use saliency::{DepthWindowDetector, HandDetector};
use tracing::{debug, error, warn};

use crate::tracking::{
    config::TrackingConfig,
    data::{FramePacket, LatestDetection, ResultBoard, SharedStabilities, StabilityLabel},
    handoff::{FrameSender, frame_handoff},
    rate::RateMeter,
    session::{DetectorFactory, TrackingSession},
    stability::StabilityTracker,
    telemetry,
    watchdog::{HealthComponent, PipelineHealth, WatchdogState, spawn_watchdog},
};

/// Run the tracking pipeline, automatically restarting on recoverable faults.
pub fn run(config: TrackingConfig) -> Result<()> {
    static CTRL_HANDLER: Once = Once::new();

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler({
            let handler_shutdown = handler_shutdown.clone();
            move || {
                handler_shutdown.store(true, Ordering::SeqCst);
            }
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });

    let mut attempt: u32 = 0;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        match run_pipeline_once(config.clone(), shutdown.clone()) {
            Ok(PipelineOutcome::Graceful) => break,
            Ok(PipelineOutcome::Restart(reason)) => {
                attempt = attempt.saturating_add(1);
                warn!("Pipeline requested restart (reason: {reason}), attempt #{attempt}");
                thread::sleep(Duration::from_secs(1));
            }
            Err(err) => {
                error!("Tracking pipeline error: {err:?}");
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                attempt = attempt.saturating_add(1);
                thread::sleep(Duration::from_secs(1));
            }
        }
    }

    Ok(())
}

/// Result of a single pipeline run attempt.
enum PipelineOutcome {
    Graceful,
    Restart(&'static str),
}

/// Execute the pipeline once, returning whether to exit or restart.
fn run_pipeline_once(config: TrackingConfig, shutdown: Arc<AtomicBool>) -> Result<PipelineOutcome> {
    if shutdown.load(Ordering::SeqCst) {
        return Ok(PipelineOutcome::Graceful);
    }

    let _telemetry_guard = telemetry::enter_runtime(&config.telemetry);
    let _ = telemetry::init_metrics_recorder();
    let pipeline_span = tracing::info_span!(
        "tracking.pipeline",
        width = config.width,
        height = config.height,
        rate = config.source_rate_hz,
        pending_limit = config.pending_limit,
    );
    let _pipeline_span_guard = pipeline_span.enter();

    let receiver = spawn_synthetic_source(SyntheticSourceConfig {
        width: config.width,
        height: config.height,
        rate_hz: config.source_rate_hz,
        frames: config.frames,
        fail_after: None,
        track_id: 1,
    })
    .context("Failed to start sensor source")?;

    let health = Arc::new(PipelineHealth::new());
    let pipeline_running = Arc::new(AtomicBool::new(true));
    let watchdog_state = Arc::new(WatchdogState::new());
    let watchdog_handle = spawn_watchdog(
        health.clone(),
        pipeline_running.clone(),
        shutdown.clone(),
        watchdog_state.clone(),
    );

    let mut controller = PipelineController::new(config.clone(), health.clone());
    controller.start_tracking();

    let mut last_instant = Instant::now();
    let mut restart_reason: Option<&'static str> = None;

    while pipeline_running.load(Ordering::Relaxed) {
        if shutdown.load(Ordering::Relaxed) {
            pipeline_running.store(false, Ordering::SeqCst);
            break;
        }

        match receiver.recv() {
            Ok(Ok(frame)) => {
                health.beat(HealthComponent::Delivery);

                let now = Instant::now();
                let elapsed = now.duration_since(last_instant).as_secs_f64();
                last_instant = now;
                if elapsed > 0.0 {
                    metrics::histogram!("tracking_frame_interval_seconds").record(elapsed);
                }

                controller.on_frame(&frame);

                if frame.seq_no > 0 && frame.seq_no % 30 == 0 {
                    log_heartbeat(&controller, frame.seq_no);
                }
            }
            Ok(Err(err)) => {
                error!("Sensor error: {err}");
                restart_reason = Some("sensor error");
                pipeline_running.store(false, Ordering::SeqCst);
                break;
            }
            Err(_) => {
                debug!("sensor stream ended");
                break;
            }
        }
    }

    debug!("Stopping tracking pipeline");
    pipeline_running.store(false, Ordering::SeqCst);
    controller.shutdown();
    drop(controller);
    let _ = watchdog_handle.join();

    if watchdog_state.is_triggered() {
        let reason = watchdog_state
            .reason()
            .map(|component| component.label())
            .unwrap_or("watchdog");
        return Ok(PipelineOutcome::Restart(reason));
    }

    if let Some(reason) = restart_reason {
        return Ok(PipelineOutcome::Restart(reason));
    }

    Ok(PipelineOutcome::Graceful)
}

/// Periodic reader-side view of the pipeline, standing in for the display
/// collaborator.
fn log_heartbeat(controller: &PipelineController, seq_no: u64) {
    let labels = controller.stability_labels();
    let mut people: Vec<String> = labels
        .iter()
        .map(|(track_id, label)| format!("{track_id}={}", label.label()))
        .collect();
    people.sort();

    match controller.latest_detection() {
        Some(latest) if !latest.detection.bounding_box.is_empty() => debug!(
            "frame #{seq_no}: worker {:.1} fps, {} dropped, [{}], hand box at frame #{} (session {})",
            controller.worker_rate(),
            controller.frames_dropped(),
            people.join(" "),
            latest.frame_number,
            latest.generation,
        ),
        _ => debug!(
            "frame #{seq_no}: worker {:.1} fps, {} dropped, [{}], no hand",
            controller.worker_rate(),
            controller.frames_dropped(),
            people.join(" "),
        ),
    }
}

/// Per-frame façade over the stability classifier, the handoff queue, and
/// the tracking session.
///
/// Owns the queue and the session by composition; collaborators only ever
/// receive the read-side handles they need.
pub(crate) struct PipelineController {
    config: TrackingConfig,
    stability: StabilityTracker,
    stabilities: SharedStabilities,
    sender: FrameSender,
    session: TrackingSession,
    board: Arc<ResultBoard>,
    rate: Arc<Mutex<RateMeter>>,
    frames_seen: u64,
    frames_dropped: u64,
}

impl PipelineController {
    pub(crate) fn new(config: TrackingConfig, health: Arc<PipelineHealth>) -> Self {
        let (sender, receiver) = frame_handoff(config.pending_limit);
        let board = Arc::new(ResultBoard::new());
        let rate = Arc::new(Mutex::new(RateMeter::new()));
        let session = TrackingSession::new(
            Arc::clone(&board),
            Arc::clone(&rate),
            receiver,
            health,
        );

        Self {
            stability: StabilityTracker::new(config.stability_window, config.drift_factor),
            stabilities: Arc::new(Mutex::new(HashMap::new())),
            sender,
            session,
            board,
            rate,
            frames_seen: 0,
            frames_dropped: 0,
            config,
        }
    }

    /// Per-frame entry point, called once per delivered frame on the
    /// delivery context. Runs the synchronous stability update, publishes
    /// the fresh label map, then attempts the non-blocking handoff.
    pub(crate) fn on_frame(&mut self, frame: &SensorFrame) {
        self.frames_seen = self.frames_seen.wrapping_add(1);

        let mut labels = HashMap::new();
        for skeleton in &frame.skeletons {
            if skeleton.state != TrackingState::Tracked {
                continue;
            }
            self.stability
                .add(skeleton.track_id, skeleton.position, skeleton.timestamp_ms);
            let label = if self.stability.is_stable(skeleton.track_id) {
                StabilityLabel::Stable
            } else {
                StabilityLabel::Unstable
            };
            labels.insert(skeleton.track_id, label);
        }
        *self.stabilities.lock().unwrap() = labels;

        if self.sender.try_enqueue(FramePacket::from_frame(frame)) {
            metrics::gauge!("tracking_queue_depth").set(self.sender.occupancy() as f64);
        } else {
            self.frames_dropped = self.frames_dropped.wrapping_add(1);
            metrics::counter!("tracking_dropped_frames_total").increment(1);
            if self.config.verbose {
                warn!(
                    "Dropping frame #{} (worker backlog, dropped total: {})",
                    frame.seq_no, self.frames_dropped
                );
            }
        }
    }

    /// Start a tracking session with the configured reference detector,
    /// superseding any session already running. Safe to call at any time,
    /// including while frames keep arriving. Callers running a replay feed
    /// stop it first; live tracking and replay are mutually exclusive.
    pub(crate) fn start_tracking(&mut self) {
        let (width, height, slab_mm) = (self.config.width, self.config.height, self.config.slab_mm);
        self.start_tracking_with(Box::new(move || {
            Ok(Box::new(DepthWindowDetector::new(width, height).with_slab_mm(slab_mm))
                as Box<dyn HandDetector>)
        }));
    }

    pub(crate) fn start_tracking_with(&mut self, factory: DetectorFactory) {
        if self.session.start(factory).is_some() {
            debug!("superseded previous tracking worker");
        }
    }

    /// Signal the current session to stop. Idempotent; never blocks on an
    /// in-flight detection.
    pub(crate) fn stop_tracking(&mut self) {
        if self.session.stop().is_some() {
            debug!("tracking session stopped");
        }
    }

    pub(crate) fn is_tracking(&self) -> bool {
        self.session.is_active()
    }

    /// Latest detection published by the worker, for the rendering side.
    pub(crate) fn latest_detection(&self) -> Option<LatestDetection> {
        self.board.snapshot()
    }

    /// Stability classification of every person tracked in the most recent
    /// frame.
    pub(crate) fn stability_labels(&self) -> HashMap<u32, StabilityLabel> {
        self.stabilities.lock().unwrap().clone()
    }

    pub(crate) fn worker_rate(&self) -> f64 {
        self.rate.lock().unwrap().current_rate(Instant::now())
    }

    pub(crate) fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    /// Stop the session and wait for the worker to unwind. Dropping the
    /// controller afterwards closes the handoff queue.
    pub(crate) fn shutdown(&mut self) {
        if let Some(handle) = self.session.stop() {
            let _ = handle.join();
        }
        debug!(
            "pipeline controller shut down after {} frames ({} dropped)",
            self.frames_seen, self.frames_dropped
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use depth_ingest::SkeletonSnapshot;
    use nalgebra::Point3;
    use saliency::{DetectError, HandDetection};

    use super::*;

    fn config() -> TrackingConfig {
        TrackingConfig {
            width: 64,
            height: 48,
            source_rate_hz: 1000.0,
            frames: Some(40),
            ..TrackingConfig::default()
        }
    }

    fn controller() -> PipelineController {
        PipelineController::new(config(), Arc::new(PipelineHealth::new()))
    }

    fn frame(seq_no: u64, skeletons: &[(u32, f32)]) -> SensorFrame {
        let timestamp_ms = seq_no as i64 * 33;
        SensorFrame {
            color: Arc::from(vec![0u8; 16].into_boxed_slice()),
            depth: Arc::from(vec![0u8; 8].into_boxed_slice()),
            skeletons: skeletons
                .iter()
                .map(|&(track_id, x)| SkeletonSnapshot {
                    track_id,
                    position: Point3::new(x, 0.0, 2.0),
                    state: TrackingState::Tracked,
                    timestamp_ms,
                })
                .collect(),
            seq_no,
            timestamp_ms,
        }
    }

    struct StubDetector {
        calls: Arc<AtomicU64>,
    }

    impl HandDetector for StubDetector {
        fn detect(
            &mut self,
            _depth: &[u8],
            _color: &[u8],
            _skeleton: Option<&SkeletonSnapshot>,
        ) -> Result<HandDetection, DetectError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(HandDetection::empty())
        }
    }

    fn stub_factory(calls: Arc<AtomicU64>) -> DetectorFactory {
        Box::new(move || Ok(Box::new(StubDetector { calls }) as Box<dyn HandDetector>))
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

    #[test]
    fn stability_labels_update_on_the_delivery_path() {
        let mut controller = controller();
        // Person 1 stands still, person 2 walks.
        for seq_no in 0..4 {
            let step = seq_no as f32 * 0.3;
            controller.on_frame(&frame(seq_no, &[(1, 0.0), (2, step)]));
        }
        let labels = controller.stability_labels();
        assert_eq!(labels.get(&1), Some(&StabilityLabel::Stable));
        assert_eq!(labels.get(&2), Some(&StabilityLabel::Unstable));
    }

    #[test]
    fn labels_reflect_only_the_latest_frame() {
        let mut controller = controller();
        controller.on_frame(&frame(0, &[(1, 0.0)]));
        controller.on_frame(&frame(1, &[(2, 0.0)]));
        let labels = controller.stability_labels();
        assert!(!labels.contains_key(&1));
        assert!(labels.contains_key(&2));
    }

    #[test]
    fn frames_drop_instead_of_blocking_when_no_worker_consumes() {
        let mut controller = controller();
        for seq_no in 0..6 {
            controller.on_frame(&frame(seq_no, &[]));
        }
        // Capacity is pending_limit + 1 = 2; everything else must drop.
        assert_eq!(controller.frames_dropped(), 4);
    }

    #[test]
    fn tracking_results_flow_end_to_end() {
        let mut controller = controller();
        let calls = Arc::new(AtomicU64::new(0));
        controller.start_tracking_with(stub_factory(Arc::clone(&calls)));
        assert!(controller.is_tracking());

        let mut seq_no = 0;
        assert!(wait_until(Duration::from_secs(2), || {
            controller.on_frame(&frame(seq_no, &[(1, 0.0)]));
            seq_no += 1;
            controller.latest_detection().is_some()
        }));
        assert!(calls.load(Ordering::SeqCst) > 0);

        controller.stop_tracking();
        assert!(wait_until(Duration::from_secs(2), || {
            !controller.is_tracking()
        }));
    }

    #[test]
    fn restarting_keeps_exactly_one_worker() {
        let mut controller = controller();
        let first_calls = Arc::new(AtomicU64::new(0));
        let second_calls = Arc::new(AtomicU64::new(0));

        controller.start_tracking_with(stub_factory(Arc::clone(&first_calls)));
        controller.start_tracking_with(stub_factory(Arc::clone(&second_calls)));
        assert!(controller.is_tracking());

        let mut seq_no = 0;
        assert!(wait_until(Duration::from_secs(2), || {
            controller.on_frame(&frame(seq_no, &[]));
            seq_no += 1;
            controller.latest_detection().is_some()
        }));
        // Only the replacement publishes; results carry its generation.
        assert!(second_calls.load(Ordering::SeqCst) > 0);
        assert_eq!(
            controller.latest_detection().map(|d| d.generation),
            Some(2)
        );
    }

    #[test]
    fn stop_and_restart_is_always_possible() {
        let mut controller = controller();
        controller.stop_tracking();
        assert!(!controller.is_tracking());

        let calls = Arc::new(AtomicU64::new(0));
        controller.start_tracking_with(stub_factory(Arc::clone(&calls)));
        controller.stop_tracking();
        controller.start_tracking_with(stub_factory(Arc::clone(&calls)));
        assert!(controller.is_tracking());
        controller.shutdown();
        assert!(!controller.is_tracking());
    }

    #[test]
    fn run_completes_for_a_frame_limited_config() {
        let config = TrackingConfig {
            width: 64,
            height: 48,
            source_rate_hz: 500.0,
            frames: Some(30),
            ..TrackingConfig::default()
        };
        run(config).unwrap();
    }
}
