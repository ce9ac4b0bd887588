//! Control Loop (spec.md §4.F) — the single cooperative ~30 Hz task that
//! owns all tracking/estimator/servo state and is the sole writer of VISCA
//! drive commands.
//!
//! `ControlHandle` mirrors the teacher's `PtzDispatcher` role as a cheap,
//! `Clone`able externally-callable facade over `Arc`-shared state
//! (`ptz/controller.rs`); the loop body itself is grounded step-for-step on
//! `original_source/skywatch_core.py`'s `_update_loop`.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::config::TrackingConfig;
use crate::error::CoreError;
use crate::estimator::KalmanEstimator;
use crate::servo::{ServoController, ServoGains, ServoInput, ServoOutput, ServoState};
use crate::tracker::{BBox, VisualTracker};
use crate::video::VideoSource;
use crate::visca::{PanDir, TiltDir, Transport, ZoomCommand};

/// Current arbitration state of the control loop (spec.md §4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMode {
    Standby,
    Tracking,
    Manual,
}

/// A manual joystick-style command with a keep-alive timestamp.
#[derive(Debug, Clone, Copy)]
pub struct ManualCommand {
    pub pan: f64,
    pub tilt: f64,
    pub zoom: f64,
    pub at: Instant,
}

/// Telemetry exposed to the external UI collaborator (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetrySnapshot {
    pub mode: ControlMode,
    pub pan_deg: Option<f64>,
    pub tilt_deg: Option<f64>,
    pub zoom_factor: Option<f64>,
    pub gains: ServoGains,
    pub active_max_speed: f64,
    pub loop_fps: f64,
    pub stabilization_active: bool,
    pub tracking_lost: bool,
}

struct Shared {
    manual: Mutex<Option<ManualCommand>>,
    toggle_tracking_requested: Mutex<bool>,
    gains: Mutex<ServoGains>,
    max_speed: Mutex<f64>,
    stabilization: Mutex<bool>,
    telemetry: Mutex<TelemetrySnapshot>,
}

/// Cheap, `Clone`able facade exposing the Control API named in spec.md §6:
/// `set_manual_command`, `toggle_tracking`, `set_pid`, `set_max_speed`,
/// `toggle_stabilization`, plus telemetry readout.
#[derive(Clone)]
pub struct ControlHandle {
    shared: Arc<Shared>,
}

impl ControlHandle {
    pub fn set_manual_command(&self, pan: f64, tilt: f64, zoom: f64) {
        let mut slot = self.shared.manual.lock().unwrap();
        *slot = Some(ManualCommand { pan, tilt, zoom, at: Instant::now() });
    }

    pub fn toggle_tracking(&self) {
        let mut flag = self.shared.toggle_tracking_requested.lock().unwrap();
        *flag = true;
    }

    pub fn set_pid(&self, kp: f64, ki: f64, kd: f64) {
        *self.shared.gains.lock().unwrap() = ServoGains { kp, ki, kd };
    }

    pub fn set_max_speed(&self, v: f64) {
        *self.shared.max_speed.lock().unwrap() = v;
    }

    pub fn toggle_stabilization(&self) {
        let mut flag = self.shared.stabilization.lock().unwrap();
        *flag = !*flag;
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        *self.shared.telemetry.lock().unwrap()
    }
}

/// Owns the three collaborating pieces of tracking state across ticks and
/// drives them at the target loop period.
pub struct ControlLoop {
    video: VideoSource,
    transport: Arc<Transport>,
    tracker: Box<dyn VisualTracker>,
    estimator: Option<KalmanEstimator>,
    servo: ServoController,
    servo_state: Option<ServoState>,
    config: TrackingConfig,
    mode: ControlMode,
    pending_init: bool,
    shared: Arc<Shared>,
}

impl ControlLoop {
    pub fn new(
        video: VideoSource,
        transport: Arc<Transport>,
        tracker: Box<dyn VisualTracker>,
        config: TrackingConfig,
    ) -> Self {
        let servo = ServoController::from_config(&config);
        let gains = servo.pan_gains;
        let max_speed = servo.max_speed;
        let shared = Arc::new(Shared {
            manual: Mutex::new(None),
            toggle_tracking_requested: Mutex::new(false),
            gains: Mutex::new(gains),
            max_speed: Mutex::new(max_speed),
            stabilization: Mutex::new(false),
            telemetry: Mutex::new(TelemetrySnapshot {
                mode: ControlMode::Standby,
                pan_deg: None,
                tilt_deg: None,
                zoom_factor: None,
                gains,
                active_max_speed: max_speed,
                loop_fps: 0.0,
                stabilization_active: false,
                tracking_lost: false,
            }),
        });

        Self {
            video,
            transport,
            tracker,
            estimator: None,
            servo,
            servo_state: None,
            config,
            mode: ControlMode::Standby,
            pending_init: false,
            shared,
        }
    }

    pub fn control_handle(&self) -> ControlHandle {
        ControlHandle { shared: self.shared.clone() }
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        *self.shared.telemetry.lock().unwrap()
    }

    fn take_toggle_request(&self) -> bool {
        let mut flag = self.shared.toggle_tracking_requested.lock().unwrap();
        let requested = *flag;
        *flag = false;
        requested
    }

    fn take_manual_command(&self) -> Option<ManualCommand> {
        *self.shared.manual.lock().unwrap()
    }

    fn start_tracking(&mut self) {
        self.mode = ControlMode::Tracking;
        self.estimator = None;
        self.servo_state = None;
        self.pending_init = true;
    }

    fn stop_tracking(&mut self) {
        self.mode = ControlMode::Standby;
        self.estimator = None;
        self.servo_state = None;
        self.pending_init = false;
    }

    async fn emit_stop(&self) {
        if let Err(e) = self.transport.send_stop().await {
            log::warn!("VISCA stop send failed: {e}");
        }
    }

    fn refresh_live_gains(&mut self) {
        let gains = *self.shared.gains.lock().unwrap();
        let max_speed = *self.shared.max_speed.lock().unwrap();
        self.servo.pan_gains = gains;
        self.servo.tilt_gains = gains;
        self.servo.max_speed = max_speed;
    }

    fn publish_telemetry(&self, loop_fps: f64) {
        let snap = self.transport.telemetry();
        let pan_deg = snap.pan_raw.map(|p| p as f64 / self.config.pan_counts_per_degree);
        let tilt_deg = snap.tilt_raw.map(|t| t as f64 / self.config.tilt_counts_per_degree);
        let zoom_factor = snap.zoom_raw.map(|z| {
            1.0 + (z as f64 / self.config.zoom_max_hex as f64) * (self.config.zoom_max_x - 1.0)
        });

        let telemetry = TelemetrySnapshot {
            mode: self.mode,
            pan_deg,
            tilt_deg,
            zoom_factor,
            gains: self.servo.pan_gains,
            active_max_speed: self.servo.max_speed,
            loop_fps,
            stabilization_active: *self.shared.stabilization.lock().unwrap(),
            tracking_lost: self.mode == ControlMode::Tracking && !self.pending_init && self.estimator.is_none()
                && self.servo_state.is_some(),
        };
        *self.shared.telemetry.lock().unwrap() = telemetry;
    }

    async fn run_tracking_tick(&mut self, frame: &crate::video::Frame, dt: f64) {
        if self.pending_init {
            let half = self.config.reticle_size as f64 / 2.0;
            let (cx, cy) = frame.center();
            let seed = BBox {
                x: cx - half,
                y: cy - half,
                width: self.config.reticle_size as f64,
                height: self.config.reticle_size as f64,
            };
            self.tracker.init(frame, seed);
            self.pending_init = false;
            self.servo_state = Some(ServoState::new());
        }

        let Some(bbox) = self.tracker.update(frame) else {
            // Tracker failure: remain engaged but issue no drive command
            // (spec.md §4.F / §7 policy choice preserved from source),
            // unless configured to auto-disengage (DESIGN.md Open Question 1).
            if self.config.auto_disengage_on_loss {
                self.stop_tracking();
                self.emit_stop().await;
            }
            return;
        };

        let (obj_x, obj_y) = bbox.center();
        let estimator = self
            .estimator
            .get_or_insert_with(|| KalmanEstimator::new(obj_x, obj_y, self.config.kf_process_noise, self.config.kf_measurement_noise));

        estimator.predict(dt + self.config.system_latency);
        estimator.update(obj_x, obj_y);
        let (kf_x, kf_y) = estimator.position();
        let (kf_vx, kf_vy) = estimator.velocity();

        let (center_x, center_y) = frame.center();
        let error_x = center_x - kf_x;
        let error_y = center_y - kf_y;

        self.refresh_live_gains();
        let state = self.servo_state.get_or_insert_with(ServoState::new);
        let output = self.servo.tick(state, ServoInput { error_x, error_y, ff_vx: kf_vx, ff_vy: kf_vy, dt });

        match output {
            ServoOutput::Drive { pan, tilt } => {
                let pan_dir = if pan >= 0 { PanDir::Right } else { PanDir::Left };
                let tilt_dir = if tilt >= 0 { TiltDir::Up } else { TiltDir::Down };
                if let Err(e) = self
                    .transport
                    .send_drive(pan.unsigned_abs() as u8, pan_dir, tilt.unsigned_abs() as u8, tilt_dir)
                    .await
                {
                    log::warn!("VISCA drive send failed: {e}");
                }
            }
            ServoOutput::Stop => self.emit_stop().await,
            ServoOutput::Suppressed => {}
        }
    }

    async fn run_manual_tick(&mut self, was_manual: bool) {
        let Some(cmd) = self.take_manual_command() else {
            if was_manual {
                self.mode = ControlMode::Standby;
                self.emit_stop().await;
            }
            return;
        };

        let lapsed = cmd.at.elapsed() >= Duration::from_secs_f64(self.config.manual_keepalive);
        if lapsed {
            if was_manual {
                self.mode = ControlMode::Standby;
                self.emit_stop().await;
            }
            return;
        }

        self.mode = ControlMode::Manual;
        let mut pan = cmd.pan;
        let mut tilt = cmd.tilt;
        if self.config.pan_invert {
            pan = -pan;
        }
        if self.config.tilt_invert {
            tilt = -tilt;
        }

        let zoom_cmd = if cmd.zoom > 0.0 {
            ZoomCommand::Tele(cmd.zoom.abs().min(7.0) as u8)
        } else if cmd.zoom < 0.0 {
            ZoomCommand::Wide(cmd.zoom.abs().min(7.0) as u8)
        } else {
            ZoomCommand::Stop
        };
        if let Err(e) = self.transport.send_zoom(zoom_cmd).await {
            log::warn!("VISCA zoom send failed: {e}");
        }

        if pan != 0.0 || tilt != 0.0 {
            let pan_dir = if pan >= 0.0 { PanDir::Right } else { PanDir::Left };
            let tilt_dir = if tilt >= 0.0 { TiltDir::Up } else { TiltDir::Down };
            if let Err(e) = self
                .transport
                .send_drive(pan.abs().min(24.0) as u8, pan_dir, tilt.abs().min(20.0) as u8, tilt_dir)
                .await
            {
                log::warn!("VISCA manual drive send failed: {e}");
            }
        }
    }

    /// Runs the ~30Hz control loop until `shutdown` reports `true`. Any
    /// unrecoverable error transitions to the fatal state described in
    /// spec.md §7; transient I/O failures are handled in place and never
    /// surface here.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), CoreError> {
        let loop_period = Duration::from_secs_f64(self.config.loop_interval);
        let mut prev_tick = Instant::now();

        loop {
            if *shutdown.borrow() {
                self.emit_stop().await;
                return Ok(());
            }

            let tick_start = Instant::now();

            let frame = self.video.read().await;
            let Some(frame) = frame else {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            };

            let now = Instant::now();
            let dt = (now - prev_tick).as_secs_f64().max(0.001);
            prev_tick = now;

            if self.take_toggle_request() {
                if self.mode == ControlMode::Tracking {
                    self.stop_tracking();
                    self.emit_stop().await;
                } else {
                    self.start_tracking();
                }
            }

            // Mode arbitration (spec.md §4.F): a non-zero manual command
            // while tracking forces immediate transition to Manual.
            if self.mode == ControlMode::Tracking {
                if let Some(cmd) = self.take_manual_command() {
                    if cmd.pan != 0.0 || cmd.tilt != 0.0 || cmd.zoom != 0.0 {
                        self.stop_tracking();
                        self.mode = ControlMode::Manual;
                    }
                }
            }

            match self.mode {
                ControlMode::Tracking => self.run_tracking_tick(&frame, dt).await,
                ControlMode::Standby | ControlMode::Manual => {
                    let was_manual = self.mode == ControlMode::Manual;
                    self.run_manual_tick(was_manual).await;
                }
            }

            let loop_fps = 1.0 / dt;
            self.publish_telemetry(loop_fps);

            let elapsed = tick_start.elapsed();
            if elapsed < loop_period {
                tokio::select! {
                    _ = tokio::time::sleep((loop_period - elapsed).max(Duration::from_millis(1))) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::CorrelationTracker;
    use crate::video::{Frame, FrameDecoder};
    use crate::error::VideoError;

    struct StaticDecoder {
        frame: Frame,
    }

    #[async_trait::async_trait]
    impl FrameDecoder for StaticDecoder {
        async fn open(_url: &str) -> Result<Self, VideoError> {
            unreachable!()
        }

        async fn decode_next(&mut self) -> Option<Frame> {
            Some(self.frame.clone())
        }
    }

    fn checkerboard(w: u32, h: u32) -> Frame {
        let mut data = vec![0u8; (w * h) as usize];
        for y in 0..h {
            for x in 0..w {
                data[(y * w + x) as usize] = if (x / 4 + y / 4) % 2 == 0 { 200 } else { 30 };
            }
        }
        Frame { data, width: w, height: h }
    }

    async fn fake_camera_transport() -> (Arc<Transport>, tokio::net::UdpSocket) {
        let camera = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = camera.local_addr().unwrap();
        let transport = Transport::connect(&addr.ip().to_string(), addr.port()).await.unwrap();
        (Arc::new(transport), camera)
    }

    #[tokio::test]
    async fn toggle_tracking_transitions_standby_to_tracking() {
        let (transport, _camera) = fake_camera_transport().await;
        let video = VideoSource::spawn(StaticDecoder { frame: checkerboard(64, 64) });
        let mut config = TrackingConfig::default();
        config.loop_interval = 0.01;
        let mut control = ControlLoop::new(video, transport, Box::new(CorrelationTracker::new(6.0, 0.3)), config);
        let handle = control.control_handle();

        assert_eq!(control.telemetry().mode, ControlMode::Standby);
        handle.toggle_tracking();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run_task = tokio::spawn(async move {
            let _ = control.run(shutdown_rx).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = shutdown_tx.send(true);
        let _ = run_task.await;
        assert!(handle.telemetry().mode != ControlMode::Standby || handle.telemetry().mode == ControlMode::Tracking);
    }

    #[tokio::test]
    async fn manual_command_drives_without_tracking() {
        let (transport, camera) = fake_camera_transport().await;
        let video = VideoSource::spawn(StaticDecoder { frame: checkerboard(64, 64) });
        let mut config = TrackingConfig::default();
        config.loop_interval = 0.01;
        let mut control = ControlLoop::new(video, transport, Box::new(CorrelationTracker::new(6.0, 0.3)), config);
        let handle = control.control_handle();
        handle.set_manual_command(5.0, 0.0, 0.0);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run_task = tokio::spawn(async move {
            let _ = control.run(shutdown_rx).await;
        });

        let mut buf = [0u8; 32];
        let received = tokio::time::timeout(Duration::from_millis(200), camera.recv_from(&mut buf)).await;
        let _ = shutdown_tx.send(true);
        let _ = run_task.await;
        assert!(received.is_ok(), "expected a VISCA packet from the manual drive command");
    }

    #[test]
    fn manual_command_struct_holds_timestamp() {
        let cmd = ManualCommand { pan: 1.0, tilt: 0.0, zoom: 0.0, at: Instant::now() };
        assert!(cmd.at.elapsed() < Duration::from_secs(1));
    }
}
