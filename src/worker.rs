// This file is part of Vigil NVR, a multi-camera motion-triggered network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Camera worker: one OS process per camera, driving four cooperative loops
//! (capture, recording controller, heartbeat, command) around a shared
//! [`Recorder`] and [`MotionTimer`].
//!
//! The loops don't share a single event loop: capture and command
//! processing block on synchronous I/O (a camera stream, an inherited pipe)
//! so they run on blocking tasks, while the recording controller and
//! heartbeat loops are plain tokio tasks ticking on a timer. All four read
//! and write a small set of atomics/mutexes rather than passing messages,
//! mirroring the source's shared-instance-variable design but made safe for
//! concurrent access.

use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base::clock::Clocks;
use base::Mutex;
use tracing::{info, warn};

use crate::config::CameraConfig;
use crate::ipc::{Command, CommandName, Heartbeat, StreamState};
use crate::motion::{Edge, MotionParams, MotionTimer};
use crate::recorder::{Frame, Recorder};
use crate::stream::{self, CapturedFrame, Opener};

const RECORDING_TICK: Duration = Duration::from_millis(500);
const HEARTBEAT_TICK: Duration = Duration::from_secs(5);
const STREAM_HEALTH_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);
const MIN_FPS_FRACTION: f64 = 0.20;
const UNHEALTHY_OBSERVATIONS_LIMIT: u32 = 3;
const SUSTAINED_LOW_FPS_DURATION: Duration = Duration::from_secs(30);
const SHUTDOWN_LOOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

struct Signals {
    running: AtomicBool,
    record_request: AtomicBool,
    stop_request: AtomicBool,
}

/// State shared by all four loops. Lock-free where the value is a single
/// word; behind a `Mutex` where it isn't.
struct Shared {
    measured_fps_bits: AtomicU64,
    error_message: Mutex<Option<String>>,
    error_critical: AtomicBool,
    motion: Mutex<MotionTimer>,
}

impl Shared {
    fn measured_fps(&self) -> f64 {
        f64::from_bits(self.measured_fps_bits.load(Ordering::Relaxed))
    }

    fn set_measured_fps(&self, fps: f64) {
        self.measured_fps_bits.store(fps.to_bits(), Ordering::Relaxed);
    }

    fn set_error(&self, msg: impl Into<String>, critical: bool) {
        *self.error_message.lock() = Some(msg.into());
        self.error_critical.store(critical, Ordering::SeqCst);
    }

    fn clear_non_critical_error(&self) {
        if !self.error_critical.load(Ordering::SeqCst) {
            *self.error_message.lock() = None;
        }
    }
}

/// Drives a single camera end to end: stream acquisition, motion detection,
/// recording control, and heartbeat/command IPC.
pub struct CameraWorker<C: Clocks> {
    camera_id: String,
    camera: CameraConfig,
    output_dir: std::path::PathBuf,
    clocks: C,
    opener: Arc<dyn Opener>,
    recorder: Arc<Recorder>,
    signals: Arc<Signals>,
    shared: Arc<Shared>,
}

impl<C: Clocks> CameraWorker<C> {
    pub fn new(
        camera_id: impl Into<String>,
        camera: CameraConfig,
        output_dir: std::path::PathBuf,
        encoder_binary: std::path::PathBuf,
        encoder_extra_args: Vec<String>,
        opener: Arc<dyn Opener>,
        clocks: C,
    ) -> Self {
        let motion = MotionTimer::new(MotionParams {
            motion_timeout: Duration::from_secs_f64(camera.motion_timeout_secs),
            post_roll: Duration::from_secs_f64(camera.post_roll_secs),
            trigger_cooldown: Duration::from_secs_f64(camera.trigger_cooldown_secs),
        });
        let recorder = Arc::new(Recorder::new(camera.clone(), encoder_binary, encoder_extra_args));
        CameraWorker {
            camera_id: camera_id.into(),
            camera,
            output_dir,
            clocks,
            opener,
            recorder,
            signals: Arc::new(Signals {
                running: AtomicBool::new(true),
                record_request: AtomicBool::new(false),
                stop_request: AtomicBool::new(false),
            }),
            shared: Arc::new(Shared {
                measured_fps_bits: AtomicU64::new(0),
                error_message: Mutex::new(None),
                error_critical: AtomicBool::new(false),
                motion: Mutex::new(motion),
            }),
        }
    }

    fn stream_state(&self) -> StreamState {
        if self.shared.error_critical.load(Ordering::SeqCst) {
            return StreamState::Error;
        }
        if self.recorder.status().recording_failed {
            return StreamState::RecordingFailed;
        }
        if self.recorder.status().recording {
            return StreamState::Recording;
        }
        if self.shared.measured_fps() > 0.0 {
            return StreamState::Capturing;
        }
        StreamState::Idle
    }

    /// Runs all four loops until `shutdown_rx` fires or the worker marks
    /// itself fatally erroring. `cmd_reader` and `heartbeat_writer` are the
    /// worker's two inherited IPC pipe ends.
    pub async fn run<R, W>(
        self: Arc<Self>,
        cmd_reader: R,
        heartbeat_writer: W,
        shutdown_rx: base::shutdown::Receiver,
    ) where
        R: BufRead + Send + 'static,
        W: Write + Send + 'static,
    {
        let capture = {
            let this = self.clone();
            tokio::task::spawn_blocking(move || this.capture_loop())
        };
        let recording = {
            let this = self.clone();
            tokio::spawn(async move { this.recording_controller_loop().await })
        };
        let heartbeat = {
            let this = self.clone();
            tokio::spawn(async move { this.heartbeat_loop(heartbeat_writer).await })
        };
        let command = {
            let this = self.clone();
            tokio::task::spawn_blocking(move || this.command_loop(cmd_reader))
        };

        shutdown_rx.as_future().await;
        info!(camera_id = %self.camera_id, "worker: shutdown requested");
        self.signals.running.store(false, Ordering::SeqCst);
        self.signals.stop_request.store(true, Ordering::SeqCst);

        let join_all = async {
            let _ = capture.await;
            let _ = recording.await;
            let _ = heartbeat.await;
            let _ = command.await;
        };
        if tokio::time::timeout(SHUTDOWN_LOOP_JOIN_TIMEOUT, join_all)
            .await
            .is_err()
        {
            warn!(camera_id = %self.camera_id, "worker: one or more loops did not exit within the shutdown window");
        }
    }

    fn capture_loop(self: Arc<Self>) {
        let mut consecutive_url_failures: u32 = 0;
        'reconnect: loop {
            if !self.signals.running.load(Ordering::SeqCst) {
                return;
            }
            let url = if consecutive_url_failures == 0 {
                self.camera.preview_url().to_owned()
            } else {
                self.camera.main_url.clone()
            };
            let mut live_stream = match self.opener.open(&url) {
                Ok(s) => {
                    consecutive_url_failures = 0;
                    s
                }
                Err(e) => {
                    consecutive_url_failures += 1;
                    warn!(camera_id = %self.camera_id, %e, consecutive_url_failures, "worker: stream open failed");
                    if consecutive_url_failures >= stream::MAX_CONSECUTIVE_URL_FAILURES {
                        self.shared
                            .set_error("No valid camera URL reachable after repeated attempts", true);
                        self.signals.running.store(false, Ordering::SeqCst);
                        return;
                    }
                    self.clocks.sleep(stream::reconnect_backoff(consecutive_url_failures - 1));
                    continue 'reconnect;
                }
            };

            let mut consecutive_invalid = 0u32;
            let mut last_valid = self.clocks.monotonic();
            let mut window_start = self.clocks.monotonic();
            let mut window_count: u32 = 0;

            loop {
                if !self.signals.running.load(Ordering::SeqCst) {
                    return;
                }
                let frame = match live_stream.next_frame(Duration::from_secs(1)) {
                    Ok(Some(f)) => f,
                    Ok(None) => {
                        if self.clocks.monotonic().duration_since(last_valid) >= stream::NO_VALID_FRAME_TIMEOUT {
                            warn!(camera_id = %self.camera_id, "worker: no valid frame for 5s, forcing reconnect");
                            continue 'reconnect;
                        }
                        continue;
                    }
                    Err(e) => {
                        warn!(camera_id = %self.camera_id, %e, "worker: stream read error, forcing reconnect");
                        consecutive_url_failures += 1;
                        continue 'reconnect;
                    }
                };

                if let Err(defect) = stream::validate_frame(&frame) {
                    consecutive_invalid += 1;
                    warn!(camera_id = %self.camera_id, ?defect, consecutive_invalid, "worker: rejecting invalid frame");
                    if consecutive_invalid >= stream::MAX_CONSECUTIVE_INVALID_FRAMES {
                        warn!(camera_id = %self.camera_id, "worker: too many consecutive invalid frames, forcing reconnect");
                        continue 'reconnect;
                    }
                    continue;
                }
                consecutive_invalid = 0;
                last_valid = self.clocks.monotonic();
                window_count += 1;

                let now = self.clocks.monotonic();
                let elapsed = now.duration_since(window_start);
                if elapsed >= Duration::from_secs(1) {
                    self.shared
                        .set_measured_fps(window_count as f64 / elapsed.as_secs_f64());
                    window_count = 0;
                    window_start = now;
                }

                self.on_valid_frame(&frame, now);
            }
        }
    }

    fn on_valid_frame(&self, frame: &CapturedFrame, now: base::clock::Instant) {
        self.recorder.add_frame(Frame(frame.data.clone()));
        let edge = self.shared.motion.lock().sample(frame.motion_detected, now);
        match edge {
            Some(Edge::Confirm) => {
                info!(camera_id = %self.camera_id, "worker: motion confirmed, requesting recording start");
                self.signals.record_request.store(true, Ordering::SeqCst);
            }
            Some(Edge::End) => {
                info!(camera_id = %self.camera_id, "worker: motion ended, requesting recording stop");
                self.signals.stop_request.store(true, Ordering::SeqCst);
            }
            None => {}
        }
    }

    async fn recording_controller_loop(self: Arc<Self>) {
        let mut unhealthy_observations: u32 = 0;
        let mut low_fps_since: Option<base::clock::Instant> = None;
        let mut since_last_health_check = Duration::ZERO;

        while self.signals.running.load(Ordering::SeqCst) {
            tokio::time::sleep(RECORDING_TICK).await;

            if self.signals.stop_request.swap(false, Ordering::SeqCst) {
                self.recorder.stop_recording(false).await;
                unhealthy_observations = 0;
                low_fps_since = None;
            }
            if self.signals.record_request.swap(false, Ordering::SeqCst)
                && !self.recorder.status().recording
            {
                let now = jiff::Zoned::now();
                if let Err(e) = self
                    .recorder
                    .start_recording(&self.output_dir, &self.camera_id, now)
                    .await
                {
                    warn!(camera_id = %self.camera_id, %e, "worker: failed to start recording");
                }
            }

            if !self.recorder.status().recording {
                continue;
            }

            since_last_health_check += RECORDING_TICK;
            if since_last_health_check < STREAM_HEALTH_SAMPLE_INTERVAL {
                continue;
            }
            since_last_health_check = Duration::ZERO;

            let min_fps = self.camera.fps as f64 * MIN_FPS_FRACTION;
            let measured = self.shared.measured_fps();
            let now = self.clocks.monotonic();
            if measured < min_fps {
                unhealthy_observations += 1;
                let since = *low_fps_since.get_or_insert(now);
                let sustained = now.duration_since(since) >= SUSTAINED_LOW_FPS_DURATION;
                if unhealthy_observations >= UNHEALTHY_OBSERVATIONS_LIMIT || sustained {
                    warn!(
                        camera_id = %self.camera_id,
                        measured,
                        min_fps,
                        "worker: sustained low stream health, force-stopping recording"
                    );
                    self.recorder.stop_recording(true).await;
                    unhealthy_observations = 0;
                    low_fps_since = None;
                }
            } else {
                unhealthy_observations = 0;
                low_fps_since = None;
            }

            if !self.recorder.is_recording_healthy() && self.recorder.status().recording {
                warn!(camera_id = %self.camera_id, "worker: recorder unhealthy, force-stopping");
                self.recorder.stop_recording(true).await;
            }
        }
    }

    async fn heartbeat_loop<W: Write + Send + 'static>(self: Arc<Self>, writer: W) {
        let mut writer = writer;
        while self.signals.running.load(Ordering::SeqCst) {
            let stream_state = self.stream_state();
            let mut hb = Heartbeat::new(self.camera_id.clone(), self.clocks.realtime());
            hb.stream_state = stream_state;
            hb.fps = self.shared.measured_fps();
            hb.recording = self.recorder.status().recording;
            hb.error_message = self.shared.error_message.lock().clone();

            let result = tokio::task::spawn_blocking(move || {
                let r = crate::ipc::write_line(&mut writer, &hb);
                (writer, r)
            })
            .await;
            match result {
                Ok((w, Ok(()))) => {
                    writer = w;
                    self.shared.clear_non_critical_error();
                }
                Ok((w, Err(e))) => {
                    writer = w;
                    warn!(camera_id = %self.camera_id, %e, "worker: heartbeat write failed");
                }
                Err(e) => {
                    warn!(camera_id = %self.camera_id, %e, "worker: heartbeat task panicked");
                    return;
                }
            }
            tokio::time::sleep(HEARTBEAT_TICK).await;
        }
    }

    fn command_loop<R: BufRead>(self: Arc<Self>, mut reader: R) {
        while self.signals.running.load(Ordering::SeqCst) {
            match crate::ipc::read_line::<_, Command>(&mut reader) {
                Ok(Some(cmd)) => self.apply_command(cmd),
                Ok(None) => {
                    info!(camera_id = %self.camera_id, "worker: command pipe closed");
                    self.signals.running.store(false, Ordering::SeqCst);
                    self.signals.stop_request.store(true, Ordering::SeqCst);
                    return;
                }
                Err(e) => {
                    warn!(camera_id = %self.camera_id, %e, "worker: command pipe read error");
                    return;
                }
            }
        }
    }

    fn apply_command(&self, cmd: Command) {
        match cmd.command {
            CommandName::Stop => {
                self.signals.running.store(false, Ordering::SeqCst);
                self.signals.stop_request.store(true, Ordering::SeqCst);
            }
            CommandName::StartRecording => {
                self.signals.record_request.store(true, Ordering::SeqCst);
            }
            CommandName::StopRecording => {
                self.signals.stop_request.store(true, Ordering::SeqCst);
            }
            CommandName::PtzMove => {
                info!(camera_id = %self.camera_id, params = ?cmd.params, "worker: PTZ command passed through (no-op)");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::SimulatedClocks;
    use std::sync::atomic::AtomicUsize;

    struct FakeStream {
        frames: std::collections::VecDeque<CapturedFrame>,
    }

    impl stream::Stream for FakeStream {
        fn next_frame(&mut self, _timeout: Duration) -> Result<Option<CapturedFrame>, base::Error> {
            Ok(self.frames.pop_front())
        }
    }

    struct FailingOpener {
        attempts: AtomicUsize,
    }

    impl Opener for FailingOpener {
        fn open(&self, _url: &str) -> Result<Box<dyn stream::Stream>, base::Error> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(base::err!(Unavailable, "camera unreachable in test"))
        }
    }

    fn camera() -> CameraConfig {
        CameraConfig {
            main_url: "rtsp://cam/stream".to_owned(),
            preview_url: None,
            motion_threshold: 25,
            min_contour_area: 500.0,
            motion_timeout_secs: 1.5,
            pre_roll_secs: 1.0,
            post_roll_secs: 2.0,
            trigger_cooldown_secs: 1.0,
            fps: 10,
            frame_width: 640,
            frame_height: 480,
            enabled: true,
        }
    }

    #[test]
    fn shared_fps_round_trips_through_bit_pattern() {
        let shared = Shared {
            measured_fps_bits: AtomicU64::new(0),
            error_message: Mutex::new(None),
            error_critical: AtomicBool::new(false),
            motion: Mutex::new(MotionTimer::new(MotionParams {
                motion_timeout: Duration::from_secs(1),
                post_roll: Duration::from_secs(1),
                trigger_cooldown: Duration::from_secs(1),
            })),
        };
        shared.set_measured_fps(14.75);
        assert_eq!(shared.measured_fps(), 14.75);
    }

    #[test]
    fn error_message_cleared_only_when_not_critical() {
        let shared = Shared {
            measured_fps_bits: AtomicU64::new(0),
            error_message: Mutex::new(Some("transient".to_owned())),
            error_critical: AtomicBool::new(false),
            motion: Mutex::new(MotionTimer::new(MotionParams {
                motion_timeout: Duration::from_secs(1),
                post_roll: Duration::from_secs(1),
                trigger_cooldown: Duration::from_secs(1),
            })),
        };
        shared.clear_non_critical_error();
        assert!(shared.error_message.lock().is_none());

        shared.set_error("fatal", true);
        shared.clear_non_critical_error();
        assert!(shared.error_message.lock().is_some());
    }

    #[tokio::test]
    async fn capture_loop_marks_fatal_error_after_max_url_failures() {
        let clocks = SimulatedClocks::new(jiff::Timestamp::UNIX_EPOCH);
        let opener = Arc::new(FailingOpener {
            attempts: AtomicUsize::new(0),
        });
        let worker = Arc::new(CameraWorker::new(
            "cam1",
            camera(),
            std::path::PathBuf::from("/tmp"),
            "ffmpeg".into(),
            Vec::new(),
            opener,
            clocks.clone(),
        ));
        let w = worker.clone();
        let handle = tokio::task::spawn_blocking(move || w.capture_loop());
        // advance the simulated clock so the backoff sleeps resolve instantly in wall time;
        // the fake opener fails synchronously so no real waiting occurs either way.
        for _ in 0..10 {
            clocks.sleep(Duration::from_secs(60));
            if !worker.signals.running.load(Ordering::SeqCst) {
                break;
            }
        }
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(!worker.signals.running.load(Ordering::SeqCst));
        assert!(worker.shared.error_critical.load(Ordering::SeqCst));
    }
}
