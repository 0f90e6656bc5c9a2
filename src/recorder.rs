// This file is part of Vigil NVR, a multi-camera motion-triggered network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Recorder: owns the external encoder subprocess for one camera, feeding it
//! pre-roll-buffered and live frames while monitoring its health and
//! restarting it (with output-file rotation) across transient failures.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base::{err, Error, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::config::CameraConfig;

/// One opaque encoded/raw frame handed to the encoder's stdin. The pixel
/// format and resizing live in the capture loop (out of scope here); the
/// recorder only ever moves bytes.
#[derive(Clone)]
pub struct Frame(pub Arc<[u8]>);

const WRITE_QUEUE_CAPACITY: usize = 1000;
const HIGH_WATERMARK_FRACTION: f64 = 0.80;
const CRITICAL_THRESHOLD_FRACTION: f64 = 0.95;
const EMERGENCY_DRAIN_FRAMES: usize = 200;
const WRITER_EXIT_DRAIN_CAP: usize = 2000;
const CONSECUTIVE_WRITE_ERROR_THRESHOLD: u32 = 10;
const MAX_RESTARTS: u32 = 3;
const BACKED_UP_THRESHOLD: usize = 50;
const MONITOR_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Builds the encoder's argv: a pure, independently testable function of the
/// camera's frame geometry, the daemon's encoder binary/extra-args, and the
/// output path, so the spawn site doesn't need to be exercised to check it.
pub fn build_argv(camera: &CameraConfig, extra_args: &[String], output_path: &Path) -> Vec<String> {
    let mut argv = vec![
        "-y".to_owned(),
        "-f".to_owned(),
        "rawvideo".to_owned(),
        "-pix_fmt".to_owned(),
        "bgr24".to_owned(),
        "-s".to_owned(),
        format!("{}x{}", camera.frame_width, camera.frame_height),
        "-r".to_owned(),
        camera.fps.to_string(),
        "-i".to_owned(),
        "pipe:0".to_owned(),
        "-an".to_owned(),
        "-c:v".to_owned(),
        "libx264".to_owned(),
        "-preset".to_owned(),
        "ultrafast".to_owned(),
        "-pix_fmt".to_owned(),
        "yuv420p".to_owned(),
    ];
    argv.extend(extra_args.iter().cloned());
    argv.push(output_path.display().to_string());
    argv
}

/// Computes the rotated output path for the `n`th restart, appended as
/// `<base>_part<n>_<HHMMSS>.<ext>`.
pub fn rotated_path(original: &Path, restart_count: u32, now: jiff::Zoned) -> PathBuf {
    let stem = original.file_stem().and_then(|s| s.to_str()).unwrap_or("output");
    let ext = original.extension().and_then(|s| s.to_str()).unwrap_or("mp4");
    let hhmmss = now.strftime("%H%M%S").to_string();
    let name = format!("{stem}_part{restart_count}_{hhmmss}.{ext}");
    original.with_file_name(name)
}

/// Decides whether `stop_recording` should skip the graceful handshake and
/// terminate the encoder immediately: the caller demanded it, the encoder
/// has already restarted, the queue is badly backed up, or the encoder's
/// stdin is known to be unwritable.
pub fn should_force_immediate(
    demanded: bool,
    restart_count: u32,
    queue_len: usize,
    stdin_writable: bool,
) -> bool {
    demanded || restart_count >= 1 || queue_len > BACKED_UP_THRESHOLD || !stdin_writable
}

struct Queue {
    frames: Mutex<VecDeque<Frame>>,
    dropped: AtomicU64,
    capacity: usize,
}

impl Queue {
    fn new(capacity: usize) -> Self {
        Queue {
            frames: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            dropped: AtomicU64::new(0),
            capacity,
        }
    }

    fn len(&self) -> usize {
        self.frames.lock().len()
    }

    /// Enqueues a frame unless the queue is already at the critical threshold
    /// (95%), in which case it's dropped and counted.
    fn push(&self, frame: Frame) -> bool {
        let critical = (self.capacity as f64 * CRITICAL_THRESHOLD_FRACTION) as usize;
        let mut q = self.frames.lock();
        if q.len() >= critical {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        q.push_back(frame);
        true
    }

    fn is_high_watermark(&self) -> bool {
        self.len() > (self.capacity as f64 * HIGH_WATERMARK_FRACTION) as usize
    }

    fn is_critical(&self) -> bool {
        self.len() >= (self.capacity as f64 * CRITICAL_THRESHOLD_FRACTION) as usize
    }

    /// Drops up to `EMERGENCY_DRAIN_FRAMES` oldest frames, for use when the
    /// queue has crossed the critical threshold.
    fn emergency_drain(&self) -> usize {
        let mut q = self.frames.lock();
        let n = EMERGENCY_DRAIN_FRAMES.min(q.len());
        q.drain(..n);
        n
    }

    fn drain_all(&self, cap: usize) {
        let mut q = self.frames.lock();
        let n = q.len().min(cap);
        q.drain(..n);
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecorderStatus {
    pub recording: bool,
    pub recording_failed: bool,
    pub restart_count: u32,
    pub dropped_frames: u64,
    pub queue_len: usize,
    pub process_alive: bool,
}

struct Inner {
    recording: bool,
    recording_failed: bool,
    restart_count: u32,
    output_path: PathBuf,
    child: Option<Child>,
    /// Shared with the writer loop so `stop_recording` can still send the
    /// graceful end-of-input sentinel after the child's stdin handle has
    /// been handed off to that loop.
    stdin: Option<Arc<tokio::sync::Mutex<tokio::process::ChildStdin>>>,
}

/// Owns one camera's encoder subprocess; strictly owned by its
/// [`crate::worker::CameraWorker`], which is the only thing that starts or
/// stops it.
pub struct Recorder {
    camera: CameraConfig,
    encoder_binary: PathBuf,
    extra_args: Vec<String>,
    pre_roll: Mutex<VecDeque<Frame>>,
    pre_roll_capacity: usize,
    queue: Arc<Queue>,
    inner: Arc<Mutex<Inner>>,
    stop_loops: Arc<AtomicBool>,
}

impl Recorder {
    pub fn new(camera: CameraConfig, encoder_binary: PathBuf, extra_args: Vec<String>) -> Self {
        let pre_roll_capacity =
            ((camera.pre_roll_secs * camera.fps as f64).ceil() as usize).max(1);
        Recorder {
            camera,
            encoder_binary,
            extra_args,
            pre_roll: Mutex::new(VecDeque::with_capacity(pre_roll_capacity)),
            pre_roll_capacity,
            queue: Arc::new(Queue::new(WRITE_QUEUE_CAPACITY)),
            inner: Arc::new(Mutex::new(Inner {
                recording: false,
                recording_failed: false,
                restart_count: 0,
                output_path: PathBuf::new(),
                child: None,
                stdin: None,
            })),
            stop_loops: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Always appends to the pre-roll ring; enqueues to the write queue only
    /// while actively (and healthily) recording.
    pub fn add_frame(&self, frame: Frame) {
        {
            let mut ring = self.pre_roll.lock();
            if ring.len() >= self.pre_roll_capacity {
                ring.pop_front();
            }
            ring.push_back(frame.clone());
        }
        let recording = {
            let inner = self.inner.lock();
            inner.recording && !inner.recording_failed
        };
        if !recording {
            return;
        }
        if self.queue.is_critical() {
            self.queue.emergency_drain();
            self.inner.lock().recording_failed = true;
            return;
        }
        if self.queue.is_high_watermark() {
            return;
        }
        self.queue.push(frame);
    }

    /// `recording ∧ ¬recording_failed ∧ subprocess alive`. Liveness is
    /// tracked by the monitor loop (which owns the only `try_wait` call);
    /// here we just check that a child handle is still present.
    pub fn is_recording_healthy(&self) -> bool {
        let inner = self.inner.lock();
        inner.recording && !inner.recording_failed && inner.child.is_some()
    }

    pub fn status(&self) -> RecorderStatus {
        let inner = self.inner.lock();
        RecorderStatus {
            recording: inner.recording,
            recording_failed: inner.recording_failed,
            restart_count: inner.restart_count,
            dropped_frames: self.queue.dropped.load(Ordering::Relaxed),
            queue_len: self.queue.len(),
            process_alive: inner.child.is_some(),
        }
    }

    /// Idempotent: returns immediately if already recording.
    pub async fn start_recording(
        &self,
        output_dir: &Path,
        camera_id: &str,
        now: jiff::Zoned,
    ) -> Result<(), Error> {
        {
            let inner = self.inner.lock();
            if inner.recording {
                return Ok(());
            }
        }
        std::fs::create_dir_all(output_dir)?;
        let file_name = format!("{camera_id}_{}.mp4", now.strftime("%Y%m%d_%H%M%S"));
        let output_path = output_dir.join(file_name);

        let mut child =
            spawn_encoder(&self.encoder_binary, &self.camera, &self.extra_args, &output_path)?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| err!(Internal, "encoder child has no stdin"))?;
        let stdin = Arc::new(tokio::sync::Mutex::new(stdin));

        {
            let mut inner = self.inner.lock();
            inner.recording = true;
            inner.recording_failed = false;
            inner.restart_count = 0;
            inner.output_path = output_path;
            inner.child = Some(child);
            inner.stdin = Some(stdin.clone());
        }
        self.stop_loops.store(false, Ordering::SeqCst);

        // Prime the encoder's input with the whole pre-roll ring.
        let preroll: Vec<Frame> = self.pre_roll.lock().iter().cloned().collect();
        for frame in preroll {
            self.queue.push(frame);
        }

        spawn_writer_loop(self.queue.clone(), self.inner.clone(), self.stop_loops.clone(), stdin);
        spawn_monitor_loop(
            camera_id.to_owned(),
            self.encoder_binary.clone(),
            self.camera.clone(),
            self.extra_args.clone(),
            self.queue.clone(),
            self.inner.clone(),
            self.stop_loops.clone(),
        );

        info!(camera_id, ?output_dir, "recording started");
        Ok(())
    }

    /// Idempotent: returns immediately if not recording.
    pub async fn stop_recording(&self, force_immediate: bool) {
        let (was_recording, restart_count, stdin_writable) = {
            let inner = self.inner.lock();
            (inner.recording, inner.restart_count, inner.child.is_some())
        };
        if !was_recording {
            return;
        }
        self.stop_loops.store(true, Ordering::SeqCst);
        self.queue.drain_all(WRITER_EXIT_DRAIN_CAP);

        let force = should_force_immediate(
            force_immediate,
            restart_count,
            self.queue.len(),
            stdin_writable,
        );

        let (mut child, stdin) = {
            let mut inner = self.inner.lock();
            inner.recording = false;
            (inner.child.take(), inner.stdin.take())
        };
        if let Some(child) = child.as_mut() {
            if force {
                let _ = child.start_kill();
            } else {
                // Graceful: ask the encoder to wrap up, then escalate.
                if let Some(stdin) = stdin {
                    let _ = stdin.lock().await.write_all(b"q\n").await;
                }
                let graceful = tokio::time::timeout(Duration::from_secs(3), child.wait()).await;
                if graceful.is_err() {
                    let _ = child.start_kill();
                }
            }
            let _ = child.wait().await;
        }
    }
}

fn spawn_encoder(
    encoder_binary: &Path,
    camera: &CameraConfig,
    extra_args: &[String],
    output_path: &Path,
) -> Result<Child, Error> {
    let log_path = output_path.with_extension("log");
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;
    let argv = build_argv(camera, extra_args, output_path);
    Command::new(encoder_binary)
        .args(&argv)
        .stdin(Stdio::piped())
        .stdout(Stdio::from(log_file.try_clone()?))
        .stderr(Stdio::from(log_file))
        .kill_on_drop(true)
        .spawn()
        .map_err(Error::from)
}

fn spawn_writer_loop(
    queue: Arc<Queue>,
    inner: Arc<Mutex<Inner>>,
    stop: Arc<AtomicBool>,
    stdin: Arc<tokio::sync::Mutex<tokio::process::ChildStdin>>,
) {
    tokio::spawn(async move {
        let mut consecutive_errors = 0u32;
        loop {
            if stop.load(Ordering::SeqCst) {
                break;
            }
            let frame = queue.frames.lock().pop_front();
            let Some(frame) = frame else {
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            };
            match stdin.lock().await.write_all(&frame.0).await {
                Ok(()) => consecutive_errors = 0,
                Err(e) => {
                    consecutive_errors += 1;
                    warn!(%e, consecutive_errors, "writer: error writing frame to encoder");
                    if consecutive_errors >= CONSECUTIVE_WRITE_ERROR_THRESHOLD {
                        inner.lock().recording_failed = true;
                        break;
                    }
                }
            }
        }
        queue.drain_all(WRITER_EXIT_DRAIN_CAP);
    });
}

fn spawn_monitor_loop(
    camera_id: String,
    encoder_binary: PathBuf,
    camera: CameraConfig,
    extra_args: Vec<String>,
    queue: Arc<Queue>,
    inner: Arc<Mutex<Inner>>,
    stop: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(MONITOR_POLL_INTERVAL).await;
            if stop.load(Ordering::SeqCst) {
                break;
            }
            let exit_status = {
                let mut guard = inner.lock();
                match guard.child.as_mut() {
                    Some(child) => match child.try_wait() {
                        Ok(status) => status,
                        Err(e) => {
                            warn!(camera_id, %e, "monitor: error polling encoder");
                            None
                        }
                    },
                    None => break,
                }
            };
            let Some(status) = exit_status else {
                continue;
            };
            if status.success() {
                info!(camera_id, "monitor: encoder exited normally");
                break;
            }
            let restart_count = inner.lock().restart_count;
            if restart_count >= MAX_RESTARTS {
                warn!(camera_id, restart_count, "monitor: giving up after max restarts");
                inner.lock().recording_failed = true;
                break;
            }
            let old_path = inner.lock().output_path.clone();
            let new_path = rotated_path(&old_path, restart_count + 1, jiff::Zoned::now());
            match spawn_encoder(&encoder_binary, &camera, &extra_args, &new_path) {
                Ok(mut new_child) => {
                    let new_stdin = new_child.stdin.take();
                    {
                        let mut guard = inner.lock();
                        guard.child = Some(new_child);
                        guard.restart_count += 1;
                        guard.output_path = new_path.clone();
                        guard.stdin = new_stdin.map(|s| Arc::new(tokio::sync::Mutex::new(s)));
                    }
                    info!(
                        camera_id,
                        restart_count = restart_count + 1,
                        ?new_path,
                        "monitor: encoder restarted"
                    );
                    if let Some(new_stdin) = inner.lock().stdin.clone() {
                        spawn_writer_loop(queue.clone(), inner.clone(), stop.clone(), new_stdin);
                    }
                }
                Err(e) => {
                    warn!(camera_id, %e, "monitor: failed to restart encoder");
                    inner.lock().recording_failed = true;
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera() -> CameraConfig {
        CameraConfig {
            main_url: "rtsp://cam/stream".to_owned(),
            preview_url: None,
            motion_threshold: 25,
            min_contour_area: 500.0,
            motion_timeout_secs: 1.5,
            pre_roll_secs: 2.0,
            post_roll_secs: 5.0,
            trigger_cooldown_secs: 2.0,
            fps: 10,
            frame_width: 640,
            frame_height: 480,
            enabled: true,
        }
    }

    #[test]
    fn build_argv_ends_with_output_path() {
        let cam = camera();
        let argv = build_argv(&cam, &[], Path::new("/tmp/out.mp4"));
        assert_eq!(argv.last().unwrap(), "/tmp/out.mp4");
        assert!(argv.contains(&"640x480".to_owned()));
        assert!(argv.contains(&"10".to_owned()));
    }

    #[test]
    fn rotated_path_appends_part_suffix() {
        let now = jiff::Zoned::now();
        let p = rotated_path(Path::new("/out/cam1_20240101_000000.mp4"), 1, now);
        let name = p.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("cam1_20240101_000000_part1_"));
        assert!(name.ends_with(".mp4"));
    }

    #[test]
    fn queue_rejects_above_critical_threshold() {
        let q = Queue::new(10);
        for i in 0..9 {
            assert!(q.push(Frame(Arc::from(vec![i as u8]))), "frame {i} should be accepted");
        }
        // 9/10 >= 95% critical threshold (9) -> next push dropped.
        assert!(!q.push(Frame(Arc::from(vec![9u8]))));
        assert_eq!(q.dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn queue_at_exactly_high_watermark_still_accepts() {
        let q = Queue::new(20);
        for i in 0..16 {
            q.push(Frame(Arc::from(vec![i as u8])));
        }
        // 16/20 == 80% high watermark exactly: still under it, not at-or-past it.
        assert!(!q.is_high_watermark());
        assert!(!q.is_critical());
    }

    #[test]
    fn high_watermark_detected_before_critical() {
        let q = Queue::new(20);
        for i in 0..17 {
            q.push(Frame(Arc::from(vec![i as u8])));
        }
        assert!(q.is_high_watermark());
        assert!(!q.is_critical());
    }

    #[test]
    fn force_immediate_rules() {
        assert!(should_force_immediate(true, 0, 0, true));
        assert!(should_force_immediate(false, 1, 0, true));
        assert!(should_force_immediate(false, 0, 51, true));
        assert!(!should_force_immediate(false, 0, 10, true));
        assert!(should_force_immediate(false, 0, 10, false));
    }

    #[test]
    fn pre_roll_capacity_derived_from_seconds_times_fps() {
        let r = Recorder::new(camera(), PathBuf::from("ffmpeg"), Vec::new());
        assert_eq!(r.pre_roll_capacity, 20); // 2.0s * 10fps
    }
}
