// This file is part of Vigil NVR, a multi-camera motion-triggered network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Supervisor: owns the lifecycle of one isolated worker process per
//! enabled camera, detects and recovers from worker faults, and exposes
//! aggregated status for the health server.

use std::collections::BTreeMap;
use std::io::{BufReader, Write};
use std::process::{Child, Stdio};
use std::sync::Arc;

use base::clock::{Clocks, Instant};
use base::{err, Error, Mutex};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::ConfigFile;
use crate::ipc::{Command, CommandName, Heartbeat};

const MONITOR_INTERVAL: std::time::Duration = std::time::Duration::from_secs(2);
const WORKER_STOP_JOIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
const WORKER_STOP_KILL_GRACE: std::time::Duration = std::time::Duration::from_secs(2);

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Starting,
    Running,
    Unhealthy,
    Crashed,
    Stopping,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub state: WorkerState,
    pub last_heartbeat: Option<String>,
    pub restart_count: u32,
    pub process_alive: bool,
    pub next_restart: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SupervisorStatus {
    pub running: bool,
    pub timestamp: String,
    pub worker_count: usize,
}

#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    pub supervisor: SupervisorStatus,
    pub workers: BTreeMap<String, WorkerSnapshot>,
}

/// Computes the exponential restart delay, capped at `max_delay`.
pub fn restart_backoff(restart_count: u32, max_delay: std::time::Duration) -> std::time::Duration {
    let secs = 2u64.saturating_pow(restart_count.min(32));
    std::time::Duration::from_secs(secs).min(max_delay)
}

struct WorkerRecord {
    camera_id: String,
    process: Option<Child>,
    cmd_writer: Option<std::process::ChildStdin>,
    status_reader: Option<BufReader<std::process::ChildStdout>>,
    state: WorkerState,
    last_heartbeat: Option<(jiff::Timestamp, Instant)>,
    restart_count: u32,
    next_restart: Option<Instant>,
}

/// Supervises every enabled camera's worker process.
pub struct Supervisor<C: Clocks = base::clock::RealClocks> {
    clocks: C,
    config: Arc<ConfigFile>,
    exe_path: std::path::PathBuf,
    config_path: std::path::PathBuf,
    workers: Mutex<BTreeMap<String, WorkerRecord>>,
    running: std::sync::atomic::AtomicBool,
}

impl<C: Clocks> Supervisor<C> {
    pub fn new(
        clocks: C,
        config: Arc<ConfigFile>,
        exe_path: std::path::PathBuf,
        config_path: std::path::PathBuf,
    ) -> Self {
        Supervisor {
            clocks,
            config,
            exe_path,
            config_path,
            workers: Mutex::new(BTreeMap::new()),
            running: std::sync::atomic::AtomicBool::new(true),
        }
    }

    pub fn clocks_realtime(&self) -> jiff::Timestamp {
        self.clocks.realtime()
    }

    /// Spawns one worker process per enabled camera.
    pub fn start(&self) -> Result<(), Error> {
        let mut workers = self.workers.lock();
        for camera_id in self.config.enabled_camera_ids() {
            let record = self.spawn_worker(&camera_id)?;
            workers.insert(camera_id, record);
        }
        info!(worker_count = workers.len(), "supervisor started");
        Ok(())
    }

    fn spawn_worker(&self, camera_id: &str) -> Result<WorkerRecord, Error> {
        info!(camera_id, "spawning worker process");
        let mut child = std::process::Command::new(&self.exe_path)
            .arg("--worker-for")
            .arg(camera_id)
            .arg("--config")
            .arg(&self.config_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| err!(Internal, "spawning worker for {camera_id}: {e}"))?;
        let cmd_writer = child.stdin.take();
        let status_reader = child.stdout.take().map(BufReader::new);
        Ok(WorkerRecord {
            camera_id: camera_id.to_owned(),
            process: Some(child),
            cmd_writer,
            status_reader,
            state: WorkerState::Starting,
            last_heartbeat: None,
            restart_count: 0,
            next_restart: None,
        })
    }

    /// Drains pending heartbeats, checks process/heartbeat health, and
    /// restarts workers whose scheduled restart time has passed. Intended to
    /// run every [`MONITOR_INTERVAL`].
    pub fn monitor_tick(&self) {
        let now_wall = self.clocks.realtime();
        let now_mono = self.clocks.monotonic();
        let heartbeat_timeout =
            std::time::Duration::from_secs_f64(self.config.heartbeat_timeout_secs);
        let max_restart_delay =
            std::time::Duration::from_secs_f64(self.config.max_restart_delay_secs);

        let mut workers = self.workers.lock();
        for record in workers.values_mut() {
            while let Some(hb) = Self::try_read_heartbeat(record) {
                record.last_heartbeat = Some((now_wall, now_mono));
                if hb.is_critical_error() {
                    if record.state == WorkerState::Running {
                        error!(camera_id = %record.camera_id, error = ?hb.error_message, "worker critical error");
                        record.state = WorkerState::Unhealthy;
                    }
                } else if record.state == WorkerState::Unhealthy && hb.fps > 0.0 {
                    info!(camera_id = %record.camera_id, "worker recovered");
                    record.state = WorkerState::Running;
                    record.restart_count = 0;
                } else if record.state == WorkerState::Starting {
                    record.state = WorkerState::Running;
                }
            }

            if let Some(process) = record.process.as_mut() {
                if let Ok(Some(status)) = process.try_wait() {
                    warn!(camera_id = %record.camera_id, ?status, "worker process exited");
                    record.process = None;
                    record.state = WorkerState::Crashed;
                    Self::schedule_restart(record, now_mono, max_restart_delay);
                    continue;
                }
            }

            if let Some((_, last_mono)) = record.last_heartbeat {
                let elapsed = now_mono.duration_since(last_mono);
                if record.state == WorkerState::Running && elapsed >= heartbeat_timeout {
                    warn!(camera_id = %record.camera_id, "worker missed heartbeat");
                    record.state = WorkerState::Unhealthy;
                } else if record.state == WorkerState::Unhealthy
                    && elapsed >= heartbeat_timeout.saturating_mul(3)
                {
                    error!(camera_id = %record.camera_id, "worker persistently unhealthy, restarting");
                    Self::kill_worker(record);
                    record.state = WorkerState::Crashed;
                    Self::schedule_restart(record, now_mono, max_restart_delay);
                } else if record.state == WorkerState::Running
                    && elapsed >= heartbeat_timeout.saturating_mul(2)
                {
                    error!(camera_id = %record.camera_id, "worker unresponsive, restarting");
                    Self::kill_worker(record);
                    record.state = WorkerState::Crashed;
                    Self::schedule_restart(record, now_mono, max_restart_delay);
                }
            }

            if record.state == WorkerState::Crashed {
                if let Some(scheduled) = record.next_restart {
                    if now_mono >= scheduled {
                        info!(camera_id = %record.camera_id, restart_count = record.restart_count, "restarting worker");
                        match self.spawn_worker(&record.camera_id) {
                            Ok(fresh) => *record = fresh,
                            Err(e) => error!(camera_id = %record.camera_id, %e, "failed to restart worker"),
                        }
                    }
                }
            }
        }
    }

    fn try_read_heartbeat(record: &mut WorkerRecord) -> Option<Heartbeat> {
        let reader = record.status_reader.as_mut()?;
        crate::ipc::read_line(reader).ok().flatten()
    }

    fn schedule_restart(
        record: &mut WorkerRecord,
        now_mono: Instant,
        max_restart_delay: std::time::Duration,
    ) {
        let delay = restart_backoff(record.restart_count, max_restart_delay);
        record.next_restart = Some(now_mono + delay);
        record.restart_count += 1;
        warn!(
            camera_id = %record.camera_id,
            ?delay,
            restart_count = record.restart_count,
            "scheduled worker restart"
        );
    }

    fn kill_worker(record: &mut WorkerRecord) {
        if let Some(process) = record.process.as_mut() {
            let _ = process.kill();
            let _ = process.wait();
        }
        record.process = None;
    }

    /// Sends `stop`, waits briefly, then escalates to terminate/kill.
    pub fn stop_worker(record: &mut WorkerRecord) {
        record.state = WorkerState::Stopping;
        if let Some(writer) = record.cmd_writer.as_mut() {
            let cmd = Command::new(CommandName::Stop);
            if let Ok(mut line) = serde_json::to_vec(&cmd) {
                line.push(b'\n');
                let _ = writer.write_all(&line);
            }
        }
        let Some(process) = record.process.as_mut() else {
            return;
        };
        let deadline = std::time::Instant::now() + WORKER_STOP_JOIN_TIMEOUT;
        loop {
            match process.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) if std::time::Instant::now() < deadline => {
                    std::thread::sleep(std::time::Duration::from_millis(50));
                }
                _ => break,
            }
        }
        warn!(camera_id = %record.camera_id, "force terminating unresponsive worker");
        let _ = process.kill();
        let _ = process.wait();
        let _ = WORKER_STOP_KILL_GRACE;
    }

    /// Stops every worker, e.g. on graceful shutdown.
    pub fn stop_all(&self) {
        self.running.store(false, std::sync::atomic::Ordering::SeqCst);
        let mut workers = self.workers.lock();
        for record in workers.values_mut() {
            Self::stop_worker(record);
        }
    }

    pub fn status_snapshot(&self) -> StatusSnapshot {
        let workers = self.workers.lock();
        let now_wall = self.clocks.realtime();
        let now_mono = self.clocks.monotonic();
        let snapshot = workers
            .iter()
            .map(|(id, record)| {
                let last_heartbeat = record.last_heartbeat.map(|(wall, mono)| {
                    let age = now_mono.duration_since(mono);
                    (wall.checked_sub(age).unwrap_or(wall)).to_string()
                });
                let next_restart = record.next_restart.map(|scheduled| {
                    let delay = scheduled.duration_since(now_mono);
                    now_wall.checked_add(delay).unwrap_or(now_wall).to_string()
                });
                (
                    id.clone(),
                    WorkerSnapshot {
                        state: record.state,
                        last_heartbeat,
                        restart_count: record.restart_count,
                        process_alive: record.process.is_some(),
                        next_restart,
                    },
                )
            })
            .collect();
        StatusSnapshot {
            supervisor: SupervisorStatus {
                running: self.running.load(std::sync::atomic::Ordering::SeqCst),
                timestamp: now_wall.to_string(),
                worker_count: workers.len(),
            },
            workers: snapshot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::SimulatedClocks;
    use crate::config::CameraConfig;
    use std::path::PathBuf;

    #[test]
    fn restart_backoff_doubles_and_caps() {
        let cap = std::time::Duration::from_secs(60);
        assert_eq!(restart_backoff(0, cap), std::time::Duration::from_secs(1));
        assert_eq!(restart_backoff(1, cap), std::time::Duration::from_secs(2));
        assert_eq!(restart_backoff(6, cap), std::time::Duration::from_secs(60));
        assert_eq!(restart_backoff(20, cap), std::time::Duration::from_secs(60));
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

    fn test_supervisor(clocks: SimulatedClocks) -> Supervisor<SimulatedClocks> {
        let mut cameras = BTreeMap::new();
        cameras.insert("cam1".to_owned(), camera());
        let config = Arc::new(ConfigFile {
            cameras,
            output_dir: PathBuf::from("/tmp"),
            health_bind: ([0, 0, 0, 0], 0).into(),
            heartbeat_timeout_secs: 15.0,
            max_restart_delay_secs: 60.0,
            encoder_binary: "ffmpeg".into(),
            encoder_extra_args: Vec::new(),
            worker_threads: None,
        });
        Supervisor::new(
            clocks,
            config,
            PathBuf::from("/bin/true"),
            PathBuf::from("/dev/null"),
        )
    }

    /// Regression test: a `Crashed` worker's `last_heartbeat` is frozen (no
    /// process is left alive to send more), so `elapsed` only grows with
    /// every tick. The heartbeat-staleness branches must not re-fire for a
    /// worker that's already `Crashed`, or `schedule_restart` keeps pushing
    /// `next_restart` into the future and the worker is never respawned.
    #[test]
    fn crashed_worker_is_not_perpetually_rescheduled_and_eventually_restarts() {
        let clocks = SimulatedClocks::new(jiff::Timestamp::UNIX_EPOCH);
        let sup = test_supervisor(clocks.clone());
        {
            let mut workers = sup.workers.lock();
            workers.insert(
                "cam1".to_owned(),
                WorkerRecord {
                    camera_id: "cam1".to_owned(),
                    process: None,
                    cmd_writer: None,
                    status_reader: None,
                    state: WorkerState::Crashed,
                    last_heartbeat: Some((clocks.realtime(), clocks.monotonic())),
                    restart_count: 1,
                    next_restart: Some(clocks.monotonic() + std::time::Duration::from_secs(100)),
                },
            );
        }

        // Past heartbeat_timeout*2 (30s) but well before the scheduled restart (100s).
        clocks.sleep(std::time::Duration::from_secs(40));
        sup.monitor_tick();
        {
            let workers = sup.workers.lock();
            let record = workers.get("cam1").unwrap();
            assert_eq!(record.state, WorkerState::Crashed);
            assert_eq!(record.restart_count, 1, "must not reschedule a worker that's already crashed");
        }

        // Now past the scheduled restart time: the worker must actually respawn.
        clocks.sleep(std::time::Duration::from_secs(61));
        sup.monitor_tick();
        {
            let workers = sup.workers.lock();
            let record = workers.get("cam1").unwrap();
            assert_ne!(record.state, WorkerState::Crashed);
        }
    }
}
