// This file is part of Vigil NVR, a multi-camera motion-triggered network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Serde-serializable status snapshot plus the minimal HTTP server the
//! supervisor process binds to expose it, per §6's health endpoint
//! contract.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::supervisor::Supervisor;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Critical,
}

#[derive(Debug, Serialize)]
pub struct WorkerCounts {
    pub healthy: usize,
    pub total: usize,
    pub percentage: f64,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: OverallStatus,
    pub timestamp: String,
    pub workers: WorkerCounts,
}

pub fn health_response(snapshot: &crate::supervisor::StatusSnapshot, now: jiff::Timestamp) -> HealthResponse {
    let total = snapshot.workers.len();
    let healthy = snapshot
        .workers
        .values()
        .filter(|w| w.state == crate::supervisor::WorkerState::Running)
        .count();
    let status = if total == 0 || healthy == 0 {
        OverallStatus::Critical
    } else if healthy == total {
        OverallStatus::Healthy
    } else {
        OverallStatus::Degraded
    };
    HealthResponse {
        status,
        timestamp: now.to_string(),
        workers: WorkerCounts {
            healthy,
            total,
            percentage: if total == 0 {
                0.0
            } else {
                100.0 * healthy as f64 / total as f64
            },
        },
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let bytes = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(bytes)))
        .expect("static response is well-formed")
}

fn not_found() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Full::new(Bytes::from_static(b"not found")))
        .expect("static response is well-formed")
}

async fn route(
    supervisor: Arc<Supervisor>,
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path();
    let snapshot = supervisor.status_snapshot();
    let resp = match path {
        "/health" => json_response(StatusCode::OK, &health_response(&snapshot, supervisor.clocks_realtime())),
        "/status" => json_response(StatusCode::OK, &snapshot),
        "/workers" => json_response(StatusCode::OK, &snapshot.workers),
        p if p.starts_with("/workers/") => {
            let id = &p["/workers/".len()..];
            match snapshot.workers.get(id) {
                Some(w) => json_response(StatusCode::OK, w),
                None => not_found(),
            }
        }
        _ => not_found(),
    };
    Ok(resp)
}

/// Runs the health HTTP server until `shutdown_rx` fires, then drains
/// in-flight connections cooperatively.
pub async fn serve(
    addr: SocketAddr,
    supervisor: Arc<Supervisor>,
    shutdown_rx: base::shutdown::Receiver,
) -> Result<(), base::Error> {
    let listener = TcpListener::bind(addr).await.map_err(base::Error::from)?;
    info!(%addr, "health server listening");
    let graceful = GracefulShutdown::new();
    let mut shutdown_fut = std::pin::pin!(shutdown_rx.as_future());

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _peer) = match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        warn!(%e, "health server: accept failed");
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let supervisor = supervisor.clone();
                let conn = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service_fn(move |req| route(supervisor.clone(), req)));
                let conn = graceful.watch(conn);
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        warn!(%e, "health server: connection error");
                    }
                });
            }
            _ = &mut shutdown_fut => {
                info!("health server: shutting down");
                break;
            }
        }
    }
    graceful.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::{StatusSnapshot, SupervisorStatus, WorkerSnapshot, WorkerState};
    use std::collections::BTreeMap;

    fn snapshot(states: &[(&str, WorkerState)]) -> StatusSnapshot {
        let mut workers = BTreeMap::new();
        for (id, state) in states {
            workers.insert(
                (*id).to_owned(),
                WorkerSnapshot {
                    state: *state,
                    last_heartbeat: None,
                    restart_count: 0,
                    process_alive: *state == WorkerState::Running,
                    next_restart: None,
                },
            );
        }
        StatusSnapshot {
            supervisor: SupervisorStatus {
                running: true,
                timestamp: jiff::Timestamp::UNIX_EPOCH.to_string(),
                worker_count: workers.len(),
            },
            workers,
        }
    }

    #[test]
    fn all_running_is_healthy() {
        let snap = snapshot(&[("cam1", WorkerState::Running), ("cam2", WorkerState::Running)]);
        let resp = health_response(&snap, jiff::Timestamp::UNIX_EPOCH);
        assert_eq!(resp.status, OverallStatus::Healthy);
        assert_eq!(resp.workers.healthy, 2);
    }

    #[test]
    fn none_running_is_critical() {
        let snap = snapshot(&[("cam1", WorkerState::Crashed)]);
        let resp = health_response(&snap, jiff::Timestamp::UNIX_EPOCH);
        assert_eq!(resp.status, OverallStatus::Critical);
    }

    #[test]
    fn mixed_is_degraded() {
        let snap = snapshot(&[("cam1", WorkerState::Running), ("cam2", WorkerState::Unhealthy)]);
        let resp = health_response(&snap, jiff::Timestamp::UNIX_EPOCH);
        assert_eq!(resp.status, OverallStatus::Degraded);
    }
}
