// This file is part of Vigil NVR, a multi-camera motion-triggered network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! `run` subcommand: the supervisor daemon entry point.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base::clock::RealClocks;
use base::Error;
use bpaf::Bpaf;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use crate::config::ConfigFile;
use crate::supervisor::Supervisor;

#[derive(Bpaf, Debug)]
#[bpaf(command("run"))]
pub struct Args {
    /// Path to the camera/daemon configuration file.
    #[bpaf(short, long, fallback(super::default_config_path()))]
    pub config: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = crate::config::read_config(&args.config)
        .map_err(|e| base::err!(Internal, "loading {}: {}", args.config.display(), e))?;

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(n) = config.worker_threads {
        builder.worker_threads(n);
    }
    let rt = builder.build().map_err(Error::from)?;

    let exe_path = std::env::current_exe().map_err(Error::from)?;
    let r = rt.block_on(async_run(Arc::new(config), exe_path, args.config));

    // Matches the teacher's distinction between a logged, bounded wait on
    // graceful shutdown and not waiting at all on a second, immediate signal.
    rt.shutdown_background();
    r
}

async fn async_run(
    config: Arc<ConfigFile>,
    exe_path: PathBuf,
    config_path: PathBuf,
) -> Result<i32, Error> {
    let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
    let mut shutdown_tx = Some(shutdown_tx);

    let supervisor = Arc::new(Supervisor::new(
        RealClocks {},
        config.clone(),
        exe_path,
        config_path,
    ));
    supervisor.start()?;
    info!(worker_count = config.enabled_camera_ids().len(), "supervisor running");

    let health_bind = config.health_bind;
    let health_task = {
        let supervisor = supervisor.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = crate::health::serve(health_bind, supervisor, shutdown_rx).await {
                tracing::error!(%e, "health server exited with an error");
            }
        })
    };
    let monitor_task = {
        let supervisor = supervisor.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(2)) => supervisor.monitor_tick(),
                    _ = shutdown_rx.as_future() => break,
                }
            }
        })
    };

    let mut int = signal(SignalKind::interrupt()).map_err(Error::from)?;
    let mut term = signal(SignalKind::terminate()).map_err(Error::from)?;

    tokio::select! {
        _ = int.recv() => {
            info!("received SIGINT; shutting down gracefully (send another signal to force)");
            shutdown_tx.take();
        }
        _ = term.recv() => {
            info!("received SIGTERM; shutting down gracefully (send another signal to force)");
            shutdown_tx.take();
        }
    }

    let wait_for_tasks = async {
        let _ = tokio::join!(health_task, monitor_task);
    };
    tokio::select! {
        _ = int.recv() => {
            warn!("second SIGINT received; shutting down immediately");
        }
        _ = term.recv() => {
            warn!("second SIGTERM received; shutting down immediately");
        }
        _ = wait_for_tasks => {}
    }

    supervisor.stop_all();
    Ok(0)
}
