// This file is part of Vigil NVR, a multi-camera motion-triggered network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Hidden `--worker-for <camera-id>` entry point.
//!
//! The supervisor re-invokes this same binary once per enabled camera,
//! passing the camera id and the shared configuration path; the worker
//! process reconstructs everything it needs from configuration alone, per
//! the redesign note on cross-process inheritance in the design notes.
//! There's no dedicated `bpaf` grammar for it: it's parsed ahead of the
//! normal subcommand dispatch in `main`, since it's an implementation
//! detail of the supervisor, not a user-facing command.

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use base::clock::RealClocks;
use base::Error;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use crate::stream::{Opener, Stream};
use crate::worker::CameraWorker;

/// Stream acquisition (RTSP/HTTP decode) is outside this crate's scope;
/// production deployments supply a real `Opener` via a separate capture
/// integration. This placeholder keeps the worker process runnable (and its
/// heartbeat/command loops testable end-to-end) without one.
struct UnimplementedOpener;

impl Opener for UnimplementedOpener {
    fn open(&self, _url: &str) -> Result<Box<dyn Stream>, Error> {
        Err(base::err!(
            Unimplemented,
            "camera stream acquisition is not built into this binary"
        ))
    }
}

pub fn run(config_path: &Path, camera_id: &str) -> Result<i32, Error> {
    let config = crate::config::read_config(config_path)?;
    let camera = config
        .cameras
        .get(camera_id)
        .ok_or_else(|| base::err!(NotFound, "no camera configured with id {camera_id}"))?
        .clone();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(Error::from)?;

    let r = rt.block_on(async_run(camera_id.to_owned(), camera, &config));
    rt.shutdown_background();
    r
}

async fn async_run(
    camera_id: String,
    camera: crate::config::CameraConfig,
    config: &crate::config::ConfigFile,
) -> Result<i32, Error> {
    let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
    let mut shutdown_tx = Some(shutdown_tx);

    let worker = Arc::new(CameraWorker::new(
        camera_id.clone(),
        camera,
        config.output_dir.clone(),
        config.encoder_binary.clone(),
        config.encoder_extra_args.clone(),
        Arc::new(UnimplementedOpener),
        RealClocks {},
    ));

    let cmd_reader = BufReader::new(std::io::stdin());
    let heartbeat_writer = std::io::stdout();

    let mut int = signal(SignalKind::interrupt()).map_err(Error::from)?;
    let mut term = signal(SignalKind::terminate()).map_err(Error::from)?;

    let run_fut = worker.run(cmd_reader, heartbeat_writer, shutdown_rx);
    tokio::pin!(run_fut);

    tokio::select! {
        _ = int.recv() => {
            info!(camera_id, "worker: received SIGINT, shutting down");
            shutdown_tx.take();
        }
        _ = term.recv() => {
            info!(camera_id, "worker: received SIGTERM, shutting down");
            shutdown_tx.take();
        }
        _ = &mut run_fut => return Ok(0),
    }

    tokio::select! {
        _ = int.recv() => warn!(camera_id, "worker: second signal, exiting immediately"),
        _ = term.recv() => warn!(camera_id, "worker: second signal, exiting immediately"),
        _ = &mut run_fut => {}
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::ErrorKind;

    #[test]
    fn unimplemented_opener_fails_loudly() {
        let err = UnimplementedOpener.open("rtsp://cam/stream").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unimplemented);
    }
}
