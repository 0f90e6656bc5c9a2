// This file is part of Vigil NVR, a multi-camera motion-triggered network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use base::Error;
use bpaf::{Bpaf, Parser};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

mod cmds;
mod config;
mod health;
mod ipc;
mod motion;
mod recorder;
mod stream;
mod supervisor;
mod worker;

/// Vigil NVR: multi-camera motion-triggered network video recorder.
#[derive(Bpaf, Debug)]
#[bpaf(options, version(env!("CARGO_PKG_VERSION")))]
enum Args {
    // See docstrings of `cmds::*::Args` structs for a description of the respective subcommands.
    Run(#[bpaf(external(cmds::run::args))] cmds::run::Args),
    CheckConfig(#[bpaf(external(cmds::check::args))] cmds::check::Args),
}

impl Args {
    fn run(self) -> Result<i32, Error> {
        match self {
            Args::Run(a) => cmds::run::run(a),
            Args::CheckConfig(a) => cmds::check::run(a),
        }
    }
}

/// `--worker-for <camera-id>` is a hidden entry point the supervisor uses to
/// re-invoke this binary once per camera. It's parsed ahead of (and instead
/// of) the normal `bpaf` grammar: it's not meant to show up in `--help`, and
/// bpaf's derive-based subcommand dispatch has no clean way to express "skip
/// the rest of argument parsing if this flag is present".
fn worker_for_args() -> Option<(PathBuf, String)> {
    parse_worker_for(std::env::args().skip(1))
}

fn parse_worker_for(args: impl Iterator<Item = String>) -> Option<(PathBuf, String)> {
    let mut args = args;
    let mut camera_id = None;
    let mut config_path = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--worker-for" => camera_id = args.next(),
            "--config" | "-c" => config_path = args.next().map(PathBuf::from),
            _ => {}
        }
    }
    camera_id.map(|id| (config_path.unwrap_or_else(cmds::default_config_path), id))
}

fn main() {
    // If using the clock will fail, find out now *before* trying to log
    // anything (with timestamps...) so we can print a helpful error.
    if let Err(e) = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC) {
        eprintln!(
            "clock_gettime failed: {e}\n\n\
             This indicates a broken environment. See the troubleshooting guide."
        );
        std::process::exit(1);
    }

    base::tracing_setup::install();

    if let Some((config_path, camera_id)) = worker_for_args() {
        match cmds::worker_entry::run(&config_path, &camera_id) {
            Err(e) => {
                error!(err = %e.chain(), camera_id, "worker exiting due to error");
                std::process::exit(1);
            }
            Ok(rv) => std::process::exit(rv),
        }
    }

    // Get the program name from the OS (e.g. if invoked as `target/debug/vigil-nvr`:
    // `vigil-nvr`), falling back to the crate name if conversion to a path/UTF-8
    // string fails. `bpaf`'s default logic is similar but doesn't have the fallback.
    let progname = std::env::args_os().next().map(PathBuf::from);
    let progname = progname
        .as_deref()
        .and_then(Path::file_name)
        .and_then(OsStr::to_str)
        .unwrap_or(env!("CARGO_PKG_NAME"));

    let args = match args()
        .fallback_to_usage()
        .run_inner(bpaf::Args::current_args().set_name(progname))
    {
        Ok(a) => a,
        Err(e) => std::process::exit(e.exit_code()),
    };
    tracing::trace!("parsed command-line arguments: {args:#?}");

    match args.run() {
        Err(e) => {
            error!(err = %e.chain(), "exiting due to error");
            std::process::exit(1);
        }
        Ok(rv) => {
            debug!("exiting with status {}", rv);
            std::process::exit(rv)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bpaf_invariants() {
        super::args().check_invariants(false);
    }

    #[test]
    fn worker_for_args_parses_camera_id_and_config() {
        let argv = ["--worker-for", "cam1", "--config", "/tmp/x.toml"]
            .into_iter()
            .map(String::from);
        assert_eq!(
            parse_worker_for(argv),
            Some((PathBuf::from("/tmp/x.toml"), "cam1".to_owned()))
        );
        let argv = ["run", "--config", "/tmp/x.toml"].into_iter().map(String::from);
        assert_eq!(parse_worker_for(argv), None);
    }
}
