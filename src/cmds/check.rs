// This file is part of Vigil NVR, a multi-camera motion-triggered network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! `check-config` subcommand: validate the configuration file without
//! starting anything, per scenario 6 in the testable-properties section.

use std::path::PathBuf;

use base::Error;
use bpaf::Bpaf;

#[derive(Bpaf, Debug)]
#[bpaf(command("check-config"))]
pub struct Args {
    /// Path to the camera/daemon configuration file.
    #[bpaf(short, long, fallback(super::default_config_path()))]
    pub config: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    match crate::config::read_config(&args.config) {
        Ok(config) => {
            println!(
                "configuration OK: {} camera(s) ({} enabled)",
                config.cameras.len(),
                config.enabled_camera_ids().len()
            );
            Ok(0)
        }
        Err(e) => {
            eprintln!("configuration invalid: {}", e.chain());
            Ok(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn run_returns_1_on_invalid_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not valid toml {{{{").unwrap();
        let args = Args {
            config: file.path().to_owned(),
        };
        assert_eq!(run(args).unwrap(), 1);
    }

    #[test]
    fn run_returns_0_on_valid_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [cameras.cam1]
            mainUrl = "rtsp://camera.local/stream"
            motionThreshold = 25
            minContourArea = 500.0
            motionTimeoutSecs = 1.5
            "#
        )
        .unwrap();
        let args = Args {
            config: file.path().to_owned(),
        };
        assert_eq!(run(args).unwrap(), 0);
    }
}
