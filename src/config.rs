// This file is part of Vigil NVR, a multi-camera motion-triggered network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Typed, validated daemon and camera configuration (`/etc/vigil-nvr.toml`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base::{bail, err, Error, ErrorKind};
use serde::Deserialize;

fn default_output_dir() -> PathBuf {
    "/var/lib/vigil-nvr/output".into()
}

fn default_health_bind() -> std::net::SocketAddr {
    ([0, 0, 0, 0], 8080).into()
}

fn default_heartbeat_timeout_secs() -> f64 {
    15.0
}

fn default_max_restart_delay_secs() -> f64 {
    60.0
}

fn default_encoder_binary() -> PathBuf {
    "ffmpeg".into()
}

fn default_pre_roll_secs() -> f64 {
    5.0
}

fn default_post_roll_secs() -> f64 {
    5.0
}

fn default_trigger_cooldown_secs() -> f64 {
    2.0
}

fn default_fps() -> u32 {
    15
}

fn default_frame_width() -> u32 {
    1920
}

fn default_frame_height() -> u32 {
    1080
}

fn default_true() -> bool {
    true
}

/// Top-level configuration file object.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    /// Camera id -> configuration, as found in the config file's `cameras` table.
    pub cameras: BTreeMap<String, CameraConfig>,

    /// Root directory under which `<camera_id>_<timestamp>.<ext>` recordings are written.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Address the supervisor's health HTTP server binds to.
    #[serde(default = "default_health_bind")]
    pub health_bind: std::net::SocketAddr,

    /// Seconds without a heartbeat before a worker is considered unhealthy.
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: f64,

    /// Cap on the exponential worker-restart backoff, in seconds.
    #[serde(default = "default_max_restart_delay_secs")]
    pub max_restart_delay_secs: f64,

    /// Path to the external encoder binary (e.g. `ffmpeg`).
    #[serde(default = "default_encoder_binary")]
    pub encoder_binary: PathBuf,

    /// Extra arguments appended to every encoder invocation, before the output path.
    #[serde(default)]
    pub encoder_extra_args: Vec<String>,

    /// The number of tokio worker threads used by the supervisor's runtime.
    ///
    /// Defaults to the number of cores on the system.
    #[serde(default)]
    pub worker_threads: Option<usize>,
}

/// Per-camera configuration, validated once at startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraConfig {
    /// High-quality stream URL, recorded when motion is confirmed.
    pub main_url: String,

    /// Lower-resolution stream used for motion detection; falls back to `main_url`.
    #[serde(default)]
    pub preview_url: Option<String>,

    /// Frame-difference threshold (0-255) above which a pixel counts as changed.
    pub motion_threshold: u8,

    /// Minimum contour area, in pixels, for a change region to count as motion.
    pub min_contour_area: f64,

    /// How long motion must persist before a recording is confirmed.
    pub motion_timeout_secs: f64,

    /// Pre-roll buffer length, in seconds, replayed at the start of a recording.
    #[serde(default = "default_pre_roll_secs")]
    pub pre_roll_secs: f64,

    /// Grace period after motion ceases during which recording continues.
    #[serde(default = "default_post_roll_secs")]
    pub post_roll_secs: f64,

    /// Minimum interval between two consecutive recording triggers.
    #[serde(default = "default_trigger_cooldown_secs")]
    pub trigger_cooldown_secs: f64,

    /// Target capture frame rate.
    #[serde(default = "default_fps")]
    pub fps: u32,

    /// Expected frame width/height, used for frame validation.
    #[serde(default = "default_frame_width")]
    pub frame_width: u32,
    #[serde(default = "default_frame_height")]
    pub frame_height: u32,

    /// Cameras with `enabled = false` are skipped at startup.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl CameraConfig {
    /// Validates this camera's fields against the ranges fixed by the data model,
    /// returning a descriptive `Error` on the first violation found.
    pub fn validate(&self, camera_id: &str) -> Result<(), Error> {
        let is_valid_url = |u: &str| {
            u.starts_with("rtsp://") || u.starts_with("http://") || u.starts_with("https://")
        };
        if !is_valid_url(&self.main_url) {
            bail!(
                InvalidArgument,
                "camera {camera_id}: mainUrl must start with rtsp://, http://, or https://"
            );
        }
        if let Some(preview) = &self.preview_url {
            if !is_valid_url(preview) {
                bail!(
                    InvalidArgument,
                    "camera {camera_id}: previewUrl must start with rtsp://, http://, or https://"
                );
            }
        }
        if self.min_contour_area <= 0.0 {
            bail!(
                InvalidArgument,
                "camera {camera_id}: minContourArea must be > 0, got {}",
                self.min_contour_area
            );
        }
        if self.motion_timeout_secs <= 0.0 {
            bail!(
                InvalidArgument,
                "camera {camera_id}: motionTimeoutSecs must be > 0, got {}",
                self.motion_timeout_secs
            );
        }
        if self.pre_roll_secs < 0.0 {
            bail!(
                InvalidArgument,
                "camera {camera_id}: preRollSecs must be >= 0, got {}",
                self.pre_roll_secs
            );
        }
        if self.post_roll_secs < 0.0 {
            bail!(
                InvalidArgument,
                "camera {camera_id}: postRollSecs must be >= 0, got {}",
                self.post_roll_secs
            );
        }
        if self.fps < 1 || self.fps > 60 {
            bail!(
                InvalidArgument,
                "camera {camera_id}: fps must be in 1..=60, got {}",
                self.fps
            );
        }
        if self.frame_width == 0 || self.frame_height == 0 {
            bail!(
                InvalidArgument,
                "camera {camera_id}: frameWidth/frameHeight must be > 0"
            );
        }
        Ok(())
    }

    pub fn preview_url(&self) -> &str {
        self.preview_url.as_deref().unwrap_or(&self.main_url)
    }
}

impl ConfigFile {
    pub fn validate(&self) -> Result<(), Error> {
        if self.cameras.is_empty() {
            return Err(err!(InvalidArgument, "configuration has no cameras"));
        }
        for (id, cam) in &self.cameras {
            cam.validate(id)?;
        }
        Ok(())
    }

    /// Returns the ids of cameras with `enabled = true`, sorted.
    pub fn enabled_camera_ids(&self) -> Vec<String> {
        self.cameras
            .iter()
            .filter(|(_, c)| c.enabled)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

pub fn read_config(path: &std::path::Path) -> Result<ConfigFile, Error> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        Error::wrap(ErrorKind::NotFound, e)
    })?;
    let config: ConfigFile = toml::from_str(&text)
        .map_err(|e| err!(InvalidArgument, "parsing {}: {}", path.display(), e))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(main_url: &str) -> CameraConfig {
        CameraConfig {
            main_url: main_url.to_owned(),
            preview_url: None,
            motion_threshold: 25,
            min_contour_area: 500.0,
            motion_timeout_secs: 1.5,
            pre_roll_secs: 5.0,
            post_roll_secs: 5.0,
            trigger_cooldown_secs: 2.0,
            fps: 15,
            frame_width: 1920,
            frame_height: 1080,
            enabled: true,
        }
    }

    #[test]
    fn rejects_bad_url_scheme() {
        let cam = sample("ftp://camera.local/stream");
        assert_eq!(
            cam.validate("cam1").unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn rejects_threshold_out_of_nothing_but_contour_area() {
        let mut cam = sample("rtsp://camera.local/stream");
        cam.min_contour_area = 0.0;
        assert!(cam.validate("cam1").is_err());
    }

    #[test]
    fn accepts_valid_camera() {
        let cam = sample("rtsp://camera.local/stream");
        assert!(cam.validate("cam1").is_ok());
        assert_eq!(cam.preview_url(), "rtsp://camera.local/stream");
    }

    #[test]
    fn read_config_parses_a_real_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        write!(
            file,
            r#"
            [cameras.front_door]
            mainUrl = "rtsp://camera.local/front"
            motionThreshold = 30
            minContourArea = 400.0
            motionTimeoutSecs = 2.0
            "#
        )
        .unwrap();
        let config = read_config(file.path()).unwrap();
        assert_eq!(config.cameras.len(), 1);
        assert!(config.cameras.contains_key("front_door"));
        assert_eq!(config.enabled_camera_ids(), vec!["front_door".to_owned()]);
    }

    #[test]
    fn read_config_rejects_a_missing_file() {
        let err = read_config(Path::new("/nonexistent/vigil-nvr.toml")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn config_file_rejects_empty_camera_map() {
        let config = ConfigFile {
            cameras: BTreeMap::new(),
            output_dir: default_output_dir(),
            health_bind: default_health_bind(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            max_restart_delay_secs: default_max_restart_delay_secs(),
            encoder_binary: default_encoder_binary(),
            encoder_extra_args: Vec::new(),
            worker_threads: None,
        };
        assert!(config.validate().is_err());
    }
}
