// This file is part of Vigil NVR, a multi-camera motion-triggered network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Preview/main stream acquisition abstraction.
//!
//! The actual RTSP/HTTP decode and motion-detection image primitives are
//! out of scope for this crate (per the external-collaborators boundary);
//! what's in scope is frame *validation* and the retry/reconnect policy
//! around an injectable [`Opener`], mirroring the teacher's own
//! test-injection split between a `RealOpener` and fakes.

use std::sync::Arc;
use std::time::Duration;

use base::Error;

/// One captured preview frame, with the motion-detection primitives
/// (frame differencing, contour extraction) already reduced to a boolean
/// plus the per-frame statistics this crate's validation rules need.
#[derive(Clone)]
pub struct CapturedFrame {
    pub width: u32,
    pub height: u32,
    /// Mean pixel intensity, 0.0..=255.0.
    pub mean: f64,
    /// Pixel intensity standard deviation.
    pub stddev: f64,
    /// Result of frame-differencing against the previous frame, already
    /// thresholded against the camera's configured motion threshold and
    /// minimum contour area.
    pub motion_detected: bool,
    /// Encoded bytes ready to hand to the recorder's encoder subprocess.
    pub data: Arc<[u8]>,
}

/// Opens a camera's stream. A trait so tests can inject a fake without a
/// real network connection or decoder.
pub trait Opener: Send + Sync {
    fn open(&self, url: &str) -> Result<Box<dyn Stream>, Error>;
}

/// A live, already-open stream of captured frames.
pub trait Stream: Send {
    /// Blocks for up to `timeout` waiting for the next frame.
    ///
    /// Returns `Ok(None)` on a clean timeout (no frame available yet) and
    /// `Err` on a connection-level failure.
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<CapturedFrame>, Error>;
}

/// Why a captured frame was rejected; see §4.3's frame validation rules.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FrameDefect {
    TooSmall,
    TooLarge,
    UniformlyBlack,
    UniformlySaturated,
    Frozen,
}

const MIN_DIMENSION: u32 = 100;
const MAX_DIMENSION: u32 = 4096;
const BLACK_MEAN_CEILING: f64 = 5.0;
const BLACK_STDDEV_CEILING: f64 = 5.0;
const SATURATED_MEAN_FLOOR: f64 = 250.0;
const SATURATED_STDDEV_CEILING: f64 = 5.0;
const FROZEN_STDDEV_CEILING: f64 = 0.1;

/// Validates one captured frame's dimensions and pixel statistics.
pub fn validate_frame(frame: &CapturedFrame) -> Result<(), FrameDefect> {
    if frame.width < MIN_DIMENSION || frame.height < MIN_DIMENSION {
        return Err(FrameDefect::TooSmall);
    }
    if frame.width > MAX_DIMENSION || frame.height > MAX_DIMENSION {
        return Err(FrameDefect::TooLarge);
    }
    if frame.mean < BLACK_MEAN_CEILING && frame.stddev < BLACK_STDDEV_CEILING {
        return Err(FrameDefect::UniformlyBlack);
    }
    if frame.mean > SATURATED_MEAN_FLOOR && frame.stddev < SATURATED_STDDEV_CEILING {
        return Err(FrameDefect::UniformlySaturated);
    }
    if frame.stddev < FROZEN_STDDEV_CEILING {
        return Err(FrameDefect::Frozen);
    }
    Ok(())
}

/// Consecutive invalid frames before the capture loop forces a reconnect.
pub const MAX_CONSECUTIVE_INVALID_FRAMES: u32 = 10;

/// Time with no *valid* frame before the capture loop forces a reconnect.
pub const NO_VALID_FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive URL-unreachable failures before a worker marks itself
/// fatally erroring (the supervisor will then restart the process).
pub const MAX_CONSECUTIVE_URL_FAILURES: u32 = 5;

/// Computes the next reconnect backoff, doubling from 5 s up to a 60 s cap.
pub fn reconnect_backoff(consecutive_failures: u32) -> Duration {
    let secs = 5u64.saturating_mul(1u64 << consecutive_failures.min(4));
    Duration::from_secs(secs.min(60))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_frame() -> CapturedFrame {
        CapturedFrame {
            width: 640,
            height: 480,
            mean: 120.0,
            stddev: 40.0,
            motion_detected: false,
            data: Arc::from(Vec::new()),
        }
    }

    #[test]
    fn accepts_a_normal_frame() {
        assert!(validate_frame(&base_frame()).is_ok());
    }

    #[test]
    fn rejects_too_small() {
        let mut f = base_frame();
        f.width = 50;
        assert_eq!(validate_frame(&f), Err(FrameDefect::TooSmall));
    }

    #[test]
    fn rejects_too_large() {
        let mut f = base_frame();
        f.height = 5000;
        assert_eq!(validate_frame(&f), Err(FrameDefect::TooLarge));
    }

    #[test]
    fn rejects_uniformly_black() {
        let mut f = base_frame();
        f.mean = 2.0;
        f.stddev = 1.0;
        assert_eq!(validate_frame(&f), Err(FrameDefect::UniformlyBlack));
    }

    #[test]
    fn rejects_uniformly_saturated() {
        let mut f = base_frame();
        f.mean = 253.0;
        f.stddev = 2.0;
        assert_eq!(validate_frame(&f), Err(FrameDefect::UniformlySaturated));
    }

    #[test]
    fn rejects_frozen() {
        let mut f = base_frame();
        f.stddev = 0.01;
        assert_eq!(validate_frame(&f), Err(FrameDefect::Frozen));
    }

    #[test]
    fn reconnect_backoff_doubles_and_caps_at_60s() {
        assert_eq!(reconnect_backoff(0), Duration::from_secs(5));
        assert_eq!(reconnect_backoff(1), Duration::from_secs(10));
        assert_eq!(reconnect_backoff(2), Duration::from_secs(20));
        assert_eq!(reconnect_backoff(3), Duration::from_secs(40));
        assert_eq!(reconnect_backoff(4), Duration::from_secs(60));
        assert_eq!(reconnect_backoff(10), Duration::from_secs(60));
    }
}
