// This file is part of Vigil NVR, a multi-camera motion-triggered network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Ambient support crate shared by the supervisor and camera worker binaries:
//! the error type, the testable clock abstraction, cooperative shutdown, and
//! tracing setup. Nothing here is camera- or recording-specific.

pub mod clock;
mod error;
pub mod shutdown;
pub mod tracing_setup;

pub use crate::error::{bail, err, Error, ErrorKind, ResultExt};

/// Re-exported so the rest of the workspace doesn't take a direct
/// `parking_lot` dependency just to spell the lock types.
pub use parking_lot::{Condvar, Mutex, MutexGuard};
