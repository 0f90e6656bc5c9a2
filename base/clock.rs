// This file is part of Vigil NVR, a multi-camera motion-triggered network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Clock interface and implementations for testability.
//!
//! Every timing-sensitive piece of the supervisor and camera worker — the
//! motion timer, the recorder's restart backoff, the supervisor's heartbeat
//! timeout — takes a `&dyn Clocks` (or is generic over `C: Clocks`) instead
//! of calling `std::time`/`libc` directly, so tests can run a simulated clock
//! instead of waiting on a real one.

use std::fmt;
use std::ops::{Add, Sub};
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::error::Error;
use crate::shutdown::ShutdownError;
use crate::Mutex;

/// A point in monotonic time, relative to an unspecified epoch.
///
/// `std::time::Instant` can't be constructed with an arbitrary value on
/// stable Rust, which makes it unusable for [`SimulatedClocks`]. This is a
/// minimal stand-in: just a `Duration` since some fixed but unspecified
/// starting point.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Instant(Duration);

impl Instant {
    pub const ZERO: Instant = Instant(Duration::ZERO);

    pub fn checked_duration_since(self, earlier: Instant) -> Option<Duration> {
        self.0.checked_sub(earlier.0)
    }

    pub fn duration_since(self, earlier: Instant) -> Duration {
        self.checked_duration_since(earlier).unwrap_or_default()
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;
    fn add(self, rhs: Duration) -> Instant {
        Instant(self.0 + rhs)
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;
    fn sub(self, rhs: Duration) -> Instant {
        Instant(self.0.saturating_sub(rhs))
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;
    fn sub(self, rhs: Instant) -> Duration {
        self.duration_since(rhs)
    }
}

/// Abstract interface to the system clocks. This is for testability.
pub trait Clocks: Send + Sync + 'static {
    /// Gets the current wall-clock time.
    fn realtime(&self) -> jiff::Timestamp;

    /// Gets the current time from a monotonic clock.
    ///
    /// On Linux, `RealClocks` backs this with `CLOCK_BOOTTIME`, which
    /// includes suspended time.
    fn monotonic(&self) -> Instant;

    /// Blocks the current thread for the specified duration.
    fn sleep(&self, how_long: Duration);
}

/// Retries `f` once a second (per the simulated or real clock) until it
/// succeeds or shutdown is requested.
pub fn retry<C, T, E>(
    clocks: &C,
    shutdown_rx: &crate::shutdown::Receiver,
    f: &mut dyn FnMut() -> Result<T, E>,
) -> Result<T, ShutdownError>
where
    C: Clocks,
    E: Into<Error>,
{
    loop {
        let e = match f() {
            Ok(t) => return Ok(t),
            Err(e) => e.into(),
        };
        shutdown_rx.check()?;
        warn!(exception = %e.chain(), "sleeping for 1 s after error");
        clocks.sleep(Duration::from_secs(1));
    }
}

#[derive(Copy, Clone, Default)]
pub struct RealClocks {}

impl RealClocks {
    fn get(&self, clock: libc::clockid_t) -> Duration {
        unsafe {
            let mut ts = std::mem::MaybeUninit::uninit();
            assert_eq!(0, libc::clock_gettime(clock, ts.as_mut_ptr()));
            let ts = ts.assume_init();
            Duration::new(
                #[allow(clippy::useless_conversion)]
                ts.tv_sec as u64,
                ts.tv_nsec as u32,
            )
        }
    }
}

impl Clocks for RealClocks {
    fn realtime(&self) -> jiff::Timestamp {
        let d = self.get(libc::CLOCK_REALTIME);
        jiff::Timestamp::new(d.as_secs() as i64, d.subsec_nanos() as i32)
            .unwrap_or(jiff::Timestamp::UNIX_EPOCH)
    }

    #[cfg(target_os = "linux")]
    fn monotonic(&self) -> Instant {
        Instant(self.get(libc::CLOCK_BOOTTIME))
    }

    #[cfg(not(target_os = "linux"))]
    fn monotonic(&self) -> Instant {
        Instant(self.get(libc::CLOCK_MONOTONIC))
    }

    fn sleep(&self, how_long: Duration) {
        std::thread::sleep(how_long)
    }
}

/// Logs a warning if the `TimerGuard` lives "too long", using the label
/// created by a supplied function.
pub struct TimerGuard<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> {
    clocks: &'a C,
    label_f: Option<F>,
    start: Instant,
}

impl<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> TimerGuard<'a, C, S, F> {
    pub fn new(clocks: &'a C, label_f: F) -> Self {
        TimerGuard {
            clocks,
            label_f: Some(label_f),
            start: clocks.monotonic(),
        }
    }
}

impl<'a, C, S, F> Drop for TimerGuard<'a, C, S, F>
where
    C: Clocks + ?Sized,
    S: AsRef<str>,
    F: FnOnce() -> S + 'a,
{
    fn drop(&mut self) {
        let elapsed = self.clocks.monotonic().duration_since(self.start);
        if elapsed >= Duration::from_secs(1) {
            let label_f = self.label_f.take().unwrap();
            warn!("{} took {:?}!", label_f().as_ref(), elapsed);
        }
    }
}

/// Simulated clock for testing: advances only when explicitly told to via
/// `sleep`, never on its own.
#[derive(Clone)]
pub struct SimulatedClocks(Arc<SimulatedClocksInner>);

struct SimulatedClocksInner {
    boot: jiff::Timestamp,
    uptime: Mutex<Duration>,
}

impl SimulatedClocks {
    pub fn new(boot: jiff::Timestamp) -> Self {
        SimulatedClocks(Arc::new(SimulatedClocksInner {
            boot,
            uptime: Mutex::new(Duration::ZERO),
        }))
    }
}

impl Clocks for SimulatedClocks {
    fn realtime(&self) -> jiff::Timestamp {
        let elapsed = *self.0.uptime.lock();
        self.0
            .boot
            .checked_add(elapsed)
            .unwrap_or(jiff::Timestamp::MAX)
    }

    fn monotonic(&self) -> Instant {
        Instant(*self.0.uptime.lock())
    }

    /// Advances the clock by the specified amount without actually sleeping.
    fn sleep(&self, how_long: Duration) {
        let mut l = self.0.uptime.lock();
        *l += how_long;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_clocks_advance_only_on_sleep() {
        let clocks = SimulatedClocks::new(jiff::Timestamp::UNIX_EPOCH);
        let start = clocks.monotonic();
        assert_eq!(start, Instant::ZERO);
        clocks.sleep(Duration::from_secs(5));
        assert_eq!(clocks.monotonic().duration_since(start), Duration::from_secs(5));
        assert_eq!(
            clocks.realtime(),
            jiff::Timestamp::UNIX_EPOCH.checked_add(Duration::from_secs(5)).unwrap()
        );
    }

    #[test]
    fn instant_ordering_and_arithmetic() {
        let a = Instant::ZERO;
        let b = a + Duration::from_secs(10);
        assert!(b > a);
        assert_eq!(b - a, Duration::from_secs(10));
        assert_eq!(b.duration_since(a), Duration::from_secs(10));
        assert_eq!(a.duration_since(b), Duration::ZERO);
    }
}
