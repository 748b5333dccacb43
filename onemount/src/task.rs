//! Shared concurrency plumbing.
//!
//! Scheduling model: parallel worker pools over cooperatively-cancelled
//! tasks. Each manager owns its workers; all derive their cancellation
//! token from a single root plumbed through every blocking call.
//!
//! Lock hierarchy, acquired strictly in this order and never upward:
//!
//! 1. the filesystem-wide read/write lock;
//! 2. a parent inode mutex;
//! 3. a child inode mutex (when both are needed, parent first).
//!
//! Per-inode field locks are not separate; the inode mutex protects
//! all fields. The two documented exceptions live in
//! [`inode`](crate::inode) and release their holds before re-entering
//! the hierarchy.

use std::{
    ops::{Deref, DerefMut},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Holds longer than this emit a debug observation.
pub const LOCK_OBSERVE_THRESHOLD: Duration = Duration::from_millis(2);

/// Wraps a lock guard and reports holds exceeding
/// [`LOCK_OBSERVE_THRESHOLD`] when the guard drops.
pub struct Timed<G> {
    guard: G,
    label: &'static str,
    acquired: Instant,
}

impl<G> Timed<G> {
    pub fn new(label: &'static str, guard: G) -> Self {
        Timed {
            guard,
            label,
            acquired: Instant::now(),
        }
    }
}

impl<G> Drop for Timed<G> {
    fn drop(&mut self) {
        let held = self.acquired.elapsed();
        if held > LOCK_OBSERVE_THRESHOLD {
            debug!(lock = self.label, held_us = held.as_micros() as u64, "long lock hold");
        }
    }
}

impl<G: Deref> Deref for Timed<G> {
    type Target = G::Target;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<G: DerefMut> DerefMut for Timed<G> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

/// Exponential back-off series: `base * 2^attempt`, capped.
pub fn backoff(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = base.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    exp.min(cap)
}

/// Sleep for the back-off delay, returning early (false) on cancel.
pub async fn backoff_sleep(
    attempt: u32,
    base: Duration,
    cap: Duration,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(backoff(attempt, base, cap)) => true,
    }
}

pub fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

pub fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

/// Emits a structured `{op, id, duration}` trace when dropped; attach
/// the error separately at the call site when one occurs.
pub struct OpTimer {
    op: &'static str,
    id: String,
    started: Instant,
}

impl OpTimer {
    pub fn new(op: &'static str, id: impl ToString) -> Self {
        OpTimer {
            op,
            id: id.to_string(),
            started: Instant::now(),
        }
    }
}

impl Drop for OpTimer {
    fn drop(&mut self) {
        debug!(
            op = self.op,
            id = %self.id,
            duration_us = self.started.elapsed().as_micros() as u64,
            "op complete"
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn backoff_caps() {
        let base = Duration::from_millis(200);
        let cap = Duration::from_secs(5);
        assert_eq!(backoff(0, base, cap), base);
        assert_eq!(backoff(1, base, cap), Duration::from_millis(400));
        assert_eq!(backoff(10, base, cap), cap);
        assert_eq!(backoff(40, base, cap), cap);
    }
}
