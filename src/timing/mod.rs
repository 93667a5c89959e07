//! Presentation timestamp bookkeeping
//!
//! Audio timestamps are derived from the number of frames fed to the encoder,
//! never from wall-clock time, so they cannot drift or jump backwards. Each
//! track's timeline is rebased onto its own first written timestamp.

use std::sync::atomic::{AtomicI64, Ordering};

/// Sample-count clock for an audio stream
#[derive(Debug, Clone)]
pub struct SampleClock {
    sample_rate: u32,
    frames: u64,
}

impl SampleClock {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            frames: 0,
        }
    }

    /// Timestamp of the next frame to be fed, in microseconds
    #[inline]
    pub fn pts_us(&self) -> i64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.frames as u128 * 1_000_000 / self.sample_rate as u128) as i64
    }

    /// Account for `frames` more frames having been fed
    #[inline]
    pub fn advance(&mut self, frames: usize) {
        self.frames = self.frames.saturating_add(frames as u64);
    }

    /// Total frames fed over the whole session
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

const UNSET: i64 = i64::MIN;

/// First-seen timestamp of a track, set exactly once
///
/// Read by both drain workers and the controller without a shared lock.
#[derive(Debug)]
pub struct ZeroReference {
    origin: AtomicI64,
}

impl ZeroReference {
    pub fn new() -> Self {
        Self {
            origin: AtomicI64::new(UNSET),
        }
    }

    /// Rebase `pts_us` onto this track's origin, latching it on first use
    pub fn rebase(&self, pts_us: i64) -> i64 {
        let origin = match self
            .origin
            .compare_exchange(UNSET, pts_us, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => pts_us,
            Err(existing) => existing,
        };
        pts_us.saturating_sub(origin)
    }

    pub fn origin(&self) -> Option<i64> {
        match self.origin.load(Ordering::Acquire) {
            UNSET => None,
            value => Some(value),
        }
    }

    pub fn is_set(&self) -> bool {
        self.origin().is_some()
    }
}

impl Default for ZeroReference {
    fn default() -> Self {
        Self::new()
    }
}
