//! Pose interpolation for sparse, irregularly arriving samples.
//!
//! Samples arrive on the unreliable channel whenever the network delivers
//! them. The interpolator keeps the two most recent samples and, every tick,
//! produces a value between them normalized by the observed gap between
//! their *local receipt times*. Sender clocks are never consulted, so there
//! is no cross-device clock skew to correct; the cost is that receipt jitter
//! shows up directly as playback jitter.

use std::time::Duration;

use crate::PoseSample;

/// Sync delays below this many seconds are treated as zero.
pub const MIN_SYNC_DELAY_SECS: f32 = 1e-6;

/// Per-connection interpolation state.
#[derive(Debug, Clone, Default)]
pub struct PoseInterpolator {
    previous: PoseSample,
    current: PoseSample,
    /// Local receipt time of `current`.
    last_sample_time: Option<Duration>,
    /// Gap between the receipt times of `previous` and `current`, seconds.
    sync_delay: f32,
    /// Seconds since `current` was received.
    elapsed: f32,
}

impl PoseInterpolator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any sample has been received yet.
    pub fn has_sample(&self) -> bool {
        self.last_sample_time.is_some()
    }

    /// Record a newly received sample stamped with local time `now`.
    ///
    /// `current` shifts to `previous`, `sync_delay` becomes the gap between
    /// the two receipts and `elapsed` restarts at zero. The very first sample
    /// fills both slots so output snaps straight to it.
    pub fn push(&mut self, sample: PoseSample, now: Duration) {
        match self.last_sample_time {
            Some(last) => {
                self.sync_delay = now.saturating_sub(last).as_secs_f32();
                self.previous = self.current;
            }
            None => {
                self.sync_delay = 0.0;
                self.previous = sample;
            }
        }
        self.current = sample;
        self.last_sample_time = Some(now);
        self.elapsed = 0.0;
    }

    /// Advance by `dt` seconds and return the interpolated pose.
    ///
    /// Returns `None` until the first sample has arrived.
    pub fn advance(&mut self, dt: f32) -> Option<PoseSample> {
        if dt.is_finite() && dt > 0.0 {
            self.elapsed += dt;
        }
        self.sample()
    }

    /// Interpolated pose at the current `elapsed`, without advancing.
    pub fn sample(&self) -> Option<PoseSample> {
        if !self.has_sample() {
            return None;
        }
        Some(PoseSample::interpolate(
            &self.previous,
            &self.current,
            self.ratio(),
        ))
    }

    /// `elapsed / sync_delay`, or 1.0 when the delay is (near) zero.
    ///
    /// Not clamped from above: it keeps growing while no new sample arrives.
    /// The lerp/slerp primitives hold the output at `current` past 1.0.
    pub fn ratio(&self) -> f32 {
        if self.sync_delay < MIN_SYNC_DELAY_SECS {
            1.0
        } else {
            (self.elapsed / self.sync_delay).max(0.0)
        }
    }

    pub fn sync_delay(&self) -> f32 {
        self.sync_delay
    }

    pub fn elapsed(&self) -> f32 {
        self.elapsed
    }

    pub fn previous(&self) -> &PoseSample {
        &self.previous
    }

    pub fn current(&self) -> &PoseSample {
        &self.current
    }
}
