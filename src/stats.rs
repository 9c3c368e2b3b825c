use std::sync::atomic::{self, AtomicU64};
use std::time::{Duration, Instant};

use log::debug;

/// Length of one measurement window.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Delivery statistics shared between a capture thread and its owner.
#[derive(Debug, Default)]
pub struct CaptureStats {
    frames_delivered: AtomicU64,
    frames_dropped: AtomicU64,
    // f64 bits of the last measured rate; 0 means not measured yet.
    measured_frame_rate: AtomicU64,
}

impl CaptureStats {
    #[must_use]
    #[inline]
    pub const fn new() -> Self {
        Self {
            frames_delivered: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            measured_frame_rate: AtomicU64::new(0),
        }
    }

    /// Number of frames handed to the frame handler.
    #[must_use]
    #[inline]
    pub fn frames_delivered(&self) -> u64 {
        self.frames_delivered.load(atomic::Ordering::Relaxed)
    }

    /// Number of frames acquired but not delivered (conversion skipped).
    #[must_use]
    #[inline]
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(atomic::Ordering::Relaxed)
    }

    /// Frames per second measured over the last complete window.
    #[must_use]
    #[inline]
    pub fn measured_frame_rate(&self) -> Option<f64> {
        match self.measured_frame_rate.load(atomic::Ordering::Relaxed) {
            0 => None,
            bits => Some(f64::from_bits(bits)),
        }
    }

    #[inline]
    pub(crate) fn record_dropped(&self) {
        self.frames_dropped.fetch_add(1, atomic::Ordering::Relaxed);
    }

    pub(crate) fn reset(&self) {
        self.frames_delivered.store(0, atomic::Ordering::Relaxed);
        self.frames_dropped.store(0, atomic::Ordering::Relaxed);
        self.measured_frame_rate.store(0, atomic::Ordering::Relaxed);
    }
}

/// Measures the delivered frame rate over one-second windows.
#[derive(Debug)]
pub struct FrameRateCounter {
    frame_count: u32,
    window_start: Instant,
}

impl FrameRateCounter {
    #[must_use]
    #[inline]
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    #[must_use]
    #[inline]
    pub const fn starting_at(window_start: Instant) -> Self {
        Self { frame_count: 0, window_start }
    }

    /// Counts one frame delivered at `now`.
    ///
    /// Returns the measured rate when `now` closes the current window.
    pub fn tick(&mut self, now: Instant) -> Option<f64> {
        self.frame_count += 1;

        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < REPORT_INTERVAL {
            return None;
        }

        let frame_rate = f64::from(self.frame_count) / elapsed.as_secs_f64();
        self.frame_count = 0;
        self.window_start = now;

        Some(frame_rate)
    }

    /// Counts one frame on behalf of `stats`, publishing the rate when a window closes.
    pub(crate) fn record(&mut self, stats: &CaptureStats) {
        stats.frames_delivered.fetch_add(1, atomic::Ordering::Relaxed);

        if let Some(frame_rate) = self.tick(Instant::now()) {
            debug!("Measured frame rate: {frame_rate:.2} FPS");
            stats.measured_frame_rate.store(frame_rate.to_bits(), atomic::Ordering::Relaxed);
        }
    }
}

impl Default for FrameRateCounter {
    fn default() -> Self {
        Self::new()
    }
}
