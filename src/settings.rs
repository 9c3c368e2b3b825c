use std::time::Duration;

/// How long the capture thread waits for a new frame before polling its stop flags again.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(100);

/// Used To Handle Settings Errors
#[derive(thiserror::Error, Eq, PartialEq, Clone, Copy, Debug)]
pub enum Error {
    #[error("Frame rate must be greater than zero")]
    InvalidFrameRate,
    #[error("Acquire timeout must be greater than zero")]
    InvalidAcquireTimeout,
}

/// Capture Settings
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub struct Settings {
    pub(crate) display_id: usize,
    pub(crate) frame_rate: u32,
    pub(crate) acquire_timeout: Duration,
}

impl Settings {
    /// Create Capture Settings For A Display Id From The Last Enumeration
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidFrameRate`] when `frame_rate` is 0.
    pub const fn new(display_id: usize, frame_rate: u32) -> Result<Self, Error> {
        if frame_rate == 0 {
            return Err(Error::InvalidFrameRate);
        }

        Ok(Self { display_id, frame_rate, acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT })
    }

    /// Overrides the bounded wait used for each frame acquisition.
    ///
    /// Stop latency is roughly this timeout plus one conversion pass.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAcquireTimeout`] for a zero timeout.
    pub const fn with_acquire_timeout(mut self, acquire_timeout: Duration) -> Result<Self, Error> {
        if acquire_timeout.is_zero() {
            return Err(Error::InvalidAcquireTimeout);
        }

        self.acquire_timeout = acquire_timeout;
        Ok(self)
    }

    #[must_use]
    #[inline]
    pub const fn display_id(&self) -> usize {
        self.display_id
    }

    #[must_use]
    #[inline]
    pub const fn frame_rate(&self) -> u32 {
        self.frame_rate
    }

    #[must_use]
    #[inline]
    pub const fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }
}
