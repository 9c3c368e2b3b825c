use std::sync::atomic::{self, AtomicBool};
use std::thread;
use std::time::{Duration, Instant};

/// Spaces frame deliveries to approximate a target frame rate.
///
/// Each period starts when a frame is acquired. The pacer never tries to catch up: when
/// a frame took longer than the interval the next one starts immediately, so a slow
/// consumer lowers the delivered rate instead of causing a burst.
#[derive(Clone, Copy, Debug, Default)]
pub struct FramePacer {
    last_frame: Option<Instant>,
}

impl FramePacer {
    #[must_use]
    #[inline]
    pub const fn new() -> Self {
        Self { last_frame: None }
    }

    /// Target time between two frames at `frame_rate` frames per second.
    ///
    /// A rate of 0 is treated as 1.
    #[must_use]
    #[inline]
    pub fn interval(frame_rate: u32) -> Duration {
        Duration::from_secs(1) / frame_rate.max(1)
    }

    /// Time still to wait at `now` before the next frame may be delivered.
    ///
    /// Returns `None` before the first frame or when the interval has already elapsed.
    #[must_use]
    #[inline]
    pub fn remaining(&self, frame_rate: u32, now: Instant) -> Option<Duration> {
        let last_frame = self.last_frame?;
        let elapsed = now.saturating_duration_since(last_frame);

        Self::interval(frame_rate).checked_sub(elapsed).filter(|remaining| !remaining.is_zero())
    }

    /// Starts a new period at `now`, the time the frame was acquired.
    #[inline]
    pub fn begin_frame(&mut self, now: Instant) {
        self.last_frame = Some(now);
    }

    /// Sleeps out the rest of the current period.
    ///
    /// The sleep parks the current thread, so unparking it together with raising one of
    /// the `halt` flags ends the wait early.
    pub fn wait(&self, frame_rate: u32, halt: &[&AtomicBool]) {
        let Some(remaining) = self.remaining(frame_rate, Instant::now()) else {
            return;
        };
        let deadline = Instant::now() + remaining;

        loop {
            if halt.iter().any(|flag| flag.load(atomic::Ordering::Acquire)) {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }

            thread::park_timeout(deadline - now);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn interval_from_rate() {
        assert_eq!(FramePacer::interval(1), Duration::from_secs(1));
        assert_eq!(FramePacer::interval(4), Duration::from_millis(250));
        assert_eq!(FramePacer::interval(0), Duration::from_secs(1));
        assert!(FramePacer::interval(30) > Duration::from_millis(33));
        assert!(FramePacer::interval(30) < Duration::from_millis(34));
    }

    #[test]
    fn first_frame_is_not_delayed() {
        let pacer = FramePacer::new();
        assert_eq!(pacer.remaining(30, Instant::now()), None);
    }

    #[test]
    fn remaining_shrinks_with_elapsed_time() {
        let start = Instant::now();
        let pacer = FramePacer { last_frame: Some(start) };

        assert_eq!(pacer.remaining(10, start), Some(Duration::from_millis(100)));
        assert_eq!(
            pacer.remaining(10, start + Duration::from_millis(40)),
            Some(Duration::from_millis(60))
        );
        assert_eq!(pacer.remaining(10, start + Duration::from_millis(100)), None);
        // Falling behind does not build up credit for later frames.
        assert_eq!(pacer.remaining(10, start + Duration::from_millis(450)), None);
    }

    #[test]
    fn wait_sleeps_out_the_period() {
        let halt = AtomicBool::new(false);
        let mut pacer = FramePacer::new();

        let start = Instant::now();
        pacer.wait(20, &[&halt]);
        assert!(start.elapsed() < Duration::from_millis(45));

        pacer.begin_frame(start);
        pacer.wait(20, &[&halt]);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn halt_cuts_the_wait_short() {
        let halt = Arc::new(AtomicBool::new(false));
        let mut pacer = FramePacer::new();
        pacer.begin_frame(Instant::now());

        let waiter = {
            let halt = halt.clone();
            thread::spawn(move || {
                let start = Instant::now();
                pacer.wait(1, &[&*halt]);
                start.elapsed()
            })
        };

        thread::sleep(Duration::from_millis(50));
        halt.store(true, atomic::Ordering::Release);
        waiter.thread().unpark();

        assert!(waiter.join().unwrap() < Duration::from_millis(900));
    }
}
