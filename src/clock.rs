//! Time source used for response timeouts, retry backoff and the poll interval.

use fugit::{MillisDurationU32, MillisDurationU64};

/// Millisecond instant on the client's monotonic timeline.
pub type Instant = fugit::TimerInstantU64<1_000>;

/// Monotonic clock plus a blocking delay.
pub trait Clock {
    fn now(&self) -> Instant;
    fn delay(&self, duration: MillisDurationU32);
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> Instant {
        (**self).now()
    }

    fn delay(&self, duration: MillisDurationU32) {
        (**self).delay(duration)
    }
}

/// `instant + duration` without mixing tick widths at the call site.
pub fn after(instant: Instant, duration: MillisDurationU32) -> Instant {
    instant + MillisDurationU64::from_ticks(u64::from(duration.ticks()))
}

/// Clock backed by [`std::time::Instant`] and [`std::thread::sleep`].
#[derive(Debug, Clone, Copy)]
pub struct StdClock {
    origin: std::time::Instant,
}

impl StdClock {
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for StdClock {
    fn now(&self) -> Instant {
        Instant::from_ticks(self.origin.elapsed().as_millis() as u64)
    }

    fn delay(&self, duration: MillisDurationU32) {
        std::thread::sleep(std::time::Duration::from_millis(u64::from(duration.ticks())));
    }
}
