//! Wall clock driven by the tokio timer.

use cadcollab_core::clock::current_time_ms;
use cadcollab_core::Clock;
use tokio::time::Instant;

/// Milliseconds since the epoch, advanced by tokio's clock.
///
/// Anchored to the system clock once and then moved by [`Instant`], so a
/// paused runtime in tests also pauses lock expiry and conflict deadlines.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    origin_ms: u64,
    start: Instant,
}

impl TokioClock {
    /// Anchor a clock at the current system time.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(current_time_ms())
    }

    /// Anchor a clock at an explicit time.
    #[must_use]
    pub fn starting_at(origin_ms: u64) -> Self {
        Self {
            origin_ms,
            start: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> u64 {
        let elapsed = u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.origin_ms.saturating_add(elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn follows_paused_time() {
        let clock = TokioClock::starting_at(1_000);
        assert_eq!(clock.now_ms(), 1_000);

        tokio::time::advance(Duration::from_millis(2_500)).await;
        assert_eq!(clock.now_ms(), 3_500);
    }
}
