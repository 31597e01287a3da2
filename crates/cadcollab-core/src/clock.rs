//! Millisecond clocks.
//!
//! The coordination state machines never read the time themselves; callers
//! pass `now_ms` in. A [`Clock`] is how the agent obtains that value.

use std::time::{SystemTime, UNIX_EPOCH};

/// A source of wall-clock milliseconds since the UNIX epoch.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds.
    fn now_ms(&self) -> u64;
}

/// Get current wall clock time in milliseconds since UNIX epoch.
#[must_use]
pub fn current_time_ms() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    u64::try_from(millis).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wall_clock_is_after_2020() {
        assert!(current_time_ms() > 1_577_836_800_000);
    }
}
