//! Monotonic and boot-time clocks.
//!
//! CLOCK_MONOTONIC stops while the system is suspended, CLOCK_BOOTTIME does
//! not; the difference is the cumulative suspend time since boot.

use nix::time::{clock_gettime, ClockId};

fn millis(id: ClockId) -> i64 {
    match clock_gettime(id) {
        Ok(ts) => ts.tv_sec() * 1000 + ts.tv_nsec() / 1_000_000,
        Err(_) => 0,
    }
}

/// Milliseconds of awake time since boot.
pub fn monotonic_ms() -> i64 {
    millis(ClockId::CLOCK_MONOTONIC)
}

/// Milliseconds since boot, suspend included.
pub fn boottime_ms() -> i64 {
    millis(ClockId::CLOCK_BOOTTIME)
}

/// `(uptime_ms, suspend_ms)` as reported over the bus.
pub fn suspend_stats() -> (i64, i64) {
    let boottime = boottime_ms();
    let monotonic = monotonic_ms();
    (boottime, (boottime - monotonic).max(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clocks_advance_and_order() {
        let mono = monotonic_ms();
        let boot = boottime_ms();
        assert!(mono > 0);
        assert!(boot >= mono);
    }

    #[test]
    fn stats_are_consistent() {
        let (uptime, suspend) = suspend_stats();
        assert!(uptime > 0);
        assert!(suspend >= 0);
        assert!(suspend <= uptime);
    }
}
