//! ---
//! tdcs_section: "01-core-functionality"
//! tdcs_subsection: "module"
//! tdcs_type: "source"
//! tdcs_scope: "code"
//! tdcs_description: "Shared primitives and utilities for the driver runtime."
//! tdcs_version: "v0.1.0"
//! tdcs_owner: "tbd"
//! ---
use std::time::Instant;

use chrono::{DateTime, Local};

/// Capture an instant suitable for scheduler comparisons.
pub fn monotonic_now() -> Instant {
    Instant::now()
}

/// Wall-clock source for operations that stamp or window field data.
///
/// Controllers carry battery-backed clocks that drift; the clock-sync and
/// sample-drain operations compare controller timestamps against this clock.
/// Tests substitute [`FixedClock`] to make the comparisons deterministic.
pub trait WallClock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// A clock pinned to one instant, for deterministic tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Local>);

impl WallClock for FixedClock {
    fn now(&self) -> DateTime<Local> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn fixed_clock_returns_pinned_instant() {
        let stamp = Local.with_ymd_and_hms(2024, 3, 14, 9, 26, 53).unwrap();
        let clock = FixedClock(stamp);
        assert_eq!(clock.now(), stamp);
        assert_eq!(clock.now(), stamp);
    }
}
