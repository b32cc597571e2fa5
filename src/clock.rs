// =============================================================================
// CLOCK MODULE
// =============================================================================
// Injected time source. Expiry checks and state-transition timestamps all go
// through this instead of calling Utc::now() ad hoc, so the state machine can
// be exercised with pinned timestamps in tests.
// =============================================================================

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy)]
pub enum Clock {
    /// Wall-clock time.
    System,
    /// A frozen instant, for tests.
    Fixed(DateTime<Utc>),
}

impl Clock {
    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Clock::System => Utc::now(),
            Clock::Fixed(t) => *t,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn fixed_clock_returns_pinned_instant() {
        let t = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let clock = Clock::Fixed(t);
        assert_eq!(clock.now(), t);
        assert_eq!(clock.now(), clock.now());
    }

    #[test]
    fn system_clock_advances() {
        let clock = Clock::System;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
