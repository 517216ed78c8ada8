//! Meeting clock state machine.
//!
//! ```text
//! Idle --start--> Running --threshold (host)--> WarningIssued --0s--> Ended
//!                    ^                               |
//!                    +------------extend-------------+
//! ```
//!
//! Reaching zero is authoritative: nothing moves the clock out of `Ended`.

use crate::errors::CallError;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockPhase {
    Idle,
    Running,
    WarningIssued,
    Ended,
}

/// What a tick produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockTransition {
    None,
    /// Host-only, once per latch.
    Warning { remaining_seconds: u64 },
    /// Budget exhausted.
    Expired,
}

/// Point-in-time view of the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockSnapshot {
    pub phase: ClockPhase,
    pub elapsed_seconds: u64,
    /// `None` when the meeting has no budget.
    pub remaining_seconds: Option<u64>,
    pub warning_fired: bool,
    pub is_host: bool,
}

#[derive(Debug, Clone)]
pub struct MeetingClock {
    phase: ClockPhase,
    elapsed_seconds: u64,
    remaining_seconds: Option<u64>,
    budget_seconds: u64,
    warning_fired: bool,
    is_host: bool,
    warning_threshold_seconds: u64,
}

impl MeetingClock {
    /// `budget_seconds == 0` means unlimited.
    #[must_use]
    pub fn new(budget_seconds: u64, is_host: bool, warning_threshold_seconds: u64) -> Self {
        Self {
            phase: ClockPhase::Idle,
            elapsed_seconds: 0,
            remaining_seconds: (budget_seconds > 0).then_some(budget_seconds),
            budget_seconds,
            warning_fired: false,
            is_host,
            warning_threshold_seconds,
        }
    }

    pub fn start(&mut self) {
        if self.phase == ClockPhase::Idle {
            self.phase = ClockPhase::Running;
        }
    }

    /// Advance one second.
    pub fn tick(&mut self) -> ClockTransition {
        if !matches!(self.phase, ClockPhase::Running | ClockPhase::WarningIssued) {
            return ClockTransition::None;
        }
        self.elapsed_seconds += 1;

        let Some(remaining) = self.remaining_seconds.as_mut() else {
            return ClockTransition::None;
        };
        *remaining = remaining.saturating_sub(1);
        let remaining = *remaining;

        if remaining == 0 {
            self.phase = ClockPhase::Ended;
            return ClockTransition::Expired;
        }

        if self.is_host && !self.warning_fired && remaining <= self.warning_threshold_seconds {
            self.warning_fired = true;
            self.phase = ClockPhase::WarningIssued;
            return ClockTransition::Warning {
                remaining_seconds: remaining,
            };
        }

        ClockTransition::None
    }

    /// Add `minutes` to the budget and re-arm the warning.
    ///
    /// Returns the new total duration in minutes.
    pub fn extend(&mut self, minutes: u64) -> Result<u64, CallError> {
        if self.phase == ClockPhase::Ended {
            return Err(CallError::SessionEnded);
        }
        if !self.is_host {
            return Err(CallError::PermissionDenied(
                "Only the host can extend the meeting".to_string(),
            ));
        }
        if minutes == 0 {
            return Err(CallError::InvalidRequest(
                "Extension must be at least one minute".to_string(),
            ));
        }
        let Some(remaining) = self.remaining_seconds.as_mut() else {
            return Err(CallError::InvalidRequest(
                "Meeting has no time limit".to_string(),
            ));
        };

        let added = minutes.saturating_mul(60);
        *remaining = remaining.saturating_add(added);
        self.budget_seconds = self.budget_seconds.saturating_add(added);
        self.warning_fired = false;
        if self.phase == ClockPhase::WarningIssued {
            self.phase = ClockPhase::Running;
        }

        Ok(self.budget_seconds.div_ceil(60))
    }

    /// Mark the clock ended for a non-expiry stop.
    pub fn end(&mut self) {
        self.phase = ClockPhase::Ended;
    }

    #[must_use]
    pub fn phase(&self) -> ClockPhase {
        self.phase
    }

    #[must_use]
    pub fn elapsed_seconds(&self) -> u64 {
        self.elapsed_seconds
    }

    #[must_use]
    pub fn snapshot(&self) -> ClockSnapshot {
        ClockSnapshot {
            phase: self.phase,
            elapsed_seconds: self.elapsed_seconds,
            remaining_seconds: self.remaining_seconds,
            warning_fired: self.warning_fired,
            is_host: self.is_host,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_until_started() {
        let mut clock = MeetingClock::new(5, true, 300);
        assert_eq!(clock.tick(), ClockTransition::None);
        assert_eq!(clock.elapsed_seconds(), 0);

        clock.start();
        clock.tick();
        assert_eq!(clock.elapsed_seconds(), 1);
        assert_eq!(clock.snapshot().remaining_seconds, Some(4));
    }

    #[test]
    fn test_expires_after_budget_and_rejects_extend() {
        let mut clock = MeetingClock::new(5, true, 0);
        clock.start();

        for _ in 0..4 {
            assert_eq!(clock.tick(), ClockTransition::None);
        }
        assert_eq!(clock.tick(), ClockTransition::Expired);
        assert_eq!(clock.phase(), ClockPhase::Ended);

        assert!(matches!(clock.extend(10), Err(CallError::SessionEnded)));
        assert_eq!(clock.tick(), ClockTransition::None);
        assert_eq!(clock.snapshot().remaining_seconds, Some(0));
    }

    #[test]
    fn test_warning_fires_once_at_threshold() {
        let mut clock = MeetingClock::new(301, true, 300);
        clock.start();

        let warnings: Vec<_> = (0..200)
            .map(|_| clock.tick())
            .filter(|t| matches!(t, ClockTransition::Warning { .. }))
            .collect();

        assert_eq!(
            warnings,
            vec![ClockTransition::Warning {
                remaining_seconds: 300
            }]
        );
        assert_eq!(clock.phase(), ClockPhase::WarningIssued);
    }

    #[test]
    fn test_extend_rearms_warning() {
        let mut clock = MeetingClock::new(301, true, 300);
        clock.start();
        assert!(matches!(clock.tick(), ClockTransition::Warning { .. }));

        // 300 + 60 = 360 remaining, 361 budget -> 7 minutes
        assert_eq!(clock.extend(1).unwrap(), 7);
        assert_eq!(clock.phase(), ClockPhase::Running);

        let mut fired = 0;
        for _ in 0..60 {
            if matches!(clock.tick(), ClockTransition::Warning { .. }) {
                fired += 1;
            }
        }
        assert_eq!(fired, 1);
    }

    #[test]
    fn test_non_host_never_warned_but_still_expires() {
        let mut clock = MeetingClock::new(3, false, 300);
        clock.start();
        assert_eq!(clock.tick(), ClockTransition::None);
        assert_eq!(clock.tick(), ClockTransition::None);
        assert_eq!(clock.tick(), ClockTransition::Expired);
    }

    #[test]
    fn test_extend_validation() {
        let mut guest = MeetingClock::new(600, false, 300);
        assert!(matches!(
            guest.extend(5),
            Err(CallError::PermissionDenied(_))
        ));

        let mut host = MeetingClock::new(600, true, 300);
        assert!(matches!(host.extend(0), Err(CallError::InvalidRequest(_))));

        let mut unlimited = MeetingClock::new(0, true, 300);
        unlimited.start();
        assert!(matches!(
            unlimited.extend(5),
            Err(CallError::InvalidRequest(_))
        ));
        for _ in 0..1000 {
            assert_eq!(unlimited.tick(), ClockTransition::None);
        }
        assert_eq!(unlimited.elapsed_seconds(), 1000);
    }
}
