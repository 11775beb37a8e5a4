//! Expiry rules for monitoring periods. Pure functions of the state and a clock.

use chrono::{DateTime, Duration, Utc};

use crate::models::MonitoringState;

const DAY_SECS: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Disabled, nothing to do.
    Inactive,
    /// The period ran out; turn monitoring off.
    Disable,
    /// Inside the warning window and not warned yet. Checks still run.
    Warn,
    Check,
}

fn remaining(state: &MonitoringState, now: DateTime<Utc>) -> Option<Duration> {
    let enabled_at = state.enabled_at?;
    Some(state.duration() - (now - enabled_at))
}

pub fn is_active(state: &MonitoringState, now: DateTime<Utc>) -> bool {
    state.enabled && matches!(remaining(state, now), Some(left) if left > Duration::zero())
}

pub fn should_disable(state: &MonitoringState, now: DateTime<Utc>) -> bool {
    state.enabled && matches!(remaining(state, now), Some(left) if left <= Duration::zero())
}

pub fn should_warn(state: &MonitoringState, now: DateTime<Utc>) -> bool {
    if state.warned || state.warn_before_secs <= 0 || !is_active(state, now) {
        return false;
    }
    matches!(remaining(state, now), Some(left) if left <= state.warn_before())
}

/// Whole days left, rounded up; `None` when not running.
pub fn days_left(state: &MonitoringState, now: DateTime<Utc>) -> Option<i64> {
    if !is_active(state, now) {
        return None;
    }
    let secs = remaining(state, now)?.num_seconds().max(0);
    Some((secs + DAY_SECS - 1) / DAY_SECS)
}

pub fn evaluate(state: &MonitoringState, now: DateTime<Utc>) -> Verdict {
    if should_disable(state, now) {
        Verdict::Disable
    } else if !is_active(state, now) {
        Verdict::Inactive
    } else if should_warn(state, now) {
        Verdict::Warn
    } else {
        Verdict::Check
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PortalKind;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn enabled_at(at: DateTime<Utc>) -> MonitoringState {
        let mut state = MonitoringState::new(
            Uuid::new_v4(),
            PortalKind::FinalGrades,
            Duration::days(14),
            Duration::days(1),
        );
        state.enable(at);
        state
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap()
    }

    #[test]
    fn disables_once_duration_elapsed() {
        let state = enabled_at(t0());
        assert!(!should_disable(&state, t0() + Duration::days(13)));
        assert!(should_disable(&state, t0() + Duration::days(14)));
        assert!(should_disable(&state, t0() + Duration::days(30)));
        assert_eq!(evaluate(&state, t0() + Duration::days(14)), Verdict::Disable);
    }

    #[test]
    fn disabled_state_is_inactive() {
        let mut state = enabled_at(t0());
        state.disable();
        assert!(!is_active(&state, t0()));
        assert!(!should_disable(&state, t0() + Duration::days(20)));
        assert!(!should_warn(&state, t0() + Duration::days(13)));
        assert_eq!(evaluate(&state, t0()), Verdict::Inactive);
    }

    #[test]
    fn enabled_without_timestamp_never_runs() {
        let mut state = enabled_at(t0());
        state.enabled_at = None;
        assert!(!is_active(&state, t0()));
        assert!(!should_disable(&state, t0()));
    }

    #[test]
    fn warns_exactly_once_per_period() {
        let mut state = enabled_at(t0());
        let mut warnings = 0;
        let mut now = t0();
        while now < t0() + Duration::days(14) {
            if should_warn(&state, now) {
                warnings += 1;
                state.warned = true;
            }
            now = now + Duration::minutes(10);
        }
        assert_eq!(warnings, 1);

        state.enable(now);
        assert!(!state.warned);
        assert!(should_warn(&state, now + Duration::days(13) + Duration::hours(1)));
    }

    #[test]
    fn warning_window_boundaries() {
        let state = enabled_at(t0());
        assert!(!should_warn(&state, t0() + Duration::days(12)));
        assert!(should_warn(&state, t0() + Duration::days(13)));
        assert_eq!(evaluate(&state, t0() + Duration::days(13)), Verdict::Warn);
        assert_eq!(evaluate(&state, t0() + Duration::days(2)), Verdict::Check);
    }

    #[test]
    fn zero_window_never_warns() {
        let mut state = enabled_at(t0());
        state.warn_before_secs = 0;
        assert!(!should_warn(&state, t0() + Duration::days(14) - Duration::seconds(1)));
    }

    #[test]
    fn days_left_rounds_up() {
        let state = enabled_at(t0());
        assert_eq!(days_left(&state, t0()), Some(14));
        assert_eq!(days_left(&state, t0() + Duration::hours(1)), Some(14));
        assert_eq!(days_left(&state, t0() + Duration::days(13) + Duration::hours(23)), Some(1));
        assert_eq!(days_left(&state, t0() + Duration::days(14)), None);
    }
}
