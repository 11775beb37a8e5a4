use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::Rng;

use crate::models::{PortalKind, SubjectId};

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub base: Duration,
    pub factor: f64,
    pub jitter: f64,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            base: Duration::seconds(60),
            factor: 2.0,
            jitter: 0.2,
            cap: Duration::seconds(3600),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `failures`-th consecutive failure.
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::zero();
        }
        let base_ms = self.base.num_milliseconds() as f64;
        let cap_ms = self.cap.num_milliseconds() as f64;
        let exp = (failures - 1).min(32) as f64;
        let mut delay = base_ms * self.factor.powf(exp);
        if delay > cap_ms {
            delay = cap_ms;
        }
        if self.jitter > 0.0 {
            let jitter = rand::thread_rng().gen_range(-(self.jitter)..self.jitter);
            delay *= 1.0 + jitter;
            if delay < 0.0 {
                delay = base_ms;
            }
        }
        Duration::milliseconds(delay.round() as i64)
    }
}

#[derive(Debug, Clone, Copy)]
struct Strikes {
    failures: u32,
    retry_at: DateTime<Utc>,
}

/// Consecutive fetch failures per (subject, kind), and when to try again.
#[derive(Default)]
pub struct BackoffTable {
    policy: RetryPolicy,
    strikes: Mutex<HashMap<(SubjectId, PortalKind), Strikes>>,
}

impl BackoffTable {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            strikes: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_waiting(&self, subject_id: SubjectId, kind: PortalKind, now: DateTime<Utc>) -> bool {
        matches!(self.strikes.lock().get(&(subject_id, kind)), Some(s) if s.retry_at > now)
    }

    /// Records one more failure and returns the moment of the next attempt.
    pub fn fail(&self, subject_id: SubjectId, kind: PortalKind, now: DateTime<Utc>) -> DateTime<Utc> {
        let mut strikes = self.strikes.lock();
        let entry = strikes.entry((subject_id, kind)).or_insert(Strikes {
            failures: 0,
            retry_at: now,
        });
        entry.failures += 1;
        entry.retry_at = now + self.policy.delay(entry.failures);
        entry.retry_at
    }

    pub fn clear(&self, subject_id: SubjectId, kind: PortalKind) {
        self.strikes.lock().remove(&(subject_id, kind));
    }

    pub fn forget_subject(&self, subject_id: SubjectId) {
        self.strikes.lock().retain(|(id, _), _| *id != subject_id);
    }

}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn steady() -> RetryPolicy {
        RetryPolicy {
            base: Duration::seconds(10),
            factor: 2.0,
            jitter: 0.0,
            cap: Duration::seconds(60),
        }
    }

    #[test]
    fn delay_doubles_up_to_cap() {
        let policy = steady();
        assert_eq!(policy.delay(0), Duration::zero());
        assert_eq!(policy.delay(1), Duration::seconds(10));
        assert_eq!(policy.delay(2), Duration::seconds(20));
        assert_eq!(policy.delay(3), Duration::seconds(40));
        assert_eq!(policy.delay(4), Duration::seconds(60));
        assert_eq!(policy.delay(40), Duration::seconds(60));
    }

    #[test]
    fn jitter_stays_in_band() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let ms = policy.delay(1).num_milliseconds();
            assert!((48_000..=72_000).contains(&ms), "{}", ms);
        }
    }

    #[test]
    fn table_waits_until_retry_time() {
        let table = BackoffTable::new(steady());
        let id = Uuid::new_v4();
        let now = Utc::now();
        assert!(!table.is_waiting(id, PortalKind::FinalGrades, now));

        let retry_at = table.fail(id, PortalKind::FinalGrades, now);
        assert_eq!(retry_at, now + Duration::seconds(10));
        assert!(table.is_waiting(id, PortalKind::FinalGrades, now + Duration::seconds(5)));
        assert!(!table.is_waiting(id, PortalKind::FinalGrades, retry_at));
        assert!(!table.is_waiting(id, PortalKind::CourseActivity, now));

        let second = table.fail(id, PortalKind::FinalGrades, retry_at);
        assert_eq!(second, retry_at + Duration::seconds(20));

        table.clear(id, PortalKind::FinalGrades);
        assert!(!table.is_waiting(id, PortalKind::FinalGrades, retry_at));
        assert_eq!(table.fail(id, PortalKind::FinalGrades, now), now + Duration::seconds(10));
    }
}
