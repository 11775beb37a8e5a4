use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context};

use crate::backoff::RetryPolicy;
use crate::models::PortalKind;

const MIN_CHECK_INTERVAL_SEC: u64 = 5;
const DAY_SECS: i64 = 86_400;
const MAX_ACTIVE_TERMS: u32 = 6;

#[derive(Debug, Clone)]
pub struct Settings {
    pub vault_key: String,
    pub database_url: Option<String>,
    pub bind_addr: SocketAddr,
    pub check_interval: Duration,
    pub moodle_check_interval: Duration,
    pub notif_duration_days: i64,
    pub notif_warn_before_days: i64,
    pub moodle_notif_duration_days: i64,
    pub moodle_notif_max_days: i64,
    pub moodle_notif_warn_before_days: i64,
    pub moodle_active_terms: u32,
    pub fetch_timeout: Duration,
    pub cycle_timeout: Duration,
    pub fetch_concurrency: usize,
    pub session_idle: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            vault_key: String::new(),
            database_url: None,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            check_interval: Duration::from_secs(600),
            moodle_check_interval: Duration::from_secs(600),
            notif_duration_days: 14,
            notif_warn_before_days: 1,
            moodle_notif_duration_days: 60,
            moodle_notif_max_days: 60,
            moodle_notif_warn_before_days: 1,
            moodle_active_terms: 1,
            fetch_timeout: Duration::from_secs(30),
            cycle_timeout: Duration::from_secs(120),
            fetch_concurrency: 4,
            session_idle: Duration::from_secs(1800),
            backoff_base: Duration::from_secs(60),
            backoff_cap: Duration::from_secs(3600),
        }
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value `{}`", name, raw)),
        _ => Ok(default),
    }
}

fn secs(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: Duration) -> anyhow::Result<Duration> {
    Ok(Duration::from_secs(parse(lookup, name, default.as_secs())?))
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Settings::default();

        let vault_key = match lookup("VAULT_KEY") {
            Some(key) if !key.trim().is_empty() => key,
            _ => bail!("VAULT_KEY is not set (generate one with `gradewatch --gen-key`)"),
        };

        let check_interval = secs(&lookup, "CHECK_INTERVAL_SEC", defaults.check_interval)?
            .max(Duration::from_secs(MIN_CHECK_INTERVAL_SEC));
        let moodle_check_interval = secs(&lookup, "MOODLE_CHECK_INTERVAL_SEC", check_interval)?
            .max(Duration::from_secs(MIN_CHECK_INTERVAL_SEC));

        let moodle_notif_duration_days = parse(
            &lookup,
            "MOODLE_NOTIF_DURATION_DAYS",
            defaults.moodle_notif_duration_days,
        )?;
        let settings = Settings {
            vault_key,
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            bind_addr: parse(&lookup, "BIND_ADDR", defaults.bind_addr)?,
            check_interval,
            moodle_check_interval,
            notif_duration_days: parse(&lookup, "NOTIF_DURATION_DAYS", defaults.notif_duration_days)?,
            notif_warn_before_days: parse(&lookup, "NOTIF_WARN_BEFORE_DAYS", defaults.notif_warn_before_days)?,
            moodle_notif_duration_days,
            moodle_notif_max_days: parse(&lookup, "MOODLE_NOTIF_MAX_DAYS", moodle_notif_duration_days)?,
            moodle_notif_warn_before_days: parse(
                &lookup,
                "MOODLE_NOTIF_WARN_BEFORE_DAYS",
                defaults.moodle_notif_warn_before_days,
            )?,
            moodle_active_terms: parse(&lookup, "MOODLE_ACTIVE_TERMS", defaults.moodle_active_terms)?
                .clamp(1, MAX_ACTIVE_TERMS),
            fetch_timeout: secs(&lookup, "FETCH_TIMEOUT_SEC", defaults.fetch_timeout)?,
            cycle_timeout: secs(&lookup, "CYCLE_TIMEOUT_SEC", defaults.cycle_timeout)?,
            fetch_concurrency: parse(&lookup, "FETCH_CONCURRENCY", defaults.fetch_concurrency)?.max(1),
            session_idle: secs(&lookup, "SESSION_IDLE_SEC", defaults.session_idle)?,
            backoff_base: secs(&lookup, "BACKOFF_BASE_SEC", defaults.backoff_base)?,
            backoff_cap: secs(&lookup, "BACKOFF_CAP_SEC", defaults.backoff_cap)?,
        };
        if settings.notif_duration_days <= 0 || settings.moodle_notif_duration_days <= 0 {
            bail!("notification durations must be at least one day");
        }
        Ok(settings)
    }

    pub fn check_interval(&self, kind: PortalKind) -> Duration {
        match kind {
            PortalKind::FinalGrades => self.check_interval,
            PortalKind::CourseActivity => self.moodle_check_interval,
        }
    }

    /// `(duration, warn_before)` of one monitoring period.
    pub fn monitoring_window(&self, kind: PortalKind) -> (chrono::Duration, chrono::Duration) {
        let (days, warn_days) = match kind {
            PortalKind::FinalGrades => (self.notif_duration_days, self.notif_warn_before_days),
            PortalKind::CourseActivity => (
                self.moodle_notif_duration_days.min(self.moodle_notif_max_days),
                self.moodle_notif_warn_before_days,
            ),
        };
        (
            chrono::Duration::seconds(days.max(0) * DAY_SECS),
            chrono::Duration::seconds(warn_days.max(0) * DAY_SECS),
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base: chrono::Duration::seconds(self.backoff_base.as_secs() as i64),
            cap: chrono::Duration::seconds(self.backoff_cap.as_secs() as i64),
            ..RetryPolicy::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from(vars: &[(&str, &str)]) -> anyhow::Result<Settings> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(move |name| vars.get(name).cloned())
    }

    #[test]
    fn vault_key_is_required() {
        assert!(from(&[]).is_err());
        assert!(from(&[("VAULT_KEY", "  ")]).is_err());
    }

    #[test]
    fn defaults_apply() {
        let settings = from(&[("VAULT_KEY", "passphrase")]).unwrap();
        assert_eq!(settings.check_interval, Duration::from_secs(600));
        assert_eq!(settings.moodle_check_interval, Duration::from_secs(600));
        assert_eq!(settings.database_url, None);
        assert_eq!(settings.bind_addr.port(), 3000);
        let (duration, warn) = settings.monitoring_window(PortalKind::FinalGrades);
        assert_eq!(duration, chrono::Duration::days(14));
        assert_eq!(warn, chrono::Duration::days(1));
        assert_eq!(
            settings.monitoring_window(PortalKind::CourseActivity).0,
            chrono::Duration::days(60)
        );
    }

    #[test]
    fn moodle_interval_follows_main_interval_and_has_a_floor() {
        let settings = from(&[("VAULT_KEY", "k"), ("CHECK_INTERVAL_SEC", "1")]).unwrap();
        assert_eq!(settings.check_interval, Duration::from_secs(5));
        assert_eq!(settings.moodle_check_interval, Duration::from_secs(5));

        let settings = from(&[
            ("VAULT_KEY", "k"),
            ("CHECK_INTERVAL_SEC", "300"),
            ("MOODLE_CHECK_INTERVAL_SEC", "900"),
        ])
        .unwrap();
        assert_eq!(settings.check_interval(PortalKind::FinalGrades), Duration::from_secs(300));
        assert_eq!(settings.check_interval(PortalKind::CourseActivity), Duration::from_secs(900));
    }

    #[test]
    fn moodle_duration_is_capped() {
        let settings = from(&[
            ("VAULT_KEY", "k"),
            ("MOODLE_NOTIF_DURATION_DAYS", "90"),
            ("MOODLE_NOTIF_MAX_DAYS", "30"),
        ])
        .unwrap();
        assert_eq!(
            settings.monitoring_window(PortalKind::CourseActivity).0,
            chrono::Duration::days(30)
        );
    }

    #[test]
    fn active_terms_are_clamped() {
        assert_eq!(from(&[("VAULT_KEY", "k")]).unwrap().moodle_active_terms, 1);
        assert_eq!(
            from(&[("VAULT_KEY", "k"), ("MOODLE_ACTIVE_TERMS", "0")]).unwrap().moodle_active_terms,
            1
        );
        assert_eq!(
            from(&[("VAULT_KEY", "k"), ("MOODLE_ACTIVE_TERMS", "9")]).unwrap().moodle_active_terms,
            6
        );
    }

    #[test]
    fn bad_numbers_are_reported() {
        let err = from(&[("VAULT_KEY", "k"), ("NOTIF_DURATION_DAYS", "two weeks")]).unwrap_err();
        assert!(err.to_string().contains("NOTIF_DURATION_DAYS"));
    }
}
