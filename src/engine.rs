use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::backoff::BackoffTable;
use crate::config::Settings;
use crate::detect::{self, Comparison, DiffSummary, Notable, RecentChange};
use crate::events::{EventPayload, Notification, Notifier};
use crate::locks::KeyedLocks;
use crate::models::{Credential, MonitoringState, PortalKind, RecordSet, Snapshot, Subject, SubjectId};
use crate::parse::{self, ParseContext};
use crate::policy::{self, Verdict};
use crate::portal::{HttpConfig, Portals};
use crate::session::SessionRegistry;
use crate::store::Store;
use crate::vault::Vault;
use crate::Error;

/// Result of one fetch, parse, detect and persist cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    /// Nothing was stored before; saved without notifying.
    FirstSeen(RecordSet),
    Unchanged(RecordSet),
    /// Saved. `notable` lists the rows worth telling the owner about and
    /// may be empty.
    Changed {
        old: RecordSet,
        new: RecordSet,
        diff: DiffSummary,
        notable: Vec<Notable>,
    },
}

impl CheckOutcome {
    fn into_records(self) -> RecordSet {
        match self {
            CheckOutcome::FirstSeen(records) | CheckOutcome::Unchanged(records) => records,
            CheckOutcome::Changed { new, .. } => new,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub considered: usize,
    pub first_seen: usize,
    pub unchanged: usize,
    pub changed: usize,
    /// Changes that produced a notification.
    pub notified: usize,
    pub failed: usize,
    pub warned: usize,
    pub disabled: usize,
    /// Backing off after fetch failures, or gone since the listing.
    pub deferred: usize,
}

enum Step {
    Skipped,
    Deferred,
    Disabled,
    Checked {
        warned: bool,
        outcome: Result<CheckOutcome, Error>,
    },
}

impl TickReport {
    fn add(&mut self, step: Step) {
        self.considered += 1;
        match step {
            Step::Skipped => {}
            Step::Deferred => self.deferred += 1,
            Step::Disabled => self.disabled += 1,
            Step::Checked { warned, outcome } => {
                if warned {
                    self.warned += 1;
                }
                match outcome {
                    Ok(CheckOutcome::FirstSeen(_)) => self.first_seen += 1,
                    Ok(CheckOutcome::Unchanged(_)) => self.unchanged += 1,
                    Ok(CheckOutcome::Changed { notable, .. }) => {
                        self.changed += 1;
                        if !notable.is_empty() {
                            self.notified += 1;
                        }
                    }
                    Err(_) => self.failed += 1,
                }
            }
        }
    }
}

/// Owns everything a check needs and exposes the operations callers use.
pub struct Engine {
    store: Arc<dyn Store>,
    vault: Arc<Vault>,
    sessions: SessionRegistry,
    portals: Portals,
    locks: KeyedLocks<(SubjectId, PortalKind)>,
    backoff: BackoffTable,
    notifier: Notifier,
    settings: Settings,
    alerted: Mutex<HashMap<(SubjectId, PortalKind), &'static str>>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        vault: Arc<Vault>,
        portals: Portals,
        notifier: Notifier,
        settings: Settings,
    ) -> Self {
        let http = HttpConfig {
            timeout: settings.fetch_timeout,
            ..HttpConfig::default()
        };
        Self {
            sessions: SessionRegistry::new(vault.clone(), http, settings.session_idle),
            backoff: BackoffTable::new(settings.retry_policy()),
            locks: KeyedLocks::new(),
            alerted: Mutex::new(HashMap::new()),
            store,
            vault,
            portals,
            notifier,
            settings,
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    fn notify(&self, subject_id: SubjectId, kind: PortalKind, payload: EventPayload, at: DateTime<Utc>) {
        self.notifier.send(Notification::new(subject_id, kind, payload, at));
    }

    /// Validates the login against the final-grades portal, then stores the
    /// encrypted credentials with monitoring switched on for every portal.
    pub async fn register_subject(&self, login: &str, password: &str) -> Result<Subject, Error> {
        let login = login.trim();
        if login.is_empty() || password.is_empty() {
            return Err(Error::MissingCredentials {
                message: "Both login and password are required!".to_string(),
            });
        }
        let credential = Credential {
            login: login.to_string(),
            password: password.to_string(),
        };

        let portal = self.portals.get(PortalKind::FinalGrades)?;
        let display_name = self.sessions.verify(portal.as_ref(), &credential).await?;
        let (login_enc, password_enc) = self.vault.seal(&credential)?;
        drop(credential);

        let now = Utc::now();
        let subject = Subject {
            id: Uuid::new_v4(),
            login_enc,
            password_enc,
            display_name,
            created_at: now,
            last_checked_at: None,
            last_error: None,
        };
        let states: Vec<MonitoringState> = PortalKind::ALL
            .iter()
            .map(|kind| {
                let mut state = self.fresh_state(subject.id, *kind);
                state.enable(now);
                state
            })
            .collect();
        self.store.insert_subject(&subject, &states).await?;
        log::info!("Registered subject {}", subject.id);
        Ok(subject)
    }

    fn fresh_state(&self, subject_id: SubjectId, kind: PortalKind) -> MonitoringState {
        let (duration, warn_before) = self.settings.monitoring_window(kind);
        MonitoringState::new(subject_id, kind, duration, warn_before)
    }

    pub async fn subject(&self, id: SubjectId) -> Result<Subject, Error> {
        self.store.subject(id).await?.ok_or_else(|| Error::no_subject(id))
    }

    /// Removes the subject's credentials, snapshots and monitoring state, and
    /// drops its portal sessions. Waits for its in-flight checks first.
    pub async fn delete_subject(&self, id: SubjectId) -> Result<(), Error> {
        let mut guards = Vec::with_capacity(PortalKind::ALL.len());
        for kind in PortalKind::ALL {
            guards.push(self.locks.lock(&(id, kind)).await);
        }
        let existed = self.store.delete_subject(id).await?;
        self.sessions.forget_subject(id);
        self.backoff.forget_subject(id);
        self.alerted.lock().retain(|(subject_id, _), _| *subject_id != id);
        drop(guards);

        if !existed {
            return Err(Error::no_subject(id));
        }
        log::info!("Deleted subject {}", id);
        Ok(())
    }

    pub async fn cached_snapshot(&self, id: SubjectId, kind: PortalKind) -> Result<Option<Snapshot>, Error> {
        self.subject(id).await?;
        self.store.load_snapshot(id, kind).await
    }

    pub async fn monitoring_state(&self, id: SubjectId, kind: PortalKind) -> Result<MonitoringState, Error> {
        self.subject(id).await?;
        Ok(self
            .store
            .monitoring(id, kind)
            .await?
            .unwrap_or_else(|| self.fresh_state(id, kind)))
    }

    /// Turning monitoring on always starts a fresh period.
    pub async fn set_monitoring(&self, id: SubjectId, kind: PortalKind, enabled: bool) -> Result<MonitoringState, Error> {
        let _guard = self.locks.lock(&(id, kind)).await;
        self.subject(id).await?;
        let mut state = match self.store.monitoring(id, kind).await? {
            Some(state) => state,
            None => self.fresh_state(id, kind),
        };
        if enabled {
            let (duration, warn_before) = self.settings.monitoring_window(kind);
            state.duration_secs = duration.num_seconds();
            state.warn_before_secs = warn_before.num_seconds();
            state.enable(Utc::now());
        } else {
            state.disable();
        }
        self.store.save_monitoring(&state).await?;
        log::debug!(
            "Monitoring of {} for subject {} is now {}",
            kind,
            id,
            if enabled { "on" } else { "off" }
        );
        Ok(state)
    }

    /// Fetches right away, ignoring back-off. The result is stored without a
    /// change notification.
    pub async fn refresh_now(&self, id: SubjectId, kind: PortalKind) -> Result<RecordSet, Error> {
        let _guard = self.locks.lock(&(id, kind)).await;
        let subject = self.subject(id).await?;
        let now = Utc::now();
        match self.check(&subject, kind, now).await {
            Ok(outcome) => {
                self.succeeded(id, kind, now).await;
                Ok(outcome.into_records())
            }
            Err(err) => {
                self.log_failure(&subject, kind, &err);
                self.record_error(id, now, &err).await;
                Err(err)
            }
        }
    }

    /// Fetch, parse, compare and persist. Callers hold the (subject, kind) lock.
    async fn check(&self, subject: &Subject, kind: PortalKind, now: DateTime<Utc>) -> Result<CheckOutcome, Error> {
        let portal = self.portals.get(kind)?;
        let raw = tokio::time::timeout(
            self.settings.cycle_timeout,
            self.sessions.fetch(subject, portal.as_ref()),
        )
        .await
        .map_err(|_| {
            Error::fetch(format!(
                "{} check did not finish within {}s",
                kind,
                self.settings.cycle_timeout.as_secs()
            ))
        })??;
        if raw.kind() != kind {
            return Err(Error::InternalError {
                kind: "PortalMismatch",
                message: format!("{} portal returned {} content", kind, raw.kind()),
            });
        }

        let stored = self.store.load_snapshot(subject.id, kind).await?;
        let ctx = ParseContext {
            now,
            active_terms: self.settings.moodle_active_terms,
            previous: stored.as_ref().map(|snapshot| &snapshot.records),
        };
        let records = parse::parse(&raw, &ctx)?;

        match detect::compare(stored.as_ref(), &records) {
            Comparison::FirstSeen => {
                let snapshot = Snapshot::capture(subject.id, kind, records.clone(), now);
                self.store.save_snapshot(&snapshot).await?;
                Ok(CheckOutcome::FirstSeen(records))
            }
            Comparison::Unchanged => {
                self.store.touch_snapshot(subject.id, kind, now).await?;
                Ok(CheckOutcome::Unchanged(records))
            }
            Comparison::Changed(diff) => {
                let notable = detect::notable(&diff);
                let fresh = notable.iter().map(|change| RecentChange::of(change, now)).collect();
                let (old, earlier) = stored
                    .map(|snapshot| (snapshot.records, snapshot.recent_changes))
                    .unwrap_or_default();
                let snapshot = Snapshot::capture(subject.id, kind, records.clone(), now)
                    .with_change(diff.clone(), now)
                    .with_history(fresh, earlier);
                self.store.save_snapshot(&snapshot).await?;
                Ok(CheckOutcome::Changed {
                    old,
                    new: records,
                    diff,
                    notable,
                })
            }
        }
    }

    async fn succeeded(&self, id: SubjectId, kind: PortalKind, now: DateTime<Utc>) {
        self.backoff.clear(id, kind);
        self.alerted.lock().remove(&(id, kind));
        if let Err(err) = self.store.record_check(id, now, None).await {
            log::warn!("Could not record check of subject {}: {}", id, err);
        }
    }

    async fn record_error(&self, id: SubjectId, now: DateTime<Utc>, err: &Error) {
        if let Err(store_err) = self.store.record_check(id, now, Some(err.brief())).await {
            log::warn!("Could not record error of subject {}: {}", id, store_err);
        }
    }

    fn log_failure(&self, subject: &Subject, kind: PortalKind, err: &Error) {
        match err {
            Error::ParseFailure { .. } => {
                log::error!("{} page of subject {} could not be parsed: {}", kind, subject.id, err)
            }
            Error::AuthenticationFailure { .. } | Error::VaultFailure { .. } => {
                log::warn!("{} check of subject {} failed: {}", kind, subject.id, err)
            }
            Error::FetchFailure { .. } => {
                log::info!("{} check of subject {} failed: {}", kind, subject.id, err)
            }
            _ => log::error!("{} check of subject {} failed: {}", kind, subject.id, err),
        }
    }

    /// Sends `CheckFailed` once per streak of the same user-actionable error.
    fn alert_once(&self, subject_id: SubjectId, kind: PortalKind, err: &Error, now: DateTime<Utc>) {
        if !matches!(
            err,
            Error::AuthenticationFailure { .. } | Error::VaultFailure { .. } | Error::ParseFailure { .. }
        ) {
            return;
        }
        let first = self.alerted.lock().insert((subject_id, kind), err.name()) != Some(err.name());
        if first {
            self.notify(
                subject_id,
                kind,
                EventPayload::CheckFailed {
                    error: err.name(),
                    message: err.brief(),
                },
                now,
            );
        }
    }

    /// One scheduler pass over every enabled subscription of `kind`.
    pub async fn tick(&self, kind: PortalKind, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let states = match self.store.active_monitoring(kind).await {
            Ok(states) => states,
            Err(err) => {
                log::error!("Could not list {} subscriptions: {}", kind, err);
                return report;
            }
        };

        let steps: Vec<Step> = stream::iter(states)
            .map(|state| self.process(state.subject_id, kind, now))
            .buffer_unordered(self.settings.fetch_concurrency.max(1))
            .collect()
            .await;
        for step in steps {
            report.add(step);
        }

        let evicted = self.sessions.evict_idle();
        if evicted > 0 {
            log::debug!("Evicted {} idle portal sessions", evicted);
        }
        self.locks.prune();
        log::info!("{} tick: {:?}", kind, report);
        report
    }

    async fn process(&self, id: SubjectId, kind: PortalKind, now: DateTime<Utc>) -> Step {
        let _guard = self.locks.lock(&(id, kind)).await;

        // Re-read under the lock: the listing may be stale.
        let mut state = match self.store.monitoring(id, kind).await {
            Ok(Some(state)) => state,
            Ok(None) => return Step::Deferred,
            Err(err) => {
                log::error!("Could not load {} monitoring of subject {}: {}", kind, id, err);
                return Step::Checked {
                    warned: false,
                    outcome: Err(err),
                };
            }
        };

        let mut warned = false;
        match policy::evaluate(&state, now) {
            Verdict::Inactive => return Step::Skipped,
            Verdict::Disable => {
                let enabled_at = state.enabled_at;
                state.disable();
                if let Err(err) = self.store.save_monitoring(&state).await {
                    log::error!("Could not disable {} monitoring of subject {}: {}", kind, id, err);
                    return Step::Deferred;
                }
                log::debug!("{} monitoring of subject {} ran out", kind, id);
                self.notify(id, kind, EventPayload::Disabled { enabled_at }, now);
                return Step::Disabled;
            }
            Verdict::Warn => {
                let days_left = policy::days_left(&state, now).unwrap_or(0);
                let expires_at = state.enabled_at.unwrap_or(now) + state.duration();
                state.warned = true;
                match self.store.save_monitoring(&state).await {
                    Ok(()) => {
                        self.notify(id, kind, EventPayload::ExpiryWarning { days_left, expires_at }, now);
                        warned = true;
                    }
                    Err(err) => {
                        log::error!("Could not mark subject {} as warned: {}", id, err)
                    }
                }
            }
            Verdict::Check => {}
        }

        if self.backoff.is_waiting(id, kind, now) {
            log::debug!("Subject {} is backing off from {}", id, kind);
            return Step::Deferred;
        }

        let subject = match self.store.subject(id).await {
            Ok(Some(subject)) => subject,
            Ok(None) => return Step::Deferred,
            Err(err) => {
                log::error!("Could not load subject {}: {}", id, err);
                return Step::Checked {
                    warned,
                    outcome: Err(err),
                };
            }
        };

        let outcome = match self.check(&subject, kind, now).await {
            Ok(outcome) => {
                self.succeeded(id, kind, now).await;
                if let CheckOutcome::Changed { new, diff, notable, .. } = &outcome {
                    if notable.is_empty() {
                        log::debug!("{} of subject {} changed quietly ({} rows)", kind, id, diff.len());
                    } else {
                        log::info!("{} of subject {} has {} new values", kind, id, notable.len());
                        self.notify(
                            id,
                            kind,
                            EventPayload::Changed {
                                changes: notable.clone(),
                                diff: diff.clone(),
                                records: new.clone(),
                            },
                            now,
                        );
                    }
                }
                Ok(outcome)
            }
            Err(err) => {
                self.log_failure(&subject, kind, &err);
                if let Error::FetchFailure { .. } = err {
                    let retry_at = self.backoff.fail(id, kind, now);
                    log::debug!("Subject {} retries {} after {}", id, kind, retry_at);
                }
                self.alert_once(id, kind, &err, now);
                self.record_error(id, now, &err).await;
                Err(err)
            }
        };
        Step::Checked { warned, outcome }
    }
}
