use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::models::{Credential, Subject, SubjectId};
use crate::portal::{HttpConfig, Portal, RawContent};
use crate::vault::Vault;
use crate::Error;

/// One logged-in cookie jar for one (subject, portal host).
#[derive(Debug)]
pub struct SessionHandle {
    http: reqwest::Client,
    generation: u64,
    subject_id: SubjectId,
}

impl SessionHandle {
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn subject_id(&self) -> SubjectId {
        self.subject_id
    }
}

struct Entry {
    handle: Arc<SessionHandle>,
    last_used: Instant,
}

impl Entry {
    fn new(handle: Arc<SessionHandle>) -> Self {
        Self {
            handle,
            last_used: Instant::now(),
        }
    }
}

type Slot = Arc<tokio::sync::Mutex<Option<Entry>>>;

/// Authenticated sessions keyed by `(subject, portal host)`.
///
/// Every slot is an async mutex: logins, re-logins and evictions for the same
/// key never overlap, while different keys proceed independently. Requests
/// themselves run outside the slot lock.
pub struct SessionRegistry {
    slots: Mutex<HashMap<(SubjectId, String), Slot>>,
    vault: Arc<Vault>,
    http: HttpConfig,
    idle: Duration,
    generations: AtomicU64,
}

impl SessionRegistry {
    pub fn new(vault: Arc<Vault>, http: HttpConfig, idle: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            vault,
            http,
            idle,
            generations: AtomicU64::new(0),
        }
    }

    fn slot(&self, subject_id: SubjectId, host: &str) -> Slot {
        self.slots
            .lock()
            .entry((subject_id, host.to_string()))
            .or_default()
            .clone()
    }

    async fn login(&self, subject: &Subject, portal: &dyn Portal) -> Result<Arc<SessionHandle>, Error> {
        let http = self.http.client()?;
        {
            let credential = self.vault.open(subject)?;
            match portal.login(&http, &credential).await {
                Err(Error::SessionExpired { message }) => return Err(Error::auth(message)),
                other => other?,
            }
        }
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        log::debug!(
            "Logged in to {} for subject {} (session #{})",
            portal.host(),
            subject.id,
            generation
        );
        Ok(Arc::new(SessionHandle {
            http,
            generation,
            subject_id: subject.id,
        }))
    }

    /// Returns the cached session, logging in first if there is none.
    pub async fn acquire(&self, subject: &Subject, portal: &dyn Portal) -> Result<Arc<SessionHandle>, Error> {
        let slot = self.slot(subject.id, portal.host());
        let mut entry = slot.lock().await;
        if let Some(current) = entry.as_mut() {
            current.last_used = Instant::now();
            return Ok(current.handle.clone());
        }
        let handle = self.login(subject, portal).await?;
        *entry = Some(Entry::new(handle.clone()));
        Ok(handle)
    }

    /// Replaces `stale` with a fresh login, unless someone already did.
    async fn renew(
        &self,
        subject: &Subject,
        portal: &dyn Portal,
        stale: &SessionHandle,
    ) -> Result<Arc<SessionHandle>, Error> {
        let slot = self.slot(subject.id, portal.host());
        let mut entry = slot.lock().await;
        if let Some(current) = entry.as_mut() {
            if current.handle.generation != stale.generation {
                current.last_used = Instant::now();
                return Ok(current.handle.clone());
            }
        }
        *entry = None;
        let handle = self.login(subject, portal).await?;
        *entry = Some(Entry::new(handle.clone()));
        Ok(handle)
    }

    /// Drops the cached session if it is still generation `generation`.
    pub async fn discard(&self, subject_id: SubjectId, host: &str, generation: u64) {
        let slot = self.slot(subject_id, host);
        let mut entry = slot.lock().await;
        if matches!(entry.as_ref(), Some(current) if current.handle.generation == generation) {
            *entry = None;
        }
    }

    /// Fetches through the subject's session. A rejected session gets exactly
    /// one fresh login and one retry; a second rejection is an auth failure.
    pub async fn fetch(&self, subject: &Subject, portal: &dyn Portal) -> Result<RawContent, Error> {
        let handle = self.acquire(subject, portal).await?;
        let message = match portal.fetch_raw(&handle).await {
            Err(Error::SessionExpired { message }) => message,
            other => return other,
        };

        log::debug!(
            "Session #{} for subject {} on {} expired ({}), logging in again",
            handle.generation,
            subject.id,
            portal.host(),
            message
        );
        let handle = self.renew(subject, portal, &handle).await?;
        match portal.fetch_raw(&handle).await {
            Err(Error::SessionExpired { message }) => {
                self.discard(subject.id, portal.host(), handle.generation).await;
                Err(Error::auth(format!(
                    "Session rejected right after a fresh login: {}",
                    message
                )))
            }
            other => other,
        }
    }

    /// Throw-away login used to validate new credentials.
    pub async fn verify(&self, portal: &dyn Portal, credential: &Credential) -> Result<Option<String>, Error> {
        let http = self.http.client()?;
        match portal.login(&http, credential).await {
            Err(Error::SessionExpired { message }) => return Err(Error::auth(message)),
            other => other?,
        }
        match portal.display_name(&http).await {
            Ok(name) => Ok(name),
            Err(err) => {
                log::debug!("Could not read display name from {}: {}", portal.host(), err);
                Ok(None)
            }
        }
    }

    /// Removes sessions unused for longer than the idle window. Slots that are
    /// locked right now are left alone.
    pub fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|_, slot| {
            let keep = match slot.try_lock() {
                Ok(mut entry) => {
                    let fresh = matches!(
                        entry.as_ref(),
                        Some(current) if now.duration_since(current.last_used) < self.idle
                    );
                    if !fresh {
                        *entry = None;
                    }
                    fresh
                }
                Err(_) => true,
            };
            keep
        });
        before - slots.len()
    }

    pub fn forget_subject(&self, subject_id: SubjectId) {
        self.slots.lock().retain(|(id, _), _| *id != subject_id);
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::models::PortalKind;
    use crate::portal::FinalGradesRaw;

    struct Scripted {
        logins: AtomicUsize,
        accept: bool,
        fetches: parking_lot::Mutex<VecDeque<Result<RawContent, Error>>>,
    }

    impl Scripted {
        fn new(accept: bool, fetches: Vec<Result<RawContent, Error>>) -> Self {
            Self {
                logins: AtomicUsize::new(0),
                accept,
                fetches: parking_lot::Mutex::new(fetches.into()),
            }
        }

        fn logins(&self) -> usize {
            self.logins.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Portal for Scripted {
        fn kind(&self) -> PortalKind {
            PortalKind::FinalGrades
        }

        fn host(&self) -> &str {
            "portal.test"
        }

        async fn login(&self, _http: &reqwest::Client, credential: &Credential) -> Result<(), Error> {
            self.logins.fetch_add(1, Ordering::SeqCst);
            if self.accept && credential.password == "hunter2" {
                Ok(())
            } else {
                Err(Error::auth("Invalid username or password."))
            }
        }

        async fn fetch_raw(&self, _session: &SessionHandle) -> Result<RawContent, Error> {
            self.fetches
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(page("<table></table>")))
        }

        async fn display_name(&self, _http: &reqwest::Client) -> Result<Option<String>, Error> {
            Ok(Some("Jane Student".to_string()))
        }
    }

    fn page(html: &str) -> RawContent {
        RawContent::FinalGrades(FinalGradesRaw { html: html.to_string() })
    }

    fn setup(idle: Duration) -> (SessionRegistry, Subject) {
        let vault = Arc::new(Vault::new([7u8; 32]).unwrap());
        let (login_enc, password_enc) = vault
            .seal(&Credential {
                login: "jstudent".to_string(),
                password: "hunter2".to_string(),
            })
            .unwrap();
        let subject = Subject {
            id: Uuid::new_v4(),
            login_enc,
            password_enc,
            display_name: None,
            created_at: Utc::now(),
            last_checked_at: None,
            last_error: None,
        };
        (SessionRegistry::new(vault, HttpConfig::default(), idle), subject)
    }

    #[tokio::test]
    async fn reuses_one_login() {
        let (registry, subject) = setup(Duration::from_secs(60));
        let portal = Scripted::new(true, vec![]);
        registry.fetch(&subject, &portal).await.unwrap();
        registry.fetch(&subject, &portal).await.unwrap();
        assert_eq!(portal.logins(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn expired_session_logs_in_once_more() {
        let (registry, subject) = setup(Duration::from_secs(60));
        let portal = Scripted::new(true, vec![Err(Error::expired("redirected to login")), Ok(page("fresh"))]);
        let raw = registry.fetch(&subject, &portal).await.unwrap();
        assert!(matches!(raw, RawContent::FinalGrades(FinalGradesRaw { ref html }) if html == "fresh"));
        assert_eq!(portal.logins(), 2);
    }

    #[tokio::test]
    async fn second_rejection_is_auth_failure_and_not_cached() {
        let (registry, subject) = setup(Duration::from_secs(60));
        let portal = Scripted::new(
            true,
            vec![Err(Error::expired("login page")), Err(Error::expired("login page again"))],
        );
        let err = registry.fetch(&subject, &portal).await.unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailure { .. }));

        registry.fetch(&subject, &portal).await.unwrap();
        assert_eq!(portal.logins(), 3);
    }

    #[tokio::test]
    async fn failed_login_is_never_cached() {
        let (registry, subject) = setup(Duration::from_secs(60));
        let portal = Scripted::new(false, vec![]);
        for _ in 0..2 {
            let err = registry.fetch(&subject, &portal).await.unwrap_err();
            assert!(matches!(err, Error::AuthenticationFailure { .. }));
        }
        assert_eq!(portal.logins(), 2);
    }

    #[tokio::test]
    async fn fetch_failures_keep_the_session() {
        let (registry, subject) = setup(Duration::from_secs(60));
        let portal = Scripted::new(true, vec![Err(Error::fetch("502")), Ok(page("ok"))]);
        assert!(registry.fetch(&subject, &portal).await.is_err());
        registry.fetch(&subject, &portal).await.unwrap();
        assert_eq!(portal.logins(), 1);
    }

    #[tokio::test]
    async fn stale_discard_keeps_newer_session() {
        let (registry, subject) = setup(Duration::from_secs(60));
        let portal = Scripted::new(true, vec![]);
        let first = registry.acquire(&subject, &portal).await.unwrap();
        let second = registry.renew(&subject, &portal, &first).await.unwrap();
        assert_ne!(first.generation, second.generation);

        registry.discard(subject.id, portal.host(), first.generation).await;
        let current = registry.acquire(&subject, &portal).await.unwrap();
        assert_eq!(current.generation, second.generation);
    }

    #[tokio::test]
    async fn evicts_idle_but_not_busy_slots() {
        let (registry, subject) = setup(Duration::from_secs(0));
        let portal = Scripted::new(true, vec![]);
        registry.acquire(&subject, &portal).await.unwrap();

        let slot = registry.slot(subject.id, portal.host());
        let busy = slot.lock().await;
        assert_eq!(registry.evict_idle(), 0);
        drop(busy);

        assert_eq!(registry.evict_idle(), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn forget_subject_drops_its_sessions() {
        let (registry, subject) = setup(Duration::from_secs(60));
        let portal = Scripted::new(true, vec![]);
        registry.acquire(&subject, &portal).await.unwrap();
        registry.forget_subject(subject.id);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn verify_returns_display_name() {
        let (registry, _) = setup(Duration::from_secs(60));
        let portal = Scripted::new(true, vec![]);
        let good = Credential {
            login: "jstudent".to_string(),
            password: "hunter2".to_string(),
        };
        let name = registry.verify(&portal, &good).await.unwrap();
        assert_eq!(name.as_deref(), Some("Jane Student"));
        assert!(registry.is_empty());

        let bad = Credential {
            password: "nope".to_string(),
            ..good
        };
        assert!(registry.verify(&portal, &bad).await.is_err());
    }
}
