pub mod fic;
pub mod forms;
pub mod moodle;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode, Url};

use crate::models::{Credential, PortalKind};
use crate::session::SessionHandle;
use crate::Error;

pub use fic::FinalGradesPortal;
pub use moodle::CourseActivityPortal;

#[derive(Debug, Clone)]
pub struct FinalGradesRaw {
    pub html: String,
}

/// One course's grade report, or why it could not be fetched.
#[derive(Debug, Clone)]
pub struct CourseReportRaw {
    pub course_id: i64,
    pub page: Result<String, Error>,
}

#[derive(Debug, Clone)]
pub struct CourseActivityRaw {
    pub overview_url: Url,
    pub overview_html: String,
    pub reports: Vec<CourseReportRaw>,
}

/// Raw portal content, tagged by the portal it came from.
#[derive(Debug, Clone)]
pub enum RawContent {
    FinalGrades(FinalGradesRaw),
    CourseActivity(CourseActivityRaw),
}

impl RawContent {
    pub fn kind(&self) -> PortalKind {
        match self {
            RawContent::FinalGrades(_) => PortalKind::FinalGrades,
            RawContent::CourseActivity(_) => PortalKind::CourseActivity,
        }
    }
}

/// A remote academic-record system reachable over an authenticated session.
///
/// `fetch_raw` reports a rejected session as [`Error::SessionExpired`]; the
/// session registry answers that with one fresh login and a retry.
#[async_trait]
pub trait Portal: Send + Sync {
    fn kind(&self) -> PortalKind;

    fn host(&self) -> &str;

    async fn login(&self, http: &reqwest::Client, credential: &Credential) -> Result<(), Error>;

    async fn fetch_raw(&self, session: &SessionHandle) -> Result<RawContent, Error>;

    /// Owner's display name, read right after a successful login.
    async fn display_name(&self, _http: &reqwest::Client) -> Result<Option<String>, Error> {
        Ok(None)
    }
}

#[derive(Clone, Default)]
pub struct Portals {
    by_kind: HashMap<PortalKind, Arc<dyn Portal>>,
}

impl Portals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live() -> Self {
        Self::new()
            .with(Arc::new(FinalGradesPortal::new()))
            .with(Arc::new(CourseActivityPortal::new()))
    }

    pub fn with(mut self, portal: Arc<dyn Portal>) -> Self {
        self.by_kind.insert(portal.kind(), portal);
        self
    }

    pub fn get(&self, kind: PortalKind) -> Result<Arc<dyn Portal>, Error> {
        self.by_kind.get(&kind).cloned().ok_or_else(|| Error::InternalError {
            kind: "PortalMissing",
            message: format!("no portal client registered for `{}`", kind),
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: format!("gradewatch/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl HttpConfig {
    /// Every session gets its own cookie jar.
    pub fn client(&self) -> Result<reqwest::Client, Error> {
        reqwest::Client::builder()
            .cookie_store(true)
            .timeout(self.timeout)
            .user_agent(self.user_agent.as_str())
            .build()
            .map_err(Error::from)
    }
}

/// A fully read response, after redirects.
#[derive(Debug)]
pub(crate) struct Page {
    pub url: Url,
    pub status: StatusCode,
    pub body: String,
}

impl Page {
    pub async fn read(resp: Response) -> Result<Self, Error> {
        let url = resp.url().clone();
        let status = resp.status();
        let body = resp.text().await?;
        Ok(Self { url, status, body })
    }

    pub fn on_host(&self, host: &str) -> bool {
        self.url.host_str() == Some(host)
    }

    pub fn path_is(&self, path: &str) -> bool {
        self.url.path().trim_end_matches('/') == path.trim_end_matches('/')
    }

    pub fn snippet(&self) -> String {
        self.body
            .chars()
            .take(300)
            .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
            .collect()
    }

    pub fn ensure_success(self, what: &str) -> Result<Self, Error> {
        if self.status.is_success() {
            return Ok(self);
        }
        Err(Error::fetch(format!(
            "{} returned {}. {}...",
            what,
            self.status,
            self.snippet()
        )))
    }
}

pub(crate) fn join(base: &Url, path: &str) -> Result<Url, Error> {
    base.join(path).map_err(|err| Error::InternalError {
        kind: "UrlError",
        message: format!("cannot join `{}` onto {}: {}", path, base, err),
    })
}

pub(crate) fn host_of(base: &Url) -> String {
    base.host_str().unwrap_or_default().to_string()
}
