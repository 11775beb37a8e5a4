use async_trait::async_trait;
use reqwest::Url;

use super::{host_of, join, FinalGradesRaw, Page, Portal, RawContent};
use crate::models::{Credential, PortalKind};
use crate::parse;
use crate::session::SessionHandle;
use crate::Error;

pub const BASE: &str = "https://learning.fraseric.ca";
const LOGIN_PATH: &str = "/user/login";
const GRADES_PATH: &str = "/student/resulttab";
const PROFILE_PATH: &str = "/student/profile";

/// Final grades on learning.fraseric.ca, behind a plain login form.
pub struct FinalGradesPortal {
    base: Url,
    host: String,
}

impl FinalGradesPortal {
    pub fn new() -> Self {
        Self::with_base(Url::parse(BASE).expect("valid portal base url"))
    }

    pub fn with_base(base: Url) -> Self {
        let host = host_of(&base);
        Self { base, host }
    }

    fn is_login_page(&self, page: &Page) -> bool {
        page.on_host(&self.host) && page.path_is(LOGIN_PATH)
    }
}

impl Default for FinalGradesPortal {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Portal for FinalGradesPortal {
    fn kind(&self) -> PortalKind {
        PortalKind::FinalGrades
    }

    fn host(&self) -> &str {
        &self.host
    }

    async fn login(&self, http: &reqwest::Client, credential: &Credential) -> Result<(), Error> {
        let resp = http
            .post(join(&self.base, LOGIN_PATH)?)
            .form(&[
                ("username", credential.login.as_str()),
                ("password", credential.password.as_str()),
                ("x", "27"),
                ("y", "4"),
            ])
            .send()
            .await?;
        let page = Page::read(resp).await?;

        if page.on_host(&self.host) && page.path_is("/") {
            return Ok(());
        }
        // A rejected login lands back on the form with the username echoed in the query.
        if self.is_login_page(&page)
            && page
                .url
                .query_pairs()
                .any(|(name, value)| name == "username" && value == credential.login.as_str())
        {
            return Err(Error::auth("Invalid username or password."));
        }
        if !page.status.is_success() {
            return Err(Error::fetch(format!(
                "Login failed: {}. {}...",
                page.status,
                page.snippet()
            )));
        }
        Err(Error::fetch(format!("Unexpected redirect after login: {}", page.url)))
    }

    async fn fetch_raw(&self, session: &SessionHandle) -> Result<RawContent, Error> {
        let resp = session.http().get(join(&self.base, GRADES_PATH)?).send().await?;
        let page = Page::read(resp).await?;
        if self.is_login_page(&page) {
            return Err(Error::expired("results page redirected to login"));
        }
        let page = page.ensure_success("results page")?;
        Ok(RawContent::FinalGrades(FinalGradesRaw { html: page.body }))
    }

    async fn display_name(&self, http: &reqwest::Client) -> Result<Option<String>, Error> {
        let resp = http.get(join(&self.base, PROFILE_PATH)?).send().await?;
        let page = Page::read(resp).await?;
        if self.is_login_page(&page) {
            return Err(Error::expired("profile page redirected to login"));
        }
        let page = page.ensure_success("profile page")?;
        Ok(parse::fic::profile_name(&page.body))
    }
}
