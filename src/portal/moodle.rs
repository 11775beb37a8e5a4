use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt, TryStreamExt};
use reqwest::Url;

use super::forms::{self, FormMethod, HtmlForm};
use super::{host_of, join, CourseActivityRaw, CourseReportRaw, Page, Portal, RawContent};
use crate::models::{Credential, PortalKind};
use crate::parse::moodle::{overview_courses, shows_not_enrolled};
use crate::session::SessionHandle;
use crate::Error;

pub const BASE: &str = "https://moodle.fraseric.ca";
const LOGIN_PATH: &str = "/login/index.php";
const OVERVIEW_PATH: &str = "/grade/report/overview/";

const MAX_SSO_HOPS: usize = 10;
const NOT_ENROLLED_RETRIES: usize = 3;
const NOT_ENROLLED_PAUSE: Duration = Duration::from_millis(800);
const REPORT_CONCURRENCY: usize = 6;

/// Moodle grade overview plus every course's grade report.
///
/// Login goes through Moodle's own form when it is offered, otherwise through
/// the single sign-on pages of the student portal (login form, then SAML
/// auto-post back to Moodle).
pub struct CourseActivityPortal {
    base: Url,
    host: String,
}

impl CourseActivityPortal {
    pub fn new() -> Self {
        Self::with_base(Url::parse(BASE).expect("valid portal base url"))
    }

    pub fn with_base(base: Url) -> Self {
        let host = host_of(&base);
        Self { base, host }
    }

    fn is_inside(&self, page: &Page) -> bool {
        page.on_host(&self.host) && !page.url.path().contains("/login/")
    }

    async fn get(&self, http: &reqwest::Client, url: Url) -> Result<Page, Error> {
        Page::read(http.get(url).send().await?).await
    }

    async fn submit(&self, http: &reqwest::Client, form: HtmlForm) -> Result<Page, Error> {
        let request = match form.method {
            FormMethod::Get => http.get(form.action).query(&form.fields),
            FormMethod::Post => http.post(form.action).form(&form.fields),
        };
        Page::read(request.send().await?).await
    }

    async fn single_sign_on(
        &self,
        http: &reqwest::Client,
        mut page: Page,
        credential: &Credential,
    ) -> Result<(), Error> {
        let mut submitted = false;
        for _ in 0..MAX_SSO_HOPS {
            if page.on_host(&self.host) {
                break;
            }
            if let Some(form) = forms::autopost_form(&page.body, &page.url) {
                page = self.submit(http, form).await?;
                continue;
            }
            if let Some(login) = forms::login_form(&page.body, &page.url) {
                if submitted {
                    return Err(Error::auth("Invalid username or password."));
                }
                submitted = true;
                page = self.submit(http, login.fill(credential)).await?;
                continue;
            }
            break;
        }

        let check = self.get(http, join(&self.base, OVERVIEW_PATH)?).await?;
        if self.is_inside(&check) {
            return Ok(());
        }
        Err(Error::fetch(format!(
            "Moodle SSO login did not complete (stuck at: {})",
            check.url
        )))
    }

    /// Only a lost session fails the whole fetch; other problems stay with the course.
    async fn fetch_report(
        &self,
        http: &reqwest::Client,
        course_id: i64,
        url: Url,
    ) -> Result<CourseReportRaw, Error> {
        let page = match self.get(http, url).await {
            Ok(page) if !self.is_inside(&page) => {
                return Err(Error::expired(format!(
                    "grade report for course {} redirected to login",
                    course_id
                )))
            }
            Ok(page) => page
                .ensure_success(&format!("grade report for course {}", course_id))
                .map(|page| page.body),
            Err(err) => Err(err),
        };
        if let Err(err) = &page {
            log::debug!("Grade report of course {} unavailable: {}", course_id, err);
        }
        Ok(CourseReportRaw { course_id, page })
    }
}

impl Default for CourseActivityPortal {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Portal for CourseActivityPortal {
    fn kind(&self) -> PortalKind {
        PortalKind::CourseActivity
    }

    fn host(&self) -> &str {
        &self.host
    }

    async fn login(&self, http: &reqwest::Client, credential: &Credential) -> Result<(), Error> {
        let first = self.get(http, join(&self.base, OVERVIEW_PATH)?).await?;
        if self.is_inside(&first) {
            return Ok(());
        }
        if !first.on_host(&self.host) {
            return self.single_sign_on(http, first, credential).await;
        }

        let login_url = join(&self.base, LOGIN_PATH)?;
        let login_page = self.get(http, login_url.clone()).await?;
        let mut fields = vec![
            ("username".to_string(), credential.login.clone()),
            ("password".to_string(), credential.password.clone()),
        ];
        if let Some(token) = forms::hidden_value(&login_page.body, "logintoken") {
            fields.push(("logintoken".to_string(), token));
        }
        let page = self
            .submit(
                http,
                HtmlForm {
                    action: login_url,
                    method: FormMethod::Post,
                    fields,
                },
            )
            .await?;

        if page.on_host(&self.host) && page.url.path().contains(LOGIN_PATH) {
            return Err(Error::auth("Invalid username or password."));
        }
        if !page.on_host(&self.host) {
            return self.single_sign_on(http, page, credential).await;
        }
        Ok(())
    }

    async fn fetch_raw(&self, session: &SessionHandle) -> Result<RawContent, Error> {
        let http = session.http();
        let overview_url = join(&self.base, OVERVIEW_PATH)?;

        let mut page = self.get(http, overview_url.clone()).await?;
        for _ in 0..NOT_ENROLLED_RETRIES {
            if !self.is_inside(&page) || !shows_not_enrolled(&page.body) {
                break;
            }
            tokio::time::sleep(NOT_ENROLLED_PAUSE).await;
            page = self.get(http, overview_url.clone()).await?;
        }
        if !self.is_inside(&page) {
            return Err(Error::expired("grade overview redirected to login"));
        }
        let page = page.ensure_success("grade overview")?;

        let courses = overview_courses(&page.body, &page.url)?;
        let reports: Vec<CourseReportRaw> = stream::iter(courses)
            .map(|course| self.fetch_report(http, course.course_id, course.url))
            .buffer_unordered(REPORT_CONCURRENCY)
            .try_collect()
            .await?;

        Ok(RawContent::CourseActivity(CourseActivityRaw {
            overview_url: page.url,
            overview_html: page.body,
            reports,
        }))
    }
}
