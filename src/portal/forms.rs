//! HTML form discovery for login and SAML hand-off pages.

use lazy_static::lazy_static;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};

use crate::models::Credential;

lazy_static! {
    static ref FORM: Selector = Selector::parse("form").expect("form selector");
    static ref INPUT: Selector = Selector::parse("input").expect("input selector");
}

const USER_HINTS: [&str; 4] = ["user", "email", "login", "name"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormMethod {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtmlForm {
    pub action: Url,
    pub method: FormMethod,
    pub fields: Vec<(String, String)>,
}

impl HtmlForm {
    pub fn set(&mut self, name: &str, value: &str) {
        match self.fields.iter_mut().find(|(field, _)| field == name) {
            Some((_, slot)) => *slot = value.to_string(),
            None => self.fields.push((name.to_string(), value.to_string())),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginForm {
    pub form: HtmlForm,
    pub user_field: Option<String>,
    pub pass_field: String,
}

impl LoginForm {
    pub fn fill(mut self, credential: &Credential) -> HtmlForm {
        if let Some(user_field) = &self.user_field {
            self.form.set(user_field, &credential.login);
        }
        self.form.set(&self.pass_field, &credential.password);
        self.form
    }
}

fn attr<'a>(el: &ElementRef<'a>, name: &str) -> &'a str {
    el.value().attr(name).unwrap_or("").trim()
}

fn to_form(form: ElementRef<'_>, page: &Url) -> Option<HtmlForm> {
    let action = attr(&form, "action");
    let action = if action.is_empty() {
        page.clone()
    } else {
        page.join(action).ok()?
    };
    let method = if attr(&form, "method").eq_ignore_ascii_case("get") {
        FormMethod::Get
    } else {
        FormMethod::Post
    };
    let fields = form
        .select(&INPUT)
        .filter(|input| !attr(input, "name").is_empty())
        .map(|input| {
            (
                attr(&input, "name").to_string(),
                input.value().attr("value").unwrap_or("").to_string(),
            )
        })
        .collect();
    Some(HtmlForm {
        action,
        method,
        fields,
    })
}

/// The first form carrying a `SAMLResponse` or `RelayState` input.
pub fn autopost_form(html: &str, page: &Url) -> Option<HtmlForm> {
    let doc = Html::parse_document(html);
    let form = doc.select(&FORM).find(|form| {
        form.select(&INPUT)
            .any(|input| matches!(attr(&input, "name"), "SAMLResponse" | "RelayState"))
    })?;
    to_form(form, page)
}

/// A username/password form, preferring one that has a password input.
pub fn login_form(html: &str, page: &Url) -> Option<LoginForm> {
    let doc = Html::parse_document(html);
    let forms: Vec<ElementRef> = doc.select(&FORM).collect();
    let chosen = forms
        .iter()
        .find(|form| {
            form.select(&INPUT)
                .any(|input| attr(&input, "type").eq_ignore_ascii_case("password"))
        })
        .or_else(|| forms.first())
        .copied()?;

    let mut user_field = None;
    let mut pass_field = None;
    for input in chosen.select(&INPUT) {
        let name = attr(&input, "name");
        if name.is_empty() {
            continue;
        }
        let kind = attr(&input, "type").to_lowercase();
        if kind == "password" {
            pass_field = Some(name.to_string());
        } else if matches!(kind.as_str(), "text" | "email" | "") {
            let hints = format!(
                "{} {} {}",
                name,
                attr(&input, "id"),
                attr(&input, "autocomplete")
            )
            .to_lowercase();
            if USER_HINTS.iter().any(|hint| hints.contains(hint)) {
                user_field = Some(name.to_string());
            }
        }
    }
    if user_field.is_none() {
        user_field = chosen
            .select(&INPUT)
            .find(|input| {
                !attr(input, "name").is_empty()
                    && matches!(attr(input, "type").to_lowercase().as_str(), "text" | "email")
            })
            .map(|input| attr(&input, "name").to_string());
    }

    Some(LoginForm {
        form: to_form(chosen, page)?,
        user_field,
        pass_field: pass_field?,
    })
}

pub fn hidden_value(html: &str, name: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let found = doc
        .select(&INPUT)
        .find(|input| attr(input, "name") == name)
        .and_then(|input| input.value().attr("value").map(str::to_string));
    found
}
