#![allow(non_snake_case)]

use std::fmt::{Display, Formatter};

use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;

use serde::Serialize;

const BRIEF_LIMIT: usize = 220;

pub async fn handler404(path: Uri) -> (StatusCode, Json<Error>) {
    (
        StatusCode::NOT_FOUND,
        Json(Error::NotFound {
            message: format!("Invalid path: {}", path),
        }),
    )
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Maybe<T> {
    Nothing(Error),
    Fine(Success<T>),
}

pub fn Fine<V>(v: V) -> Maybe<V>
where
    V: Serialize,
{
    Maybe::Fine(Success::of(v))
}

pub fn Nothing<V>(err: Error) -> Maybe<V> {
    Maybe::Nothing(err)
}

#[derive(Debug, Clone, Serialize)]
pub struct Success<V> {
    success: bool,
    #[serde(flatten)]
    value: V,
}

impl<T> IntoResponse for Maybe<T>
where
    T: Serialize,
{
    fn into_response(self) -> Response {
        match self {
            Maybe::Nothing(err) => err.into_response(),
            Maybe::Fine(success) => Json::into_response(Json(success)),
        }
    }
}

impl<V: Serialize> Success<V> {
    pub fn of(value: V) -> Self {
        Self {
            success: true,
            value,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "error")]
pub enum Error {
    /// Bad credentials, or re-authentication failed.
    AuthenticationFailure { message: String },
    /// A portal rejected an existing session. Consumed by the session registry.
    SessionExpired { message: String },
    /// Network, timeout or an unexpected portal response.
    FetchFailure { message: String },
    /// The portal page no longer has the expected structure.
    ParseFailure { message: String },
    /// Stored credentials could not be decrypted with the process key.
    VaultFailure { message: String },
    StoreFailure { kind: &'static str, message: String },
    InvalidPayload { message: String },
    MissingCredentials { message: String },
    SubjectDoesNotExist { message: String },
    NotFound { message: String },
    InternalError { kind: &'static str, message: String },
    Unknown { message: String },
}

impl Error {
    pub fn auth<S: Into<String>>(msg: S) -> Error {
        Error::AuthenticationFailure {
            message: msg.into(),
        }
    }

    pub fn expired<S: Into<String>>(msg: S) -> Error {
        Error::SessionExpired {
            message: msg.into(),
        }
    }

    pub fn fetch<S: Into<String>>(msg: S) -> Error {
        Error::FetchFailure {
            message: msg.into(),
        }
    }

    pub fn parse<S: Into<String>>(msg: S) -> Error {
        Error::ParseFailure {
            message: msg.into(),
        }
    }

    pub fn vault<S: Into<String>>(msg: S) -> Error {
        Error::VaultFailure {
            message: msg.into(),
        }
    }

    pub fn store<S: Into<String>>(kind: &'static str, msg: S) -> Error {
        Error::StoreFailure {
            kind,
            message: msg.into(),
        }
    }

    pub fn unknown<S: Into<String>>(msg: S) -> Error {
        Error::Unknown {
            message: msg.into(),
        }
    }

    pub fn no_subject(id: impl Display) -> Error {
        Error::SubjectDoesNotExist {
            message: format!("Subject with id `{}` does not exist!", id),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Error::AuthenticationFailure { .. } => "AuthenticationFailure",
            Error::SessionExpired { .. } => "SessionExpired",
            Error::FetchFailure { .. } => "FetchFailure",
            Error::ParseFailure { .. } => "ParseFailure",
            Error::VaultFailure { .. } => "VaultFailure",
            Error::StoreFailure { .. } => "StoreFailure",
            Error::InvalidPayload { .. } => "InvalidPayload",
            Error::MissingCredentials { .. } => "MissingCredentials",
            Error::SubjectDoesNotExist { .. } => "SubjectDoesNotExist",
            Error::NotFound { .. } => "NotFound",
            Error::InternalError { .. } => "InternalError",
            Error::Unknown { .. } => "Unknown",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Error::AuthenticationFailure { message }
            | Error::SessionExpired { message }
            | Error::FetchFailure { message }
            | Error::ParseFailure { message }
            | Error::VaultFailure { message }
            | Error::StoreFailure { message, .. }
            | Error::InvalidPayload { message }
            | Error::MissingCredentials { message }
            | Error::SubjectDoesNotExist { message }
            | Error::NotFound { message }
            | Error::InternalError { message, .. }
            | Error::Unknown { message } => message,
        }
    }

    /// Short form stored as a subject's "last error".
    pub fn brief(&self) -> String {
        let lower = self.message().to_lowercase();
        if lower.contains("invalid") && lower.contains("password") {
            return "Invalid login or password.".to_string();
        }
        let collapsed = self.message().split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.chars().count() <= BRIEF_LIMIT {
            return collapsed;
        }
        let mut short: String = collapsed.chars().take(BRIEF_LIMIT - 1).collect();
        short.push('…');
        short
    }

    fn status(&self) -> StatusCode {
        match self {
            Error::AuthenticationFailure { .. }
            | Error::SessionExpired { .. }
            | Error::MissingCredentials { .. } => StatusCode::UNAUTHORIZED,
            Error::FetchFailure { .. } => StatusCode::BAD_GATEWAY,
            Error::ParseFailure { .. } => StatusCode::BAD_GATEWAY,
            Error::InvalidPayload { .. } => StatusCode::BAD_REQUEST,
            Error::SubjectDoesNotExist { .. } | Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::VaultFailure { .. }
            | Error::StoreFailure { .. }
            | Error::InternalError { .. }
            | Error::Unknown { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::StoreFailure { kind, message } | Error::InternalError { kind, message } => {
                write!(f, "{} ({}): {}", self.name(), kind, message)
            }
            _ => write!(f, "{}: {}", self.name(), self.message()),
        }
    }
}

impl std::error::Error for Error {}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}

impl From<std::io::Error> for Error {
    fn from(io: std::io::Error) -> Self {
        Self::InternalError {
            kind: "IOError",
            message: io.to_string(),
        }
    }
}

impl From<uuid::Error> for Error {
    fn from(id: uuid::Error) -> Self {
        Self::InvalidPayload {
            message: id.to_string(),
        }
    }
}

impl From<postcard::Error> for Error {
    fn from(err: postcard::Error) -> Self {
        Self::VaultFailure {
            message: format!("malformed credential envelope: {}", err),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::StoreFailure {
            kind: "DatabaseError",
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::StoreFailure {
            kind: "SerializationError",
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::FetchFailure {
                message: format!("portal request timed out: {}", err),
            };
        }
        Self::FetchFailure {
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Unknown {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brief_normalises_bad_credentials() {
        let err = Error::auth("Invalid username or password.");
        assert_eq!(err.brief(), "Invalid login or password.");
    }

    #[test]
    fn brief_collapses_and_truncates() {
        let long = format!("line one\n\n   {}", "x".repeat(400));
        let brief = Error::fetch(long).brief();
        assert!(brief.starts_with("line one x"));
        assert_eq!(brief.chars().count(), 220);
        assert!(brief.ends_with('…'));
    }

    #[test]
    fn serializes_with_error_tag() {
        let json = serde_json::to_value(Error::parse("no table")).unwrap();
        assert_eq!(json["error"], "ParseFailure");
        assert_eq!(json["message"], "no table");
    }
}
