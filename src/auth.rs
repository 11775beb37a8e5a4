use std::str::FromStr;
use std::sync::Arc;

use axum::extract::Path;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::Engine;
use crate::models::{PortalKind, Subject, SubjectId};
use crate::{breaks, proceeds, Error, Payload};

pub async fn register_subject(
    Json(body): Json<RegisterSubject>,
    Extension(engine): Extension<Arc<Engine>>,
) -> Payload<RegisteredSubject> {
    if body.login.trim().is_empty() || body.password.is_empty() {
        return breaks(Error::MissingCredentials {
            message: "Provided login or password was empty!".to_string(),
        });
    }

    let subject = engine.register_subject(&body.login, &body.password).await?;
    proceeds(RegisteredSubject {
        subject_id: subject.id,
        display_name: subject.display_name,
        monitoring: PortalKind::ALL.to_vec(),
    })
}

pub async fn read_subject(
    Path(id): Path<String>,
    Extension(engine): Extension<Arc<Engine>>,
) -> Payload<Subject> {
    let id = Uuid::from_str(&id)?;
    proceeds(engine.subject(id).await?)
}

pub async fn delete_subject(
    Path(id): Path<String>,
    Extension(engine): Extension<Arc<Engine>>,
) -> Payload<SubjectDeleted> {
    let id = Uuid::from_str(&id)?;
    engine.delete_subject(id).await?;
    proceeds(SubjectDeleted {
        subject_id: id,
        deleted: true,
    })
}

#[derive(Clone, Deserialize)]
pub struct RegisterSubject {
    pub login: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisteredSubject {
    pub subject_id: SubjectId,
    pub display_name: Option<String>,
    pub monitoring: Vec<PortalKind>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubjectDeleted {
    pub subject_id: SubjectId,
    pub deleted: bool,
}
