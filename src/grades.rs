use std::str::FromStr;
use std::sync::Arc;

use axum::extract::Path;
use axum::{Extension, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::Engine;
use crate::models::{Fingerprint, MonitoringState, PortalKind, RecordSet, Snapshot, SubjectId};
use crate::policy;
use crate::{proceeds, Error, Payload};

fn target(id: &str, kind: &str) -> Result<(SubjectId, PortalKind), Error> {
    Ok((Uuid::from_str(id)?, kind.parse()?))
}

pub async fn refresh(
    Path((id, kind)): Path<(String, String)>,
    Extension(engine): Extension<Arc<Engine>>,
) -> Payload<Refreshed> {
    let (id, kind) = target(&id, &kind)?;
    let records = engine.refresh_now(id, kind).await?;
    proceeds(Refreshed {
        subject_id: id,
        kind,
        fingerprint: records.fingerprint(),
        records,
    })
}

pub async fn snapshot(
    Path((id, kind)): Path<(String, String)>,
    Extension(engine): Extension<Arc<Engine>>,
) -> Payload<Snapshot> {
    let (id, kind) = target(&id, &kind)?;
    match engine.cached_snapshot(id, kind).await? {
        Some(snapshot) => proceeds(snapshot),
        None => Err(Error::NotFound {
            message: format!("No {} snapshot for subject `{}` yet", kind, id),
        }),
    }
}

pub async fn monitoring(
    Path((id, kind)): Path<(String, String)>,
    Extension(engine): Extension<Arc<Engine>>,
) -> Payload<MonitoringView> {
    let (id, kind) = target(&id, &kind)?;
    proceeds(MonitoringView::of(engine.monitoring_state(id, kind).await?))
}

pub async fn set_monitoring(
    Path((id, kind)): Path<(String, String)>,
    Json(body): Json<SetMonitoring>,
    Extension(engine): Extension<Arc<Engine>>,
) -> Payload<MonitoringView> {
    let (id, kind) = target(&id, &kind)?;
    proceeds(MonitoringView::of(engine.set_monitoring(id, kind, body.enabled).await?))
}

#[derive(Debug, Clone, Serialize)]
pub struct Refreshed {
    pub subject_id: SubjectId,
    pub kind: PortalKind,
    pub fingerprint: Fingerprint,
    pub records: RecordSet,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetMonitoring {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitoringView {
    #[serde(flatten)]
    pub state: MonitoringState,
    pub active: bool,
    pub days_left: Option<i64>,
}

impl MonitoringView {
    fn of(state: MonitoringState) -> Self {
        let now = Utc::now();
        Self {
            active: policy::is_active(&state, now),
            days_left: policy::days_left(&state, now),
            state,
        }
    }
}
