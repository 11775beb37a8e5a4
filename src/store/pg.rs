use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use super::Store;
use crate::detect::{DiffSummary, RecentChange};
use crate::models::{Fingerprint, MonitoringState, PortalKind, RecordSet, Snapshot, Subject, SubjectId};
use crate::Error;

const SCHEMA: [&str; 4] = [
    "CREATE TABLE IF NOT EXISTS subjects (
        id UUID PRIMARY KEY,
        login_enc BYTEA NOT NULL,
        password_enc BYTEA NOT NULL,
        display_name TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        last_checked_at TIMESTAMPTZ,
        last_error TEXT
    )",
    "CREATE TABLE IF NOT EXISTS snapshots (
        subject_id UUID NOT NULL REFERENCES subjects(id) ON DELETE CASCADE,
        kind TEXT NOT NULL,
        records JSONB NOT NULL,
        fingerprint TEXT NOT NULL,
        captured_at TIMESTAMPTZ NOT NULL,
        last_change JSONB,
        changed_at TIMESTAMPTZ,
        recent_changes JSONB NOT NULL DEFAULT '[]',
        PRIMARY KEY (subject_id, kind)
    )",
    "ALTER TABLE snapshots ADD COLUMN IF NOT EXISTS recent_changes JSONB NOT NULL DEFAULT '[]'",
    "CREATE TABLE IF NOT EXISTS monitoring_state (
        subject_id UUID NOT NULL REFERENCES subjects(id) ON DELETE CASCADE,
        kind TEXT NOT NULL,
        enabled BOOLEAN NOT NULL,
        enabled_at TIMESTAMPTZ,
        duration_secs BIGINT NOT NULL,
        warn_before_secs BIGINT NOT NULL,
        warned BOOLEAN NOT NULL,
        PRIMARY KEY (subject_id, kind)
    )",
];

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    subject_id: Uuid,
    kind: String,
    records: Json<RecordSet>,
    fingerprint: String,
    captured_at: DateTime<Utc>,
    last_change: Option<Json<DiffSummary>>,
    changed_at: Option<DateTime<Utc>>,
    recent_changes: Json<Vec<RecentChange>>,
}

impl TryFrom<SnapshotRow> for Snapshot {
    type Error = Error;

    fn try_from(row: SnapshotRow) -> Result<Self, Self::Error> {
        let records = row.records.0;
        let fingerprint = Fingerprint::from_hex(row.fingerprint);
        if records.fingerprint() != fingerprint {
            return Err(Error::store(
                "CorruptSnapshot",
                format!(
                    "stored fingerprint of {}/{} does not match its records",
                    row.subject_id, row.kind
                ),
            ));
        }
        Ok(Snapshot {
            subject_id: row.subject_id,
            kind: row.kind.parse()?,
            records,
            fingerprint,
            captured_at: row.captured_at,
            last_change: row.last_change.map(|change| change.0),
            changed_at: row.changed_at,
            recent_changes: row.recent_changes.0,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MonitoringRow {
    subject_id: Uuid,
    kind: String,
    enabled: bool,
    enabled_at: Option<DateTime<Utc>>,
    duration_secs: i64,
    warn_before_secs: i64,
    warned: bool,
}

impl TryFrom<MonitoringRow> for MonitoringState {
    type Error = Error;

    fn try_from(row: MonitoringRow) -> Result<Self, Self::Error> {
        Ok(MonitoringState {
            subject_id: row.subject_id,
            kind: row.kind.parse()?,
            enabled: row.enabled,
            enabled_at: row.enabled_at,
            duration_secs: row.duration_secs,
            warn_before_secs: row.warn_before_secs,
            warned: row.warned,
        })
    }
}

const UPSERT_MONITORING: &str = "INSERT INTO monitoring_state VALUES ($1, $2, $3, $4, $5, $6, $7)
    ON CONFLICT (subject_id, kind) DO UPDATE SET
        enabled = EXCLUDED.enabled,
        enabled_at = EXCLUDED.enabled_at,
        duration_secs = EXCLUDED.duration_secs,
        warn_before_secs = EXCLUDED.warn_before_secs,
        warned = EXCLUDED.warned";

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgStore {
    pg: PgPool,
}

impl PgStore {
    pub fn new(pg: PgPool) -> Self {
        Self { pg }
    }

    pub async fn connect(url: &str) -> Result<Self, Error> {
        let pg = PgPoolOptions::new().max_connections(8).connect(url).await?;
        Ok(Self::new(pg))
    }

    pub async fn migrate(&self) -> Result<(), Error> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pg).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_subject(&self, subject: &Subject, states: &[MonitoringState]) -> Result<(), Error> {
        let mut tx = self.pg.begin().await?;
        sqlx::query("INSERT INTO subjects VALUES ($1, $2, $3, $4, $5, $6, $7)")
            .bind(subject.id)
            .bind(&subject.login_enc)
            .bind(&subject.password_enc)
            .bind(&subject.display_name)
            .bind(subject.created_at)
            .bind(subject.last_checked_at)
            .bind(&subject.last_error)
            .execute(&mut tx)
            .await?;
        for state in states {
            sqlx::query(UPSERT_MONITORING)
                .bind(subject.id)
                .bind(state.kind.as_str())
                .bind(state.enabled)
                .bind(state.enabled_at)
                .bind(state.duration_secs)
                .bind(state.warn_before_secs)
                .bind(state.warned)
                .execute(&mut tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn subject(&self, id: SubjectId) -> Result<Option<Subject>, Error> {
        let subject = sqlx::query_as::<_, Subject>("SELECT * FROM subjects WHERE id = $1 LIMIT 1")
            .bind(id)
            .fetch_optional(&self.pg)
            .await?;
        Ok(subject)
    }

    async fn record_check(&self, id: SubjectId, at: DateTime<Utc>, error: Option<String>) -> Result<(), Error> {
        let res = match error {
            None => {
                sqlx::query("UPDATE subjects SET last_checked_at = $2, last_error = NULL WHERE id = $1")
                    .bind(id)
                    .bind(at)
                    .execute(&self.pg)
                    .await?
            }
            Some(error) => {
                sqlx::query("UPDATE subjects SET last_error = $2 WHERE id = $1")
                    .bind(id)
                    .bind(error)
                    .execute(&self.pg)
                    .await?
            }
        };
        if res.rows_affected() < 1 {
            return Err(Error::store("SubjectMissing", format!("subject {} is not stored", id)));
        }
        Ok(())
    }

    async fn delete_subject(&self, id: SubjectId) -> Result<bool, Error> {
        let mut tx = self.pg.begin().await?;
        sqlx::query("DELETE FROM monitoring_state WHERE subject_id = $1")
            .bind(id)
            .execute(&mut tx)
            .await?;
        sqlx::query("DELETE FROM snapshots WHERE subject_id = $1")
            .bind(id)
            .execute(&mut tx)
            .await?;
        let res = sqlx::query("DELETE FROM subjects WHERE id = $1")
            .bind(id)
            .execute(&mut tx)
            .await?;
        tx.commit().await?;
        Ok(res.rows_affected() >= 1)
    }

    async fn load_snapshot(&self, id: SubjectId, kind: PortalKind) -> Result<Option<Snapshot>, Error> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            "SELECT * FROM snapshots WHERE subject_id = $1 AND kind = $2 LIMIT 1",
        )
        .bind(id)
        .bind(kind.as_str())
        .fetch_optional(&self.pg)
        .await?;
        row.map(Snapshot::try_from).transpose()
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO snapshots
                (subject_id, kind, records, fingerprint, captured_at, last_change, changed_at, recent_changes)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (subject_id, kind) DO UPDATE SET
                records = EXCLUDED.records,
                fingerprint = EXCLUDED.fingerprint,
                captured_at = EXCLUDED.captured_at,
                last_change = EXCLUDED.last_change,
                changed_at = EXCLUDED.changed_at,
                recent_changes = EXCLUDED.recent_changes",
        )
        .bind(snapshot.subject_id)
        .bind(snapshot.kind.as_str())
        .bind(Json(&snapshot.records))
        .bind(snapshot.fingerprint.as_str())
        .bind(snapshot.captured_at)
        .bind(snapshot.last_change.as_ref().map(Json))
        .bind(snapshot.changed_at)
        .bind(Json(&snapshot.recent_changes))
        .execute(&self.pg)
        .await?;
        Ok(())
    }

    async fn touch_snapshot(&self, id: SubjectId, kind: PortalKind, at: DateTime<Utc>) -> Result<(), Error> {
        sqlx::query("UPDATE snapshots SET captured_at = $3 WHERE subject_id = $1 AND kind = $2")
            .bind(id)
            .bind(kind.as_str())
            .bind(at)
            .execute(&self.pg)
            .await?;
        Ok(())
    }

    async fn monitoring(&self, id: SubjectId, kind: PortalKind) -> Result<Option<MonitoringState>, Error> {
        let row = sqlx::query_as::<_, MonitoringRow>(
            "SELECT * FROM monitoring_state WHERE subject_id = $1 AND kind = $2 LIMIT 1",
        )
        .bind(id)
        .bind(kind.as_str())
        .fetch_optional(&self.pg)
        .await?;
        row.map(MonitoringState::try_from).transpose()
    }

    async fn save_monitoring(&self, state: &MonitoringState) -> Result<(), Error> {
        sqlx::query(UPSERT_MONITORING)
            .bind(state.subject_id)
            .bind(state.kind.as_str())
            .bind(state.enabled)
            .bind(state.enabled_at)
            .bind(state.duration_secs)
            .bind(state.warn_before_secs)
            .bind(state.warned)
            .execute(&self.pg)
            .await?;
        Ok(())
    }

    async fn active_monitoring(&self, kind: PortalKind) -> Result<Vec<MonitoringState>, Error> {
        let rows = sqlx::query_as::<_, MonitoringRow>(
            "SELECT * FROM monitoring_state WHERE kind = $1 AND enabled ORDER BY subject_id",
        )
        .bind(kind.as_str())
        .fetch_all(&self.pg)
        .await?;
        rows.into_iter().map(MonitoringState::try_from).collect()
    }
}
