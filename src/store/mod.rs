//! Persistence for subjects, snapshots and monitoring state.

mod memory;
mod pg;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{MonitoringState, PortalKind, Snapshot, Subject, SubjectId};
use crate::Error;

pub use memory::MemoryStore;
pub use pg::PgStore;

/// Three tables: subjects, snapshots by (subject, kind), monitoring state by (subject, kind).
///
/// Snapshots and monitoring rows belong to their subject; writing one for an
/// unknown subject fails with [`Error::StoreFailure`].
#[async_trait]
pub trait Store: Send + Sync {
    /// Inserts the subject together with its initial monitoring states.
    async fn insert_subject(&self, subject: &Subject, states: &[MonitoringState]) -> Result<(), Error>;

    async fn subject(&self, id: SubjectId) -> Result<Option<Subject>, Error>;

    /// `None` marks a successful check (sets `last_checked_at`, clears the
    /// error); `Some` only replaces `last_error`.
    async fn record_check(&self, id: SubjectId, at: DateTime<Utc>, error: Option<String>) -> Result<(), Error>;

    /// Removes the subject, its snapshots and its monitoring state at once.
    /// Returns whether the subject existed.
    async fn delete_subject(&self, id: SubjectId) -> Result<bool, Error>;

    async fn load_snapshot(&self, id: SubjectId, kind: PortalKind) -> Result<Option<Snapshot>, Error>;

    /// Upsert keyed by (subject, kind).
    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), Error>;

    /// Bumps `captured_at` of an unchanged snapshot.
    async fn touch_snapshot(&self, id: SubjectId, kind: PortalKind, at: DateTime<Utc>) -> Result<(), Error>;

    async fn monitoring(&self, id: SubjectId, kind: PortalKind) -> Result<Option<MonitoringState>, Error>;

    async fn save_monitoring(&self, state: &MonitoringState) -> Result<(), Error>;

    /// Enabled monitoring states of one kind.
    async fn active_monitoring(&self, kind: PortalKind) -> Result<Vec<MonitoringState>, Error>;
}
