use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::Store;
use crate::models::{MonitoringState, PortalKind, Snapshot, Subject, SubjectId};
use crate::Error;

#[derive(Default)]
struct Tables {
    subjects: HashMap<SubjectId, Subject>,
    snapshots: HashMap<(SubjectId, PortalKind), Snapshot>,
    monitoring: HashMap<(SubjectId, PortalKind), MonitoringState>,
}

impl Tables {
    fn ensure_subject(&self, id: SubjectId) -> Result<(), Error> {
        if self.subjects.contains_key(&id) {
            Ok(())
        } else {
            Err(Error::store("SubjectMissing", format!("subject {} is not stored", id)))
        }
    }
}

/// Process-local store. One lock over all tables, so every call is atomic.
#[derive(Default, Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_subject(&self, subject: &Subject, states: &[MonitoringState]) -> Result<(), Error> {
        let mut guard = self.inner.write();
        if guard.subjects.contains_key(&subject.id) {
            return Err(Error::store(
                "DuplicateSubject",
                format!("subject {} already exists", subject.id),
            ));
        }
        guard.subjects.insert(subject.id, subject.clone());
        for state in states {
            guard
                .monitoring
                .insert((subject.id, state.kind), MonitoringState {
                    subject_id: subject.id,
                    ..state.clone()
                });
        }
        Ok(())
    }

    async fn subject(&self, id: SubjectId) -> Result<Option<Subject>, Error> {
        Ok(self.inner.read().subjects.get(&id).cloned())
    }

    async fn record_check(&self, id: SubjectId, at: DateTime<Utc>, error: Option<String>) -> Result<(), Error> {
        let mut guard = self.inner.write();
        let subject = guard
            .subjects
            .get_mut(&id)
            .ok_or_else(|| Error::store("SubjectMissing", format!("subject {} is not stored", id)))?;
        match error {
            None => {
                subject.last_checked_at = Some(at);
                subject.last_error = None;
            }
            Some(error) => subject.last_error = Some(error),
        }
        Ok(())
    }

    async fn delete_subject(&self, id: SubjectId) -> Result<bool, Error> {
        let mut guard = self.inner.write();
        guard.snapshots.retain(|(subject_id, _), _| *subject_id != id);
        guard.monitoring.retain(|(subject_id, _), _| *subject_id != id);
        Ok(guard.subjects.remove(&id).is_some())
    }

    async fn load_snapshot(&self, id: SubjectId, kind: PortalKind) -> Result<Option<Snapshot>, Error> {
        Ok(self.inner.read().snapshots.get(&(id, kind)).cloned())
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), Error> {
        let mut guard = self.inner.write();
        guard.ensure_subject(snapshot.subject_id)?;
        guard
            .snapshots
            .insert((snapshot.subject_id, snapshot.kind), snapshot.clone());
        Ok(())
    }

    async fn touch_snapshot(&self, id: SubjectId, kind: PortalKind, at: DateTime<Utc>) -> Result<(), Error> {
        if let Some(snapshot) = self.inner.write().snapshots.get_mut(&(id, kind)) {
            snapshot.captured_at = at;
        }
        Ok(())
    }

    async fn monitoring(&self, id: SubjectId, kind: PortalKind) -> Result<Option<MonitoringState>, Error> {
        Ok(self.inner.read().monitoring.get(&(id, kind)).cloned())
    }

    async fn save_monitoring(&self, state: &MonitoringState) -> Result<(), Error> {
        let mut guard = self.inner.write();
        guard.ensure_subject(state.subject_id)?;
        guard
            .monitoring
            .insert((state.subject_id, state.kind), state.clone());
        Ok(())
    }

    async fn active_monitoring(&self, kind: PortalKind) -> Result<Vec<MonitoringState>, Error> {
        let guard = self.inner.read();
        let mut states: Vec<MonitoringState> = guard
            .monitoring
            .values()
            .filter(|state| state.kind == kind && state.enabled)
            .cloned()
            .collect();
        states.sort_by_key(|state| state.subject_id);
        Ok(states)
    }
}
