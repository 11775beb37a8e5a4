use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::detect::{DiffSummary, Notable};
use crate::models::{PortalKind, RecordSet, SubjectId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Changed,
    ExpiryWarning,
    Disabled,
    /// A user-actionable failure (bad credentials, unreadable page) first appeared.
    CheckFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Changed {
        changes: Vec<Notable>,
        diff: DiffSummary,
        records: RecordSet,
    },
    ExpiryWarning {
        days_left: i64,
        expires_at: DateTime<Utc>,
    },
    Disabled {
        enabled_at: Option<DateTime<Utc>>,
    },
    CheckFailed {
        error: &'static str,
        message: String,
    },
}

impl EventPayload {
    pub fn kind(&self) -> NotificationKind {
        match self {
            EventPayload::Changed { .. } => NotificationKind::Changed,
            EventPayload::ExpiryWarning { .. } => NotificationKind::ExpiryWarning,
            EventPayload::Disabled { .. } => NotificationKind::Disabled,
            EventPayload::CheckFailed { .. } => NotificationKind::CheckFailed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub subject_id: SubjectId,
    pub portal: PortalKind,
    pub kind: NotificationKind,
    pub payload: EventPayload,
    pub at: DateTime<Utc>,
}

impl Notification {
    pub fn new(subject_id: SubjectId, portal: PortalKind, payload: EventPayload, at: DateTime<Utc>) -> Self {
        Self {
            subject_id,
            portal,
            kind: payload.kind(),
            payload,
            at,
        }
    }
}

/// Outbound event stream. Sending never blocks the engine.
#[derive(Clone)]
pub struct Notifier {
    tx: UnboundedSender<Notification>,
}

impl Notifier {
    pub fn channel() -> (Notifier, UnboundedReceiver<Notification>) {
        let (tx, rx) = unbounded_channel();
        (Notifier { tx }, rx)
    }

    pub fn send(&self, notification: Notification) {
        let (subject_id, kind) = (notification.subject_id, notification.kind);
        if self.tx.send(notification).is_err() {
            log::warn!(
                "Dropped {:?} notification for subject {}: nobody is listening",
                kind,
                subject_id
            );
        }
    }
}
