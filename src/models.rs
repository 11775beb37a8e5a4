use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::detect::{DiffSummary, RecentChange};
use crate::Error;

pub type SubjectId = Uuid;

/// Entries kept in a snapshot's change history.
pub const RECENT_CHANGES_LIMIT: usize = 50;

const SCOPE: &str = "scope";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortalKind {
    /// Final grades published on the student portal.
    FinalGrades,
    /// Per-course grade items on Moodle.
    CourseActivity,
}

impl PortalKind {
    pub const ALL: [PortalKind; 2] = [PortalKind::FinalGrades, PortalKind::CourseActivity];

    pub fn as_str(&self) -> &'static str {
        match self {
            PortalKind::FinalGrades => "final_grades",
            PortalKind::CourseActivity => "course_activity",
        }
    }
}

impl Display for PortalKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PortalKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "final_grades" => Ok(PortalKind::FinalGrades),
            "course_activity" => Ok(PortalKind::CourseActivity),
            other => Err(Error::InvalidPayload {
                message: format!("Unknown portal kind `{}`", other),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subject {
    pub id: SubjectId,
    #[serde(skip_serializing)]
    pub login_enc: Vec<u8>,
    #[serde(skip_serializing)]
    pub password_enc: Vec<u8>,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Decrypted portal login. Lives for one authentication attempt.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub login: String,
    pub password: String,
}

impl Debug for Credential {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// One normalized row. `key` is unique within a [`RecordSet`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    pub term: String,
    pub course: String,
    pub title: String,
    pub grade: String,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
}

impl Record {
    pub fn new<K, T, C>(key: K, term: T, course: C) -> Self
    where
        K: Into<String>,
        T: Into<String>,
        C: Into<String>,
    {
        Self {
            key: key.into(),
            term: term.into(),
            course: course.into(),
            title: String::new(),
            grade: String::new(),
            details: BTreeMap::new(),
        }
    }

    pub fn titled<S: Into<String>>(mut self, title: S) -> Self {
        self.title = title.into();
        self
    }

    pub fn graded<S: Into<String>>(mut self, grade: S) -> Self {
        self.grade = grade.into();
        self
    }

    /// Empty values are dropped so that absent and blank cells hash the same.
    pub fn detail<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        let value = value.into();
        if !value.is_empty() {
            self.details.insert(name.into(), value);
        }
        self
    }

    /// Marks a per-course row that sits above its grade items.
    pub fn course_summary(self) -> Self {
        self.detail(SCOPE, "course")
    }

    pub fn is_course_summary(&self) -> bool {
        self.details.get(SCOPE).map_or(false, |scope| scope == "course")
    }
}

/// Rows in canonical order: ascending by `key`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Record>", into = "Vec<Record>")]
pub struct RecordSet {
    rows: Vec<Record>,
}

impl RecordSet {
    pub fn new(mut rows: Vec<Record>) -> Self {
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        let mut canonical: Vec<Record> = Vec::with_capacity(rows.len());
        for row in rows {
            match canonical.last_mut() {
                Some(last) if last.key == row.key => *last = row,
                _ => canonical.push(row),
            }
        }
        Self { rows: canonical }
    }

    pub fn rows(&self) -> &[Record] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Record> {
        self.rows
            .binary_search_by(|row| row.key.as_str().cmp(key))
            .ok()
            .map(|idx| &self.rows[idx])
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self)
    }
}

impl From<Vec<Record>> for RecordSet {
    fn from(rows: Vec<Record>) -> Self {
        RecordSet::new(rows)
    }
}

impl From<RecordSet> for Vec<Record> {
    fn from(set: RecordSet) -> Self {
        set.rows
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    const VERSION: &'static [u8] = b"gradewatch/records/v1";

    pub fn of(set: &RecordSet) -> Self {
        let mut hasher: Sha256 = Digest::new();
        hasher.update(Self::VERSION);
        hasher.update((set.rows.len() as u64).to_le_bytes());
        for row in &set.rows {
            feed(&mut hasher, &row.key);
            feed(&mut hasher, &row.term);
            feed(&mut hasher, &row.course);
            feed(&mut hasher, &row.title);
            feed(&mut hasher, &row.grade);
            hasher.update((row.details.len() as u64).to_le_bytes());
            for (name, value) in &row.details {
                feed(&mut hasher, name);
                feed(&mut hasher, value);
            }
        }
        Fingerprint(hex::encode(hasher.finalize()))
    }

    pub fn from_hex<S: Into<String>>(hex: S) -> Self {
        Fingerprint(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn feed(hasher: &mut Sha256, field: &str) {
    hasher.update((field.len() as u64).to_le_bytes());
    hasher.update(field.as_bytes());
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub subject_id: SubjectId,
    pub kind: PortalKind,
    pub records: RecordSet,
    pub fingerprint: Fingerprint,
    pub captured_at: DateTime<Utc>,
    pub last_change: Option<DiffSummary>,
    pub changed_at: Option<DateTime<Utc>>,
    /// Newest first, at most [`RECENT_CHANGES_LIMIT`] entries.
    #[serde(default)]
    pub recent_changes: Vec<RecentChange>,
}

impl Snapshot {
    pub fn capture(
        subject_id: SubjectId,
        kind: PortalKind,
        records: RecordSet,
        captured_at: DateTime<Utc>,
    ) -> Self {
        let fingerprint = records.fingerprint();
        Self {
            subject_id,
            kind,
            records,
            fingerprint,
            captured_at,
            last_change: None,
            changed_at: None,
            recent_changes: Vec::new(),
        }
    }

    pub fn with_change(mut self, diff: DiffSummary, at: DateTime<Utc>) -> Self {
        self.last_change = Some(diff);
        self.changed_at = Some(at);
        self
    }

    pub fn with_history(mut self, fresh: Vec<RecentChange>, earlier: Vec<RecentChange>) -> Self {
        let mut merged = fresh;
        merged.extend(earlier);
        merged.truncate(RECENT_CHANGES_LIMIT);
        self.recent_changes = merged;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringState {
    pub subject_id: SubjectId,
    pub kind: PortalKind,
    pub enabled: bool,
    pub enabled_at: Option<DateTime<Utc>>,
    pub duration_secs: i64,
    pub warn_before_secs: i64,
    pub warned: bool,
}

impl MonitoringState {
    pub fn new(subject_id: SubjectId, kind: PortalKind, duration: Duration, warn_before: Duration) -> Self {
        Self {
            subject_id,
            kind,
            enabled: false,
            enabled_at: None,
            duration_secs: duration.num_seconds(),
            warn_before_secs: warn_before.num_seconds(),
            warned: false,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::seconds(self.duration_secs)
    }

    pub fn warn_before(&self) -> Duration {
        Duration::seconds(self.warn_before_secs)
    }

    /// Re-enabling always starts a fresh period.
    pub fn enable(&mut self, now: DateTime<Utc>) {
        self.enabled = true;
        self.enabled_at = Some(now);
        self.warned = false;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
        self.warned = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grade(term: &str, code: &str, grade: &str) -> Record {
        Record::new(format!("{}/{}", term, code), term, code).graded(grade)
    }

    #[test]
    fn record_sets_are_sorted_by_key() {
        let set = RecordSet::new(vec![
            grade("FIC 202503", "MACM101", "B"),
            grade("FIC 202501", "CMPT120", "A"),
        ]);
        let keys: Vec<_> = set.rows().iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["FIC 202501/CMPT120", "FIC 202503/MACM101"]);
        assert_eq!(set.get("FIC 202503/MACM101").unwrap().grade, "B");
        assert!(set.get("missing").is_none());
    }

    #[test]
    fn duplicate_keys_keep_last_row() {
        let set = RecordSet::new(vec![
            grade("FIC 202501", "CMPT120", "B"),
            grade("FIC 202501", "CMPT120", "A"),
        ]);
        assert_eq!(set.len(), 1);
        assert_eq!(set.rows()[0].grade, "A");
    }

    #[test]
    fn fingerprint_is_deterministic_and_order_free() {
        let a = RecordSet::new(vec![
            grade("FIC 202501", "CMPT120", "A"),
            grade("FIC 202501", "MATH151", "B+").detail("credits", "3"),
        ]);
        let b = RecordSet::new(vec![
            grade("FIC 202501", "MATH151", "B+").detail("credits", "3"),
            grade("FIC 202501", "CMPT120", "A"),
        ]);
        assert_eq!(a.fingerprint(), a.fingerprint());
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().as_str().len(), 64);
    }

    #[test]
    fn fingerprint_separates_field_boundaries() {
        let a = RecordSet::new(vec![Record::new("k", "ab", "c")]);
        let b = RecordSet::new(vec![Record::new("k", "a", "bc")]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_survives_json_round_trip() {
        let set = RecordSet::new(vec![
            grade("FIC 202503", "MACM101", "").detail("credits", "3"),
            grade("FIC 202501", "CMPT120", "A-"),
        ]);
        let json = serde_json::to_string(&set).unwrap();
        let back: RecordSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
        assert_eq!(back.fingerprint(), set.fingerprint());
    }

    #[test]
    fn fingerprint_is_stable_across_builds() {
        let set = RecordSet::new(vec![
            Record::new("FIC 202501/CMPT120", "FIC 202501", "CMPT120")
                .titled("Intro to Computing")
                .graded("A-")
                .detail("credits", "3"),
            Record::new("FIC 202501/MATH151", "FIC 202501", "MATH151").graded("B+"),
        ]);
        assert_eq!(set.fingerprint().as_str(), "c67a4862082447bc4d8b5574fe9ec26ece2f576ed0e85f2929fbdcb4fabcb14a");
        assert_eq!(RecordSet::default().fingerprint().as_str(), "4123752700ef50f2d3ad46a4f5f282bc6b72525280472f8eb377ea63fba1e088");
    }

    #[test]
    fn history_is_newest_first_and_capped() {
        use crate::detect::{ChangeKind, RecentChange};

        let at = Utc::now();
        let entry = |n: usize| RecentChange {
            at: at + Duration::seconds(n as i64),
            key: format!("4401/row_{}", n),
            term: "FIC 202503".to_string(),
            course: "CMPT135".to_string(),
            title: format!("Quiz {}", n),
            kind: ChangeKind::Grade,
            value: "9.00".to_string(),
            feedback: None,
        };
        let earlier: Vec<RecentChange> = (0..RECENT_CHANGES_LIMIT).rev().map(entry).collect();
        let fresh = vec![entry(100), entry(101)];

        let snapshot = Snapshot::capture(Uuid::new_v4(), PortalKind::CourseActivity, RecordSet::default(), at)
            .with_history(fresh, earlier);
        assert_eq!(snapshot.recent_changes.len(), RECENT_CHANGES_LIMIT);
        assert_eq!(snapshot.recent_changes[0].key, "4401/row_100");
        assert_eq!(snapshot.recent_changes[1].key, "4401/row_101");
        assert_eq!(snapshot.recent_changes[2].key, format!("4401/row_{}", RECENT_CHANGES_LIMIT - 1));
        assert_eq!(snapshot.recent_changes.last().unwrap().key, "4401/row_2");
    }

    #[test]
    fn course_summary_flag_is_a_detail() {
        let row = Record::new("4401", "FIC 202503", "CMPT135").course_summary();
        assert!(row.is_course_summary());
        assert!(!Record::new("4401/row_1", "FIC 202503", "CMPT135").is_course_summary());
    }

    #[test]
    fn empty_details_are_not_stored() {
        let row = Record::new("k", "t", "c").detail("feedback", "");
        assert!(row.details.is_empty());
    }

    #[test]
    fn portal_kind_round_trips_through_str() {
        for kind in PortalKind::ALL {
            assert_eq!(kind.as_str().parse::<PortalKind>().unwrap(), kind);
        }
        assert!("grades".parse::<PortalKind>().is_err());
    }

    #[test]
    fn credential_debug_hides_password() {
        let cred = Credential {
            login: "student".into(),
            password: "hunter2".into(),
        };
        assert!(!format!("{:?}", cred).contains("hunter2"));
    }

    #[test]
    fn enabling_resets_period() {
        let now = Utc::now();
        let mut state = MonitoringState::new(Uuid::new_v4(), PortalKind::FinalGrades, Duration::days(14), Duration::days(1));
        state.enable(now - Duration::days(5));
        state.warned = true;
        state.enable(now);
        assert!(state.enabled);
        assert_eq!(state.enabled_at, Some(now));
        assert!(!state.warned);
    }
}
