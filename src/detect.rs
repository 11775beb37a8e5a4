use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Record, RecordSet, Snapshot};

const SNIPPET_CHARS: usize = 120;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Comparison {
    /// Nothing stored yet. Persisted silently.
    FirstSeen,
    Unchanged,
    Changed(DiffSummary),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub added: Vec<Record>,
    pub removed: Vec<Record>,
    pub modified: Vec<RowChange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowChange {
    pub key: String,
    pub before: Record,
    pub after: Record,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.modified.len()
    }

    /// Rows matched by natural key, so reordering alone never shows up here.
    pub fn between(old: &RecordSet, new: &RecordSet) -> Self {
        let mut diff = DiffSummary::default();
        let (old_rows, new_rows) = (old.rows(), new.rows());
        let (mut i, mut j) = (0, 0);

        while i < old_rows.len() && j < new_rows.len() {
            let (before, after) = (&old_rows[i], &new_rows[j]);
            match before.key.cmp(&after.key) {
                std::cmp::Ordering::Less => {
                    diff.removed.push(before.clone());
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    diff.added.push(after.clone());
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    if before != after {
                        diff.modified.push(RowChange {
                            key: after.key.clone(),
                            before: before.clone(),
                            after: after.clone(),
                        });
                    }
                    i += 1;
                    j += 1;
                }
            }
        }
        diff.removed.extend(old_rows[i..].iter().cloned());
        diff.added.extend(new_rows[j..].iter().cloned());
        diff
    }
}

/// What makes a row worth telling the owner about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    New,
    Grade,
    Feedback,
    GradeAndFeedback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notable {
    pub kind: ChangeKind,
    pub before: Option<Record>,
    pub after: Record,
}

fn field<'a>(row: &'a Record, name: &str) -> &'a str {
    row.details.get(name).map_or("", String::as_str)
}

/// Grade, or the percentage when no grade is shown.
fn shown_value(row: &Record) -> &str {
    if row.grade.is_empty() {
        field(row, "percentage")
    } else {
        &row.grade
    }
}

/// Rows of `diff` that carry a new non-empty grade, percentage or feedback.
///
/// Removed rows, cleared values and bookkeeping details (archive flag, links,
/// categories) never qualify. Course summary rows are left to their items.
pub fn notable(diff: &DiffSummary) -> Vec<Notable> {
    let added = diff
        .added
        .iter()
        .filter(|row| !row.is_course_summary())
        .filter(|row| !shown_value(row).is_empty() || !field(row, "feedback").is_empty())
        .map(|row| Notable {
            kind: ChangeKind::New,
            before: None,
            after: row.clone(),
        });

    let modified = diff
        .modified
        .iter()
        .filter(|change| !change.after.is_course_summary())
        .filter_map(|change| {
            let (before, after) = (&change.before, &change.after);
            let grade = (before.grade != after.grade || field(before, "percentage") != field(after, "percentage"))
                && !shown_value(after).is_empty();
            let feedback =
                field(before, "feedback") != field(after, "feedback") && !field(after, "feedback").is_empty();
            let kind = match (grade, feedback) {
                (true, true) => ChangeKind::GradeAndFeedback,
                (true, false) => ChangeKind::Grade,
                (false, true) => ChangeKind::Feedback,
                (false, false) => return None,
            };
            Some(Notable {
                kind,
                before: Some(before.clone()),
                after: after.clone(),
            })
        });

    let mut changes: Vec<Notable> = added.chain(modified).collect();
    changes.sort_by(|a, b| a.after.key.cmp(&b.after.key));
    changes
}

/// Compact entry of a snapshot's change history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentChange {
    pub at: DateTime<Utc>,
    pub key: String,
    pub term: String,
    pub course: String,
    pub title: String,
    pub kind: ChangeKind,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

impl RecentChange {
    pub fn of(change: &Notable, at: DateTime<Utc>) -> Self {
        let after = &change.after;
        let feedback = match change.kind {
            ChangeKind::Feedback | ChangeKind::GradeAndFeedback => Some(snippet(field(after, "feedback"))),
            ChangeKind::New if !field(after, "feedback").is_empty() => Some(snippet(field(after, "feedback"))),
            _ => None,
        };
        Self {
            at,
            key: after.key.clone(),
            term: after.term.clone(),
            course: after.course.clone(),
            title: after.title.clone(),
            kind: change.kind,
            value: shown_value(after).to_string(),
            feedback,
        }
    }
}

fn snippet(text: &str) -> String {
    if text.chars().count() <= SNIPPET_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(SNIPPET_CHARS).collect();
    format!("{}…", cut.trim_end())
}

pub fn compare(stored: Option<&Snapshot>, fresh: &RecordSet) -> Comparison {
    let stored = match stored {
        Some(stored) => stored,
        None => return Comparison::FirstSeen,
    };
    if stored.fingerprint == fresh.fingerprint() {
        return Comparison::Unchanged;
    }
    Comparison::Changed(DiffSummary::between(&stored.records, fresh))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PortalKind;
    use chrono::Utc;
    use uuid::Uuid;

    fn row(code: &str, grade: &str) -> Record {
        Record::new(format!("FIC 202501/{}", code), "FIC 202501", code)
            .titled(format!("{} title", code))
            .graded(grade)
    }

    fn stored(rows: Vec<Record>) -> Snapshot {
        Snapshot::capture(Uuid::new_v4(), PortalKind::FinalGrades, RecordSet::new(rows), Utc::now())
    }

    #[test]
    fn nothing_stored_is_first_seen() {
        let fresh = RecordSet::new(vec![row("CMPT120", "A")]);
        assert_eq!(compare(None, &fresh), Comparison::FirstSeen);
        assert_eq!(compare(None, &RecordSet::default()), Comparison::FirstSeen);
    }

    #[test]
    fn permutation_is_unchanged() {
        let snapshot = stored(vec![row("CMPT120", "B+"), row("MATH151", "A")]);
        let fresh = RecordSet::new(vec![row("MATH151", "A"), row("CMPT120", "B+")]);
        assert_eq!(compare(Some(&snapshot), &fresh), Comparison::Unchanged);
    }

    #[test]
    fn grade_change_is_reported_by_key() {
        let snapshot = stored(vec![row("CMPT120", "B+"), row("MATH151", "A")]);
        let fresh = RecordSet::new(vec![row("MATH151", "A"), row("CMPT120", "A-")]);

        let diff = match compare(Some(&snapshot), &fresh) {
            Comparison::Changed(diff) => diff,
            other => panic!("expected change, got {:?}", other),
        };
        assert!(diff.added.is_empty());
        assert!(diff.removed.is_empty());
        assert_eq!(diff.modified.len(), 1);
        assert_eq!(diff.modified[0].after.course, "CMPT120");
        assert_eq!(diff.modified[0].before.grade, "B+");
        assert_eq!(diff.modified[0].after.grade, "A-");
    }

    #[test]
    fn added_and_removed_rows() {
        let snapshot = stored(vec![row("CMPT120", "A"), row("ECON103", "")]);
        let fresh = RecordSet::new(vec![row("CMPT120", "A"), row("MACM101", "B")]);

        let diff = DiffSummary::between(&snapshot.records, &fresh);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].course, "MACM101");
        assert_eq!(diff.removed.len(), 1);
        assert_eq!(diff.removed[0].course, "ECON103");
        assert!(diff.modified.is_empty());
        assert_eq!(diff.len(), 2);
    }

    fn item(key: &str, grade: &str) -> Record {
        Record::new(format!("4401/{}", key), "FIC 202503", "CMPT135")
            .titled(key)
            .graded(grade)
    }

    fn notable_between(old: Vec<Record>, new: Vec<Record>) -> Vec<Notable> {
        notable(&DiffSummary::between(&RecordSet::new(old), &RecordSet::new(new)))
    }

    #[test]
    fn new_row_without_a_value_is_quiet() {
        let changes = notable_between(vec![row("CMPT120", "B+")], vec![row("CMPT120", "B+"), row("MACM101", "")]);
        assert!(changes.is_empty());

        let changes = notable_between(vec![row("CMPT120", "B+")], vec![row("CMPT120", "B+"), row("MACM101", "A")]);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::New);
        assert_eq!(changes[0].before, None);
        assert_eq!(changes[0].after.course, "MACM101");
    }

    #[test]
    fn new_row_with_percentage_or_feedback_counts() {
        let changes = notable_between(
            vec![],
            vec![
                item("row_1", "").detail("percentage", "90.00 %"),
                item("row_2", "").detail("feedback", "See me"),
                item("row_3", "").detail("range", "0–10"),
            ],
        );
        let keys: Vec<_> = changes.iter().map(|c| c.after.key.as_str()).collect();
        assert_eq!(keys, vec!["4401/row_1", "4401/row_2"]);
    }

    #[test]
    fn cleared_and_removed_grades_are_quiet() {
        let changes = notable_between(vec![row("CMPT120", "B+"), row("MACM101", "")], vec![row("CMPT120", "")]);
        assert!(changes.is_empty());
    }

    #[test]
    fn changed_grade_counts() {
        let changes = notable_between(vec![row("CMPT120", "B+")], vec![row("CMPT120", "A-")]);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Grade);
        assert_eq!(changes[0].before.as_ref().unwrap().grade, "B+");

        let changes = notable_between(
            vec![item("row_1", "").detail("percentage", "80.00 %")],
            vec![item("row_1", "").detail("percentage", "85.00 %")],
        );
        assert_eq!(changes[0].kind, ChangeKind::Grade);
    }

    #[test]
    fn feedback_changes_are_classified() {
        let changes = notable_between(
            vec![item("row_1", "9.00")],
            vec![item("row_1", "9.00").detail("feedback", "Nice work")],
        );
        assert_eq!(changes[0].kind, ChangeKind::Feedback);

        let changes = notable_between(
            vec![item("row_1", "7.00")],
            vec![item("row_1", "9.00").detail("feedback", "Regraded")],
        );
        assert_eq!(changes[0].kind, ChangeKind::GradeAndFeedback);

        let changes = notable_between(
            vec![item("row_1", "9.00").detail("feedback", "Nice work")],
            vec![item("row_1", "9.00")],
        );
        assert!(changes.is_empty());
    }

    #[test]
    fn bookkeeping_details_are_quiet() {
        let changes = notable_between(
            vec![item("row_1", "9.00").detail("link", "https://a").detail("archived", "false")],
            vec![item("row_1", "9.00").detail("link", "https://b").detail("archived", "true")],
        );
        assert!(changes.is_empty());
    }

    #[test]
    fn course_summary_rows_are_left_to_items() {
        let course = |grade: &str| Record::new("4401", "FIC 202503", "CMPT135").graded(grade).course_summary();
        assert!(notable_between(vec![course("80 %")], vec![course("88 %")]).is_empty());
        assert!(notable_between(vec![], vec![course("88 %")]).is_empty());
    }

    #[test]
    fn recent_change_keeps_a_feedback_snippet() {
        let long = "x".repeat(200);
        let changes = notable_between(
            vec![item("row_1", "7.00")],
            vec![item("row_1", "")
                .detail("percentage", "70 %")
                .detail("feedback", long.as_str())],
        );
        let at = Utc::now();
        let entry = RecentChange::of(&changes[0], at);
        assert_eq!(entry.kind, ChangeKind::GradeAndFeedback);
        assert_eq!(entry.value, "70 %");
        assert_eq!(entry.at, at);
        let feedback = entry.feedback.unwrap();
        assert_eq!(feedback.chars().count(), SNIPPET_CHARS + 1);
        assert!(feedback.ends_with('…'));

        let changes = notable_between(vec![row("CMPT120", "B")], vec![row("CMPT120", "A")]);
        assert_eq!(RecentChange::of(&changes[0], at).feedback, None);
    }
}
