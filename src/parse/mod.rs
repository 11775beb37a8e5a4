//! Raw portal pages to normalized record sets. No I/O happens here.

pub mod fic;
pub mod moodle;

use chrono::{DateTime, Utc};
use scraper::ElementRef;

use crate::models::RecordSet;
use crate::portal::RawContent;
use crate::Error;

const DASHES: [&str; 3] = ["-", "–", "—"];

/// Inputs besides the page itself.
#[derive(Debug, Clone, Copy)]
pub struct ParseContext<'a> {
    pub now: DateTime<Utc>,
    /// Most recent terms whose Moodle courses count as current.
    pub active_terms: u32,
    /// Records of the last successful check, reused for course reports that
    /// could not be read this time.
    pub previous: Option<&'a RecordSet>,
}

impl<'a> ParseContext<'a> {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now,
            active_terms: 1,
            previous: None,
        }
    }
}

pub fn parse(raw: &RawContent, ctx: &ParseContext<'_>) -> Result<RecordSet, Error> {
    match raw {
        RawContent::FinalGrades(raw) => fic::final_grades(&raw.html),
        RawContent::CourseActivity(raw) => moodle::course_activity(raw, ctx),
    }
}

pub(crate) fn clean(text: &str) -> String {
    text.replace('\u{a0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub(crate) fn text_of(el: ElementRef<'_>) -> String {
    clean(&el.text().collect::<Vec<_>>().join(" "))
}

/// Dash placeholders mean "no value".
pub(crate) fn value_of(el: ElementRef<'_>) -> String {
    let text = text_of(el);
    if DASHES.contains(&text.as_str()) {
        String::new()
    } else {
        text
    }
}

pub(crate) fn has_class(el: &ElementRef<'_>, class: &str) -> bool {
    el.value().classes().any(|c| c == class)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_collapses_whitespace_and_nbsp() {
        assert_eq!(clean("  CMPT\u{a0}120 \n\t Intro  "), "CMPT 120 Intro");
        assert_eq!(clean(""), "");
    }
}
