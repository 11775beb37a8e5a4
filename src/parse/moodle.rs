use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Datelike, FixedOffset, Utc};
use lazy_static::lazy_static;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use sha2::{Digest, Sha256};

use super::{clean, has_class, text_of, value_of, ParseContext};
use crate::models::{Record, RecordSet};
use crate::portal::CourseActivityRaw;
use crate::Error;

const PACIFIC_OFFSET_SECS: i32 = 8 * 3600;
const MAX_ACTIVE_TERMS: u32 = 6;

lazy_static! {
    static ref OVERVIEW: Selector = Selector::parse("table#overview-grade").expect("overview selector");
    static ref REPORT: Selector = Selector::parse("table.user-grade").expect("report selector");
    static ref ROW: Selector = Selector::parse("tr").expect("row selector");
    static ref NAME_CELL: Selector = Selector::parse("th.c0, td.c0").expect("name cell selector");
    static ref GRADE_CELL: Selector = Selector::parse("td.c1").expect("grade cell selector");
    static ref LINK: Selector = Selector::parse("a").expect("link selector");
    static ref HEADER: Selector = Selector::parse("th").expect("header selector");
    static ref CELL: Selector = Selector::parse("td").expect("cell selector");
    static ref ITEM_HEADER: Selector = Selector::parse(".gradeitemheader").expect("item header selector");
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourseOverview {
    pub course_id: i64,
    pub name: String,
    pub url: Url,
    pub grade: String,
    pub term: String,
    pub code: String,
    pub archived: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GradeItem {
    pub item_id: String,
    pub name: String,
    pub grade: String,
    pub range: String,
    pub percentage: String,
    pub feedback: String,
    pub link: Option<String>,
    pub level: u32,
    pub category_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Grade,
    Range,
    Percentage,
    Feedback,
    Other,
}

impl Column {
    fn from_header(text: &str) -> Self {
        let text = text.to_lowercase();
        if text.starts_with("grade") && !text.contains("item") {
            Column::Grade
        } else if text.contains("range") {
            Column::Range
        } else if text.contains("percentage") {
            Column::Percentage
        } else if text.contains("feedback") {
            Column::Feedback
        } else {
            Column::Other
        }
    }
}

/// Moodle sometimes shows this notice right after login even for enrolled students.
pub fn shows_not_enrolled(html: &str) -> bool {
    let flat = clean(&html.to_lowercase());
    (flat.contains("not enrolled") && flat.contains("courses"))
        || flat.contains("you are not enrolled in, nor teaching any courses on this site")
}

/// Splits `FIC 202503 CMPT135_YEJI Title` into `("FIC 202503", "CMPT135")`.
/// Falls back to `("Moodle", <first code-looking word>)`.
pub fn split_course_label(name: &str) -> (String, String) {
    let upper = clean(name).to_uppercase();
    let words: Vec<&str> = upper.split(' ').collect();

    if words.len() >= 3
        && words[0] == "FIC"
        && words[1].len() == 6
        && words[1].chars().all(|c| c.is_ascii_digit())
    {
        let code: String = words[2]
            .split('_')
            .next()
            .unwrap_or("")
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        return (format!("FIC {}", words[1]), code);
    }

    let code = words
        .iter()
        .map(|w| w.trim_matches(|c: char| !c.is_ascii_alphanumeric()))
        .find(|w| looks_like_course_code(w))
        .unwrap_or("");
    ("Moodle".to_string(), code.to_string())
}

fn looks_like_course_code(word: &str) -> bool {
    let letters = word.chars().take_while(|c| c.is_ascii_uppercase()).count();
    let digits = word.len() - letters;
    (2..=6).contains(&letters)
        && (2..=4).contains(&digits)
        && word[letters..].chars().all(|c| c.is_ascii_digit())
}

pub fn overview_courses(html: &str, base: &Url) -> Result<Vec<CourseOverview>, Error> {
    let doc = Html::parse_document(html);
    let table = match doc.select(&OVERVIEW).next() {
        Some(table) => table,
        None if shows_not_enrolled(html) => return Ok(Vec::new()),
        None => return Err(Error::parse("grade overview table not found")),
    };

    let mut seen = HashSet::new();
    let mut courses = Vec::new();
    for tr in table.select(&ROW) {
        let (name_cell, grade_cell) = match (tr.select(&NAME_CELL).next(), tr.select(&GRADE_CELL).next()) {
            (Some(name), Some(grade)) => (name, grade),
            _ => continue,
        };
        if text_of(name_cell).to_lowercase().starts_with("course name") {
            continue;
        }
        let link = match name_cell.select(&LINK).next() {
            Some(link) => link,
            None => continue,
        };
        let href = link.value().attr("href").unwrap_or("").trim();
        if href.is_empty() || href == "#" || href == "/" || !href.contains("course/user.php") {
            continue;
        }
        let url = match base.join(href) {
            Ok(url) => url,
            Err(_) => continue,
        };
        let name = text_of(link);
        if name.is_empty() {
            continue;
        }
        let course_id = url
            .query_pairs()
            .find(|(key, _)| key == "id")
            .and_then(|(_, value)| value.parse::<i64>().ok())
            .unwrap_or(0);
        if course_id <= 0 || !seen.insert(course_id) {
            continue;
        }

        let mut grade = value_of(grade_cell);
        // Malformed exports sometimes leak course titles into the grade cell.
        if grade.contains("FIC") {
            grade.clear();
        }
        let (term, code) = split_course_label(&name);
        let archived = name.to_lowercase().contains("(archived)") || code.is_empty();
        courses.push(CourseOverview {
            course_id,
            name,
            url,
            grade,
            term,
            code,
            archived,
        });
    }
    Ok(courses)
}

fn level_of<'a>(classes: impl Iterator<Item = &'a str>) -> u32 {
    classes
        .filter_map(|c| c.strip_prefix("level"))
        .find_map(|n| n.parse().ok())
        .unwrap_or(0)
}

fn category_id(token: &str) -> Option<&str> {
    let digits = token.strip_prefix("cat_")?;
    let end = digits.find(|c: char| !c.is_ascii_digit()).unwrap_or(digits.len());
    if end == 0 {
        None
    } else {
        Some(&digits[..end])
    }
}

fn row_id(id: &str) -> Option<String> {
    let digits = id.strip_prefix("row_")?;
    let end = digits.find(|c: char| !c.is_ascii_digit()).unwrap_or(digits.len());
    if end == 0 {
        None
    } else {
        Some(format!("row_{}", &digits[..end]))
    }
}

fn strip_toggles(name: &str) -> String {
    clean(name)
        .split(' ')
        .filter(|w| !w.eq_ignore_ascii_case("collapse") && !w.eq_ignore_ascii_case("expand"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_category_header(th: &ElementRef<'_>) -> bool {
    th.value().id().map_or(false, |id| id.starts_with("cat_")) && has_class(th, "category")
}

/// Parses one course's "user report" (`course/user.php?mode=grade`).
pub fn course_report(html: &str) -> Result<Vec<GradeItem>, Error> {
    let doc = Html::parse_document(html);
    let table = doc
        .select(&REPORT)
        .next()
        .ok_or_else(|| Error::parse("course grade report table not found"))?;
    let rows: Vec<ElementRef> = table.select(&ROW).collect();

    let header = rows
        .iter()
        .find(|tr| {
            let ths: Vec<ElementRef> = tr.select(&HEADER).collect();
            !ths.is_empty() && ths.iter().all(|th| has_class(th, "header"))
        })
        .or_else(|| rows.first());
    let columns: Vec<Column> = header
        .map(|tr| {
            tr.select(&HEADER)
                .skip(1)
                .map(|th| Column::from_header(&text_of(th)))
                .collect()
        })
        .unwrap_or_default();

    let mut categories: HashMap<String, (u32, String)> = HashMap::new();
    for tr in &rows {
        let th = match tr.select(&HEADER).next() {
            Some(th) if is_category_header(&th) => th,
            _ => continue,
        };
        let id = match th.value().id().and_then(category_id) {
            Some(id) => id.to_string(),
            None => continue,
        };
        let name = strip_toggles(&text_of(th));
        if !name.is_empty() {
            categories.insert(id, (level_of(th.value().classes()), name));
        }
    }

    let mut items = Vec::new();
    for tr in &rows {
        if has_class(tr, "spacer") {
            continue;
        }
        let th = match tr.select(&HEADER).next() {
            Some(th) => th,
            None => continue,
        };
        if has_class(&th, "header") || is_category_header(&th) {
            continue;
        }

        let raw_id = th.value().id().unwrap_or("");
        let title = text_of(th);
        let item_id = row_id(raw_id).unwrap_or_else(|| {
            let classes: Vec<&str> = tr.value().classes().collect();
            let mut hasher: Sha256 = Digest::new();
            hasher.update(format!("{}|{}|{}", raw_id, classes.join("|"), title).as_bytes());
            format!("row_{}", &hex::encode(hasher.finalize())[..10])
        });

        let item_header = th.select(&ITEM_HEADER).next();
        let name = item_header
            .and_then(|h| h.value().attr("title"))
            .map(clean)
            .filter(|t| !t.is_empty())
            .or_else(|| item_header.map(text_of))
            .unwrap_or(title);
        let link = item_header
            .filter(|h| h.value().name() == "a")
            .and_then(|h| h.value().attr("href"))
            .filter(|href| !href.is_empty())
            .map(str::to_string);

        let mut path: Vec<(u32, String)> = tr
            .value()
            .classes()
            .filter_map(category_id)
            .filter_map(|id| categories.get(id).cloned())
            .collect();
        path.sort_by_key(|(level, _)| *level);
        let category_path = path
            .into_iter()
            .map(|(_, name)| name)
            .collect::<Vec<_>>()
            .join(" > ");

        let mut item = GradeItem {
            item_id,
            name,
            link,
            level: level_of(th.value().classes()),
            category_path,
            ..GradeItem::default()
        };
        for (idx, td) in tr.select(&CELL).enumerate() {
            let slot = match columns.get(idx) {
                Some(Column::Grade) => &mut item.grade,
                Some(Column::Range) => &mut item.range,
                Some(Column::Percentage) => &mut item.percentage,
                Some(Column::Feedback) => &mut item.feedback,
                _ => continue,
            };
            *slot = value_of(td);
        }
        items.push(item);
    }
    Ok(items)
}

/// Course grade from the overview, else from the "Course total" item.
fn course_grade(overview_grade: &str, items: &[GradeItem]) -> String {
    if !overview_grade.is_empty() {
        return overview_grade.to_string();
    }
    items
        .iter()
        .find(|item| item.name.eq_ignore_ascii_case("course total"))
        .map(|item| {
            if item.grade.is_empty() {
                item.percentage.clone()
            } else {
                item.grade.clone()
            }
        })
        .unwrap_or_default()
}

/// `FIC 202503` to `202503`.
fn term_code(label: &str) -> Option<u32> {
    label
        .split_whitespace()
        .find(|word| word.len() == 6 && word.chars().all(|c| c.is_ascii_digit()))
        .and_then(|word| word.parse().ok())
}

/// Term in effect at `now` as `YYYYTT`: January to April is 01, May to
/// August 02, September to December 03. Campus time is taken as UTC-8.
pub fn current_term(now: DateTime<Utc>) -> u32 {
    let local = match FixedOffset::west_opt(PACIFIC_OFFSET_SECS) {
        Some(offset) => now.with_timezone(&offset).naive_local(),
        None => now.naive_utc(),
    };
    let term = match local.month() {
        1..=4 => 1,
        5..=8 => 2,
        _ => 3,
    };
    local.year().max(0) as u32 * 100 + term
}

fn term_before(code: u32, steps: u32) -> u32 {
    let (mut year, mut term) = (code / 100, code % 100);
    for _ in 0..steps {
        if term <= 1 {
            year = year.saturating_sub(1);
            term = 3;
        } else {
            term -= 1;
        }
    }
    year * 100 + term
}

/// Archived unless the course has a code, Moodle does not label it archived,
/// and its term is one of the `active_terms` most recent ones.
pub fn is_archived(course: &CourseOverview, now: DateTime<Utc>, active_terms: u32) -> bool {
    if course.archived || course.code.is_empty() {
        return true;
    }
    let code = match term_code(&course.term) {
        Some(code) => code,
        None => return true,
    };
    let keep = active_terms.clamp(1, MAX_ACTIVE_TERMS);
    code < term_before(current_term(now), keep - 1)
}

/// Item rows of `course_id` from the last stored records.
fn carried_items(previous: Option<&RecordSet>, course_id: i64) -> Vec<Record> {
    let prefix = format!("{}/", course_id);
    previous
        .map(|set| {
            set.rows()
                .iter()
                .filter(|row| row.key.starts_with(&prefix))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

/// One row per course (key `course_id`) and one per grade item (key `course_id/item_id`).
///
/// A course whose report could not be fetched or read keeps its overview row,
/// flagged with an `error` detail, and its previously stored items.
pub fn course_activity(raw: &CourseActivityRaw, ctx: &ParseContext<'_>) -> Result<RecordSet, Error> {
    let courses = overview_courses(&raw.overview_html, &raw.overview_url)?;
    let mut rows = Vec::new();

    for course in courses {
        let code = if course.code.is_empty() {
            format!("course_{}", course.course_id)
        } else {
            course.code.clone()
        };
        let summary = Record::new(course.course_id.to_string(), course.term.as_str(), code.as_str())
            .titled(course.name.as_str())
            .detail("archived", is_archived(&course, ctx.now, ctx.active_terms).to_string())
            .course_summary();

        let items = match raw.reports.iter().find(|report| report.course_id == course.course_id) {
            Some(report) => match &report.page {
                Ok(html) => course_report(html),
                Err(err) => Err(err.clone()),
            },
            None => Err(Error::fetch(format!("no grade report for course {}", course.course_id))),
        };
        let items = match items {
            Ok(items) => items,
            Err(err) => {
                log::warn!("Keeping last known items of course {}: {}", course.course_id, err);
                rows.push(
                    summary
                        .graded(course.grade.as_str())
                        .detail("error", err.name()),
                );
                rows.extend(carried_items(ctx.previous, course.course_id));
                continue;
            }
        };

        rows.push(summary.graded(course_grade(&course.grade, &items)));
        for item in items {
            rows.push(
                Record::new(
                    format!("{}/{}", course.course_id, item.item_id),
                    course.term.as_str(),
                    code.as_str(),
                )
                .titled(item.name)
                .graded(item.grade)
                .detail("range", item.range)
                .detail("percentage", item.percentage)
                .detail("feedback", item.feedback)
                .detail("category", item.category_path)
                .detail("link", item.link.unwrap_or_default()),
            );
        }
    }
    Ok(RecordSet::new(rows))
}
