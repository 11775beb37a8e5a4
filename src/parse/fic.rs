use lazy_static::lazy_static;
use scraper::{ElementRef, Html, Selector};

use super::text_of;
use crate::models::{Record, RecordSet};
use crate::Error;

lazy_static! {
    static ref RESULTS: Selector = Selector::parse("table.data-table").expect("results selector");
    static ref TBODY: Selector = Selector::parse("tbody").expect("tbody selector");
    static ref ROW: Selector = Selector::parse("tr").expect("row selector");
    static ref CELL: Selector = Selector::parse("td").expect("cell selector");
    static ref USER_BOX: Selector = Selector::parse("#user-box strong").expect("user box selector");
    static ref HEADER: Selector = Selector::parse("th").expect("header selector");
}

/// Rows are `term | code | title | credits | grade`. Key is `term/code`.
pub fn final_grades(html: &str) -> Result<RecordSet, Error> {
    let doc = Html::parse_document(html);
    let table = doc
        .select(&RESULTS)
        .next()
        .ok_or_else(|| Error::parse("final grades table not found"))?;
    let body = table
        .select(&TBODY)
        .next()
        .ok_or_else(|| Error::parse("final grades table has no body"))?;

    let mut rows = Vec::new();
    for tr in body.select(&ROW) {
        let cells: Vec<String> = tr.select(&CELL).map(text_of).collect();
        if cells.len() < 5 {
            continue;
        }
        let (term, code) = (&cells[0], &cells[1]);
        if term.is_empty() || code.is_empty() {
            continue;
        }
        rows.push(
            Record::new(format!("{}/{}", term, code), term.as_str(), code.as_str())
                .titled(cells[2].as_str())
                .graded(cells[4].as_str())
                .detail("credits", cells[3].as_str()),
        );
    }

    if rows.is_empty() {
        return Err(Error::parse("final grades table has no readable rows"));
    }
    Ok(RecordSet::new(rows))
}

/// Full name from the profile page: the "logged in as NAME (ID)" box, else the `Name:` row.
pub fn profile_name(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);

    if let Some(strong) = doc.select(&USER_BOX).next() {
        let text = text_of(strong);
        let name = text.split('(').next().unwrap_or("").trim();
        if !name.is_empty() {
            return Some(name.to_string());
        }
    }

    let th = doc.select(&HEADER).find(|th| text_of(*th) == "Name:")?;
    let td = th
        .next_siblings()
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().name() == "td")?;
    let name = text_of(td);
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESULTS_PAGE: &str = r#"
        <html><body><div id="content">
        <table class="data-table">
          <thead><tr><th>Semester</th><th>Code</th><th>Title</th><th>Credits</th><th>Grade</th></tr></thead>
          <tbody>
            <tr><td>FIC 202501</td><td>CMPT120</td><td>Intro to Computing</td><td>3</td><td>B+</td></tr>
            <tr><td>FIC 202501</td><td>MATH151</td><td>Calculus I</td><td>3</td><td> A&nbsp;</td></tr>
            <tr><td>FIC 202503</td><td>MACM101</td><td>Discrete Mathematics I</td><td>3</td><td></td></tr>
            <tr><td colspan="5">Totals</td></tr>
            <tr><td></td><td>XXX</td><td>Ghost</td><td>0</td><td>F</td></tr>
          </tbody>
        </table></div></body></html>"#;

    #[test]
    fn reads_result_rows() {
        let set = final_grades(RESULTS_PAGE).unwrap();
        assert_eq!(set.len(), 3);

        let cmpt = set.get("FIC 202501/CMPT120").unwrap();
        assert_eq!(cmpt.course, "CMPT120");
        assert_eq!(cmpt.title, "Intro to Computing");
        assert_eq!(cmpt.grade, "B+");
        assert_eq!(cmpt.details.get("credits").map(String::as_str), Some("3"));

        assert_eq!(set.get("FIC 202501/MATH151").unwrap().grade, "A");
        assert_eq!(set.get("FIC 202503/MACM101").unwrap().grade, "");
    }

    #[test]
    fn same_page_same_fingerprint() {
        let a = final_grades(RESULTS_PAGE).unwrap();
        let b = final_grades(RESULTS_PAGE).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn missing_table_is_a_parse_error() {
        let err = final_grades("<html><body><p>Maintenance</p></body></html>").unwrap_err();
        assert!(matches!(err, Error::ParseFailure { .. }));
    }

    #[test]
    fn empty_table_is_a_parse_error() {
        let html = r#"<table class="data-table"><tbody></tbody></table>"#;
        assert!(matches!(final_grades(html), Err(Error::ParseFailure { .. })));
    }

    #[test]
    fn profile_name_from_user_box() {
        let html = r#"<div id="user-box">You are logged in as <strong>Jane Q Student (300123456)</strong></div>"#;
        assert_eq!(profile_name(html).as_deref(), Some("Jane Q Student"));
    }

    #[test]
    fn profile_name_from_table() {
        let html = r#"<table><tr><th>Name:</th><td> Jane  Student </td></tr></table>"#;
        assert_eq!(profile_name(html).as_deref(), Some("Jane Student"));
        assert_eq!(profile_name("<p>nothing</p>"), None);
    }
}
