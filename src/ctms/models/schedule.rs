//! Weekly schedule (`/Lichhoc.aspx`) and schedule notes.

use html_scraper::ElementRef;
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;
use tracing::debug;

use crate::ctms::markup::{self, Document};

/// Id of the week-start input on the schedule page.
pub const WEEK_START_INPUT: &str = "LeftCol_Lichhoc1_txtNgaydautuan";
/// Title of the icon marking a row that has a note attached.
const NOTE_MARKER_TITLE: &str = "Đã có ghi chú";
const DAYS_PER_WEEK: usize = 7;

static NOTE_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"javascript:getNote\((\d+)\);").unwrap());

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleRow {
    pub time: String,
    pub classroom: String,
    pub subject: String,
    pub teacher: String,
    pub class_id: String,
    /// Roster id rendered under the class id, if any.
    pub list_id: Option<String>,
    pub status: String,
    pub note_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleDay {
    /// Day label as rendered, e.g. "Thứ 2 - 12/07/2021".
    pub label: String,
    pub rows: Vec<ScheduleRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeeklySchedule {
    /// Week start as the portal echoes it in the date input.
    pub week_start: Option<String>,
    /// Only days that have classes; a missing day means no classes that day.
    pub days: Vec<ScheduleDay>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Note {
    pub id: u64,
    pub content: String,
}

pub fn day_table_id(index: usize) -> String {
    format!("LeftCol_Lichhoc1_rptrLichhoc_grvLichhoc_{index}")
}

/// Extract the week's schedule. Missing day tables are skipped.
pub fn parse_schedule(doc: &Document) -> WeeklySchedule {
    let days = (0..DAYS_PER_WEEK)
        .filter_map(|i| {
            let table = doc.by_id(&day_table_id(i))?;
            Some(ScheduleDay {
                label: day_label(table),
                rows: markup::data_rows(table)
                    .into_iter()
                    .filter_map(parse_row)
                    .collect(),
            })
        })
        .collect();

    WeeklySchedule {
        week_start: doc.input_value(WEEK_START_INPUT),
        days,
    }
}

/// The day label sits in the first cell of the row that wraps the day's table.
fn day_label(table: ElementRef<'_>) -> String {
    markup::parent_element(table)
        .and_then(markup::parent_element)
        .and_then(|row| markup::nth_child(row, 0))
        .map(markup::collapsed_text)
        .unwrap_or_default()
}

fn parse_row(row: ElementRef<'_>) -> Option<ScheduleRow> {
    let cells = markup::child_elements(row);
    if cells.len() < 7 {
        debug!(cells = cells.len(), "Skipping short schedule row");
        return None;
    }

    let mut ids = markup::split_on_breaks(cells[5]).into_iter();

    Some(ScheduleRow {
        time: markup::text(cells[1]),
        classroom: markup::text(cells[2]),
        subject: markup::text(cells[3]),
        teacher: markup::text(cells[4]),
        class_id: ids.next().unwrap_or_default(),
        list_id: ids.next(),
        status: markup::text(cells[6]),
        note_id: parse_note_id(cells[6]),
    })
}

/// `span > a[href]` whose icon is titled as having a note.
fn parse_note_id(cell: ElementRef<'_>) -> Option<u64> {
    let link = markup::child_by_tag(cell, "span").and_then(|s| markup::child_by_tag(s, "a"))?;
    let icon = markup::nth_child(link, 0)?;
    if icon.value().attr("title") != Some(NOTE_MARKER_TITLE) {
        return None;
    }

    let href = link.value().attr("href")?;
    NOTE_LINK_RE.captures(href)?[1].parse().ok()
}

/// Strip the callback framing `"<n>|"` plus `n` hash characters from a note response.
pub fn parse_note(id: u64, body: &str) -> Option<Note> {
    let (len, rest) = body.split_once('|')?;
    let len: usize = len.trim().parse().ok()?;
    let content: String = rest.chars().skip(len).collect();
    Some(Note { id, content })
}
