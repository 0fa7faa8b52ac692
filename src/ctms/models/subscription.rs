//! Credit-class subscription (`/DangkyLoptinchi.aspx`).
//!
//! The page is driven by ASP.NET client callbacks rather than full postbacks:
//! every command returns `"<n>|<markup>"` where the markup carries two
//! bordered tables, the classes open for subscription and those already
//! subscribed.

use chrono::{DateTime, FixedOffset};
use html_scraper::ElementRef;
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;
use tracing::debug;

use super::portal_time;
use crate::ctms::errors::CtmsError;
use crate::ctms::markup::{self, Document};

/// Callback id for listing modules.
pub const PAGE_CALLBACK: &str = "__Page";
/// Callback id for subscribe / unsubscribe.
pub const MODULE_CALLBACK: &str = "ctl00$LeftCol$LoptinchiDangky1";

const TABLES: &str = "table[border]";
const EXPIRED_MARKER: &str = "Hết hạn ĐK";
const FULL_MARKER: &str = "Hết chỉ tiêu";
const REJECTION_MARKER: &str = "Lỗi:";

static STUDENT_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""getmodule:" \+ (\d+);"#).unwrap());
static SUBSCRIBE_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"javascript:subcrible\((\d+), (\d+), (\d+)\)").unwrap());
static UNSUBSCRIBE_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"javascript:unSubcrible\((\d+),(\d+)\)").unwrap());
/// `"<subject> (<n> tc) <teacher> [Học phí: <k>*1000 (đ)]"`
static CLASS_INFO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.+) \((\d+) tc\)\s+(.+?)(?:\s+Học phí: (\d+)\*1000 \(đ\))?$").unwrap()
});
/// `HH:MM DD/MM/YY`
static WINDOW_TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,2}):(\d{2}) (\d{1,2})/(\d{1,2})/(\d{2})").unwrap());
/// Single-line framed responses only; full markup replies span many lines.
static CALLBACK_RESPONSE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\|(.*)$").unwrap());

/// What the row's action link would do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum SubscriptionAction {
    Subscribe { class_id: u64 },
    Unsubscribe { class_id: u64 },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SubscriptionWindow {
    pub start: Option<DateTime<FixedOffset>>,
    pub end: Option<DateTime<FixedOffset>>,
    pub cancel: Option<DateTime<FixedOffset>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SubscriptionRow {
    pub expired: bool,
    pub full: bool,
    pub class_id: String,
    pub subject: Option<String>,
    pub credits: Option<u32>,
    pub teacher: Option<String>,
    /// In đồng.
    pub tuition: Option<u64>,
    pub minimum: Option<u32>,
    pub maximum: Option<u32>,
    pub subscribed: Option<u32>,
    pub schedule: Vec<String>,
    pub classrooms: Vec<String>,
    pub action: Option<SubscriptionAction>,
    pub window: SubscriptionWindow,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SubscriptionPage {
    pub waiting: Vec<SubscriptionRow>,
    pub subscribed: Vec<SubscriptionRow>,
}

/// A command sent through the subscription callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionCommand {
    List,
    Subscribe(u64),
    Unsubscribe(u64),
}

impl SubscriptionCommand {
    /// `(__CALLBACKID, __CALLBACKPARAM)` for this command.
    pub fn callback(self, student_id: u64) -> (&'static str, String) {
        match self {
            Self::List => (PAGE_CALLBACK, format!("getmodule:{student_id}")),
            Self::Subscribe(class_id) => {
                (MODULE_CALLBACK, format!("subcrible:{class_id}:{student_id}"))
            }
            Self::Unsubscribe(class_id) => {
                (MODULE_CALLBACK, format!("unsubcrible:{class_id}:{student_id}"))
            }
        }
    }
}

/// Numeric student id embedded in the page's callback script.
pub fn parse_student_id(body: &str) -> Option<u64> {
    STUDENT_ID_RE.captures(body)?[1].parse().ok()
}

/// Reject callback responses that carry no markup or an error message.
pub fn check_callback_response(param: &str, body: &str) -> Result<(), CtmsError> {
    let Some(caps) = CALLBACK_RESPONSE_RE.captures(body.trim()) else {
        return Ok(());
    };

    let tail = &caps[2];
    if tail.is_empty() {
        return Err(CtmsError::SubmissionRejected(format!(
            "{param}: empty response, the command most likely failed"
        )));
    }
    if tail.contains(REJECTION_MARKER) {
        return Err(CtmsError::SubmissionRejected(format!(
            "{param}: {}",
            markup::collapse_whitespace(tail)
        )));
    }
    Ok(())
}

pub fn parse_subscription(doc: &Document) -> SubscriptionPage {
    let tables = doc.select_all(TABLES);
    let rows = |i: usize| tables.get(i).map(|t| parse_table(*t)).unwrap_or_default();

    SubscriptionPage {
        waiting: rows(0),
        subscribed: rows(1),
    }
}

fn parse_table(table: ElementRef<'_>) -> Vec<SubscriptionRow> {
    markup::data_rows(table)
        .into_iter()
        .filter_map(|row| {
            let cells = markup::child_elements(row);
            if cells.len() < 8 {
                debug!(cells = cells.len(), "Skipping short subscription row");
                return None;
            }
            Some(parse_row(&cells))
        })
        .collect()
}

fn parse_row(cells: &[ElementRef<'_>]) -> SubscriptionRow {
    let status = markup::text(cells[0]);
    let mut row = SubscriptionRow {
        expired: status.contains(EXPIRED_MARKER),
        full: status.contains(FULL_MARKER),
        class_id: markup::text(cells[1]),
        action: markup::child_by_tag(cells[0], "a")
            .and_then(|a| a.value().attr("href"))
            .and_then(parse_action),
        minimum: parse_counter(cells[3]),
        maximum: parse_counter(cells[4]),
        subscribed: parse_counter(cells[5]),
        window: parse_window(&markup::split_on_breaks(cells[6]).join(" ")),
        ..Default::default()
    };

    if let Some(caps) = CLASS_INFO_RE.captures(&markup::collapsed_text(cells[2])) {
        row.subject = Some(caps[1].to_owned());
        row.credits = caps[2].parse().ok();
        row.teacher = Some(caps[3].to_owned());
        row.tuition = caps
            .get(4)
            .and_then(|m| m.as_str().parse::<u64>().ok())
            .map(|k| k * 1000);
    }

    let lines = markup::child_by_tag(cells[7], "ul")
        .map(|ul| {
            markup::child_elements(ul)
                .into_iter()
                .filter(|li| li.value().name() == "li")
                .map(markup::collapsed_text)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    for line in lines {
        if let Some(room) = line.split(" - ").nth(1)
            && !row.classrooms.iter().any(|r| r == room)
        {
            row.classrooms.push(room.to_owned());
        }
        row.schedule.push(line);
    }

    row
}

fn parse_action(href: &str) -> Option<SubscriptionAction> {
    if let Some(caps) = SUBSCRIBE_LINK_RE.captures(href) {
        return Some(SubscriptionAction::Subscribe {
            class_id: caps[1].parse().ok()?,
        });
    }
    let caps = UNSUBSCRIBE_LINK_RE.captures(href)?;
    Some(SubscriptionAction::Unsubscribe {
        class_id: caps[1].parse().ok()?,
    })
}

fn parse_counter(cell: ElementRef<'_>) -> Option<u32> {
    markup::text(cell).replace(" sv", "").trim().parse().ok()
}

/// Up to three timestamps: start, end and cancellation deadline. Years are two digits.
fn parse_window(text: &str) -> SubscriptionWindow {
    let mut times = WINDOW_TIME_RE.captures_iter(text).map(|caps| {
        let n = |i: usize| caps[i].parse::<u32>().ok();
        let year = format!("20{}", &caps[5]).parse().ok()?;
        portal_time(year, n(4)?, n(3)?, n(1)?, n(2)?)
    });

    SubscriptionWindow {
        start: times.next().flatten(),
        end: times.next().flatten(),
        cancel: times.next().flatten(),
    }
}
