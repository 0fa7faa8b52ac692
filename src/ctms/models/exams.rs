//! Exam calendar (`/Lichthi.aspx`).

use chrono::{DateTime, FixedOffset, Utc};
use regex::Regex;
use serde::Serialize;
use std::str::FromStr;
use std::sync::LazyLock;
use tracing::debug;

use super::portal_time;
use crate::ctms::markup::{self, Document};

pub const FILTER_FIELD: &str = "ctl00$LeftCol$Lichthi1$Tuychon";
pub const SHOW_BUTTON_FIELD: &str = "ctl00$LeftCol$Lichthi1$btnHien";
/// The button label really is padded with spaces.
pub const SHOW_BUTTON_LABEL: &str = "   Hiện   ";

const ROWS: &str = "#leftcontent > table > tbody > tr";

/// `HH:MM DD/MM/YYYY`
static EXAM_TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+):(\d+) (\d+)/(\d+)/(\d+)").unwrap());

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExamFilter {
    #[default]
    All,
    Ended,
    Coming,
}

impl ExamFilter {
    /// Radio button value the portal expects for this filter.
    pub fn option(self) -> &'static str {
        match self {
            Self::All => "rbtnTatca",
            Self::Ended => "rbtnDathi",
            Self::Coming => "rbtnChuathi",
        }
    }
}

impl FromStr for ExamFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Self::All),
            "ended" => Ok(Self::Ended),
            "coming" => Ok(Self::Coming),
            other => Err(format!("unknown exam filter `{other}` (expected all, ended or coming)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExamStatus {
    Ended,
    Coming,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExamRecord {
    pub status: ExamStatus,
    pub time: DateTime<FixedOffset>,
    pub classroom: String,
    pub subject: String,
    pub list_id: String,
}

/// Extract exam rows, newest first. Rows whose time cannot be read are skipped.
pub fn parse_exams(doc: &Document, now: DateTime<Utc>) -> Vec<ExamRecord> {
    let mut exams: Vec<ExamRecord> = doc
        .select_all(ROWS)
        .into_iter()
        .skip(1)
        .filter_map(|row| {
            let cells = markup::child_elements(row);
            if cells.len() < 5 {
                return None;
            }

            let raw_time = markup::text(cells[1]);
            let Some(time) = parse_exam_time(&raw_time) else {
                debug!(time = raw_time, "Skipping exam row with unreadable time");
                return None;
            };

            Some(ExamRecord {
                status: if time < now {
                    ExamStatus::Ended
                } else {
                    ExamStatus::Coming
                },
                time,
                classroom: markup::text(cells[2]),
                subject: markup::text(cells[3]),
                list_id: markup::text(cells[4]),
            })
        })
        .collect();

    exams.sort_by(|a, b| b.time.cmp(&a.time));
    exams
}

fn parse_exam_time(text: &str) -> Option<DateTime<FixedOffset>> {
    let caps = EXAM_TIME_RE.captures(text)?;
    let n = |i: usize| caps[i].parse::<u32>().ok();
    portal_time(caps[5].parse().ok()?, n(4)?, n(3)?, n(1)?, n(2)?)
}
