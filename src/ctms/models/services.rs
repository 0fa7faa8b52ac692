//! Paid service windows (`/services/BuyServices.aspx`).

use chrono::{DateTime, FixedOffset};
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

use super::portal_time;
use crate::ctms::markup::{self, Document};

const SERVICE_BOXES: &str = "div.dichvu";
const EMAIL_CELL: &str =
    "#LeftCol_MuaDichVu1_pnWrapperModule > table > tbody > tr:nth-child(1) > td:nth-child(2)";
const OCCUPATION_CELL: &str =
    "#LeftCol_MuaDichVu1_pnWrapperModule > table > tbody > tr:nth-child(2) > td:nth-child(2)";

/// `DD/MM/YYYY HH:MM`
static WINDOW_BOUND_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)/(\d+)/(\d+) (\d+):(\d+)").unwrap());

/// Period during which a purchased service is active.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceWindow {
    pub from: DateTime<FixedOffset>,
    pub to: DateTime<FixedOffset>,
}

/// The five services the portal sells, in page order. `None` means not purchased.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServiceStatus {
    pub basic_access: Option<ServiceWindow>,
    pub unverified_score: Option<ServiceWindow>,
    pub pay_ask: Option<ServiceWindow>,
    pub couple_check_in: Option<ServiceWindow>,
    pub short_access: Option<ServiceWindow>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServicesReport {
    pub email: Option<String>,
    pub occupation: Option<String>,
    pub services: ServiceStatus,
}

pub fn parse_services(doc: &Document) -> ServicesReport {
    let mut windows = doc
        .select_all(SERVICE_BOXES)
        .into_iter()
        .map(|service| {
            markup::nth_child(service, 2)
                .and_then(|el| el.value().attr("title"))
                .and_then(parse_window)
        })
        .chain(std::iter::repeat(None));

    let mut next = || windows.next().flatten();
    let services = ServiceStatus {
        basic_access: next(),
        unverified_score: next(),
        pay_ask: next(),
        couple_check_in: next(),
        short_access: next(),
    };

    ServicesReport {
        email: doc.select_first(EMAIL_CELL).map(markup::text),
        occupation: doc.select_first(OCCUPATION_CELL).map(markup::text),
        services,
    }
}

/// Parse a title of the form `(DD/MM/YYYY HH:MM-DD/MM/YYYY HH:MM)`.
pub fn parse_window(title: &str) -> Option<ServiceWindow> {
    let inner = title.trim().strip_prefix('(')?.strip_suffix(')')?;
    let (from, to) = inner.split_once('-')?;
    Some(ServiceWindow {
        from: parse_bound(from)?,
        to: parse_bound(to)?,
    })
}

fn parse_bound(text: &str) -> Option<DateTime<FixedOffset>> {
    let caps = WINDOW_BOUND_RE.captures(text)?;
    let n = |i: usize| caps[i].parse::<u32>().ok();
    portal_time(caps[3].parse().ok()?, n(2)?, n(1)?, n(4)?, n(5)?)
}
