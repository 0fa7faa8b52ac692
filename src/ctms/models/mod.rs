//! Pure extractors turning portal pages into typed records.

pub mod exams;
pub mod grades;
pub mod schedule;
pub mod services;
pub mod subscription;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use chrono_tz::Asia::Ho_Chi_Minh;

/// Interpret a wall-clock time rendered by the portal in its local timezone.
pub(crate) fn portal_time(
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
) -> Option<DateTime<FixedOffset>> {
    let naive = NaiveDateTime::new(
        NaiveDate::from_ymd_opt(year, month, day)?,
        NaiveTime::from_hms_opt(hour, minute, 0)?,
    );
    Ho_Chi_Minh
        .from_local_datetime(&naive)
        .single()
        .map(|t| t.fixed_offset())
}
