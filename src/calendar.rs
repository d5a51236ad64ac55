//! Warehouse-local calendar arithmetic.
//!
//! Instants are UTC milliseconds; blackout rules are written in the
//! warehouse's local wall-clock time. A dock carries a fixed UTC offset,
//! so converting between the two is plain addition.

use chrono::{DateTime, NaiveDate, NaiveTime};

use crate::model::{Ms, Span, DAY_MS, MINUTE_MS};

fn offset_ms(utc_offset_min: i32) -> Ms {
    Ms::from(utc_offset_min) * MINUTE_MS
}

/// Local calendar date containing instant `t`.
pub fn local_date(t: Ms, utc_offset_min: i32) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(t + offset_ms(utc_offset_min)).map(|dt| dt.date_naive())
}

/// Instant of local wall-clock `time` on `date`.
pub fn local_instant(date: NaiveDate, time: NaiveTime, utc_offset_min: i32) -> Ms {
    date.and_time(time).and_utc().timestamp_millis() - offset_ms(utc_offset_min)
}

/// The whole local day `[00:00, next 00:00)`.
pub fn local_day(date: NaiveDate, utc_offset_min: i32) -> Span {
    let start = local_instant(date, NaiveTime::MIN, utc_offset_min);
    Span::new(start, start + DAY_MS)
}

/// Every local date a span touches, from the arrival date through the
/// finish date inclusive.
pub fn dates_touched(span: &Span, utc_offset_min: i32) -> Option<Vec<NaiveDate>> {
    let first = local_date(span.start, utc_offset_min)?;
    let last = local_date(span.end, utc_offset_min)?;
    Some(first.iter_days().take_while(|d| *d <= last).collect())
}
