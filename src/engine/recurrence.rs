use chrono::{Datelike, NaiveDate};

use crate::calendar::local_instant;
use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Does `date` satisfy the recurrence?
///
/// - Daily: on or after the anchor, every `step`th day.
/// - Weekly: the date's weekday is in the set.
/// - Monthly: the day of month equals `day_of_month`; no clamping, so
///   `day_of_month = 31` never fires in a 30-day month or February.
pub fn matches(recurrence: &Recurrence, date: NaiveDate) -> bool {
    match recurrence {
        Recurrence::Daily { anchor, step } => {
            if date < *anchor || *step == 0 {
                return false;
            }
            (date - *anchor).num_days() % i64::from(*step) == 0
        }
        Recurrence::Weekly { days } => days.contains(&date.weekday()),
        Recurrence::Monthly { day_of_month } => date.day() == *day_of_month,
    }
}

/// The rule's concrete window on `date`, if the rule fires that day.
pub fn resolve_window(rule: &BlackoutRule, date: NaiveDate, utc_offset_min: i32) -> Option<Span> {
    if !matches(&rule.recurrence, date) {
        return None;
    }
    Some(Span::new(
        local_instant(date, rule.time_from, utc_offset_min),
        local_instant(date, rule.time_to, utc_offset_min),
    ))
}

pub(crate) fn validate_rule(rule: &BlackoutRule) -> Result<(), EngineError> {
    if rule.time_from >= rule.time_to {
        return Err(EngineError::InvalidRule("time_from must be before time_to"));
    }
    if rule.reason.trim().is_empty() {
        return Err(EngineError::InvalidRule("reason is required"));
    }
    if rule.reason.len() > MAX_REASON_LEN {
        return Err(EngineError::LimitExceeded("reason too long"));
    }
    match &rule.recurrence {
        Recurrence::Daily { step, .. } if *step == 0 => {
            Err(EngineError::InvalidRule("daily step must be at least 1"))
        }
        Recurrence::Weekly { days } if days.is_empty() => {
            Err(EngineError::InvalidRule("weekly rule needs at least one day"))
        }
        Recurrence::Monthly { day_of_month } if !(1..=31).contains(day_of_month) => {
            Err(EngineError::InvalidRule("day of month must be within 1..=31"))
        }
        _ => Ok(()),
    }
}
