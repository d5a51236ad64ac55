use ulid::Ulid;

use crate::calendar::dates_touched;
use crate::model::*;

use super::recurrence::resolve_window;
use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Turn a raw `(arrival, finish)` pair into a span, rejecting inverted,
/// empty, out-of-range, or overlong intervals.
pub(crate) fn validate_interval(arrival: Ms, finish: Ms) -> Result<Span, EngineError> {
    use crate::limits::*;
    if arrival >= finish {
        return Err(EngineError::InvalidInterval { arrival, finish });
    }
    if arrival < MIN_VALID_TIMESTAMP_MS || finish > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::InvalidInterval { arrival, finish });
    }
    if finish - arrival > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("reservation too long"));
    }
    Ok(Span::new(arrival, finish))
}

/// First blackout rule (in creation order) whose window on any local date
/// the span touches overlaps the span. A span crossing midnight is checked
/// against both days.
pub(crate) fn check_blackout(ds: &DockState, span: &Span) -> Result<(), EngineError> {
    let offset = ds.dock.utc_offset_min;
    let dates = dates_touched(span, offset)
        .ok_or(EngineError::InvalidInterval { arrival: span.start, finish: span.end })?;

    for rule in &ds.rules {
        for date in &dates {
            if let Some(window) = resolve_window(rule, *date, offset)
                && window.overlaps(span)
            {
                return Err(EngineError::BlackoutConflict {
                    rule_id: rule.id,
                    reason: rule.reason.clone(),
                    window,
                    kind: rule.recurrence.kind(),
                });
            }
        }
    }
    Ok(())
}

/// First live booking on the dock overlapping the span, skipping `exclude`
/// (the booking being re-validated against its own old interval).
pub(crate) fn check_reservation(
    ds: &DockState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match ds
        .live_overlapping(span)
        .find(|b| Some(b.id) != exclude)
    {
        Some(existing) => Err(EngineError::BookingConflict {
            booking_id: existing.id,
            span: existing.span,
        }),
        None => Ok(()),
    }
}

/// Both checks, blackout first. Records a rejection metric on failure.
pub(crate) fn check_bookable(
    ds: &DockState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let result = check_blackout(ds, span).and_then(|()| check_reservation(ds, span, exclude));
    if let Err(e) = &result {
        tracing::debug!(dock = %ds.dock.id, start = span.start, end = span.end, "rejected: {e}");
        metrics::counter!(crate::observability::CONFLICTS_TOTAL, "kind" => e.code()).increment(1);
    }
    result
}
