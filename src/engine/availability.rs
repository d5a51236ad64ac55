use crate::calendar::dates_touched;
use crate::model::*;

use super::recurrence::resolve_window;

// ── Dock occupancy ────────────────────────────────────────────────

fn clamp(span: &Span, query: &Span) -> Option<Span> {
    let start = span.start.max(query.start);
    let end = span.end.min(query.end);
    (start < end).then(|| Span::new(start, end))
}

/// Concrete blackout windows falling inside `query`, clamped, sorted, merged.
pub fn blackout_windows(ds: &DockState, query: &Span) -> Vec<Span> {
    let offset = ds.dock.utc_offset_min;
    let Some(dates) = dates_touched(query, offset) else {
        return Vec::new();
    };

    let mut windows: Vec<Span> = Vec::new();
    for rule in &ds.rules {
        for date in &dates {
            if let Some(window) = resolve_window(rule, *date, offset)
                && let Some(clamped) = clamp(&window, query)
            {
                windows.push(clamped);
            }
        }
    }
    windows.sort_by_key(|s| s.start);
    merge_overlapping(&windows)
}

/// Everything that makes the dock unbookable inside `query`: blackout
/// windows plus live bookings. Sorted and merged.
pub fn unavailability(ds: &DockState, query: &Span) -> Vec<Span> {
    let mut busy = blackout_windows(ds, query);
    busy.extend(
        ds.live_overlapping(query)
            .filter_map(|b| clamp(&b.span, query)),
    );
    busy.sort_by_key(|s| s.start);
    merge_overlapping(&busy)
}

/// Free gaps inside `query`.
pub fn free_slots(ds: &DockState, query: &Span) -> Vec<Span> {
    subtract_intervals(&[*query], &unavailability(ds, query))
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// Remove sorted, disjoint `to_remove` spans from sorted, disjoint `base`.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}
