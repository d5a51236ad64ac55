//! Booking status state machine.
//!
//! ```text
//! PENDING ──confirm──▶ IN_PROGRESS ──start unloading──▶ UNLOADING ──finish──▶ FINISHED
//!    │  ▲                 │  ▲ record arrival (once)         │
//!    │  └──reconfirm──────┘  └─┘                             │
//!    └───────────────┴──────── cancel ───────────────────────┴──▶ CANCELED
//! ```
//!
//! FINISHED and CANCELED are terminal. DELAYED is never stored: it is a
//! read-time projection over PENDING/IN_PROGRESS bookings.

use ulid::Ulid;

use crate::limits::MAX_REASON_LEN;
use crate::model::*;

use super::EngineError;

/// A requested lifecycle step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Confirm,
    RecordArrival { at: Ms },
    StartUnloading { at: Ms },
    Finish { at: Ms },
    Cancel { reason: String },
    /// Edited interval and/or dock, re-validated by the caller before commit.
    Reconfirm { span: Span, dock_id: Ulid },
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Confirm => ActionKind::Confirm,
            Action::RecordArrival { .. } => ActionKind::RecordArrival,
            Action::StartUnloading { .. } => ActionKind::StartUnloading,
            Action::Finish { .. } => ActionKind::Finish,
            Action::Cancel { .. } => ActionKind::Cancel,
            Action::Reconfirm { .. } => ActionKind::Reconfirm,
        }
    }

    /// Status the action asks for.
    pub fn requested_status(&self) -> BookingStatus {
        match self {
            Action::Confirm | Action::RecordArrival { .. } | Action::Reconfirm { .. } => {
                BookingStatus::InProgress
            }
            Action::StartUnloading { .. } => BookingStatus::Unloading,
            Action::Finish { .. } => BookingStatus::Finished,
            Action::Cancel { .. } => BookingStatus::Canceled,
        }
    }

    fn description(&self) -> &'static str {
        match self {
            Action::Confirm => "confirm bookings",
            Action::RecordArrival { .. } => "record arrivals",
            Action::StartUnloading { .. } => "start unloading",
            Action::Finish { .. } => "finish bookings",
            Action::Cancel { .. } => "cancel bookings",
            Action::Reconfirm { .. } => "edit bookings",
        }
    }
}

/// Status reached by applying `action` in state `from`, or
/// `InvalidTransition` for any pair outside the transition table.
pub fn target_status(from: BookingStatus, action: &Action) -> Result<BookingStatus, EngineError> {
    use BookingStatus::*;
    let to = action.requested_status();
    let allowed = match action {
        Action::Confirm => from == Pending,
        Action::RecordArrival { .. } => from == InProgress,
        Action::StartUnloading { .. } => from == InProgress,
        Action::Finish { .. } => from == Unloading,
        Action::Cancel { .. } => matches!(from, Pending | InProgress | Unloading),
        Action::Reconfirm { .. } => matches!(from, Pending | InProgress),
    };
    if allowed {
        Ok(to)
    } else {
        Err(EngineError::InvalidTransition { from, to })
    }
}

/// Cancel: the booking's creator or driver, or staff/admin. Every other
/// action: staff/admin only.
pub(crate) fn authorize(
    caller: &Caller,
    booking: &Booking,
    action: &Action,
) -> Result<(), EngineError> {
    let privileged = matches!(caller.role, Role::Staff | Role::Admin);
    match action {
        Action::Cancel { .. } => {
            let owner = caller.username == booking.created_by
                || caller.username == booking.driver_username;
            if owner || privileged {
                Ok(())
            } else {
                Err(EngineError::UnauthorizedCancel {
                    username: caller.username.clone(),
                    booking_id: booking.id,
                })
            }
        }
        _ if privileged => Ok(()),
        _ => Err(EngineError::Forbidden {
            username: caller.username.clone(),
            action: action.description(),
        }),
    }
}

/// Apply `action` to `booking`, producing the new snapshot and its audit
/// record. An illegal transition is reported before any permission check.
/// Pure: conflict re-validation for `Reconfirm` is the caller's job.
pub(crate) fn apply(
    booking: &Booking,
    action: &Action,
    caller: &Caller,
    now: Ms,
) -> Result<(Booking, AuditRecord), EngineError> {
    let from = booking.status;
    let to = target_status(from, action)?;
    authorize(caller, booking, action)?;

    let mut next = booking.clone();
    next.status = to;
    match action {
        Action::Confirm => {}
        Action::RecordArrival { at } => {
            if booking.actual_arrival_time.is_some() {
                return Err(EngineError::InvalidTransition { from, to });
            }
            next.actual_arrival_time = Some(*at);
        }
        Action::StartUnloading { at } => {
            next.actual_arrival_time.get_or_insert(*at);
        }
        Action::Finish { at } => {
            next.actual_finish_time = Some(*at);
        }
        Action::Cancel { reason } => {
            let reason = reason.trim();
            if reason.is_empty() {
                return Err(EngineError::MissingCancelReason);
            }
            if reason.len() > MAX_REASON_LEN {
                return Err(EngineError::LimitExceeded("cancel reason too long"));
            }
            next.canceled_reason = Some(reason.to_string());
        }
        Action::Reconfirm { span, dock_id } => {
            next.span = *span;
            next.dock_id = *dock_id;
        }
    }

    let audit = AuditRecord {
        booking_id: booking.id,
        action: action.kind(),
        actor: caller.username.clone(),
        at: now,
        from: Some(from),
        to,
        before: Some(Placement {
            dock_id: booking.dock_id,
            span: booking.span,
        }),
        after: Placement {
            dock_id: next.dock_id,
            span: next.span,
        },
    };
    Ok((next, audit))
}

/// Read-time status: PENDING/IN_PROGRESS bookings with no recorded arrival
/// report as DELAYED once `now` passes arrival plus the dock's tolerance.
pub fn reported_status(booking: &Booking, delay_tolerance_min: u32, now: Ms) -> ReportedStatus {
    let waiting = matches!(booking.status, BookingStatus::Pending | BookingStatus::InProgress);
    let deadline = booking.arrival_time() + Ms::from(delay_tolerance_min) * MINUTE_MS;
    if waiting && booking.actual_arrival_time.is_none() && deadline < now {
        ReportedStatus::Delayed
    } else {
        booking.status.into()
    }
}
