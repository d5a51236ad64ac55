use ulid::Ulid;

use crate::model::{BookingStatus, Ms, RecurrenceKind, Span};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Arrival not strictly before finish, or instants out of range.
    InvalidInterval {
        arrival: Ms,
        finish: Ms,
    },
    InvalidRule(&'static str),
    /// The proposed interval hits a resolved blackout window.
    BlackoutConflict {
        rule_id: Ulid,
        reason: String,
        window: Span,
        kind: RecurrenceKind,
    },
    /// The proposed interval hits another live booking on the dock.
    BookingConflict {
        booking_id: Ulid,
        span: Span,
    },
    SequenceAllocation(String),
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    UnauthorizedCancel {
        username: String,
        booking_id: Ulid,
    },
    Forbidden {
        username: String,
        action: &'static str,
    },
    MissingCancelReason,
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Infrastructure failures leave no partial state; the same request may
    /// be retried. Business-rule rejections need different input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::SequenceAllocation(_) | EngineError::WalError(_))
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::InvalidInterval { .. } => "invalid_interval",
            EngineError::InvalidRule(_) => "invalid_rule",
            EngineError::BlackoutConflict { .. } => "blackout_conflict",
            EngineError::BookingConflict { .. } => "booking_conflict",
            EngineError::SequenceAllocation(_) => "sequence_allocation",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::UnauthorizedCancel { .. } => "unauthorized_cancel",
            EngineError::Forbidden { .. } => "forbidden",
            EngineError::MissingCancelReason => "missing_cancel_reason",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidInterval { arrival, finish } => {
                write!(f, "invalid interval: arrival {arrival} must be before finish {finish}")
            }
            EngineError::InvalidRule(msg) => write!(f, "invalid blackout rule: {msg}"),
            EngineError::BlackoutConflict {
                rule_id,
                reason,
                window,
                kind,
            } => write!(
                f,
                "dock unavailable ({reason}): {kind} blackout {rule_id} covers [{}, {})",
                window.start, window.end
            ),
            EngineError::BookingConflict { booking_id, span } => write!(
                f,
                "conflict with booking {booking_id} at [{}, {})",
                span.start, span.end
            ),
            EngineError::SequenceAllocation(e) => write!(f, "sequence allocation failed: {e}"),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "invalid transition: {from} -> {to}")
            }
            EngineError::UnauthorizedCancel {
                username,
                booking_id,
            } => write!(f, "{username} may not cancel booking {booking_id}"),
            EngineError::Forbidden { username, action } => {
                write!(f, "{username} is not permitted to {action}")
            }
            EngineError::MissingCancelReason => write!(f, "cancellation requires a reason"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
