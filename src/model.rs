use chrono::{NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, UTC. The only instant type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const DAY_MS: Ms = 86_400_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching spans (`self.end == other.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        overlaps(self.start, self.end, other.start, other.end)
    }
}

/// `[a_start, a_end)` and `[b_start, b_end)` share at least one instant.
pub fn overlaps(a_start: Ms, a_end: Ms, b_start: Ms, b_end: Ms) -> bool {
    a_start < b_end && b_start < a_end
}

// ── Docks ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dock {
    pub id: Ulid,
    pub warehouse_id: String,
    /// Short label rendered into booking codes, e.g. `D1`.
    pub code: String,
    /// Minutes past the planned arrival before a booking reports as delayed.
    pub delay_tolerance_min: u32,
    /// Fixed offset of the warehouse's local time from UTC.
    pub utc_offset_min: i32,
}

// ── Blackout rules ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecurrenceKind {
    Daily,
    Weekly,
    Monthly,
}

impl std::fmt::Display for RecurrenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecurrenceKind::Daily => write!(f, "DAILY"),
            RecurrenceKind::Weekly => write!(f, "WEEKLY"),
            RecurrenceKind::Monthly => write!(f, "MONTHLY"),
        }
    }
}

/// When a blackout rule fires. Each kind carries only the fields it uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recurrence {
    /// Every `step`th day counted from `anchor` (inclusive).
    Daily { anchor: NaiveDate, step: u32 },
    Weekly { days: Vec<Weekday> },
    /// Fires on `day_of_month`; months without that day are skipped.
    Monthly { day_of_month: u32 },
}

impl Recurrence {
    pub fn kind(&self) -> RecurrenceKind {
        match self {
            Recurrence::Daily { .. } => RecurrenceKind::Daily,
            Recurrence::Weekly { .. } => RecurrenceKind::Weekly,
            Recurrence::Monthly { .. } => RecurrenceKind::Monthly,
        }
    }
}

/// A dock's recurring unavailability window, in warehouse-local time of day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlackoutRule {
    pub id: Ulid,
    pub dock_id: Ulid,
    pub time_from: NaiveTime,
    pub time_to: NaiveTime,
    pub reason: String,
    pub recurrence: Recurrence,
    pub created_at: Ms,
}

// ── Bookings ─────────────────────────────────────────────────────

/// Persisted booking status. `Delayed` is never stored; see [`ReportedStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Pending,
    InProgress,
    Unloading,
    Finished,
    Canceled,
}

impl BookingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Finished | BookingStatus::Canceled)
    }

    /// Live bookings occupy their dock interval.
    pub fn is_live(&self) -> bool {
        !matches!(self, BookingStatus::Canceled)
    }

    pub fn label(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "PENDING",
            BookingStatus::InProgress => "IN_PROGRESS",
            BookingStatus::Unloading => "UNLOADING",
            BookingStatus::Finished => "FINISHED",
            BookingStatus::Canceled => "CANCELED",
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Status as shown to readers: the stored status, or `Delayed` when an
/// unarrived booking is past its arrival plus the dock's tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportedStatus {
    Pending,
    InProgress,
    Unloading,
    Finished,
    Canceled,
    Delayed,
}

impl From<BookingStatus> for ReportedStatus {
    fn from(status: BookingStatus) -> Self {
        match status {
            BookingStatus::Pending => ReportedStatus::Pending,
            BookingStatus::InProgress => ReportedStatus::InProgress,
            BookingStatus::Unloading => ReportedStatus::Unloading,
            BookingStatus::Finished => ReportedStatus::Finished,
            BookingStatus::Canceled => ReportedStatus::Canceled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub code: String,
    pub dock_id: Ulid,
    pub warehouse_id: String,
    pub organization_name: String,
    pub vehicle_id: String,
    pub driver_username: String,
    pub created_by: String,
    /// Planned `[arrival_time, estimated_finish_time)`.
    pub span: Span,
    pub actual_arrival_time: Option<Ms>,
    pub actual_finish_time: Option<Ms>,
    pub status: BookingStatus,
    pub canceled_reason: Option<String>,
    pub notes: Option<String>,
    /// Id of the sequence allocation that produced `code`.
    pub counter_id: Ulid,
    pub created_at: Ms,
}

impl Booking {
    pub fn arrival_time(&self) -> Ms {
        self.span.start
    }

    pub fn estimated_finish_time(&self) -> Ms {
        self.span.end
    }
}

// ── Sequence counters ────────────────────────────────────────────

/// Identity of a per-dock-per-day booking sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CounterKey {
    pub organization_name: String,
    pub warehouse_id: String,
    pub dock_id: Ulid,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceAllocation {
    pub id: Ulid,
    pub key: CounterKey,
    pub value: u32,
}

// ── Identity ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Vendor,
    Staff,
    Admin,
}

/// Already-authenticated caller identity handed in by the surrounding service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub username: String,
    pub role: Role,
    pub organization_name: String,
    pub vendor_name: Option<String>,
}

// ── Audit trail ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    Create,
    Confirm,
    RecordArrival,
    StartUnloading,
    Finish,
    Cancel,
    Reconfirm,
}

/// Where a booking sits: its dock and planned interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub dock_id: Ulid,
    pub span: Span,
}

/// Immutable record of one accepted creation or transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub booking_id: Ulid,
    pub action: ActionKind,
    pub actor: String,
    pub at: Ms,
    /// `None` for the creation record.
    pub from: Option<BookingStatus>,
    pub to: BookingStatus,
    pub before: Option<Placement>,
    pub after: Placement,
}

/// Fire-and-forget announcement of an accepted creation or transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusNotice {
    pub booking_id: Ulid,
    pub dock_id: Ulid,
    pub code: String,
    pub from: Option<BookingStatus>,
    pub to: BookingStatus,
    pub actor: String,
    pub at: Ms,
}

// ── Per-dock state ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DockState {
    pub dock: Dock,
    /// Ordered by `(created_at, id)` so the first conflicting rule is deterministic.
    pub rules: Vec<BlackoutRule>,
    /// All bookings on this dock including canceled ones, sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl DockState {
    pub fn new(dock: Dock) -> Self {
        Self {
            dock,
            rules: Vec::new(),
            bookings: Vec::new(),
        }
    }

    pub fn insert_rule(&mut self, rule: BlackoutRule) {
        let pos = self
            .rules
            .partition_point(|r| (r.created_at, r.id) < (rule.created_at, rule.id));
        self.rules.insert(pos, rule);
    }

    pub fn remove_rule(&mut self, id: Ulid) -> Option<BlackoutRule> {
        let pos = self.rules.iter().position(|r| r.id == id)?;
        Some(self.rules.remove(pos))
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    /// Bookings (any status) whose planned span overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    /// Live (non-canceled) bookings overlapping the query window.
    pub fn live_overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        self.overlapping(query).filter(|b| b.status.is_live())
    }
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    DockRegistered {
        dock: Dock,
    },
    DockUpdated {
        dock: Dock,
    },
    BlackoutRuleAdded {
        rule: BlackoutRule,
    },
    BlackoutRuleRemoved {
        id: Ulid,
        dock_id: Ulid,
    },
    SequenceAllocated {
        allocation: SequenceAllocation,
    },
    BookingCreated {
        booking: Booking,
        audit: AuditRecord,
    },
    /// Full snapshot after a transition; `previous_dock_id` differs from
    /// `booking.dock_id` when the booking moved docks.
    BookingChanged {
        previous_dock_id: Ulid,
        booking: Booking,
        audit: AuditRecord,
    },
    /// Written only by compaction: a booking with its whole audit trail.
    BookingRestored {
        booking: Booking,
        trail: Vec<AuditRecord>,
    },
}
