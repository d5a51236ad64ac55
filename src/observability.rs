use std::net::SocketAddr;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "dockbook_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "dockbook_request_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "dockbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "dockbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "dockbook_connections_rejected_total";

/// Counter: failed `auth` requests.
pub const AUTH_FAILURES_TOTAL: &str = "dockbook_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "dockbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "dockbook_wal_flush_batch_size";

// ── Domain metrics ──────────────────────────────────────────────

pub const BOOKINGS_CREATED_TOTAL: &str = "dockbook_bookings_created_total";

/// Counter: rejected creates/edits. Labels: kind (error code).
pub const CONFLICTS_TOTAL: &str = "dockbook_conflicts_total";

/// Counter: accepted transitions. Labels: to.
pub const TRANSITIONS_TOTAL: &str = "dockbook_transitions_total";

pub const SEQUENCE_ALLOCATIONS_TOTAL: &str = "dockbook_sequence_allocations_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a request to a short label for metrics.
pub fn op_label(req: &Request) -> &'static str {
    match req {
        Request::Auth { .. } => "auth",
        Request::RegisterDock { .. } => "register_dock",
        Request::UpdateDock { .. } => "update_dock",
        Request::AddBlackoutRule { .. } => "add_blackout_rule",
        Request::RemoveBlackoutRule { .. } => "remove_blackout_rule",
        Request::CreateReservation { .. } => "create_reservation",
        Request::Transition { .. } => "transition",
        Request::CancelReservation { .. } => "cancel_reservation",
        Request::EditAndReconfirm { .. } => "edit_and_reconfirm",
        Request::GetBooking { .. } => "get_booking",
        Request::ListBookings { .. } => "list_bookings",
        Request::AuditTrail { .. } => "audit_trail",
        Request::BlackoutRules { .. } => "blackout_rules",
        Request::FreeSlots { .. } => "free_slots",
        Request::DelayedBookings { .. } => "delayed_bookings",
        Request::Listen { .. } => "listen",
        Request::Unlisten { .. } => "unlisten",
    }
}
