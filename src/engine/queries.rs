use chrono::NaiveDate;
use ulid::Ulid;

use crate::calendar::local_day;
use crate::limits::*;
use crate::model::*;

use super::availability;
use super::lifecycle;
use super::{Engine, EngineError};

impl Engine {
    pub async fn get_dock(&self, id: Ulid) -> Result<Dock, EngineError> {
        let ds = self.get_dock_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = ds.read().await;
        Ok(guard.dock.clone())
    }

    /// All registered docks, ordered by id.
    pub async fn list_docks(&self) -> Vec<Dock> {
        let states: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut docks = Vec::with_capacity(states.len());
        for ds in states {
            docks.push(ds.read().await.dock.clone());
        }
        docks.sort_by_key(|d| d.id);
        docks
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let dock_id = self
            .get_dock_for_booking(&id)
            .ok_or(EngineError::NotFound(id))?;
        let ds = self
            .get_dock_state(&dock_id)
            .ok_or(EngineError::NotFound(dock_id))?;
        let guard = ds.read().await;
        guard
            .booking(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    /// Bookings on a dock whose planned interval overlaps `window`, sorted
    /// by arrival.
    pub async fn list_bookings(
        &self,
        dock_id: Ulid,
        window: Span,
        include_canceled: bool,
    ) -> Result<Vec<Booking>, EngineError> {
        if window.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let ds = self
            .get_dock_state(&dock_id)
            .ok_or(EngineError::NotFound(dock_id))?;
        let guard = ds.read().await;
        Ok(guard
            .overlapping(&window)
            .filter(|b| include_canceled || b.status.is_live())
            .cloned()
            .collect())
    }

    /// Every accepted action on a booking, oldest first. Moves show up as
    /// records whose `before` and `after` placements differ.
    pub fn audit_trail(&self, booking_id: Ulid) -> Result<Vec<AuditRecord>, EngineError> {
        self.audit
            .get(&booking_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(booking_id))
    }

    /// The dock's blackout rules in creation order.
    pub async fn blackout_rules(&self, dock_id: Ulid) -> Result<Vec<BlackoutRule>, EngineError> {
        let ds = self
            .get_dock_state(&dock_id)
            .ok_or(EngineError::NotFound(dock_id))?;
        let guard = ds.read().await;
        Ok(guard.rules.clone())
    }

    pub async fn reported_status(
        &self,
        booking_id: Ulid,
        now: Ms,
    ) -> Result<ReportedStatus, EngineError> {
        let guard = self.read_booking_dock(booking_id).await?;
        let booking = guard
            .booking(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        Ok(lifecycle::reported_status(
            booking,
            guard.dock.delay_tolerance_min,
            now,
        ))
    }

    /// Bookings on the dock that currently report as DELAYED.
    pub async fn delayed_bookings(
        &self,
        dock_id: Ulid,
        now: Ms,
    ) -> Result<Vec<Booking>, EngineError> {
        let ds = self
            .get_dock_state(&dock_id)
            .ok_or(EngineError::NotFound(dock_id))?;
        let guard = ds.read().await;
        let tolerance = guard.dock.delay_tolerance_min;
        Ok(guard
            .bookings
            .iter()
            .filter(|b| lifecycle::reported_status(b, tolerance, now) == ReportedStatus::Delayed)
            .cloned()
            .collect())
    }

    /// Merged blackout windows and live bookings on the dock's local `date`.
    pub async fn unavailability(
        &self,
        dock_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Span>, EngineError> {
        let ds = self
            .get_dock_state(&dock_id)
            .ok_or(EngineError::NotFound(dock_id))?;
        let guard = ds.read().await;
        let day = local_day(date, guard.dock.utc_offset_min);
        Ok(availability::unavailability(&guard, &day))
    }

    /// Gaps in the dock's local `date` at least `min_duration_ms` long.
    pub async fn free_slots(
        &self,
        dock_id: Ulid,
        date: NaiveDate,
        min_duration_ms: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        let ds = self
            .get_dock_state(&dock_id)
            .ok_or(EngineError::NotFound(dock_id))?;
        let guard = ds.read().await;
        let day = local_day(date, guard.dock.utc_offset_min);
        let mut free = availability::free_slots(&guard, &day);
        if let Some(min) = min_duration_ms {
            free.retain(|span| span.duration_ms() >= min);
        }
        Ok(free)
    }

    async fn read_booking_dock(
        &self,
        booking_id: Ulid,
    ) -> Result<tokio::sync::OwnedRwLockReadGuard<DockState>, EngineError> {
        let dock_id = self
            .get_dock_for_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let ds = self
            .get_dock_state(&dock_id)
            .ok_or(EngineError::NotFound(dock_id))?;
        Ok(ds.read_owned().await)
    }
}
