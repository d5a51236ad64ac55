use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::calendar::local_date;
use crate::limits::*;
use crate::model::*;

use super::conflict::{check_bookable, now_ms, validate_interval};
use super::lifecycle::{self, Action};
use super::recurrence::validate_rule;
use super::sequence::booking_code;
use super::{Engine, EngineError, SharedDockState, WalCommand};

/// Input to [`Engine::create_reservation`]. The organization comes from the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewReservation {
    pub dock_id: Ulid,
    pub vehicle_id: String,
    pub driver_username: String,
    pub arrival_time: Ms,
    pub estimated_finish_time: Ms,
    pub notes: Option<String>,
}

fn validate_dock(dock: &Dock) -> Result<(), EngineError> {
    if dock.code.is_empty() || dock.code.len() > MAX_CODE_LEN {
        return Err(EngineError::LimitExceeded("dock code must be 1..=32 bytes"));
    }
    if dock.warehouse_id.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("warehouse id too long"));
    }
    if dock.utc_offset_min.abs() > MAX_UTC_OFFSET_MIN {
        return Err(EngineError::LimitExceeded("utc offset out of range"));
    }
    Ok(())
}

impl Engine {
    // ── Docks ────────────────────────────────────────────────

    pub async fn register_dock(&self, dock: Dock) -> Result<(), EngineError> {
        validate_dock(&dock)?;
        let _gate = self.compaction_gate.read().await;
        if self.state.len() >= MAX_DOCKS {
            return Err(EngineError::LimitExceeded("too many docks"));
        }
        if self.state.contains_key(&dock.id) {
            return Err(EngineError::AlreadyExists(dock.id));
        }

        let event = Event::DockRegistered { dock: dock.clone() };
        self.wal_append(&event).await?;
        self.state
            .insert(dock.id, Arc::new(RwLock::new(DockState::new(dock))));
        Ok(())
    }

    /// Update a dock's directory data. Existing booking codes keep the old
    /// dock code; tolerance and offset apply from now on.
    pub async fn update_dock(&self, dock: Dock) -> Result<(), EngineError> {
        validate_dock(&dock)?;
        let _gate = self.compaction_gate.read().await;
        let ds = self
            .get_dock_state(&dock.id)
            .ok_or(EngineError::NotFound(dock.id))?;
        let mut guard = ds.write().await;
        if guard.dock.warehouse_id != dock.warehouse_id {
            return Err(EngineError::LimitExceeded("dock cannot change warehouse"));
        }
        let event = Event::DockUpdated { dock };
        self.persist_and_apply(&mut guard, &event).await
    }

    // ── Blackout rules ───────────────────────────────────────

    /// Add a recurring blackout window. Rules are never edited in place;
    /// changing a window means removing the rule and adding a new one.
    /// Existing bookings are not re-validated against a new rule.
    pub async fn add_blackout_rule(&self, rule: BlackoutRule) -> Result<(), EngineError> {
        validate_rule(&rule)?;
        if self.rule_to_dock.contains_key(&rule.id) {
            return Err(EngineError::AlreadyExists(rule.id));
        }
        let _gate = self.compaction_gate.read().await;
        let ds = self
            .get_dock_state(&rule.dock_id)
            .ok_or(EngineError::NotFound(rule.dock_id))?;
        let mut guard = ds.write().await;
        if guard.rules.len() >= MAX_RULES_PER_DOCK {
            return Err(EngineError::LimitExceeded("too many blackout rules on dock"));
        }

        let event = Event::BlackoutRuleAdded { rule };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn remove_blackout_rule(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let dock_id = self
            .rule_to_dock
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        let ds = self
            .get_dock_state(&dock_id)
            .ok_or(EngineError::NotFound(dock_id))?;
        let mut guard = ds.write().await;
        if !guard.rules.iter().any(|r| r.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::BlackoutRuleRemoved { id, dock_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(dock_id)
    }

    // ── Reservations ─────────────────────────────────────────

    /// Validate, conflict-check, number, and persist a new booking.
    ///
    /// The dock's write lock encloses the blackout check, the overlap check,
    /// sequence allocation, and the insert, so two concurrent creates for
    /// overlapping intervals on the same dock cannot both succeed.
    /// Vendor bookings start IN_PROGRESS; staff/admin bookings start PENDING.
    pub async fn create_reservation(
        &self,
        caller: &Caller,
        input: NewReservation,
    ) -> Result<Booking, EngineError> {
        let span = validate_interval(input.arrival_time, input.estimated_finish_time)?;
        if input.vehicle_id.len() > MAX_NAME_LEN || input.driver_username.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("name too long"));
        }
        if let Some(ref n) = input.notes
            && n.len() > MAX_NOTES_LEN
        {
            return Err(EngineError::LimitExceeded("notes too long"));
        }

        let _gate = self.compaction_gate.read().await;
        let ds = self
            .get_dock_state(&input.dock_id)
            .ok_or(EngineError::NotFound(input.dock_id))?;
        let mut guard = ds.write().await;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_DOCK {
            return Err(EngineError::LimitExceeded("too many bookings on dock"));
        }

        check_bookable(&guard, &span, None)?;

        let dock = guard.dock.clone();
        let date = local_date(span.start, dock.utc_offset_min).ok_or(EngineError::InvalidInterval {
            arrival: span.start,
            finish: span.end,
        })?;
        let allocation = self
            .allocate_sequence(CounterKey {
                organization_name: caller.organization_name.clone(),
                warehouse_id: dock.warehouse_id.clone(),
                dock_id: dock.id,
                date,
            })
            .await?;

        let now = now_ms();
        let status = match caller.role {
            Role::Vendor => BookingStatus::InProgress,
            Role::Staff | Role::Admin => BookingStatus::Pending,
        };
        let booking = Booking {
            id: Ulid::new(),
            code: booking_code(&dock.code, date, allocation.value),
            dock_id: dock.id,
            warehouse_id: dock.warehouse_id,
            organization_name: caller.organization_name.clone(),
            vehicle_id: input.vehicle_id,
            driver_username: input.driver_username,
            created_by: caller.username.clone(),
            span,
            actual_arrival_time: None,
            actual_finish_time: None,
            status,
            canceled_reason: None,
            notes: input.notes,
            counter_id: allocation.id,
            created_at: now,
        };
        let audit = AuditRecord {
            booking_id: booking.id,
            action: ActionKind::Create,
            actor: caller.username.clone(),
            at: now,
            from: None,
            to: status,
            before: None,
            after: Placement {
                dock_id: dock.id,
                span,
            },
        };

        let event = Event::BookingCreated {
            booking: booking.clone(),
            audit,
        };
        self.persist_and_apply(&mut guard, &event).await?;

        tracing::info!(booking = %booking.id, code = %booking.code, "booking created ({status})");
        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL).increment(1);
        Ok(booking)
    }

    /// Apply a lifecycle action that keeps the booking on its dock and
    /// interval. Edits go through [`edit_and_reconfirm`](Self::edit_and_reconfirm).
    pub async fn transition(
        &self,
        caller: &Caller,
        booking_id: Ulid,
        action: Action,
    ) -> Result<Booking, EngineError> {
        if let Action::Reconfirm { span, dock_id } = action {
            return self
                .edit_and_reconfirm(caller, booking_id, span.start, span.end, Some(dock_id))
                .await;
        }

        let _gate = self.compaction_gate.read().await;
        let mut guard = self.lock_booking_dock(&booking_id).await?;
        let current = guard
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        let (next, audit) = lifecycle::apply(&current, &action, caller, now_ms())?;

        let to = next.status;
        let event = Event::BookingChanged {
            previous_dock_id: current.dock_id,
            booking: next.clone(),
            audit,
        };
        self.persist_and_apply(&mut guard, &event).await?;

        tracing::info!(booking = %booking_id, "{} -> {to} by {}", current.status, caller.username);
        metrics::counter!(crate::observability::TRANSITIONS_TOTAL, "to" => to.label()).increment(1);
        Ok(next)
    }

    pub async fn cancel_reservation(
        &self,
        caller: &Caller,
        booking_id: Ulid,
        reason: String,
    ) -> Result<Booking, EngineError> {
        self.transition(caller, booking_id, Action::Cancel { reason })
            .await
    }

    /// Move a PENDING/IN_PROGRESS booking to a new interval (and optionally
    /// a new dock), re-running both conflict checks against everything but
    /// itself, then transition it to IN_PROGRESS. Validation, interval
    /// change, and status change commit as one WAL record or not at all.
    pub async fn edit_and_reconfirm(
        &self,
        caller: &Caller,
        booking_id: Ulid,
        arrival_time: Ms,
        estimated_finish_time: Ms,
        new_dock_id: Option<Ulid>,
    ) -> Result<Booking, EngineError> {
        let span = validate_interval(arrival_time, estimated_finish_time)?;
        let _gate = self.compaction_gate.read().await;

        let current_dock = self
            .get_dock_for_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let target_dock = new_dock_id.unwrap_or(current_dock);
        if target_dock == current_dock {
            return self.reconfirm_in_place(caller, booking_id, span).await;
        }

        let source = self
            .get_dock_state(&current_dock)
            .ok_or(EngineError::NotFound(current_dock))?;
        let target = self
            .get_dock_state(&target_dock)
            .ok_or(EngineError::NotFound(target_dock))?;

        // Acquire write locks in sorted order to prevent deadlocks.
        let (mut from_guard, mut to_guard) = if current_dock < target_dock {
            let a = source.write_owned().await;
            let b = target.write_owned().await;
            (a, b)
        } else {
            let b = target.write_owned().await;
            let a = source.write_owned().await;
            (a, b)
        };

        // Moved by someone else between lookup and lock.
        let Some(current) = from_guard.booking(booking_id).cloned() else {
            return Err(EngineError::NotFound(booking_id));
        };
        if to_guard.dock.warehouse_id != current.warehouse_id {
            return Err(EngineError::LimitExceeded("cannot move booking to another warehouse"));
        }
        if to_guard.bookings.len() >= MAX_BOOKINGS_PER_DOCK {
            return Err(EngineError::LimitExceeded("too many bookings on dock"));
        }
        let action = Action::Reconfirm {
            span,
            dock_id: target_dock,
        };
        let (next, audit) = lifecycle::apply(&current, &action, caller, now_ms())?;
        check_bookable(&to_guard, &span, Some(booking_id))?;

        let event = Event::BookingChanged {
            previous_dock_id: current_dock,
            booking: next.clone(),
            audit,
        };
        self.persist_and_apply_move(&mut from_guard, &mut to_guard, &event)
            .await?;

        tracing::info!(
            booking = %booking_id,
            "moved {current_dock} -> {target_dock} and reconfirmed"
        );
        metrics::counter!(crate::observability::TRANSITIONS_TOTAL, "to" => next.status.label())
            .increment(1);
        Ok(next)
    }

    async fn reconfirm_in_place(
        &self,
        caller: &Caller,
        booking_id: Ulid,
        span: Span,
    ) -> Result<Booking, EngineError> {
        let mut guard = self.lock_booking_dock(&booking_id).await?;
        let current = guard
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        let action = Action::Reconfirm {
            span,
            dock_id: current.dock_id,
        };
        let (next, audit) = lifecycle::apply(&current, &action, caller, now_ms())?;
        check_bookable(&guard, &span, Some(booking_id))?;

        let event = Event::BookingChanged {
            previous_dock_id: current.dock_id,
            booking: next.clone(),
            audit,
        };
        self.persist_and_apply(&mut guard, &event).await?;

        tracing::info!(booking = %booking_id, "rescheduled and reconfirmed");
        metrics::counter!(crate::observability::TRANSITIONS_TOTAL, "to" => next.status.label())
            .increment(1);
        Ok(next)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state. Mutations wait at the gate meanwhile, so
    /// nothing appended concurrently can be lost by the swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.write().await;
        let mut events = Vec::new();

        let mut dock_states: Vec<(Ulid, SharedDockState)> = self
            .state
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        dock_states.sort_by_key(|(id, _)| *id);

        let mut bookings = Vec::new();
        for (_, ds) in &dock_states {
            let guard = ds.read().await;
            events.push(Event::DockRegistered {
                dock: guard.dock.clone(),
            });
            for rule in &guard.rules {
                events.push(Event::BlackoutRuleAdded { rule: rule.clone() });
            }
            bookings.extend(guard.bookings.iter().cloned());
        }

        let counter_slots: Vec<(CounterKey, super::SharedCounter)> = self
            .counters
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (key, slot) in counter_slots {
            let counter = *slot.lock().await;
            if counter.value > 0 {
                events.push(Event::SequenceAllocated {
                    allocation: SequenceAllocation {
                        id: counter.last_allocation,
                        key,
                        value: counter.value,
                    },
                });
            }
        }

        for booking in bookings {
            let trail = self
                .audit
                .get(&booking.id)
                .map(|e| e.value().clone())
                .unwrap_or_default();
            events.push(Event::BookingRestored { booking, trail });
        }

        let count = events.len();
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
