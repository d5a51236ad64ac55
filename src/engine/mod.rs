mod availability;
mod conflict;
mod error;
mod lifecycle;
mod mutations;
mod queries;
mod recurrence;
mod sequence;

pub use availability::{merge_overlapping, subtract_intervals};
pub use error::EngineError;
pub use lifecycle::{reported_status, target_status, Action};
pub use mutations::NewReservation;
pub use recurrence::{matches, resolve_window};
pub use sequence::booking_code;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedDockState = Arc<RwLock<DockState>>;

/// Last value handed out for one counter identity.
#[derive(Debug, Clone, Copy)]
pub(super) struct CounterState {
    pub value: u32,
    pub last_allocation: Ulid,
}

pub(super) type SharedCounter = Arc<Mutex<CounterState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(
    wal: &mut Wal,
    batch: &[(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so partially buffered bytes don't leak
    // into the next batch.
    let flush_err = wal.flush_sync().err();
    match append_err.or(flush_err) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// The dock reservation engine: per-dock state behind async RwLocks, a
/// durable WAL, sequence counters, and the audit trail.
pub struct Engine {
    pub state: DashMap<Ulid, SharedDockState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: booking id → dock id.
    pub(super) booking_to_dock: DashMap<Ulid, Ulid>,
    /// Reverse lookup: blackout rule id → dock id.
    pub(super) rule_to_dock: DashMap<Ulid, Ulid>,
    pub(super) counters: DashMap<CounterKey, SharedCounter>,
    pub(super) audit: DashMap<Ulid, Vec<AuditRecord>>,
    /// Mutations hold this shared; compaction holds it exclusively.
    pub(super) compaction_gate: RwLock<()>,
}

/// Apply the per-dock part of an event (caller holds the lock).
fn apply_to_dock(ds: &mut DockState, event: &Event) {
    match event {
        Event::DockUpdated { dock } => {
            ds.dock = dock.clone();
        }
        Event::BlackoutRuleAdded { rule } => ds.insert_rule(rule.clone()),
        Event::BlackoutRuleRemoved { id, .. } => {
            ds.remove_rule(*id);
        }
        Event::BookingCreated { booking, .. } | Event::BookingRestored { booking, .. } => {
            ds.insert_booking(booking.clone());
        }
        Event::BookingChanged { booking, .. } => {
            // Either side of a move: drop the old snapshot, keep the new one
            // only on the dock it now belongs to.
            ds.remove_booking(booking.id);
            if ds.dock.id == booking.dock_id {
                ds.insert_booking(booking.clone());
            }
        }
        // Registration is handled at the DashMap level; counters live outside docks.
        Event::DockRegistered { .. } | Event::SequenceAllocated { .. } => {}
    }
}

/// Docks whose state an event touches.
fn event_dock_ids(event: &Event) -> Vec<Ulid> {
    match event {
        Event::DockRegistered { dock } | Event::DockUpdated { dock } => vec![dock.id],
        Event::BlackoutRuleAdded { rule } => vec![rule.dock_id],
        Event::BlackoutRuleRemoved { dock_id, .. } => vec![*dock_id],
        Event::SequenceAllocated { .. } => vec![],
        Event::BookingCreated { booking, .. } | Event::BookingRestored { booking, .. } => {
            vec![booking.dock_id]
        }
        Event::BookingChanged {
            previous_dock_id,
            booking,
            ..
        } => {
            if *previous_dock_id == booking.dock_id {
                vec![booking.dock_id]
            } else {
                vec![*previous_dock_id, booking.dock_id]
            }
        }
    }
}

/// Notice announcing the transition an event records, if any.
fn notice_for(event: &Event) -> Option<StatusNotice> {
    let (booking, audit) = match event {
        Event::BookingCreated { booking, audit } | Event::BookingChanged { booking, audit, .. } => {
            (booking, audit)
        }
        _ => return None,
    };
    Some(StatusNotice {
        booking_id: booking.id,
        dock_id: booking.dock_id,
        code: booking.code.clone(),
        from: audit.from,
        to: audit.to,
        actor: audit.actor.clone(),
        at: audit.at,
    })
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            booking_to_dock: DashMap::new(),
            rule_to_dock: DashMap::new(),
            counters: DashMap::new(),
            audit: DashMap::new(),
            compaction_gate: RwLock::new(()),
        };

        // Replay: we are the sole owner of these Arcs, so try_write/try_lock
        // always succeed instantly. Never use blocking_write here because this
        // may run inside an async context.
        for event in &events {
            if let Event::DockRegistered { dock } = event {
                let ds = DockState::new(dock.clone());
                engine.state.insert(dock.id, Arc::new(RwLock::new(ds)));
                continue;
            }
            for dock_id in event_dock_ids(event) {
                if let Some(entry) = engine.state.get(&dock_id) {
                    let ds = entry.value().clone();
                    let mut guard = ds.try_write().expect("replay: uncontended write");
                    apply_to_dock(&mut guard, event);
                }
            }
            engine.index_event(event);
        }

        tracing::info!(
            "engine replayed {} events: {} docks, {} bookings",
            events.len(),
            engine.state.len(),
            engine.booking_to_dock.len()
        );
        Ok(engine)
    }

    /// Update engine-wide indexes: booking/rule lookups, counters, audit trail.
    fn index_event(&self, event: &Event) {
        match event {
            Event::BlackoutRuleAdded { rule } => {
                self.rule_to_dock.insert(rule.id, rule.dock_id);
            }
            Event::BlackoutRuleRemoved { id, .. } => {
                self.rule_to_dock.remove(id);
            }
            Event::SequenceAllocated { allocation } => {
                let slot = self
                    .counters
                    .entry(allocation.key.clone())
                    .or_insert_with(|| {
                        Arc::new(Mutex::new(CounterState {
                            value: 0,
                            last_allocation: allocation.id,
                        }))
                    })
                    .value()
                    .clone();
                let mut counter = slot.try_lock().expect("replay: uncontended counter");
                if allocation.value > counter.value {
                    counter.value = allocation.value;
                    counter.last_allocation = allocation.id;
                }
            }
            Event::BookingCreated { booking, audit }
            | Event::BookingChanged { booking, audit, .. } => {
                self.booking_to_dock.insert(booking.id, booking.dock_id);
                self.audit.entry(booking.id).or_default().push(audit.clone());
            }
            Event::BookingRestored { booking, trail } => {
                self.booking_to_dock.insert(booking.id, booking.dock_id);
                self.audit.insert(booking.id, trail.clone());
            }
            Event::DockRegistered { .. } | Event::DockUpdated { .. } => {}
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_dock_state(&self, id: &Ulid) -> Option<SharedDockState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_dock_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_dock.get(booking_id).map(|e| *e.value())
    }

    /// WAL-append + apply + index + notify for an event touching one dock.
    pub(super) async fn persist_and_apply(
        &self,
        ds: &mut DockState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_dock(ds, event);
        self.index_event(event);
        if let Some(notice) = notice_for(event) {
            self.notify.send(notice.dock_id, &notice);
        }
        Ok(())
    }

    /// Same as [`persist_and_apply`](Self::persist_and_apply) for a booking
    /// moving between two docks whose write locks the caller holds.
    pub(super) async fn persist_and_apply_move(
        &self,
        from: &mut DockState,
        to: &mut DockState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_dock(from, event);
        apply_to_dock(to, event);
        self.index_event(event);
        if let Some(notice) = notice_for(event) {
            self.notify.send(from.dock.id, &notice);
            self.notify.send(to.dock.id, &notice);
        }
        Ok(())
    }

    /// Lookup booking → dock, acquire that dock's write lock, and confirm
    /// the booking is still there (a concurrent move may have raced the lookup).
    pub(super) async fn lock_booking_dock(
        &self,
        booking_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<DockState>, EngineError> {
        for _ in 0..3 {
            let dock_id = self
                .get_dock_for_booking(booking_id)
                .ok_or(EngineError::NotFound(*booking_id))?;
            let ds = self
                .get_dock_state(&dock_id)
                .ok_or(EngineError::NotFound(dock_id))?;
            let guard = ds.write_owned().await;
            if guard.booking(*booking_id).is_some() {
                return Ok(guard);
            }
        }
        Err(EngineError::NotFound(*booking_id))
    }
}
