//! Newline-delimited JSON over TCP.
//!
//! Each request line is an object tagged by `"op"`. Each response line is
//! `{"ok":true,"data":...}` or `{"ok":false,"error":{...}}`. After `listen`,
//! `{"notice":...}` lines are interleaved with responses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, NaiveTime};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use ulid::Ulid;

use crate::engine::{Action, Engine, EngineError, NewReservation};
use crate::limits::MAX_LINE_LEN;
use crate::model::*;
use crate::observability;

const NOTICE_BUFFER: usize = 256;

/// One request line.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Auth {
        password: String,
    },
    RegisterDock {
        dock: Dock,
    },
    UpdateDock {
        dock: Dock,
    },
    AddBlackoutRule {
        dock_id: Ulid,
        time_from: NaiveTime,
        time_to: NaiveTime,
        reason: String,
        recurrence: Recurrence,
    },
    RemoveBlackoutRule {
        rule_id: Ulid,
    },
    CreateReservation {
        caller: Caller,
        reservation: NewReservation,
    },
    Transition {
        caller: Caller,
        booking_id: Ulid,
        action: ActionRequest,
    },
    CancelReservation {
        caller: Caller,
        booking_id: Ulid,
        reason: String,
    },
    EditAndReconfirm {
        caller: Caller,
        booking_id: Ulid,
        arrival_time: Ms,
        estimated_finish_time: Ms,
        dock_id: Option<Ulid>,
    },
    GetBooking {
        booking_id: Ulid,
    },
    ListBookings {
        dock_id: Ulid,
        from: Ms,
        to: Ms,
        #[serde(default)]
        include_canceled: bool,
    },
    AuditTrail {
        booking_id: Ulid,
    },
    BlackoutRules {
        dock_id: Ulid,
    },
    FreeSlots {
        dock_id: Ulid,
        date: NaiveDate,
        min_duration_ms: Option<Ms>,
    },
    DelayedBookings {
        dock_id: Ulid,
        now: Option<Ms>,
    },
    Listen {
        dock_id: Ulid,
    },
    Unlisten {
        dock_id: Ulid,
    },
}

/// Lifecycle steps that keep the booking where it is. Timestamps default
/// to the time the request is handled.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionRequest {
    Confirm,
    RecordArrival { at: Option<Ms> },
    StartUnloading { at: Option<Ms> },
    Finish { at: Option<Ms> },
}

impl ActionRequest {
    fn into_action(self, now: Ms) -> Action {
        match self {
            ActionRequest::Confirm => Action::Confirm,
            ActionRequest::RecordArrival { at } => Action::RecordArrival { at: at.unwrap_or(now) },
            ActionRequest::StartUnloading { at } => {
                Action::StartUnloading { at: at.unwrap_or(now) }
            }
            ActionRequest::Finish { at } => Action::Finish { at: at.unwrap_or(now) },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
    pub detail: Value,
}

impl ErrorBody {
    fn protocol(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: false,
            detail: Value::Null,
        }
    }
}

impl From<&EngineError> for ErrorBody {
    fn from(e: &EngineError) -> Self {
        Self {
            code: e.code(),
            message: e.to_string(),
            retryable: e.is_retryable(),
            detail: error_detail(e),
        }
    }
}

/// Structured detail so a client can render the rejection without a
/// second round-trip.
fn error_detail(e: &EngineError) -> Value {
    match e {
        EngineError::NotFound(id) | EngineError::AlreadyExists(id) => json!({ "id": id }),
        EngineError::InvalidInterval { arrival, finish } => {
            json!({ "arrival_time": arrival, "estimated_finish_time": finish })
        }
        EngineError::BlackoutConflict {
            rule_id,
            reason,
            window,
            kind,
        } => json!({
            "rule_id": rule_id,
            "reason": reason,
            "window": window,
            "kind": kind.to_string(),
        }),
        EngineError::BookingConflict { booking_id, span } => {
            json!({ "booking_id": booking_id, "span": span })
        }
        EngineError::InvalidTransition { from, to } => json!({ "from": from, "to": to }),
        EngineError::UnauthorizedCancel {
            username,
            booking_id,
        } => json!({ "username": username, "booking_id": booking_id }),
        EngineError::Forbidden { username, action } => {
            json!({ "username": username, "action": action })
        }
        EngineError::InvalidRule(_)
        | EngineError::SequenceAllocation(_)
        | EngineError::MissingCancelReason
        | EngineError::LimitExceeded(_)
        | EngineError::WalError(_) => Value::Null,
    }
}

fn ok_line(data: Value) -> String {
    json!({ "ok": true, "data": data }).to_string()
}

fn err_line(error: ErrorBody) -> String {
    json!({ "ok": false, "error": error }).to_string()
}

/// Run one engine operation. Connection-level ops (auth, listen) are
/// handled by the caller.
async fn dispatch(engine: &Engine, req: Request) -> Result<Value, EngineError> {
    let now = chrono::Utc::now().timestamp_millis();
    match req {
        Request::RegisterDock { dock } => {
            engine.register_dock(dock.clone()).await?;
            Ok(json!(dock))
        }
        Request::UpdateDock { dock } => {
            engine.update_dock(dock.clone()).await?;
            Ok(json!(dock))
        }
        Request::AddBlackoutRule {
            dock_id,
            time_from,
            time_to,
            reason,
            recurrence,
        } => {
            let rule = BlackoutRule {
                id: Ulid::new(),
                dock_id,
                time_from,
                time_to,
                reason,
                recurrence,
                created_at: now,
            };
            engine.add_blackout_rule(rule.clone()).await?;
            Ok(json!(rule))
        }
        Request::RemoveBlackoutRule { rule_id } => {
            let dock_id = engine.remove_blackout_rule(rule_id).await?;
            Ok(json!({ "rule_id": rule_id, "dock_id": dock_id }))
        }
        Request::CreateReservation {
            caller,
            reservation,
        } => Ok(json!(engine.create_reservation(&caller, reservation).await?)),
        Request::Transition {
            caller,
            booking_id,
            action,
        } => Ok(json!(
            engine
                .transition(&caller, booking_id, action.into_action(now))
                .await?
        )),
        Request::CancelReservation {
            caller,
            booking_id,
            reason,
        } => Ok(json!(
            engine.cancel_reservation(&caller, booking_id, reason).await?
        )),
        Request::EditAndReconfirm {
            caller,
            booking_id,
            arrival_time,
            estimated_finish_time,
            dock_id,
        } => Ok(json!(
            engine
                .edit_and_reconfirm(
                    &caller,
                    booking_id,
                    arrival_time,
                    estimated_finish_time,
                    dock_id,
                )
                .await?
        )),
        Request::GetBooking { booking_id } => {
            let booking = engine.get_booking(booking_id).await?;
            let status = engine.reported_status(booking_id, now).await?;
            Ok(json!({ "booking": booking, "reported_status": status }))
        }
        Request::ListBookings {
            dock_id,
            from,
            to,
            include_canceled,
        } => {
            if from >= to {
                return Err(EngineError::InvalidInterval {
                    arrival: from,
                    finish: to,
                });
            }
            let window = Span::new(from, to);
            Ok(json!(
                engine
                    .list_bookings(dock_id, window, include_canceled)
                    .await?
            ))
        }
        Request::AuditTrail { booking_id } => Ok(json!(engine.audit_trail(booking_id)?)),
        Request::BlackoutRules { dock_id } => Ok(json!(engine.blackout_rules(dock_id).await?)),
        Request::FreeSlots {
            dock_id,
            date,
            min_duration_ms,
        } => Ok(json!(
            engine.free_slots(dock_id, date, min_duration_ms).await?
        )),
        Request::DelayedBookings { dock_id, now: at } => Ok(json!(
            engine.delayed_bookings(dock_id, at.unwrap_or(now)).await?
        )),
        Request::Auth { .. } | Request::Listen { .. } | Request::Unlisten { .. } => {
            Ok(Value::Null)
        }
    }
}

/// Per-connection state: auth flag and notice forwarders by dock.
struct Session {
    authenticated: bool,
    listeners: HashMap<Ulid, JoinHandle<()>>,
    notice_tx: mpsc::Sender<StatusNotice>,
}

impl Session {
    fn listen(&mut self, engine: &Engine, dock_id: Ulid) {
        if self.listeners.contains_key(&dock_id) {
            return;
        }
        let mut rx = engine.notify.subscribe(dock_id);
        let tx = self.notice_tx.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(notice) => {
                        if tx.send(notice).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("listener on {dock_id} lagged, dropped {n} notices");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.listeners.insert(dock_id, handle);
    }

    fn unlisten(&mut self, engine: &Engine, dock_id: Ulid) {
        if let Some(handle) = self.listeners.remove(&dock_id) {
            handle.abort();
            engine.notify.release(&dock_id);
        }
    }

    fn close(&mut self, engine: &Engine) {
        let docks: Vec<Ulid> = self.listeners.keys().copied().collect();
        for dock_id in docks {
            self.unlisten(engine, dock_id);
        }
    }
}

/// Handle one request line, returning the response line.
async fn handle_line(engine: &Engine, password: &str, session: &mut Session, line: &str) -> String {
    let req: Request = match serde_json::from_str(line) {
        Ok(req) => req,
        Err(e) => return err_line(ErrorBody::protocol("bad_request", e.to_string())),
    };

    let op = observability::op_label(&req);
    let start = Instant::now();

    let reply = match req {
        Request::Auth { password: given } => {
            if given == password {
                session.authenticated = true;
                ok_line(json!({ "authenticated": true }))
            } else {
                metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
                err_line(ErrorBody::protocol("auth_failed", "password authentication failed"))
            }
        }
        _ if !session.authenticated => {
            err_line(ErrorBody::protocol("unauthenticated", "send auth first"))
        }
        Request::Listen { dock_id } => match engine.get_dock(dock_id).await {
            Ok(_) => {
                session.listen(engine, dock_id);
                ok_line(json!({ "listening": dock_id }))
            }
            Err(e) => err_line(ErrorBody::from(&e)),
        },
        Request::Unlisten { dock_id } => {
            session.unlisten(engine, dock_id);
            ok_line(json!({ "unlistened": dock_id }))
        }
        req => match dispatch(engine, req).await {
            Ok(data) => ok_line(data),
            Err(e) => {
                metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => "error")
                    .increment(1);
                return err_line(ErrorBody::from(&e));
            }
        },
    };

    metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op)
        .record(start.elapsed().as_secs_f64());
    metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => "ok").increment(1);
    reply
}

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
) -> Result<(), LinesCodecError> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let (notice_tx, mut notice_rx) = mpsc::channel(NOTICE_BUFFER);
    let mut session = Session {
        authenticated: false,
        listeners: HashMap::new(),
        notice_tx,
    };

    let result = loop {
        tokio::select! {
            line = framed.next() => {
                let reply = match line {
                    None => break Ok(()),
                    Some(Ok(line)) if line.trim().is_empty() => continue,
                    Some(Ok(line)) => handle_line(&engine, &password, &mut session, &line).await,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        err_line(ErrorBody::protocol("line_too_long", "request line too long"))
                    }
                    Some(Err(e)) => break Err(e),
                };
                if let Err(e) = framed.send(reply).await {
                    break Err(e);
                }
            }
            Some(notice) = notice_rx.recv() => {
                let line = json!({ "notice": notice }).to_string();
                if let Err(e) = framed.send(line).await {
                    break Err(e);
                }
            }
        }
    };

    session.close(&engine);
    result
}
