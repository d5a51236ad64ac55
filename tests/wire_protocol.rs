use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use dockbook::engine::Engine;
use dockbook::notify::NotifyHub;
use dockbook::wire;

const PASSWORD: &str = "dockbook";

// 2024-01-01 (a Monday), UTC.
const MONDAY_09: i64 = 1_704_099_600_000;
const H: i64 = 3_600_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("dockbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(
        Engine::new(dir.join("dockbook.wal"), Arc::new(NotifyHub::new())).unwrap(),
    );

    let eng = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let eng = eng.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, eng, PASSWORD.to_string()).await;
            });
        }
    });

    (addr, engine)
}

struct Client {
    framed: Framed<TcpStream, LinesCodec>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let socket = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(socket, LinesCodec::new()),
        }
    }

    async fn authed(addr: SocketAddr) -> Self {
        let mut client = Self::connect(addr).await;
        let resp = client.call(json!({ "op": "auth", "password": PASSWORD })).await;
        assert_eq!(resp["ok"], json!(true));
        client
    }

    async fn next_line(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("timed out waiting for line")
            .expect("connection closed")
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    /// Send a request and return the next non-notice line.
    async fn call(&mut self, req: Value) -> Value {
        self.framed.send(req.to_string()).await.unwrap();
        loop {
            let line = self.next_line().await;
            if line.get("notice").is_none() {
                return line;
            }
        }
    }
}

fn caller(username: &str, role: &str) -> Value {
    json!({
        "username": username,
        "role": role,
        "organization_name": "acme",
        "vendor_name": null,
    })
}

async fn register_dock(client: &mut Client, code: &str) -> String {
    let id = Ulid::new().to_string();
    let resp = client
        .call(json!({
            "op": "register_dock",
            "dock": {
                "id": id,
                "warehouse_id": "WH1",
                "code": code,
                "delay_tolerance_min": 15,
                "utc_offset_min": 0,
            },
        }))
        .await;
    assert_eq!(resp["ok"], json!(true), "{resp}");
    id
}

fn reservation(dock_id: &str, start: i64, end: i64) -> Value {
    json!({
        "dock_id": dock_id,
        "vehicle_id": "TRK-1",
        "driver_username": "dave",
        "arrival_time": start,
        "estimated_finish_time": end,
        "notes": null,
    })
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn requests_before_auth_are_rejected() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;

    let resp = client.call(json!({ "op": "get_booking", "booking_id": Ulid::new() })).await;
    assert_eq!(resp["ok"], json!(false));
    assert_eq!(resp["error"]["code"], json!("unauthenticated"));

    let resp = client.call(json!({ "op": "auth", "password": "wrong" })).await;
    assert_eq!(resp["error"]["code"], json!("auth_failed"));

    let resp = client.call(json!({ "op": "auth", "password": PASSWORD })).await;
    assert_eq!(resp["ok"], json!(true));
}

#[tokio::test]
async fn malformed_lines_get_bad_request() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::authed(addr).await;

    client.framed.send("not json".to_string()).await.unwrap();
    let resp = client.next_line().await;
    assert_eq!(resp["error"]["code"], json!("bad_request"));

    let resp = client.call(json!({ "op": "teleport" })).await;
    assert_eq!(resp["error"]["code"], json!("bad_request"));

    // The connection survives.
    let resp = client.call(json!({ "op": "blackout_rules", "dock_id": Ulid::new() })).await;
    assert_eq!(resp["error"]["code"], json!("not_found"));
}

#[tokio::test]
async fn blackout_and_overlap_conflicts_over_the_wire() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::authed(addr).await;
    let dock_id = register_dock(&mut client, "D1").await;

    let resp = client
        .call(json!({
            "op": "add_blackout_rule",
            "dock_id": dock_id,
            "time_from": "12:00:00",
            "time_to": "13:00:00",
            "reason": "lunch",
            "recurrence": { "WEEKLY": { "days": ["Mon"] } },
        }))
        .await;
    assert_eq!(resp["ok"], json!(true), "{resp}");
    let rule_id = resp["data"]["id"].clone();

    // Monday 12:30-13:30 hits lunch.
    let resp = client
        .call(json!({
            "op": "create_reservation",
            "caller": caller("vera", "VENDOR"),
            "reservation": reservation(
                &dock_id,
                MONDAY_09 + 3 * H + H / 2,
                MONDAY_09 + 4 * H + H / 2,
            ),
        }))
        .await;
    assert_eq!(resp["ok"], json!(false));
    assert_eq!(resp["error"]["code"], json!("blackout_conflict"));
    assert_eq!(resp["error"]["retryable"], json!(false));
    assert_eq!(resp["error"]["detail"]["reason"], json!("lunch"));
    assert_eq!(resp["error"]["detail"]["rule_id"], rule_id);
    assert_eq!(resp["error"]["detail"]["kind"], json!("WEEKLY"));

    let resp = client
        .call(json!({
            "op": "create_reservation",
            "caller": caller("vera", "VENDOR"),
            "reservation": reservation(&dock_id, MONDAY_09, MONDAY_09 + H),
        }))
        .await;
    assert_eq!(resp["ok"], json!(true), "{resp}");
    assert_eq!(resp["data"]["code"], json!("D1-20240101-001"));
    assert_eq!(resp["data"]["status"], json!("IN_PROGRESS"));
    let first_id = resp["data"]["id"].clone();

    let resp = client
        .call(json!({
            "op": "create_reservation",
            "caller": caller("vince", "VENDOR"),
            "reservation": reservation(&dock_id, MONDAY_09 + H / 2, MONDAY_09 + H + H / 2),
        }))
        .await;
    assert_eq!(resp["error"]["code"], json!("booking_conflict"));
    assert_eq!(resp["error"]["detail"]["booking_id"], first_id);

    let resp = client
        .call(json!({
            "op": "free_slots",
            "dock_id": dock_id,
            "date": "2024-01-01",
            "min_duration_ms": 2 * H,
        }))
        .await;
    let slots = resp["data"].as_array().unwrap();
    // 00:00-09:00, 10:00-12:00, 13:00-24:00
    assert_eq!(slots.len(), 3);
    assert_eq!(slots[1]["start"], json!(MONDAY_09 + H));
    assert_eq!(slots[1]["end"], json!(MONDAY_09 + 3 * H));
}

#[tokio::test]
async fn lifecycle_and_listen() {
    let (addr, _engine) = start_test_server().await;
    let mut staff = Client::authed(addr).await;
    let mut watcher = Client::authed(addr).await;
    let dock_id = register_dock(&mut staff, "D1").await;

    let resp = watcher.call(json!({ "op": "listen", "dock_id": dock_id })).await;
    assert_eq!(resp["ok"], json!(true));

    let resp = staff
        .call(json!({
            "op": "create_reservation",
            "caller": caller("sam", "STAFF"),
            "reservation": reservation(&dock_id, MONDAY_09, MONDAY_09 + H),
        }))
        .await;
    assert_eq!(resp["data"]["status"], json!("PENDING"));
    let booking_id = resp["data"]["id"].clone();

    let created = watcher.next_line().await;
    assert_eq!(created["notice"]["booking_id"], booking_id);
    assert_eq!(created["notice"]["from"], Value::Null);
    assert_eq!(created["notice"]["to"], json!("PENDING"));

    let resp = staff
        .call(json!({
            "op": "transition",
            "caller": caller("sam", "STAFF"),
            "booking_id": booking_id,
            "action": { "kind": "confirm" },
        }))
        .await;
    assert_eq!(resp["data"]["status"], json!("IN_PROGRESS"), "{resp}");

    let confirmed = watcher.next_line().await;
    assert_eq!(confirmed["notice"]["from"], json!("PENDING"));
    assert_eq!(confirmed["notice"]["to"], json!("IN_PROGRESS"));
    assert_eq!(confirmed["notice"]["actor"], json!("sam"));

    // Vendors may not drive staff transitions.
    let resp = staff
        .call(json!({
            "op": "transition",
            "caller": caller("vera", "VENDOR"),
            "booking_id": booking_id,
            "action": { "kind": "start_unloading" },
        }))
        .await;
    assert_eq!(resp["error"]["code"], json!("forbidden"));

    let resp = staff
        .call(json!({
            "op": "cancel_reservation",
            "caller": caller("mallory", "VENDOR"),
            "booking_id": booking_id,
            "reason": "nope",
        }))
        .await;
    assert_eq!(resp["error"]["code"], json!("unauthorized_cancel"));

    let resp = staff
        .call(json!({
            "op": "cancel_reservation",
            "caller": caller("dave", "VENDOR"),
            "booking_id": booking_id,
            "reason": "truck broke down",
        }))
        .await;
    assert_eq!(resp["data"]["status"], json!("CANCELED"));
    let canceled = watcher.next_line().await;
    assert_eq!(canceled["notice"]["to"], json!("CANCELED"));

    let resp = staff.call(json!({ "op": "audit_trail", "booking_id": booking_id })).await;
    let trail = resp["data"].as_array().unwrap();
    assert_eq!(trail.len(), 3);
    assert_eq!(trail[2]["action"], json!("CANCEL"));
    assert_eq!(trail[2]["actor"], json!("dave"));

    let resp = watcher.call(json!({ "op": "unlisten", "dock_id": dock_id })).await;
    assert_eq!(resp["ok"], json!(true));
}

#[tokio::test]
async fn edit_and_reconfirm_moves_between_docks() {
    let (addr, engine) = start_test_server().await;
    let mut client = Client::authed(addr).await;
    let d1 = register_dock(&mut client, "D1").await;
    let d2 = register_dock(&mut client, "D2").await;

    let resp = client
        .call(json!({
            "op": "create_reservation",
            "caller": caller("sam", "STAFF"),
            "reservation": reservation(&d1, MONDAY_09, MONDAY_09 + H),
        }))
        .await;
    let booking_id = resp["data"]["id"].clone();

    let resp = client
        .call(json!({
            "op": "edit_and_reconfirm",
            "caller": caller("sam", "STAFF"),
            "booking_id": booking_id,
            "arrival_time": MONDAY_09 + 2 * H,
            "estimated_finish_time": MONDAY_09 + 3 * H,
            "dock_id": d2,
        }))
        .await;
    assert_eq!(resp["ok"], json!(true), "{resp}");
    assert_eq!(resp["data"]["dock_id"], json!(d2));
    assert_eq!(resp["data"]["status"], json!("IN_PROGRESS"));

    let resp = client
        .call(json!({
            "op": "list_bookings",
            "dock_id": d1,
            "from": MONDAY_09 - 9 * H,
            "to": MONDAY_09 + 15 * H,
            "include_canceled": true,
        }))
        .await;
    assert_eq!(resp["data"], json!([]));

    let id: Ulid = serde_json::from_value(booking_id).unwrap();
    assert_eq!(engine.get_booking(id).await.unwrap().dock_id.to_string(), d2);
}
