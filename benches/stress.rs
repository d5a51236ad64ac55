use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{NaiveDate, NaiveTime, Weekday};
use ulid::Ulid;

use dockbook::engine::{Engine, EngineError, NewReservation};
use dockbook::model::*;
use dockbook::notify::NotifyHub;

const HOUR: i64 = 3_600_000; // 1 hour in ms
const BASE: i64 = 1_704_067_200_000; // 2024-01-01 00:00 UTC, a Monday

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().map_or(0.0, |d| d.as_secs_f64() * 1000.0),
    );
}

fn vendor(i: usize) -> Caller {
    Caller {
        username: format!("vendor{i}"),
        role: Role::Vendor,
        organization_name: format!("org{}", i % 3),
        vendor_name: None,
    }
}

fn request(dock_id: Ulid, start: i64, end: i64) -> NewReservation {
    NewReservation {
        dock_id,
        vehicle_id: "TRK".into(),
        driver_username: "driver".into(),
        arrival_time: start,
        estimated_finish_time: end,
        notes: None,
    }
}

async fn new_engine(name: &str) -> Arc<Engine> {
    let dir = std::env::temp_dir().join(format!("dockbook_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    Arc::new(Engine::new(dir.join(format!("{name}.wal")), Arc::new(NotifyHub::new())).unwrap())
}

async fn setup_docks(engine: &Engine, n: usize) -> Vec<Ulid> {
    let mut docks = Vec::with_capacity(n);
    for i in 0..n {
        let dock = Dock {
            id: Ulid::new(),
            warehouse_id: "WH1".into(),
            code: format!("D{i}"),
            delay_tolerance_min: 15,
            utc_offset_min: 0,
        };
        engine.register_dock(dock.clone()).await.unwrap();
        // Weekday lunch break on every dock, so the blackout check does real work.
        engine
            .add_blackout_rule(BlackoutRule {
                id: Ulid::new(),
                dock_id: dock.id,
                time_from: NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
                time_to: NaiveTime::from_hms_opt(13, 0, 0).unwrap(),
                reason: "lunch".into(),
                recurrence: Recurrence::Weekly {
                    days: vec![
                        Weekday::Mon,
                        Weekday::Tue,
                        Weekday::Wed,
                        Weekday::Thu,
                        Weekday::Fri,
                    ],
                },
                created_at: 0,
            })
            .await
            .unwrap();
        docks.push(dock.id);
    }
    println!("  created {} docks", docks.len());
    docks
}

/// Sequential creates on one dock, hour after hour.
async fn phase1_sequential() {
    let engine = new_engine("phase1").await;
    let dock_id = setup_docks(&engine, 1).await[0];

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let mut rejected = 0;
    let start = Instant::now();

    for i in 0..n {
        let s = BASE + (i as i64) * HOUR;
        let t = Instant::now();
        match engine.create_reservation(&vendor(i), request(dock_id, s, s + HOUR)).await {
            Ok(_) => latencies.push(t.elapsed()),
            Err(EngineError::BlackoutConflict { .. }) => rejected += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!(
        "  {n} creates ({rejected} hit lunch) in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
    print_latency("create latency", &mut latencies);
}

/// Concurrent creates spread across docks.
async fn phase2_concurrent() {
    let engine = new_engine("phase2").await;
    let docks = setup_docks(&engine, 10).await;
    let n_tasks = 20;
    let n_per_task = 200;

    let start = Instant::now();
    let mut handles = Vec::new();
    for t in 0..n_tasks {
        let engine = engine.clone();
        let dock_id = docks[t % docks.len()];
        handles.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(n_per_task);
            for j in 0..n_per_task {
                // Two tasks share each dock and interleave their hours.
                let slot = (j * 2 + t / docks.len()) as i64;
                let s = BASE + slot * HOUR;
                let t0 = Instant::now();
                if engine
                    .create_reservation(&vendor(t), request(dock_id, s, s + HOUR))
                    .await
                    .is_ok()
                {
                    latencies.push(t0.elapsed());
                }
            }
            latencies
        }));
    }

    let mut latencies = Vec::new();
    for h in handles {
        latencies.extend(h.await.unwrap());
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} creates = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
    print_latency("accepted create latency", &mut latencies);
}

/// Many tasks fight over the same slots on one dock. Exactly one create per
/// slot may win.
async fn phase3_contention() {
    let engine = new_engine("phase3").await;
    let dock_id = setup_docks(&engine, 1).await[0];
    let slots = 50;
    let contenders = 8;
    let wins = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for c in 0..contenders {
        let engine = engine.clone();
        let wins = wins.clone();
        handles.push(tokio::spawn(async move {
            for slot in 0..slots {
                let s = BASE + 6 * HOUR + slot as i64 * 10 * 60_000;
                match engine
                    .create_reservation(&vendor(c), request(dock_id, s, s + 10 * 60_000))
                    .await
                {
                    Ok(_) => {
                        wins.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(
                        EngineError::BookingConflict { .. } | EngineError::BlackoutConflict { .. },
                    ) => {}
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let day = Span::new(BASE, BASE + 24 * HOUR);
    let booked = engine.list_bookings(dock_id, day, false).await.unwrap();
    for (i, a) in booked.iter().enumerate() {
        for b in &booked[i + 1..] {
            assert!(!a.span.overlaps(&b.span), "overlap detected");
        }
    }
    println!(
        "  {contenders} contenders x {slots} slots: {} accepted, {} bookings, in {:.2}s",
        wins.load(Ordering::Relaxed),
        booked.len(),
        start.elapsed().as_secs_f64()
    );
}

/// Free-slot queries while writers keep booking.
async fn phase4_read_under_load() {
    let engine = new_engine("phase4").await;
    let docks = setup_docks(&engine, 4).await;
    let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let mut writers = Vec::new();
    for (w, &dock_id) in docks.iter().enumerate() {
        let engine = engine.clone();
        let stop = stop.clone();
        writers.push(tokio::spawn(async move {
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) && i < 24 * 6 {
                let s = BASE + i * 10 * 60_000;
                let _ = engine
                    .create_reservation(&vendor(w), request(dock_id, s, s + 10 * 60_000))
                    .await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut readers = Vec::new();
    for r in 0..n_readers {
        let engine = engine.clone();
        let dock_id = docks[r % docks.len()];
        readers.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                engine.free_slots(dock_id, date, Some(HOUR)).await.unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut latencies = Vec::new();
    for h in readers {
        latencies.extend(h.await.unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    for h in writers {
        h.await.unwrap();
    }
    print_latency("free_slots latency under write load", &mut latencies);
}

#[tokio::main]
async fn main() {
    println!("=== dockbook stress benchmark ===\n");

    println!("[phase 1] sequential create throughput");
    phase1_sequential().await;

    println!("\n[phase 2] concurrent creates across docks");
    phase2_concurrent().await;

    println!("\n[phase 3] contention on one dock");
    phase3_contention().await;

    println!("\n[phase 4] free-slot latency under write load");
    phase4_read_under_load().await;

    println!("\n=== benchmark complete ===");
}
