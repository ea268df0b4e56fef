use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use ulid::Ulid;

use slotbook::engine::{EngineConfig, EngineError, ReservationEngine};
use slotbook::model::{Page, ReservationStatus, Slot, Span, UserId};
use slotbook::notify::NotifyHub;
use slotbook::store::{SlotStore, WalStore};

const HOUR: i64 = 3_600_000; // 1 hour in ms
const BASE: i64 = 1_700_000_000_000;
const T: Duration = Duration::from_secs(5);
/// Every caller of the hot slot queues on one lock.
const HOT_T: Duration = Duration::from_secs(120);

type Engine = ReservationEngine<WalStore>;

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
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

async fn open_engine() -> Arc<Engine> {
    let dir = std::env::temp_dir().join(format!("slotbook_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let store = Arc::new(WalStore::open(&dir.join("slotbook.wal")).unwrap());
    Arc::new(ReservationEngine::new(
        store,
        Arc::new(NotifyHub::new()),
        EngineConfig::default(),
    ))
}

async fn create_slot(engine: &Engine, index: i64, capacity: u32) -> Ulid {
    let start = BASE + index * HOUR;
    let slot = Slot::new(Ulid::new(), Span::new(start, start + HOUR), capacity, None);
    engine.store().create_slot(&slot).await.unwrap();
    slot.id
}

async fn phase1_sequential(engine: &Engine) {
    let slot_id = create_slot(engine, 0, 1).await;
    let user = UserId::from("solo");

    let n = 2000;
    let mut latencies = Vec::with_capacity(n * 2);
    let start = Instant::now();

    for _ in 0..n {
        let t = Instant::now();
        engine.book(slot_id, &user, T).await.unwrap();
        latencies.push(t.elapsed());
        let t = Instant::now();
        engine.cancel(slot_id, &user, T).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = (n * 2) as f64 / elapsed.as_secs_f64();
    println!(
        "  {n} book/cancel pairs in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
    print_latency("write latency", &mut latencies);
}

async fn phase2_independent_slots(engine: &Arc<Engine>) {
    let n_tasks = 10;
    let n_per_task = 200;

    let start = Instant::now();
    let mut handles = Vec::new();

    for i in 0..n_tasks {
        let engine = engine.clone();
        let slot_id = create_slot(&engine, 100 + i as i64, 1).await;
        handles.push(tokio::spawn(async move {
            let user = UserId::new(format!("player{i}"));
            for _ in 0..n_per_task {
                engine.book(slot_id, &user, T).await.unwrap();
                engine.cancel(slot_id, &user, T).await.unwrap();
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task * 2;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} slots x {n_per_task} cycles = {total} mutations in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_hot_slot(engine: &Arc<Engine>) {
    let capacity = 5;
    let slot_id = create_slot(engine, 200, capacity).await;
    let n_users = 200;
    let rounds = 10;

    let accepted = Arc::new(AtomicUsize::new(0));
    let full = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for i in 0..n_users {
        let engine = engine.clone();
        let accepted = accepted.clone();
        let full = full.clone();
        handles.push(tokio::spawn(async move {
            let user = UserId::new(format!("fan{i}"));
            for _ in 0..rounds {
                match engine.book(slot_id, &user, HOT_T).await {
                    Ok(_) => {
                        accepted.fetch_add(1, Ordering::Relaxed);
                        tokio::task::yield_now().await;
                        engine.cancel(slot_id, &user, HOT_T).await.unwrap();
                        accepted.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(EngineError::SlotFull { .. }) => {
                        full.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let occ = engine.occupancy(slot_id).await.unwrap();
    let accepted = accepted.load(Ordering::Relaxed);
    println!(
        "  {n_users} users x {rounds} attempts on capacity {capacity}: {accepted} accepted, {} full in {:.2}s",
        full.load(Ordering::Relaxed),
        elapsed.as_secs_f64()
    );
    assert_eq!(occ.booked_count, 0, "occupancy drifted");
    assert_eq!(occ.version, accepted as u64, "version skipped or repeated");
    println!("  invariant held: version={} booked=0", occ.version);
}

async fn phase4_read_under_load(engine: &Arc<Engine>) {
    let read_slot = create_slot(engine, 300, 10).await;
    for i in 0..10 {
        engine
            .book(read_slot, &UserId::new(format!("reader{i}")), T)
            .await
            .unwrap();
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let engine = engine.clone();
        let stop = stop.clone();
        let slot_id = create_slot(engine.as_ref(), 400 + w, 1).await;
        writer_handles.push(tokio::spawn(async move {
            let user = UserId::new(format!("writer{w}"));
            while !stop.load(Ordering::Relaxed) {
                let _ = engine.book(slot_id, &user, T).await;
                let _ = engine.cancel(slot_id, &user, T).await;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for _ in 0..n_readers {
        let engine = engine.clone();
        reader_handles.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                engine.occupancy(read_slot).await.unwrap();
                engine
                    .reservations_for_slot(read_slot, Some(ReservationStatus::Active), Page::default())
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("occupancy + listing", &mut all_latencies);
}

#[tokio::main]
async fn main() {
    println!("=== slotbook stress benchmark ===\n");
    let engine = open_engine().await;

    println!("[phase 1] sequential book/cancel");
    phase1_sequential(&engine).await;

    println!("\n[phase 2] concurrent writes on independent slots");
    phase2_independent_slots(&engine).await;

    println!("\n[phase 3] contention on one hot slot");
    phase3_hot_slot(&engine).await;

    println!("\n[phase 4] read latency under write load");
    phase4_read_under_load(&engine).await;

    let compact_start = Instant::now();
    let appends = engine.store().appends_since_compact().await;
    engine.store().compact().await.unwrap();
    println!(
        "\n[compaction] {appends} appends compacted in {:.2}ms",
        compact_start.elapsed().as_secs_f64() * 1000.0
    );

    println!("\n=== benchmark complete ===");
}
