use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_postgres::{Config, NoTls};

const DAYS: [&str; 5] = ["Monday", "Tuesday", "Wednesday", "Thursday", "Friday"];

async fn connect(host: &str, port: u16) -> tokio_postgres::Client {
    let password = std::env::var("TIMETABLED_PASSWORD").unwrap_or_else(|_| "timetabled".into());
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("bench")
        .user("bench")
        .password(password);

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

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

/// `HH:MM:SS` for a slot index, in 15-minute steps from 07:00.
fn slot_time(slot: u32) -> String {
    let minutes = 7 * 60 + slot * 15;
    format!("{:02}:{:02}:00", minutes / 60, minutes % 60)
}

fn insert_sql(room: u64, instructor: u64, day: &str, slot: u32) -> String {
    format!(
        "INSERT INTO bookings (room_id, course_id, instructor_id, academic_unit_id, weekday, start_time, end_time) \
         VALUES ({room}, 1, {instructor}, 1, '{day}', '{}', '{}')",
        slot_time(slot),
        slot_time(slot + 1)
    )
}

/// Room and instructor ids are offset per run so repeated runs against the
/// same server do not collide with earlier data.
fn run_base() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
        % 1_000_000
        * 10_000
}

async fn phase1_sequential(host: &str, port: u16, base: u64) {
    let client = connect(host, port).await;
    let n = 2000u32;
    let mut latencies = Vec::with_capacity(n as usize);
    let start = Instant::now();

    for i in 0..n {
        let room = base + (i / 200) as u64;
        let day = DAYS[(i / 40 % 5) as usize];
        let sql = insert_sql(room, base + 5000 + room, day, i % 40);
        let t = Instant::now();
        client.batch_execute(&sql).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("admission latency", &mut latencies);
}

async fn phase2_disjoint_concurrent(host: &str, port: u16, base: u64) {
    let n_tasks = 10u64;
    let n_per_task = 200u32;

    let start = Instant::now();
    let mut handles = Vec::new();

    for t in 0..n_tasks {
        let host = host.to_string();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let room = base + 1000 + t;
            for j in 0..n_per_task {
                let day = DAYS[(j / 40 % 5) as usize];
                client
                    .batch_execute(&insert_sql(room, base + 6000 + t, day, j % 40))
                    .await
                    .unwrap();
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task as u64;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} bookings = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

/// Every task races for the same room and slots; each slot must be won once.
async fn phase3_contended(host: &str, port: u16, base: u64) {
    let n_tasks = 20u64;
    let slots = 40u32;
    let room = base + 2000;

    let admitted = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));
    let busy = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for t in 0..n_tasks {
        let host = host.to_string();
        let (admitted, conflicts, busy) = (admitted.clone(), conflicts.clone(), busy.clone());
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            for slot in 0..slots {
                match client
                    .batch_execute(&insert_sql(room, base + 7000 + t, "Monday", slot))
                    .await
                {
                    Ok(()) => admitted.fetch_add(1, Ordering::Relaxed),
                    Err(e) if e.code().map(|c| c.code()) == Some("55P03") => {
                        busy.fetch_add(1, Ordering::Relaxed)
                    }
                    Err(_) => conflicts.fetch_add(1, Ordering::Relaxed),
                };
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let admitted = admitted.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} tasks x {slots} slots in {:.2}s: {admitted} admitted, {} conflicts, {} busy",
        start.elapsed().as_secs_f64(),
        conflicts.load(Ordering::Relaxed),
        busy.load(Ordering::Relaxed),
    );
    assert!(admitted <= slots as usize, "double booking detected");
}

async fn phase4_read_under_load(host: &str, port: u16, base: u64) {
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5u64 {
        let host = host.to_string();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let mut i = 0u32;
            while !stop.load(Ordering::Relaxed) {
                let room = base + 3000 + w * 100 + (i / 200) as u64;
                let day = DAYS[(i / 40 % 5) as usize];
                let _ = client
                    .batch_execute(&insert_sql(room, base + 8000 + w * 100 + (i / 200) as u64, day, i % 40))
                    .await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let host = host.to_string();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let room = base + (i % 10) as u64;
                let day = DAYS[(r + i) % 5];
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        "SELECT * FROM bookings WHERE room_id = {room} AND weekday = '{day}'"
                    ))
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

    print_latency("schedule query", &mut all_latencies);
}

#[tokio::main]
async fn main() {
    let host = std::env::var("TIMETABLED_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("TIMETABLED_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid TIMETABLED_PORT");
    let base = run_base();

    println!("=== timetabled stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential admission throughput");
    phase1_sequential(&host, port, base).await;

    println!("\n[phase 2] concurrent admission, disjoint rooms");
    phase2_disjoint_concurrent(&host, port, base).await;

    println!("\n[phase 3] concurrent admission, one contended room");
    phase3_contended(&host, port, base).await;

    println!("\n[phase 4] read latency under write load");
    phase4_read_under_load(&host, port, base).await;

    println!("\n=== benchmark complete ===");
}
