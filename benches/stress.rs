//! Latency stress for the scheduling engine: sequential bookings on one
//! teacher, parallel bookings across many teachers, and slot-candidate
//! enumeration over a loaded calendar. Run with `cargo bench`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Weekday};
use ulid::Ulid;

use rota::directory::{InMemoryCuration, InMemoryDirectory, InMemoryEnrollments, InMemoryLedger};
use rota::model::{Campus, Class, MinuteSpan, Teacher};
use rota::{BookingCandidate, ChangeFeed, DateRange, Engine, Services, SystemClock};

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
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
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

fn wal_path() -> PathBuf {
    let dir = std::env::temp_dir().join("rota_bench");
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(format!("stress_{}.wal", Ulid::new()))
}

struct Bench {
    engine: Arc<Engine>,
    campus_id: Ulid,
    directory: Arc<InMemoryDirectory>,
}

async fn setup() -> Bench {
    let directory = Arc::new(InMemoryDirectory::new());
    let campus_id = Ulid::new();
    directory.upsert_campus(Campus {
        id: campus_id,
        name: None,
        online: true,
    });
    let services = Services {
        directory: directory.clone(),
        enrollment: Arc::new(InMemoryEnrollments::new()),
        ledger: Arc::new(InMemoryLedger::new()),
        curation: Arc::new(InMemoryCuration::new()),
        clock: Arc::new(SystemClock),
    };
    let engine = Arc::new(Engine::new(wal_path(), services, Arc::new(ChangeFeed::new())).unwrap());
    Bench {
        engine,
        campus_id,
        directory,
    }
}

async fn provision_teacher(bench: &Bench) -> Class {
    let teacher_id = Ulid::new();
    bench.directory.upsert_teacher(Teacher {
        id: teacher_id,
        name: None,
        primary_subject: None,
        subjects: vec![],
    });
    let class = Class {
        id: Ulid::new(),
        course_id: Ulid::new(),
        subject_id: None,
        level_id: None,
        teacher_id,
        campus_id: bench.campus_id,
        room_id: None,
        capacity: 8,
        label: None,
    };
    bench.directory.upsert_class(class.clone());
    for weekday in [
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
    ] {
        bench
            .engine
            .add_rule(teacher_id, weekday, MinuteSpan::new(0, 1440))
            .await
            .unwrap();
    }
    class
}

/// The i-th weekday on or after 2025-01-06 (a Monday), five per week.
fn booking(class: &Class, i: u32) -> BookingCandidate {
    let (week, day) = (i / 5, i % 5);
    let date = NaiveDate::from_ymd_opt(2025, 1, 6).unwrap()
        + chrono::Duration::days(i64::from(week) * 7 + i64::from(day));
    BookingCandidate {
        class_id: class.id,
        start_at: date.and_hms_opt(9, 0, 0).unwrap(),
        end_at: date.and_hms_opt(10, 0, 0).unwrap(),
        student_id: None,
    }
}

async fn phase1_sequential(bench: &Bench) {
    let class = provision_teacher(bench).await;
    let n = 250;
    let mut latencies = Vec::with_capacity(n as usize);
    let start = Instant::now();
    for i in 0..n {
        let t = Instant::now();
        bench.engine.create_session(&booking(&class, i)).await.unwrap();
        latencies.push(t.elapsed());
    }
    let elapsed = start.elapsed();
    println!(
        "  throughput: {:.0} bookings/s",
        n as f64 / elapsed.as_secs_f64()
    );
    print_latency("sequential create_session", &mut latencies);
}

async fn phase2_parallel(bench: &Bench) {
    let mut handles = Vec::new();
    let start = Instant::now();
    for _ in 0..16 {
        let class = provision_teacher(bench).await;
        let engine = bench.engine.clone();
        handles.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(50);
            for i in 0..50 {
                let t = Instant::now();
                engine.create_session(&booking(&class, i)).await.unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }
    let mut latencies = Vec::new();
    for handle in handles {
        latencies.extend(handle.await.unwrap());
    }
    let elapsed = start.elapsed();
    println!(
        "  throughput: {:.0} bookings/s across 16 teachers",
        latencies.len() as f64 / elapsed.as_secs_f64()
    );
    print_latency("parallel create_session", &mut latencies);
}

async fn phase3_slot_candidates(bench: &Bench) {
    let class = provision_teacher(bench).await;
    for i in 0..100 {
        bench.engine.create_session(&booking(&class, i)).await.unwrap();
    }
    let range = DateRange::new(
        NaiveDate::from_ymd_opt(2025, 1, 6).unwrap(),
        NaiveDate::from_ymd_opt(2025, 1, 31).unwrap(),
    );
    let mut latencies = Vec::with_capacity(100);
    for _ in 0..100 {
        let t = Instant::now();
        let candidates = bench
            .engine
            .build_slot_candidates(&[class.teacher_id], &range, 60, 30)
            .await
            .unwrap();
        assert!(!candidates.is_empty());
        latencies.push(t.elapsed());
    }
    print_latency("build_slot_candidates (26 days)", &mut latencies);
}

#[tokio::main]
async fn main() {
    println!("rota stress bench");

    println!("phase 1: sequential bookings, one teacher");
    let bench = setup().await;
    phase1_sequential(&bench).await;

    println!("phase 2: parallel bookings, 16 teachers");
    let bench = setup().await;
    phase2_parallel(&bench).await;

    println!("phase 3: slot-candidate enumeration");
    let bench = setup().await;
    phase3_slot_candidates(&bench).await;
}
