//! RT slot contention stress test
//!
//! Several frame groups churn RT slots from their own control threads while
//! tick threads hammer the hot path. The global RT ceiling must hold at
//! every observation, and tick latency should stay flat while control
//! requests are serialized.
//!
//! Expected behavior:
//! - `rt_thread_count()` never exceeds `--max-rt-threads`
//! - Denials are reported as `global_ceiling` once the ceiling is reached
//! - Tick p99 stays in the low microseconds

use anyhow::{bail, Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use rtg_common::config::MULTI_FRAME_NUM;
use rtg_runtime::{
    Builder, FrameType, GroupId, GroupTarget, MemberUpdate, RtgType, SchedClass,
    ThreadControl, ThreadId, TickSample,
};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// RT slot contention stress test
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Number of frame groups
    #[arg(short, long, default_value_t = 4)]
    groups: u32,

    /// Worker threads per group
    #[arg(short, long, default_value_t = 3)]
    workers: u32,

    /// Global RT ceiling
    #[arg(long, default_value_t = 6)]
    max_rt_threads: usize,

    /// Duration to run the benchmark (seconds)
    #[arg(short, long, default_value_t = 5)]
    duration: u64,
}

/// Accepts every class change; no real thread is touched
struct NoopControl;

impl ThreadControl for NoopControl {
    fn set_scheduling_class(&self, _tid: ThreadId, _class: SchedClass) -> io::Result<()> {
        Ok(())
    }

    fn is_alive(&self, _tid: ThreadId) -> bool {
        true
    }
}

struct GroupThreads {
    id: GroupId,
    members: Vec<ThreadId>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt().with_env_filter("info").init();

    if args.groups == 0 || args.groups > MULTI_FRAME_NUM {
        bail!("--groups must be in 1..={}", MULTI_FRAME_NUM);
    }

    tracing::info!("RT slot contention benchmark");
    tracing::info!("  {} groups x {} workers", args.groups, args.workers);
    tracing::info!("  global RT ceiling {}", args.max_rt_threads);

    let engine = Arc::new(
        Builder::new()
            .max_rt_threads(args.max_rt_threads)
            .max_rt_frames(args.groups as usize)
            .thread_control(Arc::new(NoopControl))
            .build()
            .context("Failed to build engine")?,
    );

    let mut groups = Vec::new();
    for g in 0..args.groups {
        let base = 10_000 + g * 100;
        let workers: Vec<ThreadId> = (0..args.workers).map(|w| ThreadId(base + 2 + w)).collect();
        let id = engine
            .update_members(&MemberUpdate {
                group: GroupTarget::New,
                leader: Some(ThreadId(base)),
                render: Some(ThreadId(base + 1)),
                workers: workers.clone(),
                rt_type: RtgType::TopTask,
                max_rt_threads: 2 + args.workers as usize,
                ..Default::default()
            })
            .with_context(|| format!("Failed to create group {}", g))?;
        engine
            .begin_frame(id, FrameType::Frame0)
            .context("Failed to begin frame")?;

        let mut members = vec![ThreadId(base), ThreadId(base + 1)];
        members.extend(workers);
        groups.push(Arc::new(GroupThreads { id, members }));
    }

    // Shared state
    let stop = Arc::new(AtomicBool::new(false));
    let violations = Arc::new(AtomicU64::new(0));
    let control_ops = Arc::new(AtomicU64::new(0));
    let tick_latencies: Arc<Mutex<Vec<Duration>>> = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for group in &groups {
        // Control thread: release and re-request every member's slot
        let engine_c = engine.clone();
        let group_c = group.clone();
        let stop_c = stop.clone();
        let violations_c = violations.clone();
        let ops_c = control_ops.clone();
        let ceiling = args.max_rt_threads;
        handles.push(
            thread::Builder::new()
                .name(format!("control-{}", group.id))
                .spawn(move || {
                    while !stop_c.load(Ordering::Relaxed) {
                        for &tid in &group_c.members {
                            let _ = engine_c.release_rt_slot(group_c.id, tid);
                            let _ = engine_c.request_rt_slot(group_c.id, tid, 2);
                            if engine_c.rt_thread_count() > ceiling {
                                violations_c.fetch_add(1, Ordering::Relaxed);
                            }
                            ops_c.fetch_add(2, Ordering::Relaxed);
                        }
                    }
                })
                .context("Failed to spawn control thread")?,
        );

        // Tick thread: feed samples for the render thread
        let engine_t = engine.clone();
        let group_t = group.clone();
        let stop_t = stop.clone();
        let latencies_t = tick_latencies.clone();
        handles.push(
            thread::Builder::new()
                .name(format!("tick-{}", group.id))
                .spawn(move || {
                    let mut exec = 0u64;
                    let mut samples = Vec::with_capacity(1 << 16);
                    while !stop_t.load(Ordering::Relaxed) {
                        exec += 100_000;
                        let start = Instant::now();
                        let _ = engine_t.on_tick(TickSample {
                            group: group_t.id,
                            tid: group_t.members[1],
                            now: engine_t.now_ns(),
                            accumulated_exec: exec,
                            cpu: Some(0),
                        });
                        if samples.len() < samples.capacity() {
                            samples.push(start.elapsed());
                        }
                    }
                    latencies_t.lock().extend(samples);
                })
                .context("Failed to spawn tick thread")?,
        );
    }

    // Let the benchmark run
    tracing::info!("Running benchmark for {} seconds...", args.duration);
    thread::sleep(Duration::from_secs(args.duration));

    // Stop all threads
    stop.store(true, Ordering::Release);
    for handle in handles {
        if handle.join().is_err() {
            bail!("benchmark thread panicked");
        }
    }

    for group in &groups {
        engine
            .release_group(group.id)
            .with_context(|| format!("Failed to release group {}", group.id))?;
    }

    // Report results
    let mut latencies: Vec<u64> = tick_latencies
        .lock()
        .iter()
        .map(|d| d.as_nanos() as u64)
        .collect();

    tracing::info!("\n=== Results ===");
    tracing::info!("Control ops: {}", control_ops.load(Ordering::Relaxed));
    tracing::info!(
        "Granted: {}  Denied (global ceiling): {}",
        engine.metrics().slot_decision_count("granted"),
        engine.metrics().slot_decision_count("global_ceiling")
    );
    tracing::info!("Tick samples: {}", latencies.len());

    if !latencies.is_empty() {
        latencies.sort_unstable();
        let p50 = latencies[latencies.len() / 2];
        let p99 = latencies[latencies.len() * 99 / 100];
        let max = latencies[latencies.len() - 1];

        tracing::info!("Tick p50: {}ns", p50);
        tracing::info!("Tick p99: {}ns", p99);
        tracing::info!("Tick max: {}ns", max);
    }

    let violations = violations.load(Ordering::Relaxed);
    if violations > 0 {
        bail!("RT ceiling exceeded {} times", violations);
    }
    if engine.rt_thread_count() != 0 {
        bail!("{} RT slots leaked after release", engine.rt_thread_count());
    }

    tracing::info!("Benchmark complete");
    Ok(())
}
