// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! rtg_sim - synthetic frame workload driver for the RTG engine
//!
//! Runs a render group (leader, render thread, workers) against a simulated
//! little/big topology on a hand-driven clock. Each frame hands every thread
//! a fixed amount of work; progress per tick depends on the capacity and
//! current frequency of the cluster the engine placed the group on, and a
//! toy governor sets cluster frequencies from `cluster_demand`.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use parking_lot::Mutex;
use rtg_common::config::{NSEC_PER_MSEC, NSEC_PER_SEC, SCHED_CAPACITY_SCALE};
use rtg_runtime::placement::util_to_freq;
use rtg_runtime::{
    Builder, ClusterInfo, Clock, Engine, FrameType, GroupId, GroupTarget, ManualClock,
    MemberUpdate, RtgType, SchedClass, StaticTopology, ThreadControl, ThreadId, TickSample,
    Topology,
};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, Level};
use tracing_subscriber::EnvFilter;

/// RTG synthetic frame workload
///
/// Drives one frame group through a configurable render workload and
/// reports how the engine ramps utilization, places the group and rations
/// RT slots.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Target frame rate
    #[arg(short, long, default_value_t = 60)]
    rate: u32,

    /// Virtual load margin in milliseconds
    #[arg(short, long, default_value_t = 0, allow_hyphen_values = true)]
    margin: i32,

    /// Number of frames to run
    #[arg(short, long, default_value_t = 600)]
    frames: u64,

    /// Number of worker threads in the group
    #[arg(short, long, default_value_t = 2)]
    workers: usize,

    /// Render work per frame in milliseconds at full capacity
    #[arg(long, default_value_t = 6)]
    render_ms: u64,

    /// Work per worker thread per frame in milliseconds at full capacity
    #[arg(long, default_value_t = 3)]
    worker_ms: u64,

    /// Every Nth frame is heavy (0 to disable)
    #[arg(long, default_value_t = 30)]
    heavy_every: u64,

    /// Render work of a heavy frame in milliseconds
    #[arg(long, default_value_t = 14)]
    heavy_ms: u64,

    /// Scheduler tick in milliseconds
    #[arg(long, default_value_t = 1)]
    tick_ms: u64,

    /// Capacity of the little cluster
    #[arg(long, default_value_t = 400)]
    little_capacity: u64,

    /// Priority class of the group
    #[arg(long, value_enum, default_value_t = SimRtType::Top)]
    rt_type: SimRtType,

    /// Per-group RT slot budget
    #[arg(long, default_value_t = 2)]
    group_rt_threads: usize,

    /// Pace frames in wall-clock time instead of running flat out
    #[arg(long)]
    realtime: bool,

    /// Enable debug output
    #[arg(short, long)]
    debug: bool,

    /// Print stats every N frames (0 to disable)
    #[arg(long, default_value_t = 60)]
    stats_interval: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SimRtType {
    Vip,
    Top,
    Normal,
}

impl From<SimRtType> for RtgType {
    fn from(t: SimRtType) -> Self {
        match t {
            SimRtType::Vip => RtgType::Vip,
            SimRtType::Top => RtgType::TopTask,
            SimRtType::Normal => RtgType::NormalTask,
        }
    }
}

/// Thread control for simulated threads: every thread is alive and class
/// changes are only recorded.
#[derive(Default)]
struct SimThreadControl {
    classes: Mutex<HashMap<ThreadId, SchedClass>>,
}

impl SimThreadControl {
    fn fifo_threads(&self) -> usize {
        self.classes
            .lock()
            .values()
            .filter(|c| matches!(c, SchedClass::Fifo { .. }))
            .count()
    }
}

impl ThreadControl for SimThreadControl {
    fn set_scheduling_class(&self, tid: ThreadId, class: SchedClass) -> io::Result<()> {
        debug!(tid = tid.0, ?class, "sched class");
        self.classes.lock().insert(tid, class);
        Ok(())
    }

    fn is_alive(&self, _tid: ThreadId) -> bool {
        true
    }
}

/// One simulated thread
struct SimThread {
    tid: ThreadId,
    exec: u64,
    remaining: u64,
}

#[derive(Default)]
struct SimStats {
    frames: u64,
    late: u64,
    big_ticks: u64,
    max_util: u64,
}

fn topology(little_capacity: u64) -> StaticTopology {
    StaticTopology::new(vec![
        ClusterInfo {
            id: 0,
            capacity: little_capacity,
            cur_freq: 1_800_000,
            max_freq: 1_800_000,
            cpus: vec![0, 1, 2, 3],
        },
        ClusterInfo {
            id: 1,
            capacity: SCHED_CAPACITY_SCALE,
            cur_freq: 2_800_000,
            max_freq: 2_800_000,
            cpus: vec![4, 5, 6, 7],
        },
    ])
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let level = if args.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("rtg_sim starting");
    info!(
        "  rate: {}fps, margin: {}ms, workers: {}, render: {}ms, worker: {}ms",
        args.rate, args.margin, args.workers, args.render_ms, args.worker_ms
    );

    let clock = Arc::new(ManualClock::new(0));
    let ops = Arc::new(SimThreadControl::default());
    let topo = Arc::new(topology(args.little_capacity));

    let engine = Builder::new()
        .max_rt_threads(4)
        .default_rate(args.rate)
        .tick_period(Duration::from_millis(args.tick_ms.max(1)))
        .clock(clock.clone())
        .thread_control(ops.clone())
        .topology(topo.clone())
        .build()
        .context("Failed to build RTG engine")?;

    let leader = ThreadId(1000);
    let render = ThreadId(1001);
    let workers: Vec<ThreadId> = (0..args.workers as u32).map(|i| ThreadId(1002 + i)).collect();

    let group = engine
        .update_members(&MemberUpdate {
            group: GroupTarget::New,
            uid: 0,
            leader: Some(leader),
            render: Some(render),
            workers: workers.clone(),
            rt_type: args.rt_type.into(),
            max_rt_threads: args.group_rt_threads,
        })
        .context("Failed to create frame group")?;
    engine.set_rate(group, args.rate).context("Failed to set frame rate")?;
    engine
        .configure_margins(args.rate, &[(FrameType::Frame0, args.margin)])
        .context("Failed to configure margin")?;

    info!(
        "group {} created: {} RT threads granted ({} in FIFO)",
        group,
        engine.rt_thread_count(),
        ops.fifo_threads()
    );

    // Set up graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Received interrupt, shutting down...");
        r.store(false, Ordering::SeqCst);
    })
    .context("Error setting Ctrl-C handler")?;

    let mut threads: Vec<SimThread> = std::iter::once(render)
        .chain(workers.iter().copied())
        .map(|tid| SimThread {
            tid,
            exec: 0,
            remaining: 0,
        })
        .collect();

    let period = NSEC_PER_SEC / u64::from(args.rate.max(1));
    let tick = args.tick_ms.max(1) * NSEC_PER_MSEC;
    let mut stats = SimStats::default();

    while running.load(Ordering::SeqCst) && stats.frames < args.frames {
        let heavy = args.heavy_every > 0 && stats.frames % args.heavy_every == args.heavy_every - 1;
        let start = clock.now_ns();

        engine
            .begin_frame(group, FrameType::Frame0)
            .context("Failed to begin frame")?;
        for (i, t) in threads.iter_mut().enumerate() {
            t.remaining = match (i, heavy) {
                (0, true) => args.heavy_ms,
                (0, false) => args.render_ms,
                _ => args.worker_ms,
            } * NSEC_PER_MSEC;
            engine.thread_running(t.tid, true);
        }

        while threads.iter().any(|t| t.remaining > 0) {
            clock.advance(tick);
            run_tick(&engine, clock.now_ns(), tick, group, &topo, &mut threads, &mut stats);
            govern(&engine, &topo);
        }

        engine.end_frame(group).context("Failed to end frame")?;
        stats.frames += 1;

        let elapsed = clock.now_ns() - start;
        if elapsed > period {
            stats.late += 1;
        } else {
            clock.set(start + period);
        }
        if args.realtime {
            std::thread::sleep(Duration::from_nanos(period));
        }

        if args.stats_interval > 0 && stats.frames % args.stats_interval == 0 {
            print_stats(&engine, group, &stats)?;
        }
    }

    print_stats(&engine, group, &stats)?;
    println!("{}", engine.metrics().render());

    engine.release_group(group).context("Failed to release frame group")?;
    info!("rtg_sim exiting");
    Ok(())
}

/// Advance every busy thread by one tick on the group's current cluster
fn run_tick(
    engine: &Engine,
    now: u64,
    tick: u64,
    group: GroupId,
    topo: &StaticTopology,
    threads: &mut [SimThread],
    stats: &mut SimStats,
) {
    let clusters = topo.clusters();
    let cluster_id = engine
        .snapshot(group)
        .ok()
        .and_then(|s| s.preferred_cluster)
        .unwrap_or(0);
    let Some(cluster) = clusters.iter().find(|c| c.id == cluster_id) else {
        return;
    };
    if cluster.capacity == SCHED_CAPACITY_SCALE {
        stats.big_ticks += 1;
    }

    // Work done per tick at this cluster's capacity and current frequency
    let speed = cluster.capacity * cluster.cur_freq / cluster.max_freq.max(1);
    let progress = (tick * speed / SCHED_CAPACITY_SCALE).max(1);

    for (i, t) in threads.iter_mut().enumerate() {
        if t.remaining == 0 {
            continue;
        }
        t.exec += tick;
        t.remaining = t.remaining.saturating_sub(progress);

        let cpu = cluster.cpus.get(i % cluster.cpus.len().max(1)).copied();
        if let Some(util) = engine.on_tick(TickSample {
            group,
            tid: t.tid,
            now,
            accumulated_exec: t.exec,
            cpu,
        }) {
            stats.max_util = stats.max_util.max(util);
        }
        if t.remaining == 0 {
            engine.thread_running(t.tid, false);
        }
    }
}

/// Toy governor: set each cluster's frequency from the engine's demand
fn govern(engine: &Engine, topo: &StaticTopology) {
    for cluster in topo.clusters().iter() {
        let demand = engine.cluster_demand(cluster.id);
        let freq = util_to_freq(cluster, demand.util)
            .max(demand.min_freq)
            .max(cluster.max_freq / 4);
        topo.set_cur_freq(cluster.id, freq);
    }
}

fn print_stats(engine: &Engine, group: GroupId, stats: &SimStats) -> Result<()> {
    let snap = engine
        .snapshot(group)
        .context("Failed to read group snapshot")?;

    info!(
        "frames={} late={} big_ticks={} max_util={} util={} vload={} cluster={:?} rt={}/{}",
        stats.frames,
        stats.late,
        stats.big_ticks,
        stats.max_util,
        snap.frame_util,
        snap.frame_vload,
        snap.preferred_cluster,
        snap.curr_rt_threads,
        snap.max_rt_threads
    );

    Ok(())
}
