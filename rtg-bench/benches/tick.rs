//! Criterion benchmarks for the tick hot path

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rtg_runtime::frame::virtual_load;
use rtg_runtime::{
    Builder, Engine, FrameType, GroupId, GroupTarget, ManualClock, MemberUpdate, RtgType,
    SchedClass, ThreadControl, ThreadId, TickSample,
};
use std::io;
use std::sync::Arc;

const MS: u64 = 1_000_000;

struct NoopControl;

impl ThreadControl for NoopControl {
    fn set_scheduling_class(&self, _tid: ThreadId, _class: SchedClass) -> io::Result<()> {
        Ok(())
    }

    fn is_alive(&self, _tid: ThreadId) -> bool {
        true
    }
}

fn setup() -> (Engine, Arc<ManualClock>, GroupId) {
    let clock = Arc::new(ManualClock::new(0));
    let engine = Builder::new()
        .max_rt_threads(8)
        .clock(clock.clone())
        .thread_control(Arc::new(NoopControl))
        .build()
        .unwrap();
    let group = engine
        .update_members(&MemberUpdate {
            group: GroupTarget::New,
            leader: Some(ThreadId(100)),
            render: Some(ThreadId(101)),
            workers: vec![ThreadId(102), ThreadId(103)],
            rt_type: RtgType::TopTask,
            ..Default::default()
        })
        .unwrap();
    engine.begin_frame(group, FrameType::Frame0).unwrap();
    (engine, clock, group)
}

fn tick_benchmark(c: &mut Criterion) {
    let (engine, clock, group) = setup();
    let mut exec = 0u64;

    c.bench_function("on_tick (member)", |b| {
        b.iter(|| {
            let now = clock.advance(MS / 4);
            exec += MS / 8;
            black_box(engine.on_tick(TickSample {
                group,
                tid: ThreadId(101),
                now,
                accumulated_exec: exec,
                cpu: Some(0),
            }))
        })
    });

    c.bench_function("on_tick (untracked)", |b| {
        b.iter(|| {
            black_box(engine.on_tick(TickSample {
                group,
                tid: ThreadId(999),
                now: clock.advance(1),
                accumulated_exec: 0,
                cpu: None,
            }))
        })
    });

    c.bench_function("begin_frame + end_frame", |b| {
        b.iter(|| {
            clock.advance(MS);
            engine.begin_frame(group, FrameType::Frame0).unwrap();
            engine.end_frame(group).unwrap();
        })
    });

    c.bench_function("virtual_load", |b| {
        b.iter(|| black_box(virtual_load(black_box(8), black_box(16))))
    });
}

criterion_group!(benches, tick_benchmark);
criterion_main!(benches);
