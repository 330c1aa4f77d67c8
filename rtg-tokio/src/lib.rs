// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! # RTG Tokio Integration
//!
//! This crate drives the RTG frame engine from a Tokio runtime.
//!
//! ## Features
//!
//! - **Frame macro**: wrap an async render step in `begin_frame`/`end_frame`
//! - **Frame loop**: vsync-paced loop that opens one frame per period
//! - **Tick feeder**: background task that pushes scheduler samples
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rtg_tokio::{Builder, FrameLoopBuilder};
//!
//! #[tokio::main]
//! async fn main() -> rtg_tokio::Result<()> {
//!     let engine = Arc::new(Builder::new().build()?);
//!     let frames = FrameLoopBuilder::new().rate(90).max_frames(900).build()?;
//!
//!     let stats = frames
//!         .run(&engine, |_frame| async { /* ... render ... */ }, std::future::pending())
//!         .await?;
//!     println!("rendered {} frames, {} late", stats.frames, stats.late);
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

pub use rtg_runtime::{Builder, Engine, EngineConfig, Error, FrameSnapshot, Result, TickSample};

pub use rtg_common::{config, FrameType, GroupId, ThreadId};

/// Run an async block as one frame of `group`.
///
/// Opens the frame, awaits the body, closes the frame and returns the
/// body's output. Must be used inside an async context.
///
/// # Example
///
/// ```rust,no_run
/// use rtg_tokio::{frame, Engine, FrameType, GroupId};
///
/// async fn render(engine: &Engine) -> rtg_tokio::Result<u32> {
///     frame!(engine, GroupId::DEFAULT, FrameType::Frame0, async {
///         // ... draw ...
///         42
///     })
/// }
/// ```
#[macro_export]
macro_rules! frame {
    ($engine:expr, $group:expr, $frame_type:expr, $body:expr) => {{
        let engine = &$engine;
        let group = $group;
        match engine.begin_frame(group, $frame_type) {
            Ok(()) => {
                let out = $body.await;
                engine.end_frame(group).map(|()| out)
            }
            Err(e) => Err(e),
        }
    }};
}

/// Yield to the Tokio runtime when `group`'s current frame has run past its
/// virtual deadline.
pub async fn yield_if_saturated(engine: &Engine, group: GroupId) {
    let saturated = engine
        .snapshot(group)
        .map(|s| s.frame_vload >= config::FRAME_MAX_VLOAD)
        .unwrap_or(false);
    if saturated {
        tokio::task::yield_now().await;
    }
}

// ============================================================================
// Frame loop
// ============================================================================

/// Builder for a vsync-paced frame loop.
pub struct FrameLoopBuilder {
    group: GroupId,
    frame_type: FrameType,
    rate: u32,
    max_frames: Option<u64>,
}

impl Default for FrameLoopBuilder {
    fn default() -> Self {
        Self {
            group: GroupId::DEFAULT,
            frame_type: FrameType::Frame0,
            rate: config::DEFAULT_FRAME_RATE,
            max_frames: None,
        }
    }
}

impl FrameLoopBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Group the frames are reported against.
    pub fn group(mut self, group: GroupId) -> Self {
        self.group = group;
        self
    }

    /// Frame type passed to `begin_frame`.
    pub fn frame_type(mut self, frame_type: FrameType) -> Self {
        self.frame_type = frame_type;
        self
    }

    /// Target frame rate in frames per second.
    ///
    /// Also pushed to the engine as the group's rate when the loop starts.
    pub fn rate(mut self, rate: u32) -> Self {
        self.rate = rate;
        self
    }

    /// Stop after this many frames.
    pub fn max_frames(mut self, frames: u64) -> Self {
        self.max_frames = Some(frames);
        self
    }

    /// Get the frame period.
    pub fn get_period(&self) -> Duration {
        Duration::from_nanos(config::NSEC_PER_SEC / u64::from(self.rate.max(1)))
    }

    pub fn build(self) -> Result<FrameLoop> {
        if !(config::MIN_FRAME_RATE..=config::MAX_FRAME_RATE).contains(&self.rate) {
            return Err(Error::InvalidArgument("frame rate out of range"));
        }
        let period = self.get_period();
        Ok(FrameLoop {
            group: self.group,
            frame_type: self.frame_type,
            rate: self.rate,
            period,
            max_frames: self.max_frames,
        })
    }
}

/// Counters reported when a frame loop finishes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameLoopStats {
    pub frames: u64,

    /// Frames whose render step outlasted the period
    pub late: u64,
}

/// Paces frames on a Tokio interval and reports each one to the engine
#[derive(Debug, Clone)]
pub struct FrameLoop {
    group: GroupId,
    frame_type: FrameType,
    rate: u32,
    period: Duration,
    max_frames: Option<u64>,
}

impl FrameLoop {
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Run until `max_frames` frames are done or `shutdown` resolves.
    ///
    /// `render` is called with the frame number for every period. Missed
    /// periods are skipped rather than replayed.
    pub async fn run<R, Fut, S>(&self, engine: &Engine, mut render: R, shutdown: S) -> Result<FrameLoopStats>
    where
        R: FnMut(u64) -> Fut,
        Fut: Future<Output = ()>,
        S: Future<Output = ()>,
    {
        engine.set_rate(self.group, self.rate)?;

        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        let mut stats = FrameLoopStats::default();
        loop {
            if self.max_frames.is_some_and(|max| stats.frames >= max) {
                break;
            }
            tokio::select! {
                _ = &mut shutdown => {
                    debug!(group = %self.group, "frame loop shut down");
                    break;
                }
                _ = interval.tick() => {}
            }

            let started = Instant::now();
            frame!(engine, self.group, self.frame_type, render(stats.frames))?;
            if started.elapsed() > self.period {
                stats.late += 1;
            }
            stats.frames += 1;
        }

        debug!(group = %self.group, frames = stats.frames, late = stats.late, "frame loop done");
        Ok(stats)
    }
}

// ============================================================================
// Tick feeder
// ============================================================================

/// Handle to a running tick feeder task
pub struct TickFeeder {
    stop: watch::Sender<bool>,
    handle: JoinHandle<u64>,
}

impl TickFeeder {
    /// Spawn a task that calls `sampler` every `period` and feeds the
    /// returned samples to `engine.on_tick`.
    ///
    /// `sampler` receives the engine's current time. Must be called from
    /// within a Tokio runtime.
    pub fn spawn<F>(engine: Arc<Engine>, period: Duration, mut sampler: F) -> Self
    where
        F: FnMut(u64) -> Vec<TickSample> + Send + 'static,
    {
        let (stop, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut accepted = 0u64;
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = interval.tick() => {}
                }
                for sample in sampler(engine.now_ns()) {
                    if engine.on_tick(sample).is_some() {
                        accepted += 1;
                    }
                }
            }
            accepted
        });
        Self { stop, handle }
    }

    /// Stop the task and return how many samples the engine accepted.
    pub async fn shutdown(self) -> u64 {
        let _ = self.stop.send(true);
        match self.handle.await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "tick feeder task failed");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use rtg_runtime::FrameEvent;

    fn engine() -> Arc<Engine> {
        Arc::new(Builder::new().max_rt_threads(2).build().unwrap())
    }

    #[test]
    fn test_builder() {
        let builder = FrameLoopBuilder::new()
            .group(GroupId::DEFAULT)
            .frame_type(FrameType::Video0)
            .rate(100)
            .max_frames(5);

        assert_eq!(builder.get_period(), Duration::from_millis(10));
        let frames = builder.build().unwrap();
        assert_eq!(frames.period(), Duration::from_millis(10));

        assert!(FrameLoopBuilder::new().rate(0).build().is_err());
        assert!(FrameLoopBuilder::new().rate(121).build().is_err());
    }

    #[tokio::test]
    async fn test_frame_macro() {
        let engine = engine();
        let out = frame!(engine, GroupId::DEFAULT, FrameType::Frame1, async { 7u32 }).unwrap();
        assert_eq!(out, 7);

        let snap = engine.snapshot(GroupId::DEFAULT).unwrap();
        assert_eq!(snap.frame_state, None);
        assert_eq!(engine.metrics().frame_count(GroupId::DEFAULT, FrameEvent::Start), 1);
        assert_eq!(engine.metrics().frame_count(GroupId::DEFAULT, FrameEvent::End), 1);
    }

    #[tokio::test]
    async fn test_frame_macro_rejects_aux_group() {
        let engine = engine();
        let out = frame!(engine, GroupId::AUX, FrameType::Frame0, async {});
        assert!(out.is_err());
    }

    #[tokio::test]
    async fn test_frame_loop_runs_max_frames() {
        let engine = engine();
        let frames = FrameLoopBuilder::new().rate(120).max_frames(3).build().unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let stats = frames
            .run(
                &engine,
                move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async {}
                },
                std::future::pending(),
            )
            .await
            .unwrap();

        assert_eq!(stats.frames, 3);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(engine.metrics().frame_count(GroupId::DEFAULT, FrameEvent::Start), 3);
        assert_eq!(engine.snapshot(GroupId::DEFAULT).unwrap().rate, 120);
    }

    #[tokio::test]
    async fn test_frame_loop_shutdown() {
        let engine = engine();
        let frames = FrameLoopBuilder::new().rate(120).build().unwrap();

        let stats = frames
            .run(&engine, |_| async {}, tokio::time::sleep(Duration::from_millis(40)))
            .await
            .unwrap();

        assert!(stats.frames >= 1);
        assert_eq!(engine.snapshot(GroupId::DEFAULT).unwrap().frame_state, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tick_feeder_untracked_thread() {
        let engine = engine();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let feeder = TickFeeder::spawn(engine.clone(), Duration::from_millis(2), move |now| {
            counter.fetch_add(1, Ordering::SeqCst);
            vec![TickSample {
                group: GroupId::DEFAULT,
                tid: ThreadId(u32::MAX),
                now,
                accumulated_exec: 0,
                cpu: None,
            }]
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(feeder.shutdown().await, 0);
        assert!(calls.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn test_yield_if_saturated() {
        let engine = engine();
        // Should not hang on an idle group
        yield_if_saturated(&engine, GroupId::DEFAULT).await;
        yield_if_saturated(&engine, GroupId(99)).await;
    }
}
