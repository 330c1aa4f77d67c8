//! Engine builder and control-plane entry point
//!
//! The [`Engine`] owns every group, the RT budgets and the two timer
//! threads. Build one with [`Builder`], hand it the OS collaborators, then
//! feed it ticks and control requests from any thread.

use crate::adapter::{
    Clock, FrequencySink, LinuxThreadControl, MonotonicClock, NullFrequencySink, StaticTopology,
    ThreadControl, Topology,
};
use crate::arbiter::SlotDecision;
use crate::error::{Error, Result};
use crate::frame::FrameParams;
use crate::group::{LoadMode, PlacementDefaults};
use crate::members::MemberRole;
use crate::metrics::EngineMetrics;
use crate::shared::Shared;
use crate::timer::TimerWorker;
use rtg_common::config::{
    DEFAULT_CAPACITY_MARGIN, DEFAULT_FRAME_RATE, DEFAULT_FREQ_UPDATE_INTERVAL_MS,
    DEFAULT_INVALID_INTERVAL_MS, DEFAULT_MAX_RT_FRAMES, DEFAULT_MAX_RT_THREAD,
    DEFAULT_TICK_PERIOD_MS, DEFAULT_VLOAD_MARGIN, MAX_BOOST_DURATION_MS, MAX_FRAME_RATE,
    MAX_VLOAD_MARGIN, MIN_FRAME_RATE, MIN_VLOAD_MARGIN, SCHED_CAPACITY_SCALE,
};
use rtg_common::{
    FrameStatus, FrameType, GroupId, RtgType, ThreadId, TimestampFlags,
};
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::info;

// ============================================================================
// Configuration
// ============================================================================

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Global RT thread ceiling (default: number of CPUs)
    pub max_rt_threads: usize,

    /// Dynamic frame groups allowed to run RT threads at once
    pub max_rt_frames: usize,

    /// Frame rate new groups start with
    pub default_rate: u32,

    /// Vload margin new groups start with (ms)
    pub default_margin: i32,

    /// Utilization ceiling of a frame group outside activities
    pub frame_max_util: u64,

    /// Utilization ceiling while an activity window is open
    pub act_max_util: u64,

    /// Debounce for normal frequency updates
    pub freq_update_interval: Duration,

    /// Staleness threshold, `None` disables the detector
    pub util_invalid_interval: Option<Duration>,

    /// Native scheduler tick; faster update intervals use the pseudo-tick
    pub tick_period: Duration,

    /// Multiplier on group util during cluster selection (1024 = none)
    pub capacity_margin: u64,

    /// Boosted groups go straight to the biggest cluster
    pub global_boost_enabled: bool,

    /// Longest accepted boost pulse
    pub max_boost_duration: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_rt_threads: std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            max_rt_frames: DEFAULT_MAX_RT_FRAMES,
            default_rate: DEFAULT_FRAME_RATE,
            default_margin: DEFAULT_VLOAD_MARGIN,
            frame_max_util: SCHED_CAPACITY_SCALE,
            act_max_util: SCHED_CAPACITY_SCALE,
            freq_update_interval: Duration::from_millis(DEFAULT_FREQ_UPDATE_INTERVAL_MS),
            util_invalid_interval: Some(Duration::from_millis(DEFAULT_INVALID_INTERVAL_MS)),
            tick_period: Duration::from_millis(DEFAULT_TICK_PERIOD_MS),
            capacity_margin: DEFAULT_CAPACITY_MARGIN,
            global_boost_enabled: true,
            max_boost_duration: Duration::from_millis(MAX_BOOST_DURATION_MS),
        }
    }
}

pub(crate) fn duration_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

impl EngineConfig {
    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if !(MIN_FRAME_RATE..=MAX_FRAME_RATE).contains(&self.default_rate) {
            return Err(Error::InvalidArgument("default frame rate out of range"));
        }
        if !(MIN_VLOAD_MARGIN..=MAX_VLOAD_MARGIN).contains(&self.default_margin) {
            return Err(Error::InvalidArgument("default vload margin out of range"));
        }
        if self.frame_max_util > SCHED_CAPACITY_SCALE || self.act_max_util > SCHED_CAPACITY_SCALE {
            return Err(Error::InvalidArgument("max util out of range"));
        }
        if self.freq_update_interval.is_zero() {
            return Err(Error::InvalidArgument("freq update interval must be positive"));
        }
        if self.util_invalid_interval.is_some_and(|d| d.is_zero()) {
            return Err(Error::InvalidArgument("util invalid interval must be positive"));
        }
        if self.tick_period.is_zero() || self.max_boost_duration.is_zero() {
            return Err(Error::InvalidArgument("timer periods must be positive"));
        }
        Ok(())
    }

    pub(crate) fn frame_params(&self) -> FrameParams {
        FrameParams {
            rate: self.default_rate,
            margin: self.default_margin,
            max_util: self.frame_max_util,
        }
    }

    pub(crate) fn placement_defaults(&self) -> PlacementDefaults {
        PlacementDefaults {
            freq_update_interval: duration_ns(self.freq_update_interval),
            util_invalid_interval: self.util_invalid_interval.map_or(u64::MAX, duration_ns),
            capacity_margin: self.capacity_margin,
        }
    }
}

// ============================================================================
// Requests and reports
// ============================================================================

/// One scheduler tick for a running member thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickSample {
    pub group: GroupId,
    pub tid: ThreadId,

    /// Monotonic time of the tick (ns)
    pub now: u64,

    /// Total exec time of the thread so far (ns)
    pub accumulated_exec: u64,

    /// CPU the thread ran on, for capacity scaling
    pub cpu: Option<u32>,
}

/// Group a membership update applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupTarget {
    /// Allocate a dynamic group
    #[default]
    New,
    Existing(GroupId),
}

/// Replace the RT-eligible members of a frame group
///
/// A `leader` of `None` clears the group instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberUpdate {
    pub group: GroupTarget,

    /// uid of the caller, recorded as the group's owner
    pub uid: u32,

    pub leader: Option<ThreadId>,
    pub render: Option<ThreadId>,

    /// Up to `MAX_TID_NUM` worker threads
    pub workers: Vec<ThreadId>,

    pub rt_type: RtgType,

    /// Per-group RT slot budget
    pub max_rt_threads: usize,
}

impl Default for MemberUpdate {
    fn default() -> Self {
        Self {
            group: GroupTarget::New,
            uid: 0,
            leader: None,
            render: None,
            workers: Vec::new(),
            rt_type: RtgType::default(),
            max_rt_threads: DEFAULT_MAX_RT_THREAD,
        }
    }
}

/// Parameters of an auxiliary thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuxParams {
    /// Util the auxiliary group publishes
    pub min_util: u64,

    /// RT priority, `None` for time-shared
    pub prio: Option<u32>,
}

/// What the governor should provide for one cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClusterDemand {
    pub util: u64,

    /// Highest explicit frequency floor (kHz)
    pub min_freq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberSnapshot {
    pub tid: ThreadId,
    pub role: MemberRole,
    pub granted: Option<u32>,
    pub running: bool,
}

/// Point-in-time copy of one group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSnapshot {
    pub id: GroupId,
    pub aux: bool,
    pub sched_enabled: bool,
    pub freq_enabled: bool,
    pub activity_open: bool,
    pub frame_state: Option<FrameType>,
    pub owner: Option<u32>,
    pub rt_type: RtgType,
    pub status: FrameStatus,
    pub rate: u32,
    pub margin: i32,
    pub frame_util: u64,
    pub frame_vload: u64,
    pub frame_min_util: u64,
    pub frame_max_util: u64,
    pub boost_min_util: u64,
    pub invalid_count: u64,
    pub curr_rt_threads: usize,
    pub max_rt_threads: usize,
    pub members: Vec<MemberSnapshot>,
    pub preferred_cluster: Option<u32>,
    pub normalized_util: u64,
    pub min_freq: u64,
}

// ============================================================================
// Builder
// ============================================================================

/// RTG engine builder
pub struct Builder {
    config: EngineConfig,
    clock: Option<Arc<dyn Clock>>,
    ops: Option<Arc<dyn ThreadControl>>,
    topology: Option<Arc<dyn Topology>>,
    sink: Option<Arc<dyn FrequencySink>>,
}

impl Builder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            config,
            clock: None,
            ops: None,
            topology: None,
            sink: None,
        }
    }

    /// Set the global RT thread ceiling
    pub fn max_rt_threads(mut self, n: usize) -> Self {
        self.config.max_rt_threads = n;
        self
    }

    /// Set how many dynamic groups may run RT threads at once
    pub fn max_rt_frames(mut self, n: usize) -> Self {
        self.config.max_rt_frames = n;
        self
    }

    pub fn default_rate(mut self, rate: u32) -> Self {
        self.config.default_rate = rate;
        self
    }

    pub fn default_margin(mut self, margin: i32) -> Self {
        self.config.default_margin = margin;
        self
    }

    pub fn frame_max_util(mut self, util: u64) -> Self {
        self.config.frame_max_util = util;
        self
    }

    pub fn act_max_util(mut self, util: u64) -> Self {
        self.config.act_max_util = util;
        self
    }

    pub fn freq_update_interval(mut self, interval: Duration) -> Self {
        self.config.freq_update_interval = interval;
        self
    }

    /// `None` disables the staleness detector
    pub fn util_invalid_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.util_invalid_interval = interval;
        self
    }

    pub fn tick_period(mut self, period: Duration) -> Self {
        self.config.tick_period = period;
        self
    }

    pub fn capacity_margin(mut self, margin: u64) -> Self {
        self.config.capacity_margin = margin;
        self
    }

    pub fn global_boost(mut self, enabled: bool) -> Self {
        self.config.global_boost_enabled = enabled;
        self
    }

    pub fn max_boost_duration(mut self, duration: Duration) -> Self {
        self.config.max_boost_duration = duration;
        self
    }

    /// Time base (default: [`MonotonicClock`])
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Priority primitive (default: [`LinuxThreadControl`])
    pub fn thread_control(mut self, ops: Arc<dyn ThreadControl>) -> Self {
        self.ops = Some(ops);
        self
    }

    /// Cluster table (default: one full-capacity cluster of all CPUs)
    pub fn topology(mut self, topology: Arc<dyn Topology>) -> Self {
        self.topology = Some(topology);
        self
    }

    /// Frequency request receiver (default: [`NullFrequencySink`])
    pub fn frequency_sink(mut self, sink: Arc<dyn FrequencySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Build the engine and start its timer threads
    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()));
        let ops = self.ops.unwrap_or_else(|| Arc::new(LinuxThreadControl));
        let topology = self.topology.unwrap_or_else(|| {
            let cpus = std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1);
            Arc::new(StaticTopology::uniform(cpus as u32, 0))
        });
        let sink = self.sink.unwrap_or_else(|| Arc::new(NullFrequencySink));

        Engine::new(self.config, clock, ops, topology, sink)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Engine
// ============================================================================

/// RTG frame engine
///
/// All methods take `&self`; share the engine behind an `Arc`.
pub struct Engine {
    shared: Arc<Shared>,
    pseudo_tick: TimerWorker,
    boost_timer: TimerWorker,
}

impl Engine {
    fn new(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        ops: Arc<dyn ThreadControl>,
        topology: Arc<dyn Topology>,
        sink: Arc<dyn FrequencySink>,
    ) -> Result<Self> {
        let shared = Arc::new(Shared::new(config, clock, ops, topology, sink));

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let pseudo_tick = TimerWorker::spawn("rtg-pseudo-tick", move || {
            weak.upgrade().and_then(|shared| shared.pseudo_tick())
        })?;

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let boost_timer = TimerWorker::spawn("rtg-boost", move || {
            if let Some(shared) = weak.upgrade() {
                shared.boost_expired();
            }
            None
        })?;

        info!(
            max_rt_threads = shared.config.max_rt_threads,
            max_rt_frames = shared.config.max_rt_frames,
            "RTG engine started"
        );
        Ok(Self {
            shared,
            pseudo_tick,
            boost_timer,
        })
    }

    /// Get the engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.shared.metrics
    }

    /// Current time on the engine's clock (ns)
    pub fn now_ns(&self) -> u64 {
        self.shared.clock.now_ns()
    }

    fn kick_pseudo_tick(&self) {
        if self.pseudo_tick.is_armed() {
            return;
        }
        if let Some(period) = self.shared.pseudo_period() {
            self.pseudo_tick.start(period);
        }
    }

    /// Stop the pseudo-tick once no group needs it
    fn settle_pseudo_tick(&self) {
        if self.shared.pseudo_period().is_none() {
            self.pseudo_tick.cancel();
        }
    }

    // ------------------------------------------------------------------
    // Tick path
    // ------------------------------------------------------------------

    /// Account one tick and refresh the group's utilization
    ///
    /// Returns the group's frame util, or `None` when the sample does not
    /// belong to a tracked member. While the pseudo-tick runs only the
    /// load is accounted here.
    pub fn on_tick(&self, sample: TickSample) -> Option<u64> {
        self.shared.on_tick(&sample, self.pseudo_tick.is_armed())
    }

    /// Scheduler notification that `tid` started or stopped running
    pub fn thread_running(&self, tid: ThreadId, running: bool) -> bool {
        let tracked = self.shared.thread_running(tid, running);
        if tracked && running {
            self.kick_pseudo_tick();
        }
        tracked
    }

    /// Scheduler notification that `tid` is gone
    pub fn thread_exited(&self, tid: ThreadId) -> bool {
        let found = self.shared.thread_exited(tid);
        if found {
            self.settle_pseudo_tick();
        }
        found
    }

    /// Whether the pseudo-tick timer is currently armed
    pub fn pseudo_tick_active(&self) -> bool {
        self.pseudo_tick.is_armed()
    }

    // ------------------------------------------------------------------
    // Frame boundaries
    // ------------------------------------------------------------------

    /// Open a frame of kind `frame_type`
    pub fn begin_frame(&self, group: GroupId, frame_type: FrameType) -> Result<()> {
        self.shared.begin_frame(group, frame_type)?;
        self.kick_pseudo_tick();
        Ok(())
    }

    /// Close the open frame; no-op when none is open
    pub fn end_frame(&self, group: GroupId) -> Result<()> {
        self.shared.end_frame(group)
    }

    /// Apply a raw frame timestamp
    pub fn set_status(&self, group: GroupId, flags: TimestampFlags) -> Result<()> {
        self.shared.set_status(group, flags)
    }

    pub fn begin_activity(&self, uid: u32, group: GroupId) -> Result<()> {
        self.shared.begin_activity(uid, group)
    }

    pub fn end_activity(&self, group: GroupId) -> Result<()> {
        self.shared.end_activity(group)
    }

    // ------------------------------------------------------------------
    // Frame tunables
    // ------------------------------------------------------------------

    pub fn set_rate(&self, group: GroupId, rate: u32) -> Result<()> {
        self.shared.set_rate(group, rate)
    }

    pub fn set_margin(&self, group: GroupId, margin: i32) -> Result<()> {
        self.shared.set_margin(group, margin)
    }

    pub fn set_min_util(&self, group: GroupId, min_util: u64) -> Result<()> {
        self.shared.set_min_util(group, min_util)
    }

    pub fn set_max_util(&self, group: GroupId, max_util: u64) -> Result<()> {
        self.shared.set_max_util(group, max_util)
    }

    pub fn set_min_util_and_margin(&self, group: GroupId, min_util: u64, margin: i32) -> Result<()> {
        self.shared.set_min_util_and_margin(group, min_util, margin)
    }

    /// Install per-frame-type margins for `rate`
    pub fn configure_margins(&self, rate: u32, entries: &[(FrameType, i32)]) -> Result<()> {
        self.shared.configure_margins(rate, entries)
    }

    pub fn clear_margins(&self) {
        self.shared.clear_margins();
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// Set the RT-eligible members of a group, allocating one if asked
    pub fn update_members(&self, update: &MemberUpdate) -> Result<GroupId> {
        let id = self.shared.update_members(update)?;
        self.kick_pseudo_tick();
        Ok(id)
    }

    /// Set the cfs-only members of a frame group
    pub fn set_cfs_members(
        &self,
        uid: u32,
        group: GroupId,
        tids: &[ThreadId],
        replace: bool,
    ) -> Result<()> {
        self.shared.set_cfs_members(uid, group, tids, replace)
    }

    /// Give a dynamic group back to the pool
    pub fn release_group(&self, group: GroupId) -> Result<()> {
        self.shared.release_group(group)?;
        self.settle_pseudo_tick();
        Ok(())
    }

    /// Add, update or remove a thread of the auxiliary group
    pub fn set_aux_thread(&self, tid: ThreadId, enable: bool, params: AuxParams) -> Result<()> {
        self.shared.set_aux_thread(tid, enable, params)
    }

    // ------------------------------------------------------------------
    // RT slots
    // ------------------------------------------------------------------

    /// Ask for FIFO scheduling of one member
    pub fn request_rt_slot(&self, group: GroupId, tid: ThreadId, prio: u32) -> Result<SlotDecision> {
        self.shared.request_rt_slot(group, tid, prio)
    }

    /// Return one member to time-shared scheduling
    pub fn release_rt_slot(&self, group: GroupId, tid: ThreadId) -> Result<bool> {
        self.shared.release_rt_slot(group, tid)
    }

    pub fn set_priority(&self, group: GroupId, rt_type: RtgType) -> Result<()> {
        self.shared.set_priority(group, rt_type)
    }

    /// RT slots in use across all groups
    pub fn rt_thread_count(&self) -> usize {
        self.shared.rt_thread_count()
    }

    /// Dynamic groups currently holding an RT frame slot
    pub fn rt_frame_count(&self) -> usize {
        self.shared.rt_frame_count()
    }

    // ------------------------------------------------------------------
    // Tracking state
    // ------------------------------------------------------------------

    pub fn set_sched_enabled(&self, group: GroupId, enable: bool) -> Result<()> {
        self.shared.set_sched_enabled(group, enable)?;
        if enable {
            self.kick_pseudo_tick();
        } else {
            self.settle_pseudo_tick();
        }
        Ok(())
    }

    pub fn start_frame_freq(&self, group: GroupId) -> Result<()> {
        self.shared.set_frame_freq(group, true)?;
        self.kick_pseudo_tick();
        Ok(())
    }

    pub fn stop_frame_freq(&self, group: GroupId) -> Result<()> {
        self.shared.set_frame_freq(group, false)?;
        self.settle_pseudo_tick();
        Ok(())
    }

    /// Raise every frame group's util floor for `duration_ms`
    pub fn start_boost(&self, duration_ms: u64, min_util: u64) -> Result<()> {
        let duration = self.shared.start_boost(duration_ms, min_util)?;
        self.boost_timer.arm(duration);
        self.kick_pseudo_tick();
        Ok(())
    }

    /// Whether a boost pulse is pending expiry
    pub fn boost_active(&self) -> bool {
        self.boost_timer.is_armed()
    }

    // ------------------------------------------------------------------
    // Placement
    // ------------------------------------------------------------------

    pub fn set_freq_update_interval(&self, group: GroupId, interval_ms: u64) -> Result<()> {
        self.shared.set_freq_update_interval(group, interval_ms)?;
        self.kick_pseudo_tick();
        Ok(())
    }

    /// `None` disables the staleness detector for the group
    pub fn set_util_invalid_interval(&self, group: GroupId, interval_ms: Option<u64>) -> Result<()> {
        self.shared.set_util_invalid_interval(group, interval_ms)
    }

    pub fn set_min_freq(&self, group: GroupId, freq_khz: u64) -> Result<()> {
        self.shared.set_min_freq(group, freq_khz)
    }

    pub fn set_preferred_cluster(&self, group: GroupId, cluster: Option<u32>) -> Result<()> {
        self.shared.set_preferred_cluster(group, cluster)
    }

    pub fn set_group_boost(&self, group: GroupId, boosted: bool) -> Result<()> {
        self.shared.set_group_boost(group, boosted)
    }

    pub fn set_global_boost(&self, enabled: bool) {
        self.shared.set_global_boost(enabled);
    }

    pub fn set_load_mode(&self, group: GroupId, mode: LoadMode) -> Result<()> {
        self.shared.set_load_mode(group, mode)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Aggregate demand of the groups preferring `cluster`
    pub fn cluster_demand(&self, cluster: u32) -> ClusterDemand {
        self.shared.cluster_demand(cluster)
    }

    pub fn snapshot(&self, group: GroupId) -> Result<FrameSnapshot> {
        self.shared.snapshot(group)
    }

    /// Default group plus every allocated dynamic group
    pub fn active_groups(&self) -> Vec<GroupId> {
        self.shared.active_groups()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.pseudo_tick.shutdown();
        self.boost_timer.shutdown();
        info!("RTG engine shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let builder = Builder::new()
            .max_rt_threads(4)
            .max_rt_frames(2)
            .default_rate(90)
            .util_invalid_interval(None);

        assert_eq!(builder.config.max_rt_threads, 4);
        assert_eq!(builder.config.max_rt_frames, 2);
        assert_eq!(builder.config.default_rate, 90);
        assert!(builder.config.util_invalid_interval.is_none());
    }

    #[test]
    fn test_config_validation() {
        assert!(EngineConfig::default().validate().is_ok());

        let bad_rate = EngineConfig {
            default_rate: 0,
            ..EngineConfig::default()
        };
        assert!(bad_rate.validate().is_err());

        let bad_interval = EngineConfig {
            util_invalid_interval: Some(Duration::ZERO),
            ..EngineConfig::default()
        };
        assert!(bad_interval.validate().is_err());
        assert!(Builder::with_config(bad_interval).build().is_err());
    }

    #[test]
    fn test_placement_defaults() {
        let config = EngineConfig {
            util_invalid_interval: None,
            ..EngineConfig::default()
        };
        let p = config.placement_defaults();
        assert_eq!(p.util_invalid_interval, u64::MAX);
        assert_eq!(p.freq_update_interval, 8_000_000);
        assert_eq!(p.capacity_margin, DEFAULT_CAPACITY_MARGIN);
    }
}
