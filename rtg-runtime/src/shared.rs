//! Engine state shared with the timer threads
//!
//! [`Shared`] holds every group and budget. The public [`Engine`] wraps it
//! together with the timer handles; the timer callbacks only hold a weak
//! reference to `Shared`, so dropping the engine never waits on itself.
//!
//! Lock order, outermost first:
//!
//! ```text
//! control mutex -> registry mutex -> group RwLock -> margin table mutex
//! ```
//!
//! The tick path takes exactly one group lock. Control requests that touch
//! RT slots or membership serialize on the control mutex and never hold
//! two group locks at once.
//!
//! [`Engine`]: crate::Engine

use crate::adapter::{Clock, ClusterInfo, FrequencySink, ThreadControl, Topology};
use crate::arbiter::{SlotArbiter, SlotCounter, SlotDecision};
use crate::engine::{
    duration_ns, AuxParams, ClusterDemand, EngineConfig, FrameSnapshot, GroupTarget,
    MemberSnapshot, MemberUpdate, TickSample,
};
use crate::error::{Error, Result};
use crate::frame::FrameInfo;
use crate::group::{Group, GroupClass, GroupState, LoadMode};
use crate::margin::MarginTable;
use crate::members::{Member, MemberRole, MemberSet};
use crate::metrics::{EngineMetrics, FrameEvent};
use crate::registry::GroupRegistry;
use parking_lot::Mutex;
use rtg_common::config::{
    MAX_AUX_THREADS, MAX_FRAME_CFS_THREADS, MAX_FREQ_CYCLE_MS, MAX_RT_THREAD, MAX_TID_NUM,
    MIN_FREQ_CYCLE_MS, NSEC_PER_MSEC, SCHED_CAPACITY_SCALE,
};
use rtg_common::{
    sched_priority, FrameStatus, FrameType, GroupId, RtgType, ThreadId, TimestampFlags,
    UpdateKind,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

pub(crate) struct Shared {
    pub(crate) config: EngineConfig,
    pub(crate) clock: Arc<dyn Clock>,
    ops: Arc<dyn ThreadControl>,
    topology: Arc<dyn Topology>,
    sink: Arc<dyn FrequencySink>,

    default_group: Arc<Group>,
    aux_group: Arc<Group>,
    registry: GroupRegistry<Group>,

    /// Global RT thread ceiling
    rt_ceiling: SlotCounter,

    /// Dynamic groups allowed to run RT threads
    rt_frames: SlotCounter,

    margins: Mutex<MarginTable>,
    control: Mutex<()>,
    global_boost: AtomicBool,
    pub(crate) metrics: EngineMetrics,
}

impl Shared {
    pub(crate) fn new(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        ops: Arc<dyn ThreadControl>,
        topology: Arc<dyn Topology>,
        sink: Arc<dyn FrequencySink>,
    ) -> Self {
        let now = clock.now_ns();
        let params = config.frame_params();
        let placement = config.placement_defaults();

        let default_group = Arc::new(Group::new(
            GroupId::DEFAULT,
            GroupState::frame(params, placement, now),
        ));

        let mut aux = GroupState::aux(placement);
        aux.sched_enabled = true;
        aux.slots.max = MAX_AUX_THREADS;
        let aux_group = Arc::new(Group::new(GroupId::AUX, aux));

        let registry =
            GroupRegistry::new(|id| Group::new(id, GroupState::frame(params, placement, now)));

        Self {
            rt_ceiling: SlotCounter::new(config.max_rt_threads),
            rt_frames: SlotCounter::new(config.max_rt_frames),
            global_boost: AtomicBool::new(config.global_boost_enabled),
            config,
            clock,
            ops,
            topology,
            sink,
            default_group,
            aux_group,
            registry,
            margins: Mutex::new(MarginTable::new()),
            control: Mutex::new(()),
            metrics: EngineMetrics::new(),
        }
    }

    // ------------------------------------------------------------------
    // Lookup helpers
    // ------------------------------------------------------------------

    fn group(&self, id: GroupId) -> Result<&Arc<Group>> {
        match id {
            GroupId::DEFAULT => Ok(&self.default_group),
            GroupId::AUX => Ok(&self.aux_group),
            _ => self
                .registry
                .lookup_active(id)
                .ok_or(Error::InvalidGroupId(id)),
        }
    }

    /// Like `group`, but the auxiliary group is not a frame group
    fn frame_group(&self, id: GroupId) -> Result<&Arc<Group>> {
        if id == GroupId::AUX {
            return Err(Error::InvalidGroupId(id));
        }
        self.group(id)
    }

    fn frame_groups(&self) -> impl Iterator<Item = &Arc<Group>> {
        std::iter::once(&self.default_group).chain(self.registry.active())
    }

    fn groups(&self) -> impl Iterator<Item = &Arc<Group>> {
        self.frame_groups().chain(std::iter::once(&self.aux_group))
    }

    fn arbiter(&self) -> SlotArbiter<'_> {
        SlotArbiter::new(&self.rt_ceiling, self.ops.as_ref())
    }

    fn cluster_cpu(&self, cluster: u32) -> Option<u32> {
        let clusters = self.topology.clusters();
        clusters
            .iter()
            .find(|c| c.id == cluster)
            .and_then(ClusterInfo::first_cpu)
    }

    fn request_freq(&self, cpu: u32, kind: UpdateKind) {
        self.metrics.record_freq_update(kind);
        self.sink.request_frequency_reconsideration(cpu, kind);
    }

    fn with_frame<R>(
        &self,
        id: GroupId,
        f: impl FnOnce(&mut FrameInfo) -> Result<R>,
    ) -> Result<R> {
        let group = self.frame_group(id)?;
        let mut state = group.write();
        let frame = state
            .class
            .frame_mut()
            .ok_or(Error::InvalidGroupId(id))?;
        f(frame)
    }

    fn check_owner(&self, id: GroupId, state: &GroupState, uid: u32) -> Result<()> {
        if id.is_dynamic() && state.owner.is_some_and(|owner| owner != uid) {
            return Err(Error::PermissionDenied { group: id, uid });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------

    /// Hand a new util to placement and the governor
    fn publish(&self, id: GroupId, state: &mut GroupState, util: u64, kind: UpdateKind, now: u64) {
        self.metrics.set_frame_util(id, util);

        if state.members.is_empty() {
            state.placement.normalized_util = util;
            return;
        }

        let clusters = self.topology.clusters();
        let decision = state.placement.update_util(
            util,
            kind,
            now,
            &clusters,
            self.global_boost.load(Ordering::Acquire),
        );

        if let Some(cpu) = decision.prev_cpu {
            self.metrics.record_cluster_switch();
            self.request_freq(cpu, UpdateKind::Force);
        }
        if let Some(cpu) = decision.next_cpu {
            if state.mode.freq_enabled {
                self.request_freq(cpu, decision.kind);
            }
        }
        trace!(
            group = %id,
            util,
            cluster = ?decision.cluster,
            min_freq = decision.min_freq,
            "publish"
        );
    }

    /// Exec time scaled by the running CPU's capacity and frequency
    fn scale_load(&self, cpu: Option<u32>, exec: u64) -> u64 {
        let Some(cpu) = cpu else {
            return exec;
        };
        let clusters = self.topology.clusters();
        match clusters.iter().find(|c| c.cpus.contains(&cpu)) {
            Some(c) if c.max_freq > 0 => {
                let scaled = exec as u128 * c.capacity as u128 * c.cur_freq as u128
                    / (SCHED_CAPACITY_SCALE as u128 * c.max_freq as u128);
                u64::try_from(scaled).unwrap_or(u64::MAX)
            }
            _ => exec,
        }
    }

    fn tick_locked(&self, id: GroupId, state: &mut GroupState, now: u64) -> u64 {
        let invalid_interval = state.placement.util_invalid_interval;
        let before = state.class.frame().map(FrameInfo::invalid_count);
        let util = state.class.tick(now, invalid_interval);
        if state.class.frame().map(FrameInfo::invalid_count) != before {
            self.metrics.record_frame(id, FrameEvent::Invalid);
        }
        self.publish(id, state, util, UpdateKind::Normal, now);
        util
    }

    fn timestamp_locked(
        &self,
        id: GroupId,
        state: &mut GroupState,
        flags: TimestampFlags,
        now: u64,
    ) -> Result<()> {
        if !state.sched_enabled {
            return Err(Error::NotInFrame(id));
        }
        let frame = state
            .class
            .frame_mut()
            .ok_or(Error::InvalidGroupId(id))?;

        let applied = frame.timestamp(flags, now)?;
        let skipped = frame.timestamp_skipped();

        match applied {
            Some(util) => {
                let event = if flags.contains(TimestampFlags::START) {
                    FrameEvent::Start
                } else {
                    FrameEvent::End
                };
                self.metrics.record_frame(id, event);
                self.publish(id, state, util, UpdateKind::Force, now);
            }
            None if skipped => {
                self.metrics.record_frame(id, FrameEvent::Skipped);
            }
            None => {}
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sched state and RT slots
    // ------------------------------------------------------------------

    fn set_sched_locked(&self, id: GroupId, state: &mut GroupState, enable: bool, now: u64) {
        if state.sched_enabled == enable {
            return;
        }
        state.sched_enabled = enable;

        if enable {
            if let Some(frame) = state.class.frame_mut() {
                frame.enable_tracking();
            }
            self.sync_rt_slots(id, state);
        } else {
            self.release_all_slots(state);
            if std::mem::take(&mut state.activity_open) {
                if let Some(frame) = state.class.frame_mut() {
                    if let Err(e) = frame.set_max_util(self.config.frame_max_util) {
                        warn!(group = %id, error = %e, "failed to restore max util");
                    }
                }
            }
            if let Some(frame) = state.class.frame_mut() {
                frame.disable_tracking();
            }
            state.frame_state = None;
            self.publish(id, state, 0, UpdateKind::Normal, now);
            state.placement.clear();
        }
        debug!(group = %id, enable, "sched state");
    }

    /// Bring RT grants in line with the group's priority and budget
    fn sync_rt_slots(&self, id: GroupId, state: &mut GroupState) {
        if state.class.is_aux() || !state.sched_enabled {
            return;
        }
        let prio = match state.rt_prio() {
            Some(prio) if !id.is_dynamic() || state.rt_frame_held => prio,
            _ => {
                self.release_all_slots(state);
                return;
            }
        };

        let arbiter = self.arbiter();
        let GroupState { members, slots, .. } = state;

        // Budget may have shrunk: keep the earliest slots
        let mut kept = 0;
        for (role, member) in members.iter_roles_mut() {
            if member.granted.is_some() {
                if role.rt_eligible() && kept < slots.max {
                    kept += 1;
                } else {
                    arbiter.release(slots, member);
                }
            }
        }

        for (role, member) in members.iter_roles_mut() {
            if !role.rt_eligible() {
                continue;
            }
            let fresh = member.granted.is_none();
            let decision = arbiter.request(slots, member, prio, false);
            if fresh {
                self.metrics.record_slot_decision(decision.as_str());
            }
        }
    }

    fn release_all_slots(&self, state: &mut GroupState) {
        let arbiter = self.arbiter();
        let GroupState { members, slots, .. } = state;
        for member in members.iter_mut() {
            arbiter.release(slots, member);
        }
    }

    /// Take or give back the group's RT frame slot for `rt_type`
    fn update_rt_frame(&self, id: GroupId, state: &mut GroupState, rt_type: RtgType) -> Result<()> {
        if !id.is_dynamic() {
            return Ok(());
        }
        let wants_rt = rt_type.rt_prio().is_some();
        if wants_rt && !state.rt_frame_held {
            if !self.rt_frames.try_acquire() {
                warn!(group = %id, rt_frames = self.rt_frames.count(), "no RT frame slots left");
                return Err(Error::NoRtFrameSlots);
            }
            state.rt_frame_held = true;
        } else if !wants_rt && state.rt_frame_held {
            self.rt_frames.release();
            state.rt_frame_held = false;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Membership helpers
    // ------------------------------------------------------------------

    /// Remove `tids` from every group other than `keep`
    fn evict_elsewhere(&self, keep: GroupId, tids: &[ThreadId]) {
        for group in self.groups() {
            if group.id() == keep {
                continue;
            }
            let mut state = group.write();
            let GroupState { members, slots, .. } = &mut *state;
            for &tid in tids {
                if let Some(member) = members.find_mut(tid) {
                    self.arbiter().release(slots, member);
                    members.remove(tid);
                    debug!(tid = %tid, from = %group.id(), to = %keep, "thread moved between groups");
                }
            }
        }
    }

    fn group_led_by(&self, leader: ThreadId) -> Option<GroupId> {
        self.frame_groups()
            .find(|g| {
                g.read()
                    .members
                    .get(MemberRole::Leader)
                    .is_some_and(|m| m.tid == leader)
            })
            .map(|g| g.id())
    }

    /// Put `tid` into `role`, evicting the previous occupant
    ///
    /// A thread already in another slot moves with its grant and exec
    /// history. Threads that are gone are skipped.
    fn assign_slot(&self, state: &mut GroupState, role: MemberRole, tid: Option<ThreadId>) {
        let current = state.members.get(role).map(|m| m.tid);
        if current == tid {
            return;
        }

        if let Some(old) = current {
            let GroupState { members, slots, .. } = &mut *state;
            if let Some(member) = members.find_mut(old) {
                self.arbiter().release(slots, member);
            }
            members.remove(old);
        }

        let Some(tid) = tid else {
            return;
        };
        let member = match state.members.remove(tid) {
            Some(member) => member,
            None if self.ops.is_alive(tid) => Member::new(tid),
            None => {
                debug!(tid = %tid, ?role, "skipping exited thread");
                return;
            }
        };
        if let Some(slot) = state.members.slot_mut(role) {
            *slot = Some(member);
        }
    }

    fn release_inner(&self, id: GroupId) -> Result<()> {
        let now = self.clock.now_ns();
        let params = self.config.frame_params();
        let placement = self.config.placement_defaults();

        let prev_cluster = self.registry.release(id, |group| {
            let mut state = group.write();
            self.release_all_slots(&mut state);
            if state.rt_frame_held {
                self.rt_frames.release();
            }
            let prev = state.placement.preferred_cluster;
            *state = GroupState::frame(params, placement, now);
            prev
        })?;

        if let Some(cpu) = prev_cluster.and_then(|c| self.cluster_cpu(c)) {
            self.request_freq(cpu, UpdateKind::Force);
        }
        info!(group = %id, "frame group released");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tick path
    // ------------------------------------------------------------------

    pub(crate) fn on_tick(&self, sample: &TickSample, pseudo_active: bool) -> Option<u64> {
        let group = self.group(sample.group).ok()?;
        let mut state = group.write();

        let member = state.members.find_mut(sample.tid)?;
        member.running = true;
        let exec = member.exec_delta(sample.accumulated_exec);
        let load = self.scale_load(sample.cpu, exec);
        if let Some(frame) = state.class.frame_mut() {
            let window = &mut frame.window_mut().load;
            window.add_exec(exec);
            window.add_load(load);
        }

        if !state.sched_enabled {
            return None;
        }
        if pseudo_active {
            return Some(state.class.util());
        }
        Some(self.tick_locked(sample.group, &mut state, sample.now))
    }

    /// One pseudo-tick pass; returns the delay until the next one
    pub(crate) fn pseudo_tick(&self) -> Option<Duration> {
        let now = self.clock.now_ns();
        for group in self.groups() {
            let mut state = group.write();
            if state.sched_enabled && state.has_running() {
                self.tick_locked(group.id(), &mut state, now);
            }
        }
        self.pseudo_period()
    }

    /// Shortest update interval among active groups, when below the
    /// native tick
    pub(crate) fn pseudo_period(&self) -> Option<Duration> {
        let tick = duration_ns(self.config.tick_period);
        self.groups()
            .filter_map(|g| {
                let state = g.read();
                (state.sched_enabled && state.has_running())
                    .then_some(state.placement.freq_update_interval)
            })
            .filter(|&interval| interval < tick)
            .min()
            .map(Duration::from_nanos)
    }

    pub(crate) fn thread_running(&self, tid: ThreadId, running: bool) -> bool {
        let mut tracked = false;
        for group in self.groups() {
            if !group.read().members.contains(tid) {
                continue;
            }
            if let Some(member) = group.write().members.find_mut(tid) {
                member.running = running;
                tracked = true;
            }
        }
        tracked
    }

    pub(crate) fn thread_exited(&self, tid: ThreadId) -> bool {
        let mut found = false;
        for group in self.groups() {
            let mut state = group.write();
            let GroupState { members, slots, .. } = &mut *state;
            if let Some(member) = members.find_mut(tid) {
                self.arbiter().release_exited(slots, member);
                members.remove(tid);
                found = true;
                debug!(tid = %tid, group = %group.id(), "exited thread evicted");
            }
        }
        found
    }

    // ------------------------------------------------------------------
    // Frame boundaries
    // ------------------------------------------------------------------

    pub(crate) fn begin_frame(&self, id: GroupId, frame_type: FrameType) -> Result<()> {
        let _control = self.control.lock();
        let group = self.frame_group(id)?;
        let now = self.clock.now_ns();
        let mut state = group.write();

        if state.activity_open {
            return Err(Error::ActivityInProgress(id));
        }
        if let Some(frame) = state.class.frame_mut() {
            let margin = self.margins.lock().lookup(frame.rate(), frame_type);
            frame.set_margin(margin)?;
        }

        state.freq_enabled = true;
        self.set_sched_locked(id, &mut state, true, now);
        state.frame_state = Some(frame_type);
        trace!(group = %id, %frame_type, "begin frame");
        self.timestamp_locked(id, &mut state, TimestampFlags::START, now)
    }

    pub(crate) fn end_frame(&self, id: GroupId) -> Result<()> {
        let group = self.frame_group(id)?;
        let now = self.clock.now_ns();
        let mut state = group.write();

        if state.frame_state.take().is_none() {
            return Ok(());
        }
        self.timestamp_locked(id, &mut state, TimestampFlags::END, now)
    }

    pub(crate) fn set_status(&self, id: GroupId, flags: TimestampFlags) -> Result<()> {
        let group = self.frame_group(id)?;
        let now = self.clock.now_ns();
        let mut state = group.write();
        self.timestamp_locked(id, &mut state, flags, now)
    }

    pub(crate) fn begin_activity(&self, uid: u32, id: GroupId) -> Result<()> {
        let _control = self.control.lock();
        let group = self.frame_group(id)?;
        let now = self.clock.now_ns();
        let mut state = group.write();

        self.check_owner(id, &state, uid)?;
        if !state.sched_enabled {
            return Err(Error::NotInFrame(id));
        }
        if state.activity_open {
            return Ok(());
        }

        if let Some(frame) = state.class.frame_mut() {
            let margin = self
                .margins
                .lock()
                .lookup(frame.rate(), FrameType::Activity);
            frame.set_margin(margin)?;
            frame.set_max_util(self.config.act_max_util)?;
        }
        state.activity_open = true;
        self.metrics.record_frame(id, FrameEvent::ActivityStart);
        self.timestamp_locked(
            id,
            &mut state,
            TimestampFlags::START | TimestampFlags::USE_MARGIN_IMME | TimestampFlags::SKIP_START,
            now,
        )
    }

    pub(crate) fn end_activity(&self, id: GroupId) -> Result<()> {
        let group = self.frame_group(id)?;
        let now = self.clock.now_ns();
        let mut state = group.write();
        self.end_activity_locked(id, &mut state, now);
        Ok(())
    }

    fn end_activity_locked(&self, id: GroupId, state: &mut GroupState, now: u64) {
        if !std::mem::take(&mut state.activity_open) {
            return;
        }
        if let Some(frame) = state.class.frame_mut() {
            if let Err(e) = frame.set_max_util(self.config.frame_max_util) {
                warn!(group = %id, error = %e, "failed to restore max util");
            }
        }
        self.metrics.record_frame(id, FrameEvent::ActivityEnd);
        if state.sched_enabled {
            if let Err(e) =
                self.timestamp_locked(id, state, TimestampFlags::END | TimestampFlags::SKIP_END, now)
            {
                warn!(group = %id, error = %e, "activity end timestamp rejected");
            }
        }
    }

    // ------------------------------------------------------------------
    // Frame tunables
    // ------------------------------------------------------------------

    pub(crate) fn set_rate(&self, id: GroupId, rate: u32) -> Result<()> {
        self.with_frame(id, |frame| frame.set_rate(rate))
    }

    pub(crate) fn set_margin(&self, id: GroupId, margin: i32) -> Result<()> {
        self.with_frame(id, |frame| frame.set_margin(margin))
    }

    pub(crate) fn set_max_util(&self, id: GroupId, max_util: u64) -> Result<()> {
        self.with_frame(id, |frame| frame.set_max_util(max_util))
    }

    pub(crate) fn set_min_util(&self, id: GroupId, min_util: u64) -> Result<()> {
        let group = self.frame_group(id)?;
        let now = self.clock.now_ns();
        let mut state = group.write();
        let util = state
            .class
            .frame_mut()
            .ok_or(Error::InvalidGroupId(id))?
            .set_min_util(min_util)?;
        if state.sched_enabled {
            self.publish(id, &mut state, util, UpdateKind::Force, now);
        }
        Ok(())
    }

    pub(crate) fn set_min_util_and_margin(&self, id: GroupId, min_util: u64, margin: i32) -> Result<()> {
        let group = self.frame_group(id)?;
        let now = self.clock.now_ns();
        let mut state = group.write();
        let frame = state
            .class
            .frame_mut()
            .ok_or(Error::InvalidGroupId(id))?;

        let old_margin = frame.margin();
        frame.set_margin(margin)?;
        let util = match frame.set_min_util(min_util) {
            Ok(util) => util,
            Err(e) => {
                // old_margin was accepted before, so this cannot fail
                let _ = frame.set_margin(old_margin);
                return Err(e);
            }
        };
        if state.sched_enabled {
            self.publish(id, &mut state, util, UpdateKind::Force, now);
        }
        Ok(())
    }

    pub(crate) fn configure_margins(&self, rate: u32, entries: &[(FrameType, i32)]) -> Result<()> {
        self.margins.lock().configure(rate, entries)
    }

    pub(crate) fn clear_margins(&self) {
        self.margins.lock().clear();
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    pub(crate) fn update_members(&self, update: &MemberUpdate) -> Result<GroupId> {
        if update.workers.len() > MAX_TID_NUM {
            return Err(Error::InvalidArgument("too many worker threads"));
        }
        if update.max_rt_threads > MAX_RT_THREAD {
            return Err(Error::InvalidArgument("RT thread budget out of range"));
        }
        let mut tids: Vec<ThreadId> = update
            .leader
            .into_iter()
            .chain(update.render)
            .chain(update.workers.iter().copied())
            .collect();
        tids.sort_unstable();
        if tids.windows(2).any(|w| w[0] == w[1]) {
            return Err(Error::InvalidArgument("thread listed twice"));
        }

        let _control = self.control.lock();
        let now = self.clock.now_ns();

        let Some(leader) = update.leader else {
            let GroupTarget::Existing(id) = update.group else {
                return Err(Error::InvalidArgument("clearing members needs a group id"));
            };
            let group = self.frame_group(id)?;
            let mut state = group.write();
            self.check_owner(id, &state, update.uid)?;
            self.end_activity_locked(id, &mut state, now);
            self.release_all_slots(&mut state);
            state.members = MemberSet::new();
            debug!(group = %id, "members cleared");
            return Ok(id);
        };

        let (id, fresh) = match update.group {
            GroupTarget::New => {
                if let Some(existing) = self.group_led_by(leader) {
                    return Err(Error::GroupAlreadyActive(existing));
                }
                let id = self.registry.alloc()?;
                info!(group = %id, leader = %leader, uid = update.uid, "frame group allocated");
                (id, true)
            }
            GroupTarget::Existing(id) => (id, false),
        };

        let result = self.apply_members(id, update, leader, &tids, now);
        if result.is_err() && fresh {
            if let Err(e) = self.release_inner(id) {
                warn!(group = %id, error = %e, "rollback of fresh group failed");
            }
        }
        result.map(|()| id)
    }

    fn apply_members(
        &self,
        id: GroupId,
        update: &MemberUpdate,
        leader: ThreadId,
        tids: &[ThreadId],
        now: u64,
    ) -> Result<()> {
        let group = self.frame_group(id)?;
        {
            let mut state = group.write();
            self.check_owner(id, &state, update.uid)?;
            self.update_rt_frame(id, &mut state, update.rt_type)?;
        }
        self.evict_elsewhere(id, tids);

        let mut state = group.write();
        self.end_activity_locked(id, &mut state, now);

        if id.is_dynamic() {
            state.owner = Some(update.uid);
        }
        state.rt_type = update.rt_type;
        state.slots.max = update.max_rt_threads;

        let leader_changed = state.members.get(MemberRole::Leader).map(|m| m.tid) != Some(leader);
        if leader_changed {
            for i in 0..MAX_FRAME_CFS_THREADS {
                self.assign_slot(&mut state, MemberRole::Cfs(i), None);
            }
        }
        self.assign_slot(&mut state, MemberRole::Leader, Some(leader));
        self.assign_slot(&mut state, MemberRole::Render, update.render);
        for i in 0..MAX_TID_NUM {
            self.assign_slot(&mut state, MemberRole::Worker(i), update.workers.get(i).copied());
        }

        if state.sched_enabled {
            self.sync_rt_slots(id, &mut state);
        } else {
            self.set_sched_locked(id, &mut state, true, now);
        }
        debug!(
            group = %id,
            members = state.members.len(),
            curr_rt_thread_num = state.slots.curr,
            "members updated"
        );
        Ok(())
    }

    pub(crate) fn set_cfs_members(
        &self,
        uid: u32,
        id: GroupId,
        tids: &[ThreadId],
        replace: bool,
    ) -> Result<()> {
        if tids.len() > MAX_FRAME_CFS_THREADS {
            return Err(Error::InvalidArgument("too many cfs threads"));
        }

        let _control = self.control.lock();
        let group = self.frame_group(id)?;
        let now = self.clock.now_ns();
        self.check_owner(id, &group.read(), uid)?;
        self.evict_elsewhere(id, tids);

        let mut state = group.write();
        if replace {
            for i in 0..MAX_FRAME_CFS_THREADS {
                self.assign_slot(&mut state, MemberRole::Cfs(i), tids.get(i).copied());
            }
        } else {
            let cfs_of = |state: &GroupState, tid| {
                matches!(state.members.role_of(tid), Some(MemberRole::Cfs(_)))
            };
            let new: Vec<ThreadId> = tids.iter().copied().filter(|&t| !cfs_of(&*state, t)).collect();
            let free: Vec<usize> = (0..MAX_FRAME_CFS_THREADS)
                .filter(|&i| state.members.get(MemberRole::Cfs(i)).is_none())
                .collect();
            if new.len() > free.len() {
                return Err(Error::InvalidArgument("no free cfs slots"));
            }
            for (tid, i) in new.into_iter().zip(free) {
                self.assign_slot(&mut state, MemberRole::Cfs(i), Some(tid));
            }
        }

        self.end_activity_locked(id, &mut state, now);
        self.sync_rt_slots(id, &mut state);
        Ok(())
    }

    pub(crate) fn release_group(&self, id: GroupId) -> Result<()> {
        if !id.is_dynamic() {
            return Err(Error::InvalidGroupId(id));
        }
        let _control = self.control.lock();
        self.release_inner(id)
    }

    pub(crate) fn set_aux_thread(&self, tid: ThreadId, enable: bool, params: AuxParams) -> Result<()> {
        if params.min_util > SCHED_CAPACITY_SCALE {
            return Err(Error::InvalidArgument("aux min util out of range"));
        }
        if params.prio.is_some_and(|p| sched_priority(p).is_none()) {
            return Err(Error::InvalidArgument("aux priority out of range"));
        }

        let _control = self.control.lock();
        let now = self.clock.now_ns();
        let arbiter = self.arbiter();

        if !enable {
            let mut state = self.aux_group.write();
            let GroupState { members, slots, .. } = &mut *state;
            if let Some(member) = members.find_mut(tid) {
                arbiter.release(slots, member);
                members.remove(tid);
                debug!(tid = %tid, "aux thread removed");
            }
            return Ok(());
        }

        if !self.ops.is_alive(tid) {
            return Err(Error::InvalidArgument("thread does not exist"));
        }
        self.evict_elsewhere(GroupId::AUX, &[tid]);

        let mut state = self.aux_group.write();
        if !state.members.contains(tid) && !state.members.insert_any(Member::new(tid)) {
            return Err(Error::InvalidArgument("auxiliary group is full"));
        }
        if let GroupClass::Aux(aux) = &mut state.class {
            aux.min_util = params.min_util;
        }

        {
            let GroupState { members, slots, .. } = &mut *state;
            if let Some(member) = members.find_mut(tid) {
                match params.prio {
                    Some(prio) => {
                        let decision = arbiter.request(slots, member, prio, true);
                        self.metrics.record_slot_decision(decision.as_str());
                    }
                    None => {
                        arbiter.release(slots, member);
                    }
                }
            }
        }

        self.publish(GroupId::AUX, &mut state, params.min_util, UpdateKind::Force, now);
        debug!(tid = %tid, min_util = params.min_util, prio = ?params.prio, "aux thread set");
        Ok(())
    }

    // ------------------------------------------------------------------
    // RT slots
    // ------------------------------------------------------------------

    pub(crate) fn request_rt_slot(&self, id: GroupId, tid: ThreadId, prio: u32) -> Result<SlotDecision> {
        let _control = self.control.lock();
        let group = self.group(id)?;
        let mut state = group.write();

        match state.members.role_of(tid) {
            None => return Err(Error::NotInFrame(id)),
            Some(role) if !state.class.is_aux() && !role.rt_eligible() => {
                return Err(Error::InvalidArgument("cfs-only members cannot hold RT slots"));
            }
            Some(_) => {}
        }

        let best_effort_cfs = state.class.is_aux();
        let GroupState { members, slots, .. } = &mut *state;
        let member = members.find_mut(tid).ok_or(Error::NotInFrame(id))?;
        let decision = self.arbiter().request(slots, member, prio, best_effort_cfs);
        self.metrics.record_slot_decision(decision.as_str());
        Ok(decision)
    }

    pub(crate) fn release_rt_slot(&self, id: GroupId, tid: ThreadId) -> Result<bool> {
        let _control = self.control.lock();
        let group = self.group(id)?;
        let mut state = group.write();
        let GroupState { members, slots, .. } = &mut *state;
        let member = members.find_mut(tid).ok_or(Error::NotInFrame(id))?;
        Ok(self.arbiter().release(slots, member))
    }

    pub(crate) fn set_priority(&self, id: GroupId, rt_type: RtgType) -> Result<()> {
        let _control = self.control.lock();
        let group = self.frame_group(id)?;
        let mut state = group.write();
        self.update_rt_frame(id, &mut state, rt_type)?;
        state.rt_type = rt_type;
        self.sync_rt_slots(id, &mut state);
        debug!(group = %id, ?rt_type, "priority set");
        Ok(())
    }

    pub(crate) fn rt_thread_count(&self) -> usize {
        self.rt_ceiling.count()
    }

    pub(crate) fn rt_frame_count(&self) -> usize {
        self.rt_frames.count()
    }

    // ------------------------------------------------------------------
    // Tracking state and boost
    // ------------------------------------------------------------------

    pub(crate) fn set_sched_enabled(&self, id: GroupId, enable: bool) -> Result<()> {
        let _control = self.control.lock();
        let group = self.frame_group(id)?;
        let now = self.clock.now_ns();
        let mut state = group.write();
        self.set_sched_locked(id, &mut state, enable, now);
        Ok(())
    }

    /// Latch the frequency-enable flag and follow it with the sched state
    pub(crate) fn set_frame_freq(&self, id: GroupId, enable: bool) -> Result<()> {
        let _control = self.control.lock();
        let group = self.frame_group(id)?;
        let now = self.clock.now_ns();
        let mut state = group.write();
        state.freq_enabled = enable;
        self.set_sched_locked(id, &mut state, enable, now);
        Ok(())
    }

    pub(crate) fn start_boost(&self, duration_ms: u64, min_util: u64) -> Result<Duration> {
        let duration = Duration::from_millis(duration_ms);
        if duration.is_zero() || duration > self.config.max_boost_duration {
            return Err(Error::InvalidArgument("boost duration out of range"));
        }
        if min_util > SCHED_CAPACITY_SCALE {
            return Err(Error::InvalidArgument("boost util out of range"));
        }

        let _control = self.control.lock();
        let now = self.clock.now_ns();
        for group in self.frame_groups() {
            let mut state = group.write();
            self.set_sched_locked(group.id(), &mut state, true, now);
            if let Some(frame) = state.class.frame_mut() {
                frame.set_boost_min_util(min_util)?;
            }
            let util = state.class.util();
            self.publish(group.id(), &mut state, util, UpdateKind::Force, now);
        }
        self.metrics.record_boost_pulse();
        info!(duration_ms, min_util, "boost pulse started");
        Ok(duration)
    }

    /// Boost timer expiry: drop the floor everywhere
    pub(crate) fn boost_expired(&self) {
        let _control = self.control.lock();
        let now = self.clock.now_ns();
        for group in self.frame_groups() {
            let mut state = group.write();
            let util = state.class.frame_mut().map(FrameInfo::clear_boost_min_util);
            if !state.freq_enabled {
                self.set_sched_locked(group.id(), &mut state, false, now);
            } else if let Some(util) = util.filter(|_| state.sched_enabled) {
                self.publish(group.id(), &mut state, util, UpdateKind::Force, now);
            }
        }
        debug!("boost pulse expired");
    }

    // ------------------------------------------------------------------
    // Placement tunables
    // ------------------------------------------------------------------

    pub(crate) fn set_freq_update_interval(&self, id: GroupId, interval_ms: u64) -> Result<()> {
        if !(MIN_FREQ_CYCLE_MS..=MAX_FREQ_CYCLE_MS).contains(&interval_ms) {
            return Err(Error::InvalidArgument("freq update interval out of range"));
        }
        let group = self.group(id)?;
        group.write().placement.freq_update_interval = interval_ms * NSEC_PER_MSEC;
        Ok(())
    }

    pub(crate) fn set_util_invalid_interval(&self, id: GroupId, interval_ms: Option<u64>) -> Result<()> {
        let interval = match interval_ms {
            Some(0) => return Err(Error::InvalidArgument("util invalid interval must be positive")),
            Some(ms) => ms.saturating_mul(NSEC_PER_MSEC),
            None => u64::MAX,
        };
        let group = self.group(id)?;
        group.write().placement.util_invalid_interval = interval;
        Ok(())
    }

    pub(crate) fn set_min_freq(&self, id: GroupId, freq_khz: u64) -> Result<()> {
        let group = self.group(id)?;
        let mut state = group.write();
        let cluster = state
            .placement
            .preferred_cluster
            .ok_or(Error::InvalidArgument("group has no preferred cluster"))?;
        state.placement.min_freq = freq_khz;
        state.placement.last_freq_update_time = self.clock.now_ns();
        if let Some(cpu) = self.cluster_cpu(cluster) {
            self.request_freq(cpu, UpdateKind::Force);
        }
        Ok(())
    }

    pub(crate) fn set_preferred_cluster(&self, id: GroupId, cluster: Option<u32>) -> Result<()> {
        let target_cpu = match cluster {
            Some(c) => Some(
                self.cluster_cpu(c)
                    .ok_or(Error::InvalidArgument("unknown cluster"))?,
            ),
            None => None,
        };
        let group = self.group(id)?;
        let mut state = group.write();
        let prev = std::mem::replace(&mut state.placement.preferred_cluster, cluster);
        if prev != cluster {
            if let Some(cpu) = prev.and_then(|c| self.cluster_cpu(c)) {
                self.metrics.record_cluster_switch();
                self.request_freq(cpu, UpdateKind::Force);
            }
        }
        if let Some(cpu) = target_cpu {
            self.request_freq(cpu, UpdateKind::Force);
        }
        Ok(())
    }

    pub(crate) fn set_group_boost(&self, id: GroupId, boosted: bool) -> Result<()> {
        let group = self.group(id)?;
        let now = self.clock.now_ns();
        let mut state = group.write();
        if state.placement.boosted == boosted {
            return Ok(());
        }
        state.placement.boosted = boosted;
        if state.sched_enabled {
            let util = state.class.util();
            self.publish(id, &mut state, util, UpdateKind::Force, now);
        }
        Ok(())
    }

    pub(crate) fn set_global_boost(&self, enabled: bool) {
        self.global_boost.store(enabled, Ordering::Release);
    }

    pub(crate) fn set_load_mode(&self, id: GroupId, mode: LoadMode) -> Result<()> {
        self.group(id)?.write().mode = mode;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub(crate) fn cluster_demand(&self, cluster: u32) -> ClusterDemand {
        let now = self.clock.now_ns();
        let mut demand = ClusterDemand::default();

        for group in self.groups() {
            let state = group.read();
            let placement = &state.placement;
            if state.members.is_empty()
                || placement.preferred_cluster != Some(cluster)
                || placement.is_util_stale(now)
            {
                continue;
            }
            demand.min_freq = demand.min_freq.max(placement.min_freq);
            if state.mode.util_enabled && state.has_running() {
                demand.util = demand.util.max(placement.normalized_util);
            }
        }
        demand
    }

    pub(crate) fn snapshot(&self, id: GroupId) -> Result<FrameSnapshot> {
        let group = self.group(id)?;
        let state = group.read();
        let frame = state.class.frame();

        Ok(FrameSnapshot {
            id,
            aux: state.class.is_aux(),
            sched_enabled: state.sched_enabled,
            freq_enabled: state.freq_enabled,
            activity_open: state.activity_open,
            frame_state: state.frame_state,
            owner: state.owner,
            rt_type: state.rt_type,
            status: frame.map_or(FrameStatus::End, FrameInfo::status),
            rate: frame.map_or(0, FrameInfo::rate),
            margin: frame.map_or(0, FrameInfo::margin),
            frame_util: state.class.util(),
            frame_vload: frame.map_or(0, FrameInfo::frame_vload),
            frame_min_util: frame.map_or(0, FrameInfo::frame_min_util),
            frame_max_util: frame.map_or(SCHED_CAPACITY_SCALE, FrameInfo::frame_max_util),
            boost_min_util: frame.map_or(0, FrameInfo::boost_min_util),
            invalid_count: frame.map_or(0, FrameInfo::invalid_count),
            curr_rt_threads: state.slots.curr,
            max_rt_threads: state.slots.max,
            members: state
                .members
                .iter_roles()
                .map(|(role, m)| MemberSnapshot {
                    tid: m.tid,
                    role,
                    granted: m.granted,
                    running: m.running,
                })
                .collect(),
            preferred_cluster: state.placement.preferred_cluster,
            normalized_util: state.placement.normalized_util,
            min_freq: state.placement.min_freq,
        })
    }

    pub(crate) fn active_groups(&self) -> Vec<GroupId> {
        self.frame_groups().map(|g| g.id()).collect()
    }
}
