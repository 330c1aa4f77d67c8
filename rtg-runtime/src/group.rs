//! Group records
//!
//! A [`Group`] is one related thread group: its members, RT budget,
//! placement bookkeeping and the class-specific tracking state. Frame
//! groups carry a [`FrameInfo`]; the auxiliary group only publishes a
//! fixed utilization floor. The class set is closed, so the per-tick
//! behavior is a `match` on [`GroupClass`].

use crate::arbiter::RtSlots;
use crate::frame::{FrameInfo, FrameParams};
use crate::members::MemberSet;
use crate::placement::PlacementState;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use rtg_common::{FrameType, GroupId, RtgType};

/// Auxiliary group tracking state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuxInfo {
    /// Util published for the group on every tick
    pub min_util: u64,
}

/// Class-specific tracking state
#[derive(Debug, Clone)]
pub enum GroupClass {
    Frame(FrameInfo),
    Aux(AuxInfo),
}

impl GroupClass {
    /// Recompute the group's utilization at `now`
    pub fn tick(&mut self, now: u64, invalid_interval: u64) -> u64 {
        match self {
            GroupClass::Frame(frame) => frame.tick(now, invalid_interval),
            GroupClass::Aux(aux) => aux.min_util,
        }
    }

    /// Current utilization without advancing anything
    pub fn util(&self) -> u64 {
        match self {
            GroupClass::Frame(frame) => frame.frame_util(),
            GroupClass::Aux(aux) => aux.min_util,
        }
    }

    pub fn frame(&self) -> Option<&FrameInfo> {
        match self {
            GroupClass::Frame(frame) => Some(frame),
            GroupClass::Aux(_) => None,
        }
    }

    pub fn frame_mut(&mut self) -> Option<&mut FrameInfo> {
        match self {
            GroupClass::Frame(frame) => Some(frame),
            GroupClass::Aux(_) => None,
        }
    }

    pub fn is_aux(&self) -> bool {
        matches!(self, GroupClass::Aux(_))
    }
}

/// How a group's load feeds the governor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadMode {
    /// Publish frequency reconsideration requests
    pub freq_enabled: bool,

    /// Count the group's util in cluster demand
    pub util_enabled: bool,
}

impl Default for LoadMode {
    fn default() -> Self {
        Self {
            freq_enabled: true,
            util_enabled: true,
        }
    }
}

/// Placement defaults a group returns to on reset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacementDefaults {
    pub freq_update_interval: u64,
    pub util_invalid_interval: u64,
    pub capacity_margin: u64,
}

/// Everything guarded by a group's lock
#[derive(Debug, Clone)]
pub struct GroupState {
    pub class: GroupClass,
    pub members: MemberSet,
    pub slots: RtSlots,
    pub placement: PlacementState,
    pub mode: LoadMode,

    /// uid that registered the group's threads
    pub owner: Option<u32>,

    /// Priority class requested for RT-eligible members
    pub rt_type: RtgType,

    /// Tracking on: timestamps accepted, ticks processed
    pub sched_enabled: bool,

    /// External frequency-enable latch
    pub freq_enabled: bool,

    /// Group holds one of the engine's RT frame slots
    pub rt_frame_held: bool,

    pub activity_open: bool,

    /// Kind of the open frame, `None` once ended
    pub frame_state: Option<FrameType>,
}

impl GroupState {
    fn with_class(class: GroupClass, placement: PlacementDefaults) -> Self {
        let mut state = Self {
            class,
            members: MemberSet::new(),
            slots: RtSlots::default(),
            placement: PlacementState::default(),
            mode: LoadMode::default(),
            owner: None,
            rt_type: RtgType::default(),
            sched_enabled: false,
            freq_enabled: false,
            rt_frame_held: false,
            activity_open: false,
            frame_state: None,
        };
        state.placement.reset(
            placement.freq_update_interval,
            placement.util_invalid_interval,
            placement.capacity_margin,
        );
        state
    }

    /// Fresh frame group state
    pub fn frame(params: FrameParams, placement: PlacementDefaults, now: u64) -> Self {
        Self::with_class(GroupClass::Frame(FrameInfo::new(params, now)), placement)
    }

    /// Fresh auxiliary group state
    pub fn aux(placement: PlacementDefaults) -> Self {
        Self::with_class(GroupClass::Aux(AuxInfo::default()), placement)
    }

    /// Whether any member is on a CPU
    pub fn has_running(&self) -> bool {
        self.members.running_count() > 0
    }

    /// RT priority requested for RT-eligible members
    pub fn rt_prio(&self) -> Option<u32> {
        self.rt_type.rt_prio()
    }
}

/// One related thread group
#[derive(Debug)]
pub struct Group {
    id: GroupId,
    state: RwLock<GroupState>,
}

impl Group {
    pub fn new(id: GroupId, state: GroupState) -> Self {
        Self {
            id,
            state: RwLock::new(state),
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, GroupState> {
        self.state.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, GroupState> {
        self.state.write()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::members::{Member, MemberRole};
    use rtg_common::ThreadId;

    fn defaults() -> PlacementDefaults {
        PlacementDefaults {
            freq_update_interval: 4_000_000,
            util_invalid_interval: u64::MAX,
            capacity_margin: 1024,
        }
    }

    #[test]
    fn test_aux_tick_publishes_floor() {
        let mut state = GroupState::aux(defaults());
        if let GroupClass::Aux(aux) = &mut state.class {
            aux.min_util = 300;
        }
        assert_eq!(state.class.tick(123, u64::MAX), 300);
        assert!(state.class.frame().is_none());
        assert!(state.class.is_aux());
    }

    #[test]
    fn test_frame_state_defaults() {
        let state = GroupState::frame(FrameParams::default(), defaults(), 0);
        assert!(!state.sched_enabled);
        assert_eq!(state.placement.freq_update_interval, 4_000_000);
        assert_eq!(state.rt_prio(), None);
        assert_eq!(state.class.util(), 0);
    }

    #[test]
    fn test_running_members() {
        let group = Group::new(
            GroupId::DEFAULT,
            GroupState::frame(FrameParams::default(), defaults(), 0),
        );
        {
            let mut state = group.write();
            let mut m = Member::new(ThreadId(5));
            m.running = true;
            *state.members.slot_mut(MemberRole::Render).unwrap() = Some(m);
        }
        assert!(group.read().has_running());
        assert_eq!(group.id(), GroupId::DEFAULT);
    }
}
