//! Group membership
//!
//! Members are weak references: a [`ThreadId`] plus whatever the engine
//! remembers about it. The set has a fixed number of slots so the tick
//! path never allocates.
//!
//! Frame groups use the slots by role:
//!
//! ```text
//! [ leader | render | worker 0..5 | cfs 0..3 ]
//! ```
//!
//! The auxiliary group treats every slot as a plain member.

use rtg_common::config::{MAX_FRAME_CFS_THREADS, MAX_TID_NUM};
use rtg_common::ThreadId;

/// Total slots per group
pub const MAX_MEMBERS: usize = 2 + MAX_TID_NUM + MAX_FRAME_CFS_THREADS;

const WORKER_BASE: usize = 2;
const CFS_BASE: usize = WORKER_BASE + MAX_TID_NUM;

/// Slot a member occupies in a frame group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberRole {
    Leader,
    Render,
    Worker(usize),
    Cfs(usize),
}

impl MemberRole {
    fn index(self) -> usize {
        match self {
            MemberRole::Leader => 0,
            MemberRole::Render => 1,
            MemberRole::Worker(i) => WORKER_BASE + i,
            MemberRole::Cfs(i) => CFS_BASE + i,
        }
    }

    /// Role of slot `index`
    pub fn of(index: usize) -> MemberRole {
        match index {
            0 => MemberRole::Leader,
            1 => MemberRole::Render,
            i if i < CFS_BASE => MemberRole::Worker(i - WORKER_BASE),
            i => MemberRole::Cfs(i - CFS_BASE),
        }
    }

    /// CFS-only members never hold RT slots
    pub fn rt_eligible(self) -> bool {
        !matches!(self, MemberRole::Cfs(_))
    }
}

/// One tracked thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Member {
    pub tid: ThreadId,

    /// RT priority currently granted, if any
    pub granted: Option<u32>,

    /// Accumulated exec last seen on a tick (ns), `None` until sampled
    pub last_exec: Option<u64>,

    /// Thread is currently on a CPU runqueue
    pub running: bool,
}

impl Member {
    pub fn new(tid: ThreadId) -> Self {
        Self {
            tid,
            granted: None,
            last_exec: None,
            running: false,
        }
    }

    /// Exec time since the previous sample, and remember this sample
    ///
    /// The first sample only primes the counter.
    pub fn exec_delta(&mut self, accumulated: u64) -> u64 {
        let delta = self
            .last_exec
            .map_or(0, |last| accumulated.saturating_sub(last));
        self.last_exec = Some(accumulated);
        delta
    }
}

/// Fixed-capacity member table
#[derive(Debug, Clone, Default)]
pub struct MemberSet {
    slots: [Option<Member>; MAX_MEMBERS],
}

impl MemberSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, role: MemberRole) -> Option<&Member> {
        self.slots.get(role.index()).and_then(Option::as_ref)
    }

    pub fn slot_mut(&mut self, role: MemberRole) -> Option<&mut Option<Member>> {
        self.slots.get_mut(role.index())
    }

    pub fn find(&self, tid: ThreadId) -> Option<&Member> {
        self.iter().find(|m| m.tid == tid)
    }

    pub fn find_mut(&mut self, tid: ThreadId) -> Option<&mut Member> {
        self.iter_mut().find(|m| m.tid == tid)
    }

    pub fn contains(&self, tid: ThreadId) -> bool {
        self.find(tid).is_some()
    }

    /// Role held by `tid`
    pub fn role_of(&self, tid: ThreadId) -> Option<MemberRole> {
        self.slots
            .iter()
            .position(|s| s.is_some_and(|m| m.tid == tid))
            .map(MemberRole::of)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Member> {
        self.slots.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Member> {
        self.slots.iter_mut().flatten()
    }

    /// Members with their roles
    pub fn iter_roles(&self) -> impl Iterator<Item = (MemberRole, &Member)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|m| (MemberRole::of(i), m)))
    }

    /// Mutable members with their roles
    pub fn iter_roles_mut(&mut self) -> impl Iterator<Item = (MemberRole, &mut Member)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|m| (MemberRole::of(i), m)))
    }

    /// Take the member out of whatever slot holds `tid`
    pub fn remove(&mut self, tid: ThreadId) -> Option<Member> {
        self.slots
            .iter_mut()
            .find(|s| s.is_some_and(|m| m.tid == tid))
            .and_then(Option::take)
    }

    /// Put `member` in the first free slot
    pub fn insert_any(&mut self, member: Member) -> bool {
        match self.slots.iter_mut().find(|s| s.is_none()) {
            Some(slot) => {
                *slot = Some(member);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn running_count(&self) -> usize {
        self.iter().filter(|m| m.running).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_round_trip_indices() {
        for i in 0..MAX_MEMBERS {
            assert_eq!(MemberRole::of(i).index(), i);
        }
        assert!(MemberRole::Worker(0).rt_eligible());
        assert!(!MemberRole::Cfs(2).rt_eligible());
    }

    #[test]
    fn test_slots_by_role() {
        let mut set = MemberSet::new();
        *set.slot_mut(MemberRole::Leader).unwrap() = Some(Member::new(ThreadId(10)));
        *set.slot_mut(MemberRole::Worker(4)).unwrap() = Some(Member::new(ThreadId(14)));
        *set.slot_mut(MemberRole::Cfs(0)).unwrap() = Some(Member::new(ThreadId(20)));

        assert_eq!(set.len(), 3);
        assert_eq!(set.role_of(ThreadId(14)), Some(MemberRole::Worker(4)));
        assert_eq!(set.role_of(ThreadId(20)), Some(MemberRole::Cfs(0)));
        assert!(set.slot_mut(MemberRole::Cfs(MAX_FRAME_CFS_THREADS)).is_none());

        assert!(set.remove(ThreadId(14)).is_some());
        assert!(!set.contains(ThreadId(14)));
        assert!(set.remove(ThreadId(14)).is_none());
    }

    #[test]
    fn test_insert_any_until_full() {
        let mut set = MemberSet::new();
        for i in 0..MAX_MEMBERS as u32 {
            assert!(set.insert_any(Member::new(ThreadId(i))));
        }
        assert!(!set.insert_any(Member::new(ThreadId(99))));
        assert_eq!(set.len(), MAX_MEMBERS);
        for i in 0..MAX_MEMBERS as u32 {
            assert!(set.remove(ThreadId(i)).is_some());
        }
        assert!(set.is_empty());
    }

    #[test]
    fn test_exec_delta() {
        let mut m = Member::new(ThreadId(1));
        assert_eq!(m.exec_delta(1_000), 0);
        assert_eq!(m.exec_delta(1_600), 600);
        // Counter went backwards (thread id reuse)
        assert_eq!(m.exec_delta(100), 0);
        assert_eq!(m.exec_delta(150), 50);
    }

    #[test]
    fn test_exec_delta_first_sample_zero() {
        let mut m = Member::new(ThreadId(1));
        assert_eq!(m.exec_delta(0), 0);
        assert_eq!(m.exec_delta(700), 700);
        assert_eq!(m.exec_delta(900), 200);
    }
}
