//! RT slot arbitration
//!
//! Two budgets gate every elevation to FIFO scheduling:
//!
//! - the per-group [`RtSlots`] (`curr` / `max`), guarded by the group lock
//! - the process-wide [`SlotCounter`] ceiling, a lock-free counter shared
//!   by every group of one engine
//!
//! Grant state lives on the [`Member`] itself, so each grant is paired
//! with exactly one release no matter which path (membership update,
//! sched disable, group release, thread exit) gives the slot back.

use crate::adapter::{SchedClass, ThreadControl};
use crate::members::Member;
use rtg_common::config::DEFAULT_MAX_RT_THREAD;
use rtg_common::sched_priority;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{trace, warn};

/// Bounded counter shared across groups
///
/// Used for the global RT thread ceiling and for the number of frame
/// groups allowed to run RT threads at once.
#[derive(Debug)]
pub struct SlotCounter {
    count: AtomicUsize,
    max: usize,
}

impl SlotCounter {
    pub fn new(max: usize) -> Self {
        Self {
            count: AtomicUsize::new(0),
            max,
        }
    }

    /// Take one slot if the ceiling allows it
    pub fn try_acquire(&self) -> bool {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then_some(n + 1)
            })
            .is_ok()
    }

    /// Give one slot back; never goes below zero
    pub fn release(&self) {
        let _ = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

/// Per-group RT budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtSlots {
    pub curr: usize,
    pub max: usize,
}

impl Default for RtSlots {
    fn default() -> Self {
        Self {
            curr: 0,
            max: DEFAULT_MAX_RT_THREAD,
        }
    }
}

/// Outcome of an RT slot request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotDecision {
    /// Thread now runs FIFO at this engine priority
    Granted(u32),

    /// Thread stays time-shared
    Denied(DenyReason),
}

impl SlotDecision {
    pub fn is_granted(self) -> bool {
        matches!(self, SlotDecision::Granted(_))
    }

    /// Label for metrics
    pub fn as_str(self) -> &'static str {
        match self {
            SlotDecision::Granted(_) => "granted",
            SlotDecision::Denied(DenyReason::InvalidPriority) => "invalid_priority",
            SlotDecision::Denied(DenyReason::GroupBudget) => "group_budget",
            SlotDecision::Denied(DenyReason::GlobalCeiling) => "global_ceiling",
            SlotDecision::Denied(DenyReason::PrimitiveFailed) => "primitive_failed",
        }
    }
}

/// Why a thread was not elevated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    InvalidPriority,
    GroupBudget,
    GlobalCeiling,
    PrimitiveFailed,
}

/// Grants and releases RT slots against both budgets
pub struct SlotArbiter<'a> {
    ceiling: &'a SlotCounter,
    ops: &'a dyn ThreadControl,
}

impl<'a> SlotArbiter<'a> {
    pub fn new(ceiling: &'a SlotCounter, ops: &'a dyn ThreadControl) -> Self {
        Self { ceiling, ops }
    }

    /// Ask for FIFO scheduling of `member` at engine priority `prio`
    ///
    /// `best_effort_cfs` selects the auxiliary-group behavior: when the
    /// global ceiling is exhausted the thread is still explicitly moved to
    /// the time-shared class.
    pub fn request(
        &self,
        slots: &mut RtSlots,
        member: &mut Member,
        prio: u32,
        best_effort_cfs: bool,
    ) -> SlotDecision {
        if sched_priority(prio).is_none() {
            return SlotDecision::Denied(DenyReason::InvalidPriority);
        }

        // Already elevated: only the priority level may change
        if let Some(current) = member.granted {
            if current == prio {
                return SlotDecision::Granted(prio);
            }
            return match self
                .ops
                .set_scheduling_class(member.tid, SchedClass::Fifo { prio })
            {
                Ok(()) => {
                    member.granted = Some(prio);
                    SlotDecision::Granted(prio)
                }
                Err(e) => {
                    warn!(tid = %member.tid, error = %e, "RT priority change failed");
                    SlotDecision::Granted(current)
                }
            };
        }

        if slots.curr >= slots.max {
            trace!(tid = %member.tid, curr = slots.curr, max = slots.max, "group RT budget exhausted");
            return SlotDecision::Denied(DenyReason::GroupBudget);
        }

        if !self.ceiling.try_acquire() {
            trace!(tid = %member.tid, rtg_rt_thread_num = self.ceiling.count(), "global RT ceiling reached");
            if best_effort_cfs {
                if let Err(e) = self.ops.set_scheduling_class(member.tid, SchedClass::Normal) {
                    warn!(tid = %member.tid, error = %e, "CFS fallback failed");
                }
            }
            return SlotDecision::Denied(DenyReason::GlobalCeiling);
        }
        slots.curr += 1;

        match self
            .ops
            .set_scheduling_class(member.tid, SchedClass::Fifo { prio })
        {
            Ok(()) => {
                member.granted = Some(prio);
                trace!(
                    tid = %member.tid,
                    prio,
                    curr_rt_thread_num = slots.curr,
                    rtg_rt_thread_num = self.ceiling.count(),
                    "RT slot granted"
                );
                SlotDecision::Granted(prio)
            }
            Err(e) => {
                slots.curr -= 1;
                self.ceiling.release();
                warn!(tid = %member.tid, error = %e, "RT promotion failed, rolled back");
                SlotDecision::Denied(DenyReason::PrimitiveFailed)
            }
        }
    }

    /// Return `member` to time-shared scheduling and free its slot
    ///
    /// A member without a grant is left alone. Returns whether a slot was
    /// freed.
    pub fn release(&self, slots: &mut RtSlots, member: &mut Member) -> bool {
        if member.granted.take().is_none() {
            return false;
        }

        if let Err(e) = self.ops.set_scheduling_class(member.tid, SchedClass::Normal) {
            warn!(tid = %member.tid, error = %e, "demotion to CFS failed");
        }
        slots.curr = slots.curr.saturating_sub(1);
        self.ceiling.release();
        trace!(
            tid = %member.tid,
            curr_rt_thread_num = slots.curr,
            rtg_rt_thread_num = self.ceiling.count(),
            "RT slot released"
        );
        true
    }

    /// Free the slot of a thread that no longer exists
    ///
    /// Only the accounting is undone; the thread is not touched.
    pub fn release_exited(&self, slots: &mut RtSlots, member: &mut Member) -> bool {
        if member.granted.take().is_none() {
            return false;
        }
        slots.curr = slots.curr.saturating_sub(1);
        self.ceiling.release();
        trace!(tid = %member.tid, rtg_rt_thread_num = self.ceiling.count(), "RT slot of exited thread freed");
        true
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rtg_common::ThreadId;
    use std::collections::HashSet;
    use std::io;
    use std::sync::Arc;

    /// Records class changes; threads in `failing` reject FIFO
    #[derive(Default)]
    pub(crate) struct MockControl {
        pub calls: Mutex<Vec<(ThreadId, SchedClass)>>,
        pub failing: Mutex<HashSet<ThreadId>>,
    }

    impl ThreadControl for MockControl {
        fn set_scheduling_class(&self, tid: ThreadId, class: SchedClass) -> io::Result<()> {
            if matches!(class, SchedClass::Fifo { .. }) && self.failing.lock().contains(&tid) {
                return Err(io::Error::from(io::ErrorKind::PermissionDenied));
            }
            self.calls.lock().push((tid, class));
            Ok(())
        }

        fn is_alive(&self, _tid: ThreadId) -> bool {
            true
        }
    }

    #[test]
    fn test_group_budget_then_release() {
        let ceiling = SlotCounter::new(8);
        let ops = MockControl::default();
        let arb = SlotArbiter::new(&ceiling, &ops);
        let mut slots = RtSlots { curr: 0, max: 2 };
        let mut a = Member::new(ThreadId(1));
        let mut b = Member::new(ThreadId(2));
        let mut c = Member::new(ThreadId(3));
        let mut d = Member::new(ThreadId(4));

        assert_eq!(arb.request(&mut slots, &mut a, 2, false), SlotDecision::Granted(2));
        assert_eq!(arb.request(&mut slots, &mut b, 2, false), SlotDecision::Granted(2));
        assert_eq!(
            arb.request(&mut slots, &mut c, 2, false),
            SlotDecision::Denied(DenyReason::GroupBudget)
        );

        assert!(arb.release(&mut slots, &mut a));
        assert!(arb.request(&mut slots, &mut d, 2, false).is_granted());
        assert_eq!(slots.curr, 2);
        assert_eq!(ceiling.count(), 2);
    }

    #[test]
    fn test_priority_out_of_range() {
        let ceiling = SlotCounter::new(8);
        let ops = MockControl::default();
        let arb = SlotArbiter::new(&ceiling, &ops);
        let mut slots = RtSlots::default();
        let mut m = Member::new(ThreadId(1));

        assert_eq!(
            arb.request(&mut slots, &mut m, 100, false),
            SlotDecision::Denied(DenyReason::InvalidPriority)
        );
        assert_eq!(slots.curr, 0);
        assert!(ops.calls.lock().is_empty());
    }

    #[test]
    fn test_primitive_failure_rolls_back() {
        let ceiling = SlotCounter::new(8);
        let ops = MockControl::default();
        ops.failing.lock().insert(ThreadId(7));
        let arb = SlotArbiter::new(&ceiling, &ops);
        let mut slots = RtSlots::default();
        let mut m = Member::new(ThreadId(7));

        assert_eq!(
            arb.request(&mut slots, &mut m, 1, false),
            SlotDecision::Denied(DenyReason::PrimitiveFailed)
        );
        assert_eq!(slots.curr, 0);
        assert_eq!(ceiling.count(), 0);
        assert_eq!(m.granted, None);
    }

    #[test]
    fn test_global_ceiling_and_aux_fallback() {
        let ceiling = SlotCounter::new(1);
        let ops = MockControl::default();
        let arb = SlotArbiter::new(&ceiling, &ops);
        let mut g1 = RtSlots::default();
        let mut g2 = RtSlots::default();
        let mut a = Member::new(ThreadId(1));
        let mut b = Member::new(ThreadId(2));

        assert!(arb.request(&mut g1, &mut a, 1, false).is_granted());
        assert_eq!(
            arb.request(&mut g2, &mut b, 1, true),
            SlotDecision::Denied(DenyReason::GlobalCeiling)
        );
        assert_eq!(g2.curr, 0);
        assert_eq!(
            ops.calls.lock().last(),
            Some(&(ThreadId(2), SchedClass::Normal))
        );
    }

    #[test]
    fn test_regrant_changes_priority_only() {
        let ceiling = SlotCounter::new(8);
        let ops = MockControl::default();
        let arb = SlotArbiter::new(&ceiling, &ops);
        let mut slots = RtSlots::default();
        let mut m = Member::new(ThreadId(1));

        arb.request(&mut slots, &mut m, 1, false);
        assert_eq!(arb.request(&mut slots, &mut m, 2, false), SlotDecision::Granted(2));
        assert_eq!(slots.curr, 1);
        assert_eq!(ceiling.count(), 1);
    }

    #[test]
    fn test_release_without_grant_is_noop() {
        let ceiling = SlotCounter::new(8);
        let ops = MockControl::default();
        let arb = SlotArbiter::new(&ceiling, &ops);
        let mut slots = RtSlots::default();
        let mut m = Member::new(ThreadId(1));

        assert!(!arb.release(&mut slots, &mut m));
        assert_eq!(ceiling.count(), 0);
        assert!(ops.calls.lock().is_empty());
    }

    #[test]
    fn test_release_exited_skips_primitive() {
        let ceiling = SlotCounter::new(8);
        let ops = MockControl::default();
        let arb = SlotArbiter::new(&ceiling, &ops);
        let mut slots = RtSlots::default();
        let mut m = Member::new(ThreadId(1));

        arb.request(&mut slots, &mut m, 1, false);
        ops.calls.lock().clear();
        assert!(arb.release_exited(&mut slots, &mut m));
        assert!(!arb.release_exited(&mut slots, &mut m));
        assert_eq!(slots.curr, 0);
        assert_eq!(ceiling.count(), 0);
        assert!(ops.calls.lock().is_empty());
    }

    #[test]
    fn test_counter_saturates_at_zero() {
        let c = SlotCounter::new(2);
        c.release();
        assert_eq!(c.count(), 0);
        assert!(c.try_acquire());
        assert!(c.try_acquire());
        assert!(!c.try_acquire());
        assert_eq!(c.count(), 2);
    }

    #[test]
    fn test_ceiling_under_contention() {
        let ceiling = Arc::new(SlotCounter::new(3));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ceiling = ceiling.clone();
                let peak = peak.clone();
                std::thread::spawn(move || {
                    for _ in 0..2_000 {
                        if ceiling.try_acquire() {
                            peak.fetch_max(ceiling.count(), Ordering::Relaxed);
                            ceiling.release();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(peak.load(Ordering::Relaxed) <= 3);
        assert_eq!(ceiling.count(), 0);
    }
}
