//! Cluster placement and frequency floor
//!
//! Every time a group publishes a new normalized utilization the group's
//! preferred cluster is re-chosen and the governor is told which CPUs
//! should re-evaluate their frequency:
//!
//! - boosted group with global boost on: the biggest cluster, outright
//! - otherwise the smallest cluster whose capacity covers the util plus
//!   the capacity margin, falling back to the biggest
//!
//! A cluster change forces an update on the cluster the group left. The
//! new cluster is updated subject to the group's debounce interval.

use crate::adapter::ClusterInfo;
use rtg_common::config::{
    DEFAULT_CAPACITY_MARGIN, DEFAULT_FREQ_UPDATE_INTERVAL_MS, NSEC_PER_MSEC, SCHED_CAPACITY_SCALE,
};
use rtg_common::UpdateKind;
use tracing::trace;

/// Pick the preferred cluster for `util`
///
/// `clusters` must be in ascending capacity order.
pub fn best_cluster(
    clusters: &[ClusterInfo],
    util: u64,
    boosted: bool,
    global_boost: bool,
    capacity_margin: u64,
) -> Option<&ClusterInfo> {
    let max_cluster = clusters.iter().max_by_key(|c| c.capacity);
    if boosted && global_boost {
        return max_cluster;
    }

    let boosted_util = util * capacity_margin / SCHED_CAPACITY_SCALE;
    clusters
        .iter()
        .find(|c| boosted_util <= c.capacity)
        .or(max_cluster)
}

/// Frequency (kHz) at which `cluster` delivers `util` with 25% headroom
pub fn util_to_freq(cluster: &ClusterInfo, util: u64) -> u64 {
    if cluster.capacity == 0 {
        return cluster.max_freq;
    }
    let freq = (cluster.max_freq + (cluster.max_freq >> 2)) * util / cluster.capacity;
    freq.min(cluster.max_freq)
}

/// Result of publishing a new util for one group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlacementDecision {
    /// Preferred cluster after the update
    pub cluster: Option<u32>,

    /// Frequency floor requested for that cluster (kHz)
    pub min_freq: u64,

    /// CPU of the cluster the group left; needs a forced update
    pub prev_cpu: Option<u32>,

    /// CPU of the preferred cluster, when the debounce allows an update
    pub next_cpu: Option<u32>,

    /// Urgency for `next_cpu`
    pub kind: UpdateKind,
}

/// Per-group placement bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacementState {
    pub preferred_cluster: Option<u32>,
    pub normalized_util: u64,
    pub last_util_update_time: u64,
    pub last_freq_update_time: u64,

    /// Debounce for normal updates (ns)
    pub freq_update_interval: u64,

    /// Age after which the util is ignored (ns), `u64::MAX` = never
    pub util_invalid_interval: u64,

    /// Explicit frequency floor (kHz)
    pub min_freq: u64,

    /// Group asked for a performance boost
    pub boosted: bool,

    pub capacity_margin: u64,
}

impl Default for PlacementState {
    fn default() -> Self {
        Self {
            preferred_cluster: None,
            normalized_util: 0,
            last_util_update_time: 0,
            last_freq_update_time: 0,
            freq_update_interval: DEFAULT_FREQ_UPDATE_INTERVAL_MS * NSEC_PER_MSEC,
            util_invalid_interval: u64::MAX,
            min_freq: 0,
            boosted: false,
            capacity_margin: DEFAULT_CAPACITY_MARGIN,
        }
    }
}

impl PlacementState {
    /// Debounce gate for frequency requests
    pub fn should_update(&self, kind: UpdateKind, now: u64) -> bool {
        match kind {
            UpdateKind::Force => true,
            UpdateKind::Normal => {
                now.saturating_sub(self.last_freq_update_time) >= self.freq_update_interval
            }
        }
    }

    /// Whether the published util is too old to trust
    pub fn is_util_stale(&self, now: u64) -> bool {
        self.util_invalid_interval != u64::MAX
            && now.saturating_sub(self.last_freq_update_time) >= self.util_invalid_interval
    }

    /// Publish `util` and re-choose the preferred cluster
    pub fn update_util(
        &mut self,
        util: u64,
        kind: UpdateKind,
        now: u64,
        clusters: &[ClusterInfo],
        global_boost: bool,
    ) -> PlacementDecision {
        self.normalized_util = util;

        let best = best_cluster(clusters, util, self.boosted, global_boost, self.capacity_margin);
        let mut decision = PlacementDecision {
            kind,
            ..PlacementDecision::default()
        };

        match (self.preferred_cluster, best) {
            (None, Some(new)) => self.preferred_cluster = Some(new.id),
            (Some(old), Some(new)) if old != new.id => {
                decision.prev_cpu = clusters
                    .iter()
                    .find(|c| c.id == old)
                    .and_then(ClusterInfo::first_cpu);
                self.preferred_cluster = Some(new.id);
                trace!(from = old, to = new.id, "preferred_cluster");
            }
            _ => {}
        }

        let preferred = self
            .preferred_cluster
            .and_then(|id| clusters.iter().find(|c| c.id == id));

        self.last_util_update_time = now;
        if self.should_update(kind, now) {
            self.last_freq_update_time = now;
            decision.next_cpu = Some(preferred.and_then(ClusterInfo::first_cpu).unwrap_or(0));
        }

        decision.cluster = self.preferred_cluster;
        decision.min_freq = preferred
            .map(|c| util_to_freq(c, util).max(self.min_freq))
            .unwrap_or(self.min_freq);
        decision
    }

    /// Forget the preferred cluster and util
    pub fn clear(&mut self) {
        self.preferred_cluster = None;
        self.normalized_util = 0;
    }

    /// Back to defaults, keeping nothing from the previous tenant
    pub fn reset(&mut self, freq_update_interval: u64, util_invalid_interval: u64, capacity_margin: u64) {
        *self = Self {
            freq_update_interval,
            util_invalid_interval,
            capacity_margin,
            ..Self::default()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = NSEC_PER_MSEC;

    fn clusters() -> Vec<ClusterInfo> {
        vec![
            ClusterInfo {
                id: 0,
                capacity: 400,
                cur_freq: 1_000_000,
                max_freq: 1_800_000,
                cpus: vec![0, 1, 2, 3],
            },
            ClusterInfo {
                id: 1,
                capacity: 800,
                cur_freq: 1_500_000,
                max_freq: 2_400_000,
                cpus: vec![4, 5, 6],
            },
            ClusterInfo {
                id: 2,
                capacity: 1024,
                cur_freq: 2_000_000,
                max_freq: 3_000_000,
                cpus: vec![7],
            },
        ]
    }

    #[test]
    fn test_best_cluster_smallest_fit() {
        let c = clusters();
        let pick = |util| best_cluster(&c, util, false, true, DEFAULT_CAPACITY_MARGIN).map(|c| c.id);
        assert_eq!(pick(0), Some(0));
        assert_eq!(pick(380), Some(0));
        // 5% margin pushes 390 past 400
        assert_eq!(pick(390), Some(1));
        assert_eq!(pick(900), Some(2));
        assert_eq!(pick(1024), Some(2));
    }

    #[test]
    fn test_best_cluster_boost() {
        let c = clusters();
        assert_eq!(best_cluster(&c, 10, true, true, 1024).map(|c| c.id), Some(2));
        assert_eq!(best_cluster(&c, 10, true, false, 1024).map(|c| c.id), Some(0));
        assert!(best_cluster(&[], 10, false, true, 1024).is_none());
    }

    #[test]
    fn test_util_to_freq() {
        let c = &clusters()[0];
        assert_eq!(util_to_freq(c, 0), 0);
        assert_eq!(util_to_freq(c, 200), 1_125_000);
        assert_eq!(util_to_freq(c, 400), 1_800_000);
    }

    #[test]
    fn test_debounce() {
        let mut p = PlacementState::default();
        p.last_freq_update_time = 10 * MS;
        assert!(!p.should_update(UpdateKind::Normal, 17 * MS));
        assert!(p.should_update(UpdateKind::Normal, 18 * MS));
        assert!(p.should_update(UpdateKind::Force, 10 * MS));
    }

    #[test]
    fn test_cluster_change_forces_previous() {
        let c = clusters();
        let mut p = PlacementState::default();

        let first = p.update_util(100, UpdateKind::Force, 0, &c, true);
        assert_eq!(first.cluster, Some(0));
        assert_eq!(first.prev_cpu, None);
        assert_eq!(first.next_cpu, Some(0));

        let second = p.update_util(700, UpdateKind::Normal, MS, &c, true);
        assert_eq!(second.cluster, Some(1));
        assert_eq!(second.prev_cpu, Some(0));
        // Inside the debounce window
        assert_eq!(second.next_cpu, None);

        let third = p.update_util(700, UpdateKind::Normal, 9 * MS, &c, true);
        assert_eq!(third.prev_cpu, None);
        assert_eq!(third.next_cpu, Some(4));
    }

    #[test]
    fn test_min_freq_floor() {
        let c = clusters();
        let mut p = PlacementState {
            min_freq: 1_500_000,
            ..PlacementState::default()
        };
        let d = p.update_util(40, UpdateKind::Force, 0, &c, true);
        assert_eq!(d.min_freq, 1_500_000);

        p.min_freq = 0;
        let d = p.update_util(40, UpdateKind::Force, 0, &c, true);
        assert_eq!(d.min_freq, 225_000);
    }

    #[test]
    fn test_util_staleness() {
        let mut p = PlacementState::default();
        assert!(!p.is_util_stale(u64::MAX));

        p.util_invalid_interval = 50 * MS;
        p.last_freq_update_time = 100 * MS;
        assert!(!p.is_util_stale(120 * MS));
        assert!(p.is_util_stale(150 * MS));
    }
}
