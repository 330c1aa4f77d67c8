//! Prometheus metrics for the frame engine
//!
//! Every engine owns one [`EngineMetrics`]; `render` produces Prometheus
//! text format for whatever front end exports it.
//!
//! ## Metrics Exported
//!
//! - `rtg_frames_total{group, event}` - Frame boundaries and state changes
//! - `rtg_rt_slot_decisions_total{decision}` - RT slot grants and denials
//! - `rtg_cluster_switches_total` - Preferred cluster changes
//! - `rtg_freq_updates_total{kind}` - Frequency reconsideration requests
//! - `rtg_boost_pulses_total` - Boost pulses started
//! - `rtg_frame_util{group}` - Last published frame utilization

use parking_lot::RwLock;
use rtg_common::{GroupId, UpdateKind};
use std::collections::HashMap;
use std::fmt::Write;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

/// Frame events counted per group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameEvent {
    Start,
    End,
    Invalid,
    Skipped,
    ActivityStart,
    ActivityEnd,
}

impl FrameEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            FrameEvent::Start => "start",
            FrameEvent::End => "end",
            FrameEvent::Invalid => "invalid",
            FrameEvent::Skipped => "skipped",
            FrameEvent::ActivityStart => "activity_start",
            FrameEvent::ActivityEnd => "activity_end",
        }
    }
}

/// Metrics collector for one engine
#[derive(Default)]
pub struct EngineMetrics {
    /// Frame events per group
    frames: RwLock<HashMap<(u32, FrameEvent), AtomicU64>>,

    /// RT slot outcomes by label
    slot_decisions: RwLock<HashMap<&'static str, AtomicU64>>,

    /// Preferred cluster changes
    cluster_switches: AtomicU64,

    /// Frequency requests, normal and forced
    freq_normal: AtomicU64,
    freq_force: AtomicU64,

    /// Boost pulses started
    boost_pulses: AtomicU64,

    /// Last frame util per group
    frame_util: RwLock<HashMap<u32, AtomicU64>>,
}

/// Add `delta` to the counter under `key`
///
/// Only the first sample for a key takes the write lock.
fn bump<K: Eq + Hash>(map: &RwLock<HashMap<K, AtomicU64>>, key: K, delta: u64) {
    if let Some(counter) = map.read().get(&key) {
        counter.fetch_add(delta, Ordering::Relaxed);
        return;
    }
    map.write()
        .entry(key)
        .or_insert_with(|| AtomicU64::new(0))
        .fetch_add(delta, Ordering::Relaxed);
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_frame(&self, group: GroupId, event: FrameEvent) {
        bump(&self.frames, (group.0, event), 1);
    }

    pub fn record_slot_decision(&self, decision: &'static str) {
        bump(&self.slot_decisions, decision, 1);
    }

    pub fn record_cluster_switch(&self) {
        self.cluster_switches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_freq_update(&self, kind: UpdateKind) {
        match kind {
            UpdateKind::Normal => &self.freq_normal,
            UpdateKind::Force => &self.freq_force,
        }
        .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_boost_pulse(&self) {
        self.boost_pulses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_frame_util(&self, group: GroupId, util: u64) {
        if let Some(gauge) = self.frame_util.read().get(&group.0) {
            gauge.store(util, Ordering::Relaxed);
            return;
        }
        self.frame_util
            .write()
            .entry(group.0)
            .or_insert_with(|| AtomicU64::new(0))
            .store(util, Ordering::Relaxed);
    }

    /// Count of `event` for `group`
    pub fn frame_count(&self, group: GroupId, event: FrameEvent) -> u64 {
        self.frames
            .read()
            .get(&(group.0, event))
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Count of RT slot decisions with label `decision`
    pub fn slot_decision_count(&self, decision: &str) -> u64 {
        self.slot_decisions
            .read()
            .get(decision)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub fn boost_pulses(&self) -> u64 {
        self.boost_pulses.load(Ordering::Relaxed)
    }

    /// Render metrics in Prometheus text format
    pub fn render(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP rtg_frames_total Frame events by group and event\n");
        output.push_str("# TYPE rtg_frames_total counter\n");
        {
            let frames = self.frames.read();
            let mut keys: Vec<_> = frames.keys().copied().collect();
            keys.sort_by_key(|(group, event)| (*group, event.as_str()));
            for key in keys {
                if let Some(count) = frames.get(&key) {
                    let _ = writeln!(
                        output,
                        "rtg_frames_total{{group=\"{}\",event=\"{}\"}} {}",
                        key.0,
                        key.1.as_str(),
                        count.load(Ordering::Relaxed)
                    );
                }
            }
        }

        output.push_str("# HELP rtg_rt_slot_decisions_total RT slot requests by outcome\n");
        output.push_str("# TYPE rtg_rt_slot_decisions_total counter\n");
        {
            let decisions = self.slot_decisions.read();
            let mut keys: Vec<_> = decisions.keys().copied().collect();
            keys.sort_unstable();
            for key in keys {
                if let Some(count) = decisions.get(key) {
                    let _ = writeln!(
                        output,
                        "rtg_rt_slot_decisions_total{{decision=\"{}\"}} {}",
                        key,
                        count.load(Ordering::Relaxed)
                    );
                }
            }
        }

        output.push_str("# HELP rtg_cluster_switches_total Preferred cluster changes\n");
        output.push_str("# TYPE rtg_cluster_switches_total counter\n");
        let _ = writeln!(
            output,
            "rtg_cluster_switches_total {}",
            self.cluster_switches.load(Ordering::Relaxed)
        );

        output.push_str("# HELP rtg_freq_updates_total Frequency reconsideration requests\n");
        output.push_str("# TYPE rtg_freq_updates_total counter\n");
        let _ = writeln!(
            output,
            "rtg_freq_updates_total{{kind=\"normal\"}} {}",
            self.freq_normal.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            output,
            "rtg_freq_updates_total{{kind=\"force\"}} {}",
            self.freq_force.load(Ordering::Relaxed)
        );

        output.push_str("# HELP rtg_boost_pulses_total Boost pulses started\n");
        output.push_str("# TYPE rtg_boost_pulses_total counter\n");
        let _ = writeln!(output, "rtg_boost_pulses_total {}", self.boost_pulses());

        output.push_str("# HELP rtg_frame_util Last published frame utilization\n");
        output.push_str("# TYPE rtg_frame_util gauge\n");
        {
            let utils = self.frame_util.read();
            let mut groups: Vec<_> = utils.keys().copied().collect();
            groups.sort_unstable();
            for group in groups {
                if let Some(util) = utils.get(&group) {
                    let _ = writeln!(
                        output,
                        "rtg_frame_util{{group=\"{}\"}} {}",
                        group,
                        util.load(Ordering::Relaxed)
                    );
                }
            }
        }

        output
    }
}
