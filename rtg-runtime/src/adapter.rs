// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! # Scheduler Adapter Layer
//!
//! The engine never talks to the OS scheduler directly. Everything it needs
//! from the outside world goes through the traits in this module:
//!
//! - [`ThreadControl`]: switch a thread between time-shared and FIFO
//!   scheduling, and ask whether a thread still exists
//! - [`Topology`]: the CPU clusters, ascending by capacity
//! - [`FrequencySink`]: fire-and-forget frequency reconsideration requests
//! - [`Clock`]: the monotonic time base
//!
//! ## Adapter Implementations
//!
//! - `LinuxThreadControl`: `sched_setscheduler(2)` and `/proc` liveness
//! - `StaticTopology`: a fixed cluster table with mutable current frequency
//! - `NullFrequencySink` / `RecordingFrequencySink`
//! - `MonotonicClock` / `ManualClock`

use parking_lot::{Mutex, RwLock};
use rtg_common::{sched_priority, ThreadId, UpdateKind};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

// ============================================================================
// Thread control
// ============================================================================

/// Scheduling class requested for a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedClass {
    /// Time-shared (SCHED_OTHER)
    Normal,

    /// Fixed priority (SCHED_FIFO), engine priority `prio`
    Fifo { prio: u32 },
}

/// Priority-change primitive plus thread liveness
pub trait ThreadControl: Send + Sync {
    /// Move `tid` into `class`
    ///
    /// May fail (permissions, thread gone); the caller rolls back its own
    /// accounting on error.
    fn set_scheduling_class(&self, tid: ThreadId, class: SchedClass) -> io::Result<()>;

    /// Whether `tid` still refers to a live thread
    fn is_alive(&self, tid: ThreadId) -> bool;
}

/// [`ThreadControl`] backed by Linux syscalls
#[derive(Debug, Default)]
pub struct LinuxThreadControl;

impl ThreadControl for LinuxThreadControl {
    fn set_scheduling_class(&self, tid: ThreadId, class: SchedClass) -> io::Result<()> {
        let (policy, priority) = match class {
            SchedClass::Normal => (libc::SCHED_OTHER, 0),
            SchedClass::Fifo { prio } => {
                let priority = sched_priority(prio)
                    .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
                (libc::SCHED_FIFO | libc::SCHED_RESET_ON_FORK, priority as libc::c_int)
            }
        };
        let param = libc::sched_param {
            sched_priority: priority,
        };

        // SAFETY: `param` is a valid, initialized sched_param that outlives
        // the call; the kernel validates the pid.
        let ret = unsafe { libc::sched_setscheduler(tid.0 as libc::pid_t, policy, &param) };
        if ret == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn is_alive(&self, tid: ThreadId) -> bool {
        // Thread ids resolve under /proc even though they are not listed
        std::path::Path::new(&format!("/proc/{}", tid.0)).exists()
    }
}

// ============================================================================
// Topology
// ============================================================================

/// One frequency domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInfo {
    pub id: u32,

    /// Max compute capacity on the `[0, 1024]` scale
    pub capacity: u64,

    /// Current frequency (kHz)
    pub cur_freq: u64,

    /// Maximum frequency (kHz)
    pub max_freq: u64,

    /// CPUs in this cluster
    pub cpus: Vec<u32>,
}

impl ClusterInfo {
    /// First CPU, used as the target of frequency requests
    pub fn first_cpu(&self) -> Option<u32> {
        self.cpus.first().copied()
    }
}

/// Cluster topology provider
pub trait Topology: Send + Sync {
    /// Clusters in ascending capacity order
    fn clusters(&self) -> Arc<[ClusterInfo]>;
}

/// Fixed cluster table
///
/// Current frequencies can be updated to feed load scaling.
#[derive(Debug)]
pub struct StaticTopology {
    clusters: RwLock<Arc<[ClusterInfo]>>,
}

impl StaticTopology {
    /// Create from any ordering; clusters are sorted by capacity
    pub fn new(mut clusters: Vec<ClusterInfo>) -> Self {
        clusters.sort_by_key(|c| (c.capacity, c.id));
        Self {
            clusters: RwLock::new(clusters.into()),
        }
    }

    /// Single cluster of `num_cpus` at full capacity
    pub fn uniform(num_cpus: u32, max_freq: u64) -> Self {
        Self::new(vec![ClusterInfo {
            id: 0,
            capacity: rtg_common::config::SCHED_CAPACITY_SCALE,
            cur_freq: max_freq,
            max_freq,
            cpus: (0..num_cpus).collect(),
        }])
    }

    /// Record a new current frequency for `cluster`
    pub fn set_cur_freq(&self, cluster: u32, freq: u64) {
        let mut guard = self.clusters.write();
        let mut updated: Vec<ClusterInfo> = guard.to_vec();
        if let Some(c) = updated.iter_mut().find(|c| c.id == cluster) {
            c.cur_freq = freq.min(c.max_freq);
        }
        *guard = updated.into();
    }
}

impl Topology for StaticTopology {
    fn clusters(&self) -> Arc<[ClusterInfo]> {
        self.clusters.read().clone()
    }
}

// ============================================================================
// Frequency sink
// ============================================================================

/// Receiver of frequency reconsideration requests
pub trait FrequencySink: Send + Sync {
    /// Ask the governor to re-evaluate `cpu`; best effort, never blocks
    fn request_frequency_reconsideration(&self, cpu: u32, kind: UpdateKind);
}

/// Drops every request
#[derive(Debug, Default)]
pub struct NullFrequencySink;

impl FrequencySink for NullFrequencySink {
    fn request_frequency_reconsideration(&self, _cpu: u32, _kind: UpdateKind) {}
}

/// Keeps every request, for inspection
#[derive(Debug, Default)]
pub struct RecordingFrequencySink {
    requests: Mutex<Vec<(u32, UpdateKind)>>,
}

impl RecordingFrequencySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take all requests recorded so far
    pub fn drain(&self) -> Vec<(u32, UpdateKind)> {
        std::mem::take(&mut *self.requests.lock())
    }

    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FrequencySink for RecordingFrequencySink {
    fn request_frequency_reconsideration(&self, cpu: u32, kind: UpdateKind) {
        self.requests.lock().push((cpu, kind));
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Monotonic nanosecond time base
pub trait Clock: Send + Sync {
    fn now_ns(&self) -> u64;
}

/// Wall clock relative to construction
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Hand-driven clock
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ns: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ns),
        }
    }

    pub fn set(&self, now_ns: u64) {
        self.now.store(now_ns, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ns: u64) -> u64 {
        self.now.fetch_add(delta_ns, Ordering::SeqCst) + delta_ns
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_clusters() -> StaticTopology {
        StaticTopology::new(vec![
            ClusterInfo {
                id: 1,
                capacity: 1024,
                cur_freq: 2_000_000,
                max_freq: 2_800_000,
                cpus: vec![4, 5, 6, 7],
            },
            ClusterInfo {
                id: 0,
                capacity: 400,
                cur_freq: 1_000_000,
                max_freq: 1_800_000,
                cpus: vec![0, 1, 2, 3],
            },
        ])
    }

    #[test]
    fn test_topology_sorted_by_capacity() {
        let topo = two_clusters();
        let clusters = topo.clusters();
        assert_eq!(clusters[0].id, 0);
        assert_eq!(clusters[1].id, 1);
        assert_eq!(clusters[1].first_cpu(), Some(4));
    }

    #[test]
    fn test_topology_cur_freq_capped() {
        let topo = two_clusters();
        topo.set_cur_freq(0, 5_000_000);
        assert_eq!(topo.clusters()[0].cur_freq, 1_800_000);
    }

    #[test]
    fn test_recording_sink() {
        let sink = RecordingFrequencySink::new();
        sink.request_frequency_reconsideration(3, UpdateKind::Force);
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.drain(), vec![(3, UpdateKind::Force)]);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(10);
        assert_eq!(clock.advance(5), 15);
        clock.set(100);
        assert_eq!(clock.now_ns(), 100);
    }

    #[test]
    fn test_linux_liveness_of_self() {
        let me = ThreadId(std::process::id());
        assert!(LinuxThreadControl.is_alive(me));
    }

    #[test]
    fn test_linux_rejects_out_of_range_prio() {
        let me = ThreadId(std::process::id());
        let err = LinuxThreadControl
            .set_scheduling_class(me, SchedClass::Fifo { prio: 500 })
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
