// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! # rtg-common
//!
//! Shared identifiers, enums and constants for the RTG (Related Thread
//! Group) frame engine.
//!
//! Everything here is plain data so that control-plane front ends (CLI,
//! async integrations, benches) can speak the engine's vocabulary without
//! pulling in the engine itself.
//!
//! ## Scales
//!
//! - **Utilization** is fixed point on `[0, 1024]` (`SCHED_CAPACITY_SCALE`).
//! - **Time** is nanoseconds unless a name says otherwise (`_ms`).
//! - **Frequency** is kHz.

#![no_std]

use core::fmt;

use bitflags::bitflags;

// ============================================================================
// Identifiers
// ============================================================================

/// Frame group identifier
///
/// The default frame group and the auxiliary group have fixed ids; dynamic
/// groups are handed out from [`config::MULTI_FRAME_ID`] upwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u32);

impl GroupId {
    /// The always-present default frame group
    pub const DEFAULT: GroupId = GroupId(config::DEFAULT_RT_FRAME_ID);

    /// The always-present auxiliary group
    pub const AUX: GroupId = GroupId(config::DEFAULT_AUX_ID);

    /// Whether this id falls into the dynamic pool range
    #[inline]
    pub fn is_dynamic(self) -> bool {
        self.0 >= config::MULTI_FRAME_ID && self.0 < config::MULTI_FRAME_ID + config::MULTI_FRAME_NUM
    }

    /// Slot index inside the dynamic pool
    #[inline]
    pub fn pool_index(self) -> Option<usize> {
        self.is_dynamic()
            .then(|| (self.0 - config::MULTI_FRAME_ID) as usize)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque OS thread identifier
///
/// The engine never owns the thread behind it; liveness is always asked of
/// the external scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u32);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Frame Status
// ============================================================================

/// Frame lifecycle state
///
/// ```text
///            START (timestamp)
///   END ─────────────────────────▶ START ──┐
///    ▲                              │  ▲   │ START (window rollover)
///    │ END (timestamp)              │  └───┘
///    └──────────────────────────────┤
///                                   │ tick: stale window
///   INVALID ◀───────────────────────┘
/// ```
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameStatus {
    /// Frame open, deadline clock running
    Start = 1 << 0,

    /// Frame closed, no deadline pressure
    #[default]
    End = 1 << 1,

    /// Window judged stale by the tick path
    Invalid = 1 << 2,
}

impl FrameStatus {
    /// Whether the deadline clock is running
    #[inline]
    pub fn is_open(self) -> bool {
        matches!(self, FrameStatus::Start)
    }
}

impl TryFrom<u32> for FrameStatus {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FrameStatus::Start),
            2 => Ok(FrameStatus::End),
            4 => Ok(FrameStatus::Invalid),
            _ => Err(()),
        }
    }
}

// ============================================================================
// Timestamp Flags
// ============================================================================

bitflags! {
    /// Flags carried by a frame timestamp
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TimestampFlags: u32 {
        /// Frame boundary opened
        const START = 1 << 0;
        /// Frame boundary closed
        const END = 1 << 1;
        /// Compute virtual load immediately at timeline 0
        const USE_MARGIN_IMME = 1 << 4;
        /// Latch: ignore plain timestamps until `SKIP_END`
        const SKIP_START = 1 << 5;
        /// Release the `SKIP_START` latch
        const SKIP_END = 1 << 6;
    }
}

impl TimestampFlags {
    /// The single status this timestamp requests, if well formed
    pub fn status(self) -> Option<FrameStatus> {
        match (self.contains(Self::START), self.contains(Self::END)) {
            (true, false) => Some(FrameStatus::Start),
            (false, true) => Some(FrameStatus::End),
            _ => None,
        }
    }
}

// ============================================================================
// Group Priority Type
// ============================================================================

/// Priority class requested for a frame group's threads
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RtgType {
    /// Highest RT class
    Vip = 0,

    /// Key threads of the top application
    TopTask = 1,

    /// Time-shared only, never elevated
    #[default]
    NormalTask = 2,
}

impl RtgType {
    /// Engine-level RT priority for this class, `None` for time-shared
    #[inline]
    pub fn rt_prio(self) -> Option<u32> {
        match self {
            RtgType::NormalTask => None,
            other => Some(other as u32 + config::DEFAULT_RT_PRIO),
        }
    }
}

impl TryFrom<u32> for RtgType {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(RtgType::Vip),
            1 => Ok(RtgType::TopTask),
            2 => Ok(RtgType::NormalTask),
            _ => Err(()),
        }
    }
}

/// Map an engine RT priority onto the OS `sched_priority` for SCHED_FIFO
///
/// Returns `None` when the priority lies outside the user RT range.
#[inline]
pub fn sched_priority(prio: u32) -> Option<u32> {
    (prio < config::MAX_USER_RT_PRIO).then(|| config::MAX_USER_RT_PRIO - 1 - prio)
}

// ============================================================================
// Frame Types
// ============================================================================

/// Kind of boundary a caller announces with `begin_frame`
///
/// Each kind carries its own vload margin per frame rate.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Activity = 0,
    Frame0 = 1,
    Frame1 = 2,
    Frame2 = 3,
    Click = 4,
    Video0 = 5,
    Video1 = 6,
    Video2 = 7,
    Video3 = 8,
}

impl FrameType {
    /// Number of frame types
    pub const COUNT: usize = 9;

    /// All frame types, in index order
    pub const ALL: [FrameType; Self::COUNT] = [
        FrameType::Activity,
        FrameType::Frame0,
        FrameType::Frame1,
        FrameType::Frame2,
        FrameType::Click,
        FrameType::Video0,
        FrameType::Video1,
        FrameType::Video2,
        FrameType::Video3,
    ];

    /// Table index
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Stable lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            FrameType::Activity => "activity",
            FrameType::Frame0 => "frame0",
            FrameType::Frame1 => "frame1",
            FrameType::Frame2 => "frame2",
            FrameType::Click => "click",
            FrameType::Video0 => "video0",
            FrameType::Video1 => "video1",
            FrameType::Video2 => "video2",
            FrameType::Video3 => "video3",
        }
    }
}

impl TryFrom<u32> for FrameType {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        FrameType::ALL.get(value as usize).copied().ok_or(())
    }
}

impl TryFrom<&str> for FrameType {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        FrameType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(value))
            .ok_or(())
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Frequency Update Kind
// ============================================================================

/// Urgency of a frequency reconsideration request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateKind {
    /// Subject to the per-group debounce interval
    #[default]
    Normal,

    /// Bypasses the debounce interval
    Force,
}

// ============================================================================
// Configuration Constants
// ============================================================================

/// Engine-wide constants
pub mod config {
    /// Fixed-point utilization scale
    pub const SCHED_CAPACITY_SCALE: u64 = 1024;

    /// Shift matching [`SCHED_CAPACITY_SCALE`]
    pub const SCHED_CAPACITY_SHIFT: u32 = 10;

    /// Id of the auxiliary group
    pub const DEFAULT_AUX_ID: u32 = 2;

    /// Id of the default frame group
    pub const DEFAULT_RT_FRAME_ID: u32 = 8;

    /// First id of the dynamic frame group pool
    pub const MULTI_FRAME_ID: u32 = 9;

    /// Size of the dynamic frame group pool
    pub const MULTI_FRAME_NUM: u32 = 5;

    /// Worker thread slots per frame group
    pub const MAX_TID_NUM: usize = 5;

    /// CFS-only thread slots per frame group
    pub const MAX_FRAME_CFS_THREADS: usize = 3;

    /// Threads the auxiliary group may hold
    pub const MAX_AUX_THREADS: usize = 8;

    /// Default per-group RT slot budget
    pub const DEFAULT_MAX_RT_THREAD: usize = 2;

    /// Upper bound for a per-group RT slot budget
    pub const MAX_RT_THREAD: usize = MAX_TID_NUM + 2;

    /// Default number of dynamic groups allowed to run RT threads
    pub const DEFAULT_MAX_RT_FRAMES: usize = 3;

    /// Exclusive upper bound of user RT priorities
    pub const MAX_USER_RT_PRIO: u32 = 100;

    /// Offset added to an `RtgType` to form its RT priority
    pub const DEFAULT_RT_PRIO: u32 = 1;

    /// Default target frame rate
    pub const DEFAULT_FRAME_RATE: u32 = 60;

    /// Lowest accepted frame rate
    pub const MIN_FRAME_RATE: u32 = 1;

    /// Highest accepted frame rate
    pub const MAX_FRAME_RATE: u32 = 120;

    /// Default vload margin (ms)
    pub const DEFAULT_VLOAD_MARGIN: i32 = 16;

    /// Lowest accepted vload margin (ms)
    pub const MIN_VLOAD_MARGIN: i32 = -100;

    /// Highest accepted vload margin (ms)
    pub const MAX_VLOAD_MARGIN: i32 = 100;

    /// Saturation value of the virtual load
    pub const FRAME_MAX_VLOAD: u64 = SCHED_CAPACITY_SCALE;

    /// Saturation value of frame utilization
    pub const FRAME_MAX_LOAD: u64 = SCHED_CAPACITY_SCALE;

    /// Exec must exceed `timeline / FACTOR` for a frame to stay valid
    pub const FRAME_UTIL_INVALID_FACTOR: u64 = 4;

    /// Default frequency update debounce (ms)
    pub const DEFAULT_FREQ_UPDATE_INTERVAL_MS: u64 = 8;

    /// Accepted frequency update debounce range (ms)
    pub const MIN_FREQ_CYCLE_MS: u64 = 1;
    pub const MAX_FREQ_CYCLE_MS: u64 = 16;

    /// Default staleness threshold for the INVALID detector (ms)
    pub const DEFAULT_INVALID_INTERVAL_MS: u64 = 50;

    /// Native scheduler tick period (ms)
    pub const DEFAULT_TICK_PERIOD_MS: u64 = 4;

    /// Capacity margin applied to group util during cluster selection (~5%)
    pub const DEFAULT_CAPACITY_MARGIN: u64 = 1077;

    /// Longest accepted boost pulse (ms)
    pub const MAX_BOOST_DURATION_MS: u64 = 1000;

    /// Nanoseconds per millisecond
    pub const NSEC_PER_MSEC: u64 = 1_000_000;

    /// Nanoseconds per second
    pub const NSEC_PER_SEC: u64 = 1_000_000_000;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_id_pool_range() {
        assert!(!GroupId::DEFAULT.is_dynamic());
        assert!(!GroupId::AUX.is_dynamic());
        assert_eq!(GroupId(9).pool_index(), Some(0));
        assert_eq!(GroupId(13).pool_index(), Some(4));
        assert_eq!(GroupId(14).pool_index(), None);
    }

    #[test]
    fn test_frame_status_values() {
        assert_eq!(FrameStatus::try_from(1), Ok(FrameStatus::Start));
        assert_eq!(FrameStatus::try_from(4), Ok(FrameStatus::Invalid));
        assert_eq!(FrameStatus::try_from(3), Err(()));
        assert_eq!(FrameStatus::default(), FrameStatus::End);
        assert!(FrameStatus::Start.is_open());
        assert!(!FrameStatus::Invalid.is_open());
    }

    #[test]
    fn test_timestamp_status() {
        assert_eq!(TimestampFlags::START.status(), Some(FrameStatus::Start));
        assert_eq!(
            (TimestampFlags::END | TimestampFlags::SKIP_END).status(),
            Some(FrameStatus::End)
        );
        assert_eq!((TimestampFlags::START | TimestampFlags::END).status(), None);
        assert_eq!(TimestampFlags::SKIP_START.status(), None);
    }

    #[test]
    fn test_rt_prio_mapping() {
        assert_eq!(RtgType::Vip.rt_prio(), Some(1));
        assert_eq!(RtgType::TopTask.rt_prio(), Some(2));
        assert_eq!(RtgType::NormalTask.rt_prio(), None);

        assert_eq!(sched_priority(1), Some(98));
        assert_eq!(sched_priority(99), Some(0));
        assert_eq!(sched_priority(100), None);
    }

    #[test]
    fn test_frame_type_names() {
        for ty in FrameType::ALL {
            assert_eq!(FrameType::try_from(ty.as_str()), Ok(ty));
            assert_eq!(FrameType::try_from(ty as u32), Ok(ty));
        }
        assert_eq!(FrameType::try_from("CLICK"), Ok(FrameType::Click));
        assert_eq!(FrameType::try_from("scroll"), Err(()));
    }

    #[test]
    fn test_config_relations() {
        assert_eq!(1u64 << config::SCHED_CAPACITY_SHIFT, config::SCHED_CAPACITY_SCALE);
        assert!(config::DEFAULT_MAX_RT_THREAD <= config::MAX_RT_THREAD);
        assert!(config::MIN_VLOAD_MARGIN == -config::MAX_VLOAD_MARGIN);
        assert!(config::DEFAULT_FREQ_UPDATE_INTERVAL_MS <= config::MAX_FREQ_CYCLE_MS);
        assert!(config::DEFAULT_AUX_ID < config::DEFAULT_RT_FRAME_ID);
        assert!(config::DEFAULT_RT_FRAME_ID < config::MULTI_FRAME_ID);
    }
}
