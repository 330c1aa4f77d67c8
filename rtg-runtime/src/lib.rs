//! # RTG Runtime
//!
//! Frame load tracking and virtual-deadline scheduling for related thread
//! groups.
//!
//! A frame group is a small set of threads (leader, render thread, a few
//! workers) that together produce frames at a target rate. The engine
//! watches their execution, ramps a "virtual load" as each frame approaches
//! its deadline, turns both into a clamped utilization target, and uses
//! that target to pick a CPU cluster and a frequency floor for the group.
//! Key threads can be promoted to fixed-priority scheduling within two
//! budgets: one per group and one for the whole process.
//!
//! ## Key Components
//!
//! - **FrameInfo**: per-group frame state machine and utilization math
//! - **SlotArbiter**: RT slot grants against the per-group and global budgets
//! - **GroupRegistry**: fixed pool of dynamically allocated frame groups
//! - **Placement**: preferred cluster and frequency floor selection
//! - **Engine**: the control plane, tick entry point and timers
//!
//! ## Usage
//!
//! ```rust,no_run
//! use rtg_runtime::{Builder, GroupId, FrameType};
//!
//! fn main() -> rtg_runtime::Result<()> {
//!     let engine = Builder::new().max_rt_threads(4).build()?;
//!
//!     engine.set_rate(GroupId::DEFAULT, 90)?;
//!     engine.begin_frame(GroupId::DEFAULT, FrameType::Frame0)?;
//!     // ... render ...
//!     engine.end_frame(GroupId::DEFAULT)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Collaborators
//!
//! The engine reaches the OS only through the traits in [`adapter`]:
//! thread scheduling class changes, the cluster topology, frequency
//! requests and the clock. Tests and simulations swap in
//! [`ManualClock`] and [`RecordingFrequencySink`].

pub mod adapter;
pub mod arbiter;
pub mod engine;
pub mod error;
pub mod frame;
pub mod group;
pub mod margin;
pub mod members;
pub mod metrics;
pub mod placement;
pub mod registry;
mod shared;
pub mod timer;
pub mod window;

pub use adapter::{
    Clock, ClusterInfo, FrequencySink, LinuxThreadControl, ManualClock, MonotonicClock,
    NullFrequencySink, RecordingFrequencySink, SchedClass, StaticTopology, ThreadControl,
    Topology,
};
pub use arbiter::{DenyReason, SlotDecision};
pub use engine::{
    AuxParams, Builder, ClusterDemand, Engine, EngineConfig, FrameSnapshot, GroupTarget,
    MemberSnapshot, MemberUpdate, TickSample,
};
pub use error::{Error, ErrorKind, Result};
pub use group::LoadMode;
pub use members::MemberRole;
pub use metrics::{EngineMetrics, FrameEvent};

/// Re-export common types
pub use rtg_common::{
    FrameStatus, FrameType, GroupId, RtgType, ThreadId, TimestampFlags, UpdateKind,
};
