//! Frame state machine
//!
//! [`FrameInfo`] tracks one frame group's deadline: the window accounting,
//! the virtual load ramp and the clamped utilization target derived from
//! both. It is plain data; the owning group's write lock serializes every
//! mutation.
//!
//! ## Utilization
//!
//! ```text
//! frame_util = clamp(max(prev_util, frame_vload), frame_min_util, frame_max_util)
//! frame_util = max(frame_util, min(boost_min_util, frame_max_util))
//! ```

use crate::error::{Error, Result};
use crate::window::FrameWindow;
use rtg_common::config::{
    DEFAULT_FRAME_RATE, DEFAULT_VLOAD_MARGIN, FRAME_MAX_LOAD, FRAME_MAX_VLOAD,
    FRAME_UTIL_INVALID_FACTOR, MAX_FRAME_RATE, MAX_VLOAD_MARGIN, MIN_FRAME_RATE,
    MIN_VLOAD_MARGIN, NSEC_PER_MSEC, NSEC_PER_SEC, SCHED_CAPACITY_SCALE, SCHED_CAPACITY_SHIFT,
};
use rtg_common::{FrameStatus, TimestampFlags};
use tracing::trace;

/// Tunables a frame starts from, and returns to on reset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameParams {
    pub rate: u32,
    pub margin: i32,
    pub max_util: u64,
}

impl Default for FrameParams {
    fn default() -> Self {
        Self {
            rate: DEFAULT_FRAME_RATE,
            margin: DEFAULT_VLOAD_MARGIN,
            max_util: SCHED_CAPACITY_SCALE,
        }
    }
}

/// Deadline ramp on `[0, FRAME_MAX_VLOAD]`
///
/// `vtime` and `max_time` are milliseconds. Zero at the frame start,
/// exactly `FRAME_MAX_VLOAD` at `max_time`, saturated beyond it.
pub fn virtual_load(vtime: i64, max_time: i64) -> u64 {
    let ceiling = FRAME_MAX_VLOAD as i64;

    if max_time <= 0 || vtime > max_time {
        return FRAME_MAX_VLOAD;
    }
    if vtime <= 0 {
        return 0;
    }

    // vtime^2 - vtime * max_time + FRAME_MAX_VLOAD * vtime / max_time
    let load = vtime * (vtime - max_time) + ceiling * vtime / max_time;
    load.clamp(0, ceiling) as u64
}

#[inline]
fn clamp_util(util: u64, min: u64, max: u64) -> u64 {
    util.max(min).min(max)
}

/// Per-group frame tracking state
#[derive(Debug, Clone)]
pub struct FrameInfo {
    window: FrameWindow,
    status: FrameStatus,

    qos_frame: u32,
    qos_frame_time: u64,
    vload_margin: i32,
    max_vload_time: i64,

    frame_vload: u64,
    frame_util: u64,
    frame_min_util: u64,
    frame_max_util: u64,
    prev_min_util: u64,
    prev_max_util: u64,
    frame_boost_min_util: u64,

    prev_frame_load: u64,
    prev_frame_exec: u64,
    prev_frame_time: u64,
    prev_frame_load_util: u64,
    prev_fake_load_util: u64,

    margin_imme: bool,
    timestamp_skipped: bool,

    /// Times the staleness detector fired
    invalidations: u64,
}

impl FrameInfo {
    /// Create a frame in the END state with a window opened at `now`
    pub fn new(params: FrameParams, now: u64) -> Self {
        let mut frame = Self {
            window: FrameWindow::default(),
            status: FrameStatus::End,
            qos_frame: DEFAULT_FRAME_RATE,
            qos_frame_time: NSEC_PER_SEC / DEFAULT_FRAME_RATE as u64,
            vload_margin: DEFAULT_VLOAD_MARGIN,
            max_vload_time: 0,
            frame_vload: 0,
            frame_util: 0,
            frame_min_util: 0,
            frame_max_util: SCHED_CAPACITY_SCALE,
            prev_min_util: 0,
            prev_max_util: SCHED_CAPACITY_SCALE,
            frame_boost_min_util: 0,
            prev_frame_load: 0,
            prev_frame_exec: 0,
            prev_frame_time: 0,
            prev_frame_load_util: 0,
            prev_fake_load_util: 0,
            margin_imme: false,
            timestamp_skipped: false,
            invalidations: 0,
        };
        frame.reset(params, now);
        frame
    }

    /// Return every field to its initial value
    ///
    /// Out-of-range params fall back to the compiled defaults.
    pub fn reset(&mut self, params: FrameParams, now: u64) {
        let defaults = FrameParams::default();
        let rate = if (MIN_FRAME_RATE..=MAX_FRAME_RATE).contains(&params.rate) {
            params.rate
        } else {
            defaults.rate
        };
        let margin = if (MIN_VLOAD_MARGIN..=MAX_VLOAD_MARGIN).contains(&params.margin) {
            params.margin
        } else {
            defaults.margin
        };

        self.window.reset(now);
        self.status = FrameStatus::End;
        self.qos_frame = rate;
        self.qos_frame_time = NSEC_PER_SEC / rate as u64;
        self.vload_margin = margin;
        self.update_max_vload_time();
        self.frame_vload = 0;
        self.frame_util = 0;
        self.frame_min_util = 0;
        self.frame_max_util = params.max_util.min(SCHED_CAPACITY_SCALE);
        self.prev_min_util = 0;
        self.prev_max_util = SCHED_CAPACITY_SCALE;
        self.frame_boost_min_util = 0;
        self.prev_frame_load = 0;
        self.prev_frame_exec = 0;
        self.prev_frame_time = 0;
        self.prev_frame_load_util = 0;
        self.prev_fake_load_util = 0;
        self.margin_imme = false;
        self.timestamp_skipped = false;
        self.invalidations = 0;
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn status(&self) -> FrameStatus {
        self.status
    }

    pub fn rate(&self) -> u32 {
        self.qos_frame
    }

    /// Frame period (ns)
    pub fn qos_frame_time(&self) -> u64 {
        self.qos_frame_time
    }

    pub fn margin(&self) -> i32 {
        self.vload_margin
    }

    /// Deadline of the virtual load ramp (ms)
    pub fn max_vload_time(&self) -> i64 {
        self.max_vload_time
    }

    pub fn frame_vload(&self) -> u64 {
        self.frame_vload
    }

    pub fn frame_util(&self) -> u64 {
        self.frame_util
    }

    pub fn frame_min_util(&self) -> u64 {
        self.frame_min_util
    }

    pub fn frame_max_util(&self) -> u64 {
        self.frame_max_util
    }

    pub fn boost_min_util(&self) -> u64 {
        self.frame_boost_min_util
    }

    pub fn prev_frame_load_util(&self) -> u64 {
        self.prev_frame_load_util
    }

    pub fn prev_fake_load_util(&self) -> u64 {
        self.prev_fake_load_util
    }

    pub fn timestamp_skipped(&self) -> bool {
        self.timestamp_skipped
    }

    /// Number of frames the tick path declared stale
    pub fn invalid_count(&self) -> u64 {
        self.invalidations
    }

    pub fn window(&self) -> &FrameWindow {
        &self.window
    }

    pub fn window_mut(&mut self) -> &mut FrameWindow {
        &mut self.window
    }

    // ------------------------------------------------------------------
    // Tunables
    // ------------------------------------------------------------------

    fn update_max_vload_time(&mut self) {
        self.max_vload_time = (self.qos_frame_time / NSEC_PER_MSEC) as i64 + self.vload_margin as i64;
    }

    /// Set the target frame rate, `1..=120`
    pub fn set_rate(&mut self, rate: u32) -> Result<()> {
        if !(MIN_FRAME_RATE..=MAX_FRAME_RATE).contains(&rate) {
            return Err(Error::InvalidArgument("frame rate out of range"));
        }
        self.qos_frame = rate;
        self.qos_frame_time = NSEC_PER_SEC / rate as u64;
        self.update_max_vload_time();
        trace!(rate, max_vload_time = self.max_vload_time, "FRAME_QOS");
        Ok(())
    }

    /// Set the deadline margin (ms), `-100..=100`
    pub fn set_margin(&mut self, margin: i32) -> Result<()> {
        if !(MIN_VLOAD_MARGIN..=MAX_VLOAD_MARGIN).contains(&margin) {
            return Err(Error::InvalidArgument("vload margin out of range"));
        }
        self.vload_margin = margin;
        self.update_max_vload_time();
        trace!(margin, max_vload_time = self.max_vload_time, "FRAME_MARGIN");
        Ok(())
    }

    /// Set the utilization ceiling
    ///
    /// A floor above the new ceiling is pulled down to it.
    pub fn set_max_util(&mut self, max_util: u64) -> Result<()> {
        if max_util > SCHED_CAPACITY_SCALE {
            return Err(Error::InvalidArgument("max util out of range"));
        }
        self.frame_max_util = max_util;
        self.frame_min_util = self.frame_min_util.min(max_util);
        self.frame_util = clamp_util(self.frame_util, self.frame_min_util, self.frame_max_util);
        trace!(max_util, "FRAME_MAX_UTIL");
        Ok(())
    }

    /// Set the utilization floor and recompute the target
    ///
    /// Returns the new `frame_util`.
    pub fn set_min_util(&mut self, min_util: u64) -> Result<u64> {
        if min_util > SCHED_CAPACITY_SCALE {
            return Err(Error::InvalidArgument("min util out of range"));
        }
        if min_util > self.frame_max_util {
            return Err(Error::InvalidArgument("min util above max util"));
        }
        self.frame_min_util = min_util;
        self.frame_util = self.calc_frame_util(false);
        self.apply_boost();
        trace!(min_util, frame_util = self.frame_util, "FRAME_MIN_UTIL");
        Ok(self.frame_util)
    }

    /// Set the boost-pulse floor
    pub fn set_boost_min_util(&mut self, min_util: u64) -> Result<()> {
        if min_util > SCHED_CAPACITY_SCALE {
            return Err(Error::InvalidArgument("boost util out of range"));
        }
        self.frame_boost_min_util = min_util;
        self.apply_boost();
        trace!(min_util, frame_util = self.frame_util, "FRAME_BOOST_MIN_UTIL");
        Ok(())
    }

    /// Drop the boost-pulse floor and return the recomputed `frame_util`
    pub fn clear_boost_min_util(&mut self) -> u64 {
        self.frame_boost_min_util = 0;
        self.frame_util = self.calc_frame_util(self.status != FrameStatus::Start);
        trace!(frame_util = self.frame_util, "FRAME_BOOST_MIN_UTIL cleared");
        self.frame_util
    }

    /// Clear the window and util history when tracking is switched on
    pub fn enable_tracking(&mut self) {
        self.prev_fake_load_util = 0;
        self.prev_frame_load_util = 0;
        self.frame_vload = 0;
        self.window.load.curr_window_load = 0;
    }

    /// Close the frame when tracking is switched off
    pub fn disable_tracking(&mut self) {
        self.status = FrameStatus::End;
        self.frame_vload = 0;
        self.frame_util = clamp_util(0, self.frame_min_util, self.frame_max_util);
        self.timestamp_skipped = false;
    }

    // ------------------------------------------------------------------
    // Load math
    // ------------------------------------------------------------------

    /// Virtual load for a point `timeline` ns into the window
    pub fn calc_vload(&self, timeline: u64) -> u64 {
        virtual_load((timeline / NSEC_PER_MSEC) as i64, self.max_vload_time)
    }

    fn calc_frame_exec(&self) -> u64 {
        if self.qos_frame_time == 0 {
            return 0;
        }
        (self.window.load.curr_window_exec << SCHED_CAPACITY_SHIFT) / self.qos_frame_time
    }

    fn calc_frame_util(&self, fake: bool) -> u64 {
        let prev = if fake {
            self.prev_fake_load_util
        } else {
            self.prev_frame_load_util
        };
        clamp_util(prev.max(self.frame_vload), self.frame_min_util, self.frame_max_util)
    }

    fn calc_prev_frame_load_util(&self) -> u64 {
        let util = if self.prev_frame_load >= self.qos_frame_time {
            FRAME_MAX_LOAD
        } else {
            (self.prev_frame_load << SCHED_CAPACITY_SHIFT) / self.qos_frame_time
        };
        clamp_util(util, self.prev_min_util, self.prev_max_util)
    }

    fn calc_prev_fake_load_util(&self) -> u64 {
        let frame_time = self.prev_frame_time.max(self.qos_frame_time);
        let util = if frame_time > 0 {
            (self.prev_frame_load << SCHED_CAPACITY_SHIFT) / frame_time
        } else {
            0
        };
        clamp_util(util, self.prev_min_util, self.prev_max_util)
    }

    fn update_frame_prev_load(&mut self, fake: bool) {
        self.prev_frame_exec = self.window.load.prev_window_exec;
        self.prev_frame_time = self.window.prev_window_time;
        self.prev_frame_load = self.window.load.prev_window_load;

        if fake {
            self.prev_fake_load_util = self.calc_prev_fake_load_util();
        } else {
            self.prev_frame_load_util = self.calc_prev_frame_load_util();
        }
        trace!(
            prev_frame_exec = self.prev_frame_exec,
            prev_frame_time = self.prev_frame_time,
            prev_frame_load = self.prev_frame_load,
            fake,
            "frame_last_load"
        );
    }

    fn apply_boost(&mut self) {
        let floor = self.frame_boost_min_util.min(self.frame_max_util);
        if self.frame_util < floor {
            self.frame_util = floor;
        }
    }

    fn is_util_invalid(&self, timeline: u64, invalid_interval: u64) -> bool {
        invalid_interval <= timeline
            && self
                .window
                .load
                .curr_window_exec
                .saturating_mul(FRAME_UTIL_INVALID_FACTOR)
                <= timeline
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    fn set_frame_start(&mut self) {
        match self.status {
            // The previous frame ends where this one starts
            FrameStatus::Start => self.update_frame_prev_load(false),
            // [END, START] is not a real frame window
            FrameStatus::End | FrameStatus::Invalid => {
                self.update_frame_prev_load(true);
                self.status = FrameStatus::Start;
            }
        }

        if self.margin_imme {
            self.frame_vload = self.calc_vload(0);
            self.frame_util = self.calc_frame_util(false);
        } else {
            self.frame_vload = 0;
            self.frame_util = clamp_util(
                self.prev_frame_load_util,
                self.frame_min_util,
                self.frame_max_util,
            );
        }
        trace!(status = ?self.status, frame_vload = self.frame_vload, "FRAME_STATUS");
    }

    fn do_frame_end(&mut self, fake: bool) {
        self.status = FrameStatus::End;
        self.update_frame_prev_load(fake);
        self.frame_vload = 0;
        self.frame_min_util = 0;

        let prev = if fake {
            self.prev_fake_load_util
        } else {
            self.prev_frame_load_util
        };
        self.frame_util = clamp_util(prev, self.frame_min_util, self.frame_max_util);
        trace!(fake, frame_util = self.frame_util, "FRAME_STATUS END");
    }

    /// Apply a frame timestamp at `now`
    ///
    /// Returns `Some(frame_util)` when the timestamp changed the frame and
    /// `None` when it was skipped or was a repeated END.
    pub fn timestamp(&mut self, flags: TimestampFlags, now: u64) -> Result<Option<u64>> {
        let status = flags
            .status()
            .ok_or(Error::InvalidArgument("timestamp needs exactly one of START or END"))?;

        if flags.contains(TimestampFlags::SKIP_START) {
            self.timestamp_skipped = true;
        } else if flags.contains(TimestampFlags::SKIP_END) {
            self.timestamp_skipped = false;
        } else if self.timestamp_skipped {
            trace!(?flags, "FRAME_TIMESTAMP_SKIPPED");
            return Ok(None);
        }

        self.margin_imme = flags.contains(TimestampFlags::USE_MARGIN_IMME);

        if status.is_open() {
            self.window.rollover(now);
            self.set_frame_start();
        } else {
            if self.status == FrameStatus::End {
                return Ok(None);
            }
            self.window.rollover(now);
            self.do_frame_end(false);
        }

        self.apply_boost();
        trace!(frame_util = self.frame_util, "frame_util");
        Ok(Some(self.frame_util))
    }

    /// Recompute the target from the clock alone
    ///
    /// `invalid_interval` is the staleness threshold in ns (`u64::MAX`
    /// disables the detector). Returns the new `frame_util`.
    pub fn tick(&mut self, now: u64, invalid_interval: u64) -> u64 {
        let timeline = self.window.timeline(now);

        match self.status {
            FrameStatus::End | FrameStatus::Invalid => {
                if timeline >= self.qos_frame_time {
                    // Fake END to close the idle window
                    self.window.rollover(now);
                    self.do_frame_end(true);
                } else {
                    self.frame_vload = self.calc_frame_exec();
                    self.frame_util = self.calc_frame_util(true);
                }
            }
            FrameStatus::Start => {
                if self.is_util_invalid(timeline, invalid_interval) {
                    self.status = FrameStatus::Invalid;
                    self.invalidations += 1;
                    trace!(timeline, "FRAME_STATUS INVALID");
                    self.window.rollover(now);
                    self.do_frame_end(false);
                } else {
                    self.frame_vload = self.calc_vload(timeline);
                    self.frame_util = self.calc_frame_util(false);
                }
            }
        }

        self.apply_boost();
        trace!(
            timeline_ms = timeline / NSEC_PER_MSEC,
            frame_vload = self.frame_vload,
            frame_util = self.frame_util,
            "frame tick"
        );
        self.frame_util
    }
}
