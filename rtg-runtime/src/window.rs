//! Windowed load accounting
//!
//! A frame group accumulates load and exec time into a "current" window.
//! Closing a window shifts current into previous and starts from zero.
//! The caller serializes access (the group's write lock); rolling over
//! twice inside one window discards the first window's totals.

/// Current/previous window accumulators for one group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowedLoad {
    pub curr_window_load: u64,
    pub prev_window_load: u64,
    pub curr_window_exec: u64,
    pub prev_window_exec: u64,
}

impl WindowedLoad {
    /// Create an empty accumulator
    pub const fn new() -> Self {
        Self {
            curr_window_load: 0,
            prev_window_load: 0,
            curr_window_exec: 0,
            prev_window_exec: 0,
        }
    }

    /// Account executed wall time to the current window
    #[inline]
    pub fn add_exec(&mut self, delta_ns: u64) {
        self.curr_window_exec = self.curr_window_exec.saturating_add(delta_ns);
    }

    /// Account capacity-scaled load to the current window
    #[inline]
    pub fn add_load(&mut self, delta_ns: u64) {
        self.curr_window_load = self.curr_window_load.saturating_add(delta_ns);
    }

    /// Close the current window
    #[inline]
    pub fn rollover(&mut self) {
        self.prev_window_load = self.curr_window_load;
        self.prev_window_exec = self.curr_window_exec;
        self.curr_window_load = 0;
        self.curr_window_exec = 0;
    }

    /// Drop all accumulated history
    pub fn clear(&mut self) {
        *self = Self::new();
    }
}

/// A [`WindowedLoad`] anchored in time
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameWindow {
    pub load: WindowedLoad,

    /// Start of the current window (ns)
    pub window_start: u64,

    /// Wall length of the last closed window (ns)
    pub prev_window_time: u64,
}

impl FrameWindow {
    /// Close the current window at `now` and open a new one
    pub fn rollover(&mut self, now: u64) {
        self.load.rollover();
        self.prev_window_time = now.saturating_sub(self.window_start);
        self.window_start = now;
    }

    /// Time elapsed since the current window opened
    #[inline]
    pub fn timeline(&self, now: u64) -> u64 {
        now.saturating_sub(self.window_start)
    }

    /// Forget history and start a fresh window at `now`
    pub fn reset(&mut self, now: u64) {
        self.load.clear();
        self.prev_window_time = 0;
        self.window_start = now;
    }
}
