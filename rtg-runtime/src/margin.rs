//! Per-rate vload margins
//!
//! Callers announce what kind of frame is starting (`FrameType`); the
//! margin applied to the deadline depends on both the kind and the group's
//! current frame rate. The first rate ever configured becomes the default
//! table, used for rates that were never configured.

use crate::error::{Error, Result};
use rtg_common::config::{MAX_FRAME_RATE, MAX_VLOAD_MARGIN, MIN_FRAME_RATE, MIN_VLOAD_MARGIN};
use rtg_common::FrameType;
use std::collections::BTreeMap;
use tracing::debug;

type Row = [Option<i32>; FrameType::COUNT];

/// `(rate, FrameType) -> margin` lookup
#[derive(Debug, Clone, Default)]
pub struct MarginTable {
    rows: BTreeMap<u32, Row>,
    default_rate: Option<u32>,
}

impl MarginTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install margins for `rate`
    ///
    /// Validates everything before touching the table. Entries for a rate
    /// that already has a row are merged into it.
    pub fn configure(&mut self, rate: u32, entries: &[(FrameType, i32)]) -> Result<()> {
        if !(MIN_FRAME_RATE..=MAX_FRAME_RATE).contains(&rate) {
            return Err(Error::InvalidArgument("frame rate out of range"));
        }
        if entries
            .iter()
            .any(|(_, m)| !(MIN_VLOAD_MARGIN..=MAX_VLOAD_MARGIN).contains(m))
        {
            return Err(Error::InvalidArgument("vload margin out of range"));
        }

        let row = self.rows.entry(rate).or_insert([None; FrameType::COUNT]);
        for &(ty, margin) in entries {
            row[ty.index()] = Some(margin);
        }
        self.default_rate.get_or_insert(rate);

        debug!(rate, entries = entries.len(), "margin table updated");
        Ok(())
    }

    /// Configured margin for `ty` at `rate`, falling back to the default rate
    pub fn get(&self, rate: u32, ty: FrameType) -> Option<i32> {
        let row = self
            .rows
            .get(&rate)
            .or_else(|| self.default_rate.and_then(|r| self.rows.get(&r)))?;
        row[ty.index()]
    }

    /// Margin to apply when a frame of kind `ty` begins
    ///
    /// Without any configured entry the frame type's index is used.
    pub fn lookup(&self, rate: u32, ty: FrameType) -> i32 {
        self.get(rate, ty).unwrap_or(ty.index() as i32)
    }

    pub fn default_rate(&self) -> Option<u32> {
        self.default_rate
    }

    /// Drop every row
    pub fn clear(&mut self) {
        self.rows.clear();
        self.default_rate = None;
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rate_fallback() {
        let mut table = MarginTable::new();
        table
            .configure(60, &[(FrameType::Frame0, 4), (FrameType::Click, -8)])
            .unwrap();
        table.configure(90, &[(FrameType::Frame0, 2)]).unwrap();

        assert_eq!(table.default_rate(), Some(60));
        assert_eq!(table.get(90, FrameType::Frame0), Some(2));
        // 90 has a row, so no fallback for missing entries in it
        assert_eq!(table.get(90, FrameType::Click), None);
        // 120 has no row at all
        assert_eq!(table.get(120, FrameType::Click), Some(-8));
    }

    #[test]
    fn test_lookup_without_entry_uses_type_index() {
        let table = MarginTable::new();
        assert_eq!(table.lookup(60, FrameType::Activity), 0);
        assert_eq!(table.lookup(60, FrameType::Video1), 6);
    }

    #[test]
    fn test_rejects_bad_input_without_mutation() {
        let mut table = MarginTable::new();
        assert!(table.configure(0, &[(FrameType::Frame0, 1)]).is_err());
        assert!(table
            .configure(60, &[(FrameType::Frame0, 1), (FrameType::Frame1, 101)])
            .is_err());
        assert!(table.is_empty());
        assert_eq!(table.default_rate(), None);
    }

    #[test]
    fn test_clear() {
        let mut table = MarginTable::new();
        table.configure(60, &[(FrameType::Frame0, 1)]).unwrap();
        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.get(60, FrameType::Frame0), None);
    }
}
