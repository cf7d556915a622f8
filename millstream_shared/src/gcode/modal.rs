//! Active modal state recovered from a parsed program by scanning backward.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::gcode::text::strip_comments;
use crate::gcode::words::tokenize;
use crate::types::{CommandRecord, ModalState, OffsetId, Plane, Positioning, Units};

/// The four modal groups the operator and the reverser need to agree on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ActiveModal {
    pub offset: OffsetId,
    pub plane: Plane,
    pub units: Units,
    pub positioning: Positioning,
}

impl From<&ModalState> for ActiveModal {
    fn from(modal: &ModalState) -> Self {
        Self {
            offset: modal.active_work_offset,
            plane: modal.plane,
            units: modal.units,
            positioning: modal.positioning,
        }
    }
}

impl ActiveModal {
    /// Modal words in the order they are re-emitted: offset, plane, units, distance mode.
    pub fn words(&self) -> [&'static str; 4] {
        [self.offset.code(), self.plane.code(), self.units.code(), self.positioning.code()]
    }
}

/// Scans `records[..=index]` backward and returns, per group, the last code
/// written in the program text. Groups never written keep their defaults.
/// An index past the end is clamped to the last record.
pub fn active_modal_state(records: &[CommandRecord], index: usize) -> ActiveModal {
    let mut offset = None;
    let mut plane = None;
    let mut units = None;
    let mut positioning = None;

    let end = index.min(records.len().saturating_sub(1));
    for record in records.iter().take(end + 1).rev() {
        let text = strip_comments(&record.raw_text.to_ascii_uppercase());
        for word in tokenize(&text).iter().rev().filter(|w| w.letter == 'G') {
            let code = word.code();
            if offset.is_none() {
                offset = OffsetId::from_code(&code).filter(|id| id.is_work_offset());
            }
            if plane.is_none() {
                plane = Plane::from_code(&code);
            }
            if units.is_none() {
                units = Units::from_code(&code);
            }
            if positioning.is_none() {
                positioning = Positioning::from_code(&code);
            }
        }
        if offset.is_some() && plane.is_some() && units.is_some() && positioning.is_some() {
            break;
        }
    }

    ActiveModal {
        offset: offset.unwrap_or_default(),
        plane: plane.unwrap_or_default(),
        units: units.unwrap_or_default(),
        positioning: positioning.unwrap_or_default(),
    }
}

/// Memoizes [`active_modal_state`] per record index for one program.
#[derive(Debug, Default, Clone)]
pub struct ModalScanner {
    cache: HashMap<usize, ActiveModal>,
}

impl ModalScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state_at(&mut self, records: &[CommandRecord], index: usize) -> ActiveModal {
        *self
            .cache
            .entry(index)
            .or_insert_with(|| active_modal_state(records, index))
    }

    /// Drops cached results. Call whenever the program changes.
    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gcode::parse;
    use crate::types::OffsetTable;

    fn program() -> Vec<CommandRecord> {
        parse(
            &["G55 G18", "G20", "G1 X1 F10", "G17 G91 (relative)", "G1 X1", "G21 G90 G56"],
            &OffsetTable::new(),
            OffsetId::G54,
        )
    }

    #[test]
    fn groups_are_found_independently() {
        let records = program();
        let at = active_modal_state(&records, 2);
        assert_eq!(at.offset, OffsetId::G55);
        assert_eq!(at.plane, Plane::XZ);
        assert_eq!(at.units, Units::Inches);
        assert_eq!(at.positioning, Positioning::Absolute);

        let at = active_modal_state(&records, 4);
        assert_eq!(at.plane, Plane::XY);
        assert_eq!(at.positioning, Positioning::Relative);
        assert_eq!(at.units, Units::Inches);
    }

    #[test]
    fn scan_agrees_with_parser_snapshots() {
        let records = program();
        for (index, record) in records.iter().enumerate() {
            assert_eq!(active_modal_state(&records, index), ActiveModal::from(&record.modal));
        }
    }

    #[test]
    fn out_of_range_and_empty_inputs() {
        let records = program();
        assert_eq!(active_modal_state(&records, 99).offset, OffsetId::G56);
        assert_eq!(active_modal_state(&[], 3), ActiveModal::default());
    }

    #[test]
    fn scanner_caches_until_cleared() {
        let records = program();
        let mut scanner = ModalScanner::new();
        assert_eq!(scanner.state_at(&records, 1).units, Units::Inches);
        // cached entry survives even against a different slice
        assert_eq!(scanner.state_at(&[], 1).units, Units::Inches);
        scanner.clear();
        assert_eq!(scanner.state_at(&[], 1).units, Units::Millimeters);
    }
}
