//! Builds a program that retraces an executed path backward.
//!
//! Given the parsed history and the line execution stopped on, [`reverse`]
//! walks the moving records from that line back to the start of the program
//! and emits one line per move, targeting each move's start point. Arc
//! winding is flipped and centre offsets are re-derived from the reversed
//! start. When execution stopped part-way along an arc, a straight move onto
//! the arc (or helix) is spliced in first.

use std::f64::consts::TAU;

use thiserror::Error;

use crate::gcode::resume::format_value;
use crate::geometry::{
    GeometryError, Helix, angular_sign, first_helix_crossing, normalize_angle, project, rotate_about_axis,
    unproject,
};
use crate::types::{Axis, CommandRecord, OffsetId, OffsetTable, Plane, Point, Units};

/// Distance from the arc radius under which a position counts as on the arc.
const ON_ARC_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReverseError {
    #[error("line {0} is not part of the program")]
    LineNotFound(u32),
    #[error(transparent)]
    Geometry(#[from] GeometryError),
}

fn invert_code(code: &str) -> &str {
    match code {
        "G2" => "G3",
        "G3" => "G2",
        "G28" | "G30" => "G0",
        other => other,
    }
}

/// Axes that change anywhere in the program. Arcs always move both in-plane axes.
fn moving_axes(records: &[CommandRecord]) -> Vec<Axis> {
    let mut moving = [false; 6];
    for record in records.iter().filter(|r| r.has_move) {
        let end = record.resting_point();
        for axis in Axis::ALL {
            let changed = match (record.start_point.axis(axis), end.axis(axis)) {
                (None, None) => false,
                (a, b) => (a.unwrap_or(0.0) - b.unwrap_or(0.0)).abs() > 1e-9,
            };
            moving[axis.index()] |= changed;
        }
        if record.is_arc {
            let (u, v, _) = record.modal.plane.axes();
            moving[u.index()] = true;
            moving[v.index()] = true;
        }
    }
    Axis::ALL.into_iter().filter(|a| moving[a.index()]).collect()
}

/// Modal words re-emitted on reversed lines. Distance mode is always absolute.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ModalKey {
    offset: OffsetId,
    plane: Plane,
    units: Units,
}

impl ModalKey {
    fn of(record: &CommandRecord) -> Self {
        Self { offset: record.modal.active_work_offset, plane: record.modal.plane, units: record.modal.units }
    }

    fn words(&self) -> String {
        format!("{} {} {} G90", self.offset.code(), self.plane.code(), self.units.code())
    }
}

struct LineWriter<'a> {
    axes: Vec<Axis>,
    offsets: &'a OffsetTable,
    last_modal: Option<ModalKey>,
    out: Vec<String>,
}

impl LineWriter<'_> {
    fn emit(&mut self, record: &CommandRecord, code: &str, target: &Point, center: Option<(&Point, &Point)>) {
        let modal = ModalKey::of(record);
        let mut words = vec![format!("N{}", record.line_number)];
        if self.last_modal != Some(modal) {
            words.push(modal.words());
            self.last_modal = Some(modal);
        }
        words.push(code.to_string());

        let work = *target + self.offsets.effective(modal.offset);
        for axis in &self.axes {
            if let Some(value) = work.axis(*axis) {
                words.push(format!("{}{}", axis.letter(), format_value(value)));
            }
        }
        if let Some((arc_center, from)) = center {
            let (u, v, _) = modal.plane.axes();
            let (lu, lv) = modal.plane.offset_letters();
            words.push(format!("{lu}{}", format_value(arc_center.axis_or_zero(u) - from.axis_or_zero(u))));
            words.push(format!("{lv}{}", format_value(arc_center.axis_or_zero(v) - from.axis_or_zero(v))));
        }
        if record.feed_rate > 0.0 {
            words.push(format!("F{}", format_value(record.feed_rate)));
        }
        self.out.push(words.join(" "));
    }
}

/// Where the reversed walk joins an arc that was interrupted at `position`.
///
/// A position already on the arc's circle is used as is. Otherwise the
/// arc is rotated so its start sits at angle zero, modelled as one turn of a
/// helix, and the nearest crossing on the executed part is located.
fn arc_join_point(record: &CommandRecord, center: &Point, position: &Point) -> Result<Point, GeometryError> {
    let plane = record.modal.plane;
    let clockwise = record.is_clockwise.unwrap_or(true);
    let start = record.start_point;
    let end = record.resting_point();

    let (cu, cv, _) = project(center, plane);
    let (su, sv, sw) = project(&start, plane);
    let (eu, ev, ew) = project(&end, plane);
    let (pu, pv, _) = project(position, plane);

    let radius = (su - cu).hypot(sv - cv);
    if ((pu - cu).hypot(pv - cv) - radius).abs() <= ON_ARC_TOLERANCE {
        return Ok(*position);
    }

    let start_angle = (sv - cv).atan2(su - cu);
    let end_angle = (ev - cv).atan2(eu - cu);
    let sign = angular_sign(plane, clockwise);
    let mut sweep = normalize_angle(sign * (end_angle - start_angle));
    if sweep < 1e-9 {
        sweep = TAU;
    }
    let helix = Helix {
        center: unproject(&Point::ORIGIN, plane, (cu, cv, sw)),
        radius,
        pitch: (ew - sw) * TAU / sweep,
        plane,
        clockwise,
    };
    let local = rotate_about_axis(position, &helix.center, plane, -start_angle);
    let hit = first_helix_crossing(&helix, &local, sweep)?;
    Ok(rotate_about_axis(&hit, &helix.center, plane, start_angle))
}

/// Reverses `history` from `from_line` back to its first line.
///
/// `current_position` is the live machine position; `offsets` translates
/// machine coordinates back into work coordinates.
pub fn reverse(
    history: &[CommandRecord],
    from_line: u32,
    current_position: &Point,
    offsets: &OffsetTable,
) -> Result<Vec<String>, ReverseError> {
    let from_index = history
        .iter()
        .position(|r| r.line_number == from_line)
        .ok_or(ReverseError::LineNotFound(from_line))?;

    let mut writer = LineWriter { axes: moving_axes(history), offsets, last_modal: None, out: Vec::new() };
    let mut walked = history[..=from_index].iter().rev().filter(|r| r.has_move).peekable();

    // The move nearest the stop point may have been interrupted.
    if let Some(first) = walked.next_if(|r| r.is_arc) {
        match first.arc_center {
            Some(center) => {
                let join = arc_join_point(first, &center, current_position)?;
                tracing::debug!("reversing interrupted arc on line {} via {:?}", first.line_number, join);
                writer.emit(first, "G1", &join, None);
                writer.emit(first, invert_code(&first.command_code), &first.start_point, Some((&center, &join)));
            }
            None => writer.emit(first, invert_code(&first.command_code), &first.start_point, None),
        }
    }

    for record in walked {
        let code = invert_code(&record.command_code);
        let end = record.resting_point();
        let center = record.arc_center.as_ref().filter(|_| record.is_arc).map(|c| (c, &end));
        writer.emit(record, code, &record.start_point, center);
    }
    Ok(writer.out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gcode::{parse, tokenize};

    fn history(lines: &[&str]) -> Vec<CommandRecord> {
        parse(lines, &OffsetTable::new(), OffsetId::G54)
    }

    fn word(line: &str, letter: char) -> Option<f64> {
        tokenize(line).into_iter().find(|w| w.letter == letter).map(|w| w.value)
    }

    #[test]
    fn straight_moves_retrace_to_the_origin() {
        let records = history(&["N1 G54", "N2 G17", "N3 G21", "N4 G90", "N5 G1 X10 Y0 F100", "N6 G1 X10 Y10 F100"]);
        let out = reverse(&records, 6, &Point::new(10.0, 10.0, 0.0), &OffsetTable::new()).unwrap();
        assert_eq!(out, vec!["N6 G54 G17 G21 G90 G1 X10 Y0 F100", "N5 G1 X0 Y0 F100"]);
    }

    #[test]
    fn interrupted_arc_on_its_circle_joins_at_the_machine_position() {
        let records = history(&["N1 G17 G21 G90", "N2 G2 X10 Y0 I5 J0 F200"]);
        let out = reverse(&records, 2, &Point::new(5.0, -5.0, 0.0), &OffsetTable::new()).unwrap();
        assert_eq!(out, vec!["N2 G54 G17 G21 G90 G1 X5 Y-5 F200", "N2 G3 X0 Y0 I0 J5 F200"]);
    }

    #[test]
    fn interrupted_arc_off_its_circle_joins_the_executed_part() {
        let records = history(&["N1 G17 G21 G90", "N2 G2 X10 Y0 I5 J0 F200"]);
        let out = reverse(&records, 2, &Point::new(5.0, 4.9, 0.0), &OffsetTable::new()).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out[0].contains(" G1 "));
        let (x, y) = (word(&out[0], 'X').unwrap(), word(&out[0], 'Y').unwrap());
        assert!(x < 5.0, "join point {x},{y} lies on the executed side");
        assert!(((x - 5.0).hypot(y) - 5.0).abs() < 1e-3);
        assert!(out[1].starts_with("N2 G3 X0 Y0"));
    }

    #[test]
    fn interrupted_helix_joins_at_the_right_height() {
        let records = history(&["G17", "G2 X10 Y0 Z-2 I5 J0 F100"]);
        let out = reverse(&records, 2, &Point::new(5.0, 4.95, -1.0), &OffsetTable::new()).unwrap();
        let (x, y, z) = (word(&out[0], 'X').unwrap(), word(&out[0], 'Y').unwrap(), word(&out[0], 'Z').unwrap());
        assert!(((x - 5.0).hypot(y) - 5.0).abs() < 1e-3);
        assert!((z + 1.0).abs() < 0.1);
        assert!(out[1].contains("G3 X0 Y0 Z0"));
    }

    #[test]
    fn arc_interrupted_at_its_centre_retraces_the_whole_arc() {
        let records = history(&["G18 G21 G90", "G2 X10 Y0 Z0 I5 K0 F100"]);
        let out = reverse(&records, 2, &Point::new(5.0, 0.0, 0.0), &OffsetTable::new()).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out[0].contains(" G1 "));
        assert!((word(&out[0], 'X').unwrap() - 10.0).abs() < 1e-6);
        assert!(word(&out[0], 'Z').unwrap().abs() < 1e-6);
        assert!(out[1].contains(" G3 "));
        assert_eq!(word(&out[1], 'X'), Some(0.0));
    }

    #[test]
    fn earlier_arcs_flip_and_recompute_offsets() {
        let records = history(&["G1 X10 F100", "G2 X20 Y0 I5 J0", "G1 X30"]);
        let out = reverse(&records, 3, &Point::new(30.0, 0.0, 0.0), &OffsetTable::new()).unwrap();
        assert_eq!(
            out,
            vec!["N3 G54 G17 G21 G90 G1 X20 Y0 F100", "N2 G3 X10 Y0 I-5 J0 F100", "N1 G1 X0 Y0 F100"]
        );
    }

    #[test]
    fn home_moves_come_back_as_rapids() {
        let records = history(&["G0 X5", "G28 X0"]);
        let out = reverse(&records, 2, &Point::ORIGIN, &OffsetTable::new()).unwrap();
        assert_eq!(out[0], "N2 G54 G17 G21 G90 G0 X5");
    }

    #[test]
    fn targets_are_in_work_coordinates() {
        let mut offsets = OffsetTable::new();
        offsets.set(OffsetId::G55, Point::new(10.0, 20.0, 0.0));
        let records = parse(&["G55", "G1 X5 Y5 F100", "G1 X6 Y5"], &offsets, OffsetId::G54);
        let out = reverse(&records, 3, &Point::new(-4.0, -15.0, 0.0), &offsets).unwrap();
        assert_eq!(out[0], "N3 G55 G17 G21 G90 G1 X5 Y5 F100");
    }

    #[test]
    fn modal_words_reappear_when_they_change() {
        let records = history(&["G21 G1 X1 F100", "G20", "G1 X2"]);
        let out = reverse(&records, 3, &Point::new(2.0, 0.0, 0.0), &OffsetTable::new()).unwrap();
        assert_eq!(out, vec!["N3 G54 G17 G20 G90 G1 X1 F100", "N1 G54 G17 G21 G90 G1 X0 F100"]);
    }

    #[test]
    fn unknown_line_is_an_error() {
        let records = history(&["G1 X1"]);
        assert_eq!(
            reverse(&records, 9, &Point::ORIGIN, &OffsetTable::new()),
            Err(ReverseError::LineNotFound(9))
        );
    }
}
