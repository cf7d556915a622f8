//! Modal G-code parser producing one [`CommandRecord`] per meaningful line.
//!
//! The parser keeps the running machine position, the modal state and its own
//! copy of the offset table while scanning forward. Every record embeds a
//! snapshot of the modal state as it stands after that line, and its start
//! point is the resting point of the previous moving record, so positions chain
//! across the whole program.
//!
//! Coordinates written in work space are translated to machine space by
//! subtracting the effective offset of the active slot. `G53` lines and the
//! `G28`/`G30` reference moves are taken as machine coordinates. Incremental
//! (`G91`) words move relative to the current machine position.

use crate::gcode::text::strip_comments;
use crate::gcode::words::tokenize;
use crate::geometry::circle_circle_intersection;
use crate::types::{
    Axis, CommandRecord, CommandType, ModalState, OffsetId, OffsetTable, Plane, Point, Positioning, Units,
};

/// Parses `lines` in order. Blank and comment-only lines produce no record and
/// do not consume a line number.
pub fn parse<S: AsRef<str>>(lines: &[S], initial_offsets: &OffsetTable, initial_offset: OffsetId) -> Vec<CommandRecord> {
    let mut parser = GCodeParser::new(initial_offsets.clone(), initial_offset);
    lines
        .iter()
        .filter_map(|line| parser.parse_line(line.as_ref()))
        .collect()
}

#[derive(Debug, Clone)]
pub struct GCodeParser {
    offsets: OffsetTable,
    modal: ModalState,
    position: Point,
    motion_code: String,
    next_line_number: u32,
}

/// Words collected from one line before they are applied.
#[derive(Debug, Default)]
struct LineWords {
    line_number: Option<u32>,
    codes: Vec<(CommandType, String)>,
    motion: Option<String>,
    axes: [Option<f64>; 6],
    center: [Option<f64>; 3],
    radius: Option<f64>,
    feed: Option<f64>,
    spindle: Option<f64>,
    p: Option<f64>,
    l: Option<f64>,
    dwell: bool,
    machine_coordinates: bool,
    home: bool,
    set_offset: bool,
    set_global: bool,
    clear_global: bool,
}

impl LineWords {
    fn has_axis_words(&self) -> bool {
        self.axes.iter().any(Option::is_some)
    }

    fn has_center_words(&self) -> bool {
        self.center.iter().any(Option::is_some) || self.radius.is_some()
    }
}

impl GCodeParser {
    /// Starts at the active offset's position with default modal state.
    pub fn new(offsets: OffsetTable, active_offset: OffsetId) -> Self {
        let position = offsets.get(active_offset);
        let modal = ModalState { active_work_offset: active_offset, ..ModalState::default() };
        Self { offsets, modal, position, motion_code: "G0".to_string(), next_line_number: 1 }
    }

    pub fn position(&self) -> Point {
        self.position
    }

    pub fn modal(&self) -> &ModalState {
        &self.modal
    }

    pub fn offsets(&self) -> &OffsetTable {
        &self.offsets
    }

    /// Parses a single line, returning `None` for blank and comment-only input.
    pub fn parse_line(&mut self, raw: &str) -> Option<CommandRecord> {
        let upper = raw.trim().to_ascii_uppercase();
        let text = strip_comments(&upper);
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let words = self.collect_words(text);

        let line_number = words.line_number.unwrap_or(self.next_line_number);
        self.next_line_number = line_number.saturating_add(1);

        if let Some(feed) = words.feed.filter(|f| *f > 0.0) {
            self.modal.feed_rate = feed;
        }
        if let Some(speed) = words.spindle.filter(|s| *s >= 0.0) {
            self.modal.spindle_speed = speed;
        }

        let offset_line = words.set_offset || words.set_global || words.clear_global;
        if offset_line {
            self.apply_offset_words(&words);
        }

        let start = self.position;
        let has_move = !offset_line && !words.dwell && (words.has_axis_words() || words.has_center_words());
        let motion = words
            .motion
            .clone()
            .or_else(|| has_move.then(|| self.motion_code.clone()));
        let is_arc = has_move && matches!(motion.as_deref(), Some("G2") | Some("G3"));
        let is_clockwise = is_arc.then(|| motion.as_deref() == Some("G2"));

        let mut end_point = None;
        let mut arc_center = None;
        if has_move {
            let end = self.target_point(&words);
            if is_arc {
                arc_center = self.arc_center(&words, &start, &end, is_clockwise.unwrap_or(true));
            }
            self.position = end;
            end_point = Some(end);
        }

        let (command_type, command_code) = if let Some(code) = motion.clone() {
            (CommandType::G, code)
        } else if words.dwell {
            (CommandType::G, "G4".to_string())
        } else {
            words.codes.first().cloned().unwrap_or((CommandType::G, String::new()))
        };

        Some(CommandRecord {
            line_number,
            raw_text: raw.trim().to_string(),
            command_code,
            command_type,
            is_rapid: has_move && motion.as_deref() == Some("G0"),
            is_arc,
            is_clockwise,
            arc_center,
            start_point: start,
            end_point,
            feed_rate: self.modal.feed_rate,
            dwell_time: if words.dwell { words.p } else { None },
            has_move,
            machine_coordinates: words.machine_coordinates,
            is_home: words.home,
            modal: self.modal.clone(),
        })
    }

    fn collect_words(&mut self, text: &str) -> LineWords {
        let mut words = LineWords::default();
        for word in tokenize(text) {
            match word.letter {
                'N' if word.value >= 0.0 => words.line_number = Some(word.value as u32),
                'G' => {
                    let code = word.code();
                    self.apply_g_code(&code, &mut words);
                    words.codes.push((CommandType::G, code));
                }
                'M' => {
                    let code = word.code();
                    self.apply_aux_code(&code);
                    words.codes.push((CommandType::M, code));
                }
                'T' => words.codes.push((CommandType::T, word.code())),
                'X' | 'Y' | 'Z' | 'A' | 'B' | 'C' => {
                    if let Some(axis) = Axis::from_letter(word.letter) {
                        words.axes[axis.index()] = Some(word.value);
                    }
                }
                'I' => words.center[0] = Some(word.value),
                'J' => words.center[1] = Some(word.value),
                'K' => words.center[2] = Some(word.value),
                'R' => words.radius = Some(word.value),
                'F' => words.feed = Some(word.value),
                'S' => words.spindle = Some(word.value),
                'P' => words.p = Some(word.value),
                'L' => words.l = Some(word.value),
                other => tracing::trace!("ignoring word {}{}", other, word.value),
            }
        }
        words
    }

    fn apply_g_code(&mut self, code: &str, words: &mut LineWords) {
        match code {
            "G0" | "G1" | "G2" | "G3" => {
                self.motion_code = code.to_string();
                words.motion = Some(code.to_string());
            }
            "G4" => words.dwell = true,
            "G10" => words.set_offset = true,
            "G28" | "G30" => {
                words.home = true;
                words.motion = Some(code.to_string());
            }
            "G53" => words.machine_coordinates = true,
            "G92" => words.set_global = true,
            "G92.1" => words.clear_global = true,
            _ => {
                if let Some(plane) = Plane::from_code(code) {
                    self.modal.plane = plane;
                } else if let Some(units) = Units::from_code(code) {
                    self.modal.units = units;
                } else if let Some(positioning) = Positioning::from_code(code) {
                    self.modal.positioning = positioning;
                } else if let Some(id) = OffsetId::from_code(code).filter(|id| id.is_work_offset()) {
                    self.modal.active_work_offset = id;
                }
            }
        }
    }

    fn apply_aux_code(&mut self, code: &str) {
        let aux = &mut self.modal.active_aux_commands;
        match code {
            "M3" | "M4" | "M5" => {
                aux.retain(|c| !matches!(c.as_str(), "M3" | "M4" | "M5"));
                aux.push(code.to_string());
            }
            "M7" | "M8" => {
                if !aux.iter().any(|c| c == code) {
                    aux.push(code.to_string());
                }
            }
            "M9" => aux.retain(|c| !matches!(c.as_str(), "M7" | "M8")),
            _ => {}
        }
    }

    /// `G10 L2/L20 P<k>`, `G92` and `G92.1` update the parser's offset table.
    fn apply_offset_words(&mut self, words: &LineWords) {
        if words.clear_global {
            self.offsets.set(OffsetId::G92, Point::ORIGIN);
            return;
        }
        if words.set_global {
            let active = self.offsets.get(self.modal.active_work_offset);
            let mut global = self.offsets.get(OffsetId::G92);
            for axis in Axis::ALL {
                if let Some(work) = words.axes[axis.index()] {
                    let value = work - self.position.axis_or_zero(axis) - active.axis_or_zero(axis);
                    global = global.with_axis(axis, value);
                }
            }
            self.offsets.set(OffsetId::G92, global);
            return;
        }
        let slot = match words.p.map(|p| p.round() as i64) {
            Some(0) | None => Some(self.modal.active_work_offset),
            Some(p) if p > 0 => OffsetId::from_p_index(p as u32),
            Some(_) => None,
        };
        let Some(slot) = slot else {
            tracing::trace!("G10 with unknown slot P{:?} ignored", words.p);
            return;
        };
        let level = words.l.map(|l| l.round() as i64);
        let global = self.offsets.get(OffsetId::G92);
        let mut offset = self.offsets.get(slot);
        for axis in Axis::ALL {
            if let Some(value) = words.axes[axis.index()] {
                let new_value = match level {
                    Some(20) => value - self.position.axis_or_zero(axis) - global.axis_or_zero(axis),
                    Some(2) => value,
                    _ => continue,
                };
                offset = offset.with_axis(axis, new_value);
            }
        }
        self.offsets.set(slot, offset);
    }

    fn target_point(&self, words: &LineWords) -> Point {
        let translate = !(words.machine_coordinates || words.home);
        let offset = self.offsets.effective(self.modal.active_work_offset);
        let mut end = self.position;
        for axis in Axis::ALL {
            let Some(value) = words.axes[axis.index()] else {
                continue;
            };
            let target = match self.modal.positioning {
                Positioning::Relative => self.position.axis_or_zero(axis) + value,
                Positioning::Absolute if translate => value - offset.axis_or_zero(axis),
                Positioning::Absolute => value,
            };
            end = end.with_axis(axis, target);
        }
        end
    }

    fn arc_center(&self, words: &LineWords, start: &Point, end: &Point, clockwise: bool) -> Option<Point> {
        if words.center.iter().any(Option::is_some) {
            let [i, j, k] = words.center.map(|c| c.unwrap_or(0.0));
            return Some(Point::new(start.x + i, start.y + j, start.z + k));
        }
        let radius = words.radius?;
        // R-form arcs: the center is one of the two points at |R| from both ends.
        // The XZ plane is viewed from -Y, so its winding is mirrored.
        let plane = self.modal.plane;
        let winding = clockwise != (plane == Plane::XZ);
        let candidates =
            circle_circle_intersection(start, radius.abs(), end, radius.abs(), plane, winding).ok()?;
        let (_, _, normal) = plane.axes();
        let pick = if radius >= 0.0 { candidates.first() } else { candidates.last() };
        pick.map(|c| c.with_axis(normal, start.axis_or_zero(normal)))
    }
}
