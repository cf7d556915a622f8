//! Program model shared by the parser, the reverser and the streaming host.

use serde::{Deserialize, Serialize};
use std::ops::{Add, Sub};

/// Machine axis. Linear axes are always present on a [`Point`], rotary ones are optional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
    A,
    B,
    C,
}

impl Axis {
    pub const ALL: [Axis; 6] = [Axis::X, Axis::Y, Axis::Z, Axis::A, Axis::B, Axis::C];

    pub fn letter(self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
            Axis::A => 'A',
            Axis::B => 'B',
            Axis::C => 'C',
        }
    }

    pub fn from_letter(letter: char) -> Option<Axis> {
        match letter.to_ascii_uppercase() {
            'X' => Some(Axis::X),
            'Y' => Some(Axis::Y),
            'Z' => Some(Axis::Z),
            'A' => Some(Axis::A),
            'B' => Some(Axis::B),
            'C' => Some(Axis::C),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Position in machine units. `a`, `b` and `c` stay `None` until a program touches them.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub a: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub c: Option<f64>,
}

impl Point {
    pub const ORIGIN: Point = Point { x: 0.0, y: 0.0, z: 0.0, a: None, b: None, c: None };

    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z, a: None, b: None, c: None }
    }

    pub fn axis(&self, axis: Axis) -> Option<f64> {
        match axis {
            Axis::X => Some(self.x),
            Axis::Y => Some(self.y),
            Axis::Z => Some(self.z),
            Axis::A => self.a,
            Axis::B => self.b,
            Axis::C => self.c,
        }
    }

    /// Axis value with absent rotary axes read as zero.
    pub fn axis_or_zero(&self, axis: Axis) -> f64 {
        self.axis(axis).unwrap_or(0.0)
    }

    pub fn with_axis(mut self, axis: Axis, value: f64) -> Self {
        match axis {
            Axis::X => self.x = value,
            Axis::Y => self.y = value,
            Axis::Z => self.z = value,
            Axis::A => self.a = Some(value),
            Axis::B => self.b = Some(value),
            Axis::C => self.c = Some(value),
        }
        self
    }

    /// Euclidean distance over the linear axes.
    pub fn distance(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2) + (self.z - other.z).powi(2)).sqrt()
    }

    pub fn approx_eq(&self, other: &Point, tolerance: f64) -> bool {
        Axis::ALL
            .iter()
            .all(|&axis| (self.axis_or_zero(axis) - other.axis_or_zero(axis)).abs() <= tolerance)
    }
}

fn combine(lhs: Option<f64>, rhs: Option<f64>, op: fn(f64, f64) -> f64) -> Option<f64> {
    match (lhs, rhs) {
        (None, None) => None,
        (l, r) => Some(op(l.unwrap_or(0.0), r.unwrap_or(0.0))),
    }
}

impl Add for Point {
    type Output = Point;

    fn add(self, rhs: Point) -> Point {
        Point {
            x: self.x + rhs.x,
            y: self.y + rhs.y,
            z: self.z + rhs.z,
            a: combine(self.a, rhs.a, |l, r| l + r),
            b: combine(self.b, rhs.b, |l, r| l + r),
            c: combine(self.c, rhs.c, |l, r| l + r),
        }
    }
}

impl Sub for Point {
    type Output = Point;

    fn sub(self, rhs: Point) -> Point {
        Point {
            x: self.x - rhs.x,
            y: self.y - rhs.y,
            z: self.z - rhs.z,
            a: combine(self.a, rhs.a, |l, r| l - r),
            b: combine(self.b, rhs.b, |l, r| l - r),
            c: combine(self.c, rhs.c, |l, r| l - r),
        }
    }
}

/// Active arc plane (G17/G18/G19).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Plane {
    #[default]
    XY,
    XZ,
    YZ,
}

impl Plane {
    /// In-plane axes followed by the plane normal.
    pub fn axes(self) -> (Axis, Axis, Axis) {
        match self {
            Plane::XY => (Axis::X, Axis::Y, Axis::Z),
            Plane::XZ => (Axis::X, Axis::Z, Axis::Y),
            Plane::YZ => (Axis::Y, Axis::Z, Axis::X),
        }
    }

    /// Arc-center letters addressing the in-plane axes.
    pub fn offset_letters(self) -> (char, char) {
        match self {
            Plane::XY => ('I', 'J'),
            Plane::XZ => ('I', 'K'),
            Plane::YZ => ('J', 'K'),
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Plane::XY => "G17",
            Plane::XZ => "G18",
            Plane::YZ => "G19",
        }
    }

    pub fn from_code(code: &str) -> Option<Plane> {
        match code {
            "G17" => Some(Plane::XY),
            "G18" => Some(Plane::XZ),
            "G19" => Some(Plane::YZ),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Units {
    #[default]
    Millimeters,
    Inches,
}

impl Units {
    pub fn code(self) -> &'static str {
        match self {
            Units::Millimeters => "G21",
            Units::Inches => "G20",
        }
    }

    pub fn from_code(code: &str) -> Option<Units> {
        match code {
            "G20" => Some(Units::Inches),
            "G21" => Some(Units::Millimeters),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Positioning {
    #[default]
    Absolute,
    Relative,
}

impl Positioning {
    pub fn code(self) -> &'static str {
        match self {
            Positioning::Absolute => "G90",
            Positioning::Relative => "G91",
        }
    }

    pub fn from_code(code: &str) -> Option<Positioning> {
        match code {
            "G90" => Some(Positioning::Absolute),
            "G91" => Some(Positioning::Relative),
            _ => None,
        }
    }
}

/// Work-offset slot: six fixed coordinate systems plus the global G92 adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum OffsetId {
    #[default]
    G54,
    G55,
    G56,
    G57,
    G58,
    G59,
    G92,
}

impl OffsetId {
    pub const ALL: [OffsetId; 7] = [
        OffsetId::G54,
        OffsetId::G55,
        OffsetId::G56,
        OffsetId::G57,
        OffsetId::G58,
        OffsetId::G59,
        OffsetId::G92,
    ];

    pub fn code(self) -> &'static str {
        match self {
            OffsetId::G54 => "G54",
            OffsetId::G55 => "G55",
            OffsetId::G56 => "G56",
            OffsetId::G57 => "G57",
            OffsetId::G58 => "G58",
            OffsetId::G59 => "G59",
            OffsetId::G92 => "G92",
        }
    }

    pub fn from_code(code: &str) -> Option<OffsetId> {
        OffsetId::ALL.into_iter().find(|id| id.code() == code)
    }

    /// `P` index used by `G10 L2`/`G10 L20`: 1..=6 address G54..G59.
    pub fn from_p_index(p: u32) -> Option<OffsetId> {
        match p {
            1..=6 => Some(OffsetId::ALL[(p - 1) as usize]),
            _ => None,
        }
    }

    pub fn p_index(self) -> Option<u32> {
        match self {
            OffsetId::G92 => None,
            id => Some(id as u32 + 1),
        }
    }

    pub fn is_work_offset(self) -> bool {
        self != OffsetId::G92
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Offset per slot. Machine coordinates are obtained as `work - effective(id)`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OffsetTable {
    slots: [Point; 7],
}

impl OffsetTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: OffsetId) -> Point {
        self.slots[id.index()]
    }

    pub fn set(&mut self, id: OffsetId, point: Point) {
        self.slots[id.index()] = point;
    }

    /// Offset of a work slot with the global G92 adjustment applied on top.
    pub fn effective(&self, id: OffsetId) -> Point {
        if id == OffsetId::G92 {
            return self.get(OffsetId::G92);
        }
        self.get(id) + self.get(OffsetId::G92)
    }

    pub fn iter(&self) -> impl Iterator<Item = (OffsetId, Point)> + '_ {
        OffsetId::ALL.into_iter().map(|id| (id, self.get(id)))
    }
}

/// Interpreter settings that persist across lines until changed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModalState {
    pub active_work_offset: OffsetId,
    pub plane: Plane,
    pub positioning: Positioning,
    pub units: Units,
    pub feed_rate: f64,
    pub spindle_speed: f64,
    pub active_aux_commands: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CommandType {
    #[default]
    G,
    M,
    T,
}

/// One parsed program line. Created once by the parser and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub line_number: u32,
    pub raw_text: String,
    pub command_code: String,
    pub command_type: CommandType,
    pub is_rapid: bool,
    pub is_arc: bool,
    pub is_clockwise: Option<bool>,
    pub arc_center: Option<Point>,
    pub start_point: Point,
    pub end_point: Option<Point>,
    pub feed_rate: f64,
    pub dwell_time: Option<f64>,
    pub has_move: bool,
    /// Coordinates on this line were machine coordinates (G53).
    pub machine_coordinates: bool,
    /// G28/G30 reference move.
    pub is_home: bool,
    pub modal: ModalState,
}

impl CommandRecord {
    /// Where the machine sits after this line.
    pub fn resting_point(&self) -> Point {
        self.end_point.unwrap_or(self.start_point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_offset_stacks_global_adjustment() {
        let mut table = OffsetTable::new();
        table.set(OffsetId::G55, Point::new(10.0, 20.0, 0.0));
        table.set(OffsetId::G92, Point::new(1.0, 1.0, 1.0));
        assert_eq!(table.effective(OffsetId::G55), Point::new(11.0, 21.0, 1.0));
        assert_eq!(table.effective(OffsetId::G92), Point::new(1.0, 1.0, 1.0));
    }

    #[test]
    fn rotary_axes_only_appear_once_touched() {
        let p = Point::new(1.0, 2.0, 3.0);
        assert_eq!(p.axis(Axis::A), None);
        let q = p.with_axis(Axis::A, 90.0);
        assert_eq!((q - p).a, Some(90.0));
        assert_eq!((p + p).a, None);
    }

    #[test]
    fn p_index_addresses_work_slots() {
        assert_eq!(OffsetId::from_p_index(1), Some(OffsetId::G54));
        assert_eq!(OffsetId::from_p_index(6), Some(OffsetId::G59));
        assert_eq!(OffsetId::from_p_index(7), None);
        assert_eq!(OffsetId::G56.p_index(), Some(3));
    }
}
