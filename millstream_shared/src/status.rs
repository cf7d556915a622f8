//! Inbound controller telegrams: status reports, acknowledgements, errors,
//! alarms, offset and modal-state feedback.
//!
//! Everything here is best-effort. A telegram that does not decode yields
//! `None` (or [`ControllerResponse::Other`]) and is logged at trace level;
//! nothing in this module returns an error or panics on controller input.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{OffsetId, Point};

/// Controller state as reported in the first field of a status telegram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MachineState {
    #[default]
    NotConnected,
    Idle,
    Run,
    Hold,
    Alarm,
    Home,
    Door,
    Jog,
    Check,
    Sleep,
}

impl MachineState {
    pub fn from_report(name: &str) -> Option<MachineState> {
        let state = match name {
            "Idle" => MachineState::Idle,
            "Run" => MachineState::Run,
            "Hold" => MachineState::Hold,
            "Alarm" => MachineState::Alarm,
            "Home" => MachineState::Home,
            "Door" => MachineState::Door,
            "Jog" => MachineState::Jog,
            "Check" => MachineState::Check,
            "Sleep" => MachineState::Sleep,
            _ => return None,
        };
        Some(state)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FeedSpeed {
    pub feed: f64,
    pub speed: f64,
}

/// Feed, rapid and spindle override percentages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Overrides {
    pub feed: u32,
    pub rapid: u32,
    pub spindle: u32,
}

/// `Bf:` field: free planner blocks and free serial RX bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BufferCredit {
    pub blocks: u32,
    pub bytes: Option<u32>,
}

/// One decoded status telegram. Replaced wholesale on every report.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MachineStatus {
    pub state: MachineState,
    /// Sub-state as reported after `:` (e.g. `Hold:1`), if any.
    pub sub_state: Option<u32>,
    pub machine_position: Option<Point>,
    pub work_position: Option<Point>,
    pub work_offset: Option<Point>,
    pub feed_and_speed: Option<FeedSpeed>,
    pub overrides: Option<Overrides>,
    pub line_in_execution: Option<u32>,
    pub buffer: Option<BufferCredit>,
    pub dwell_remaining: Option<f64>,
    pub dwell_total: Option<f64>,
    /// Keys this decoder does not interpret (`Pn`, `A`, ...), kept verbatim.
    pub extras: BTreeMap<String, String>,
}

fn numbers(value: &str) -> Option<Vec<f64>> {
    value
        .split(',')
        .map(|v| v.trim().parse::<f64>().ok().filter(|n| n.is_finite()))
        .collect()
}

fn point(value: &str) -> Option<Point> {
    let values = numbers(value)?;
    if values.len() < 3 {
        return None;
    }
    let mut p = Point::new(values[0], values[1], values[2]);
    p.a = values.get(3).copied();
    p.b = values.get(4).copied();
    p.c = values.get(5).copied();
    Some(p)
}

fn count(value: f64) -> Option<u32> {
    (value >= 0.0 && value.fract() == 0.0).then_some(value as u32)
}

/// Decodes `<State|Key:Val|Key:Val,Val,...>`. Returns `None` for anything that
/// is not a complete telegram or carries a non-numeric known field.
pub fn parse_status(line: &str) -> Option<MachineStatus> {
    let inner = line.trim().strip_prefix('<')?.strip_suffix('>')?;
    let mut fields = inner.split('|');
    let state_field = fields.next()?.trim();
    let (state_name, sub_state) = match state_field.split_once(':') {
        Some((name, sub)) => (name, sub.parse::<u32>().ok()),
        None => (state_field, None),
    };
    let mut status = MachineStatus {
        state: MachineState::from_report(state_name)?,
        sub_state,
        ..MachineStatus::default()
    };

    for field in fields {
        let Some((key, value)) = field.split_once(':') else {
            status.extras.insert(field.to_string(), String::new());
            continue;
        };
        match key {
            "MPos" => status.machine_position = Some(point(value)?),
            "WPos" => status.work_position = Some(point(value)?),
            "WCO" => status.work_offset = Some(point(value)?),
            "FS" => {
                let v = numbers(value)?;
                status.feed_and_speed = Some(FeedSpeed { feed: *v.first()?, speed: v.get(1).copied().unwrap_or(0.0) });
            }
            "F" => {
                let v = numbers(value)?;
                status.feed_and_speed = Some(FeedSpeed { feed: *v.first()?, speed: 0.0 });
            }
            "Ov" => {
                let v = numbers(value)?;
                if v.len() < 3 {
                    return None;
                }
                status.overrides = Some(Overrides { feed: count(v[0])?, rapid: count(v[1])?, spindle: count(v[2])? });
            }
            "Ln" => status.line_in_execution = Some(value.trim().parse().ok()?),
            "Bf" => {
                let v = numbers(value)?;
                let blocks = count(*v.first()?)?;
                let bytes = match v.get(1) {
                    Some(b) => Some(count(*b)?),
                    None => None,
                };
                status.buffer = Some(BufferCredit { blocks, bytes });
            }
            "Dwell" => {
                let v = numbers(value)?;
                status.dwell_remaining = Some(*v.first()?);
                status.dwell_total = v.get(1).copied();
            }
            _ => {
                status.extras.insert(key.to_string(), value.to_string());
            }
        }
    }

    // The controller keeps reporting Idle while it dwells.
    if status.state == MachineState::Idle && status.dwell_remaining.is_some_and(|d| d > 0.0) {
        status.state = MachineState::Run;
    }
    Some(status)
}

/// Every inbound line falls into exactly one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControllerResponse {
    Ok,
    Error { code: Option<u32>, message: String },
    Alarm { code: Option<u32>, message: String },
    Status(MachineStatus),
    Offset { id: OffsetId, point: Point },
    ModalState(Vec<String>),
    Welcome(String),
    Message(String),
    Other(String),
}

/// Error telegram detection: the line mentions `error` in any case.
pub fn is_error_line(line: &str) -> bool {
    line.to_ascii_lowercase().contains("error")
}

fn trailing_code(line: &str) -> Option<u32> {
    line.rsplit_once(':').and_then(|(_, n)| n.trim().parse().ok())
}

pub fn classify_response(line: &str) -> ControllerResponse {
    let line = line.trim();
    if line.eq_ignore_ascii_case("ok") {
        return ControllerResponse::Ok;
    }
    if line.starts_with('<') {
        return match parse_status(line) {
            Some(status) => ControllerResponse::Status(status),
            None => {
                tracing::trace!("discarding malformed status telegram '{}'", line);
                ControllerResponse::Other(line.to_string())
            }
        };
    }
    if line.get(..5).is_some_and(|p| p.eq_ignore_ascii_case("alarm")) {
        let code = trailing_code(line);
        let message = code.and_then(alarm_message).unwrap_or(line).to_string();
        return ControllerResponse::Alarm { code, message };
    }
    if is_error_line(line) {
        let code = trailing_code(line);
        let message = code.and_then(error_message).unwrap_or(line).to_string();
        return ControllerResponse::Error { code, message };
    }
    if let Some(inner) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
        return classify_feedback(inner);
    }
    if line.starts_with("Grbl ") {
        return ControllerResponse::Welcome(line.to_string());
    }
    ControllerResponse::Other(line.to_string())
}

fn classify_feedback(inner: &str) -> ControllerResponse {
    if let Some(modal) = inner.strip_prefix("GC:") {
        return ControllerResponse::ModalState(modal.split_whitespace().map(str::to_string).collect());
    }
    if let Some((key, value)) = inner.split_once(':') {
        if let Some(id) = OffsetId::from_code(key) {
            if let Some(point) = point(value) {
                return ControllerResponse::Offset { id, point };
            }
        }
    }
    ControllerResponse::Message(inner.to_string())
}

const ERROR_MESSAGES: [&str; 38] = [
    "Expected command letter",
    "Bad number format",
    "Invalid statement",
    "Value < 0",
    "Setting disabled",
    "Value < 3 usec",
    "EEPROM read fail. Using defaults",
    "Not idle",
    "G-code lock",
    "Homing not enabled",
    "Line overflow",
    "Step rate > 30kHz",
    "Check door",
    "Line length exceeded",
    "Travel exceeded",
    "Invalid jog command",
    "Setting disabled. Laser mode requires PWM output",
    "Reserved",
    "Reserved",
    "Unsupported command",
    "Modal group violation",
    "Undefined feed rate",
    "Invalid G-code ID",
    "Invalid G-code ID",
    "Invalid G-code ID",
    "Invalid G-code ID",
    "Invalid G-code ID",
    "Invalid G-code ID",
    "Invalid G-code ID",
    "Invalid G-code ID",
    "Invalid G-code ID",
    "Invalid G-code ID",
    "Invalid target",
    "Arc radius error",
    "No arc offsets in plane",
    "Unused G-code words",
    "G43.1 offset on wrong axis",
    "Tool number out of range",
];

const ALARM_MESSAGES: [&str; 9] = [
    "Hard limit triggered",
    "Soft limit: motion target exceeds machine travel",
    "Reset while in motion, position lost",
    "Probe fail: probe not in expected initial state",
    "Probe fail: no contact within travel",
    "Homing fail: reset during homing",
    "Homing fail: safety door opened",
    "Homing fail: pull-off failed to clear limit switch",
    "Homing fail: limit switch not found",
];

pub fn error_message(code: u32) -> Option<&'static str> {
    ERROR_MESSAGES.get((code as usize).checked_sub(1)?).copied()
}

pub fn alarm_message(code: u32) -> Option<&'static str> {
    ALARM_MESSAGES.get((code as usize).checked_sub(1)?).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_full_report() {
        let status = parse_status("<Run|MPos:1.000,-2.5,3|FS:500,12000|WCO:0,0,-10|Ov:100,50,110|Ln:42|Bf:15,128>").unwrap();
        assert_eq!(status.state, MachineState::Run);
        assert_eq!(status.machine_position, Some(Point::new(1.0, -2.5, 3.0)));
        assert_eq!(status.work_offset, Some(Point::new(0.0, 0.0, -10.0)));
        assert_eq!(status.feed_and_speed, Some(FeedSpeed { feed: 500.0, speed: 12000.0 }));
        assert_eq!(status.overrides, Some(Overrides { feed: 100, rapid: 50, spindle: 110 }));
        assert_eq!(status.line_in_execution, Some(42));
        assert_eq!(status.buffer, Some(BufferCredit { blocks: 15, bytes: Some(128) }));
    }

    #[test]
    fn sub_state_is_stripped() {
        let status = parse_status("<Hold:0|MPos:0,0,0>").unwrap();
        assert_eq!(status.state, MachineState::Hold);
        assert_eq!(status.sub_state, Some(0));
    }

    #[test]
    fn dwell_promotes_idle_to_run() {
        let status = parse_status("<Idle|MPos:0,0,0|Dwell:1.5,3>").unwrap();
        assert_eq!(status.state, MachineState::Run);
        assert_eq!(status.dwell_total, Some(3.0));
        let finished = parse_status("<Idle|MPos:0,0,0|Dwell:0,3>").unwrap();
        assert_eq!(finished.state, MachineState::Idle);
    }

    #[test]
    fn unknown_keys_are_retained() {
        let status = parse_status("<Idle|MPos:0,0,0|Pn:XZ|A:SF>").unwrap();
        assert_eq!(status.extras.get("Pn").map(String::as_str), Some("XZ"));
        assert_eq!(status.extras.get("A").map(String::as_str), Some("SF"));
    }

    #[test]
    fn malformed_telegrams_are_discarded() {
        assert!(parse_status("<Idle|MPos:0,0,0").is_none());
        assert!(parse_status("<Idle|MPos:0,abc,0>").is_none());
        assert!(parse_status("<Flying|MPos:0,0,0>").is_none());
        assert!(parse_status("ok").is_none());
        assert!(matches!(classify_response("<Idle|MPos:x>"), ControllerResponse::Other(_)));
    }

    #[test]
    fn classifies_every_line_kind() {
        assert_eq!(classify_response("ok"), ControllerResponse::Ok);
        assert_eq!(
            classify_response("error:20"),
            ControllerResponse::Error { code: Some(20), message: "Unsupported command".into() }
        );
        assert_eq!(
            classify_response("Error: bad thing"),
            ControllerResponse::Error { code: None, message: "Error: bad thing".into() }
        );
        assert_eq!(
            classify_response("ALARM:1"),
            ControllerResponse::Alarm { code: Some(1), message: "Hard limit triggered".into() }
        );
        assert_eq!(
            classify_response("[G55:10.000,20.000,-5.000]"),
            ControllerResponse::Offset { id: OffsetId::G55, point: Point::new(10.0, 20.0, -5.0) }
        );
        assert_eq!(
            classify_response("[GC:G0 G54 G17 G21 G90 G94 M5 M9 T0 F0 S0]"),
            ControllerResponse::ModalState(
                "G0 G54 G17 G21 G90 G94 M5 M9 T0 F0 S0".split(' ').map(String::from).collect()
            )
        );
        assert!(matches!(classify_response("Grbl 1.1h ['$' for help]"), ControllerResponse::Welcome(_)));
        assert_eq!(classify_response("[MSG:Caution: Unlocked]"), ControllerResponse::Message("MSG:Caution: Unlocked".into()));
        assert_eq!(classify_response("$10=1"), ControllerResponse::Other("$10=1".into()));
    }

    #[test]
    fn message_tables_cover_published_codes() {
        assert_eq!(error_message(1), Some("Expected command letter"));
        assert_eq!(error_message(38), Some("Tool number out of range"));
        assert_eq!(error_message(0), None);
        assert_eq!(error_message(39), None);
        assert_eq!(alarm_message(9), Some("Homing fail: limit switch not found"));
    }
}
