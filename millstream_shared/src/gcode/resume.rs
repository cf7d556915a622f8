//! Forward resume: restart a program part-way with its modal state restored.

use crate::gcode::modal::ActiveModal;
use crate::gcode::text::strip_comments;
use crate::types::{CommandRecord, ModalState};

/// Four decimals, trailing zeros trimmed, `-0` printed as `0`.
pub(crate) fn format_value(value: f64) -> String {
    let text = format!("{value:.4}");
    let text = text.trim_end_matches('0').trim_end_matches('.');
    if text == "-0" { "0".to_string() } else { text.to_string() }
}

/// Lines that put the controller into `modal`: the modal words on one line,
/// then spindle/coolant commands, then the sticky feed rate.
pub fn modal_preamble(modal: &ModalState) -> Vec<String> {
    let mut out = vec![ActiveModal::from(modal).words().join(" ")];
    for aux in &modal.active_aux_commands {
        if matches!(aux.as_str(), "M3" | "M4") && modal.spindle_speed > 0.0 {
            out.push(format!("{aux} S{}", format_value(modal.spindle_speed)));
        } else {
            out.push(aux.clone());
        }
    }
    if modal.feed_rate > 0.0 {
        out.push(format!("F{}", format_value(modal.feed_rate)));
    }
    out
}

/// Returns the preamble for `from_line` followed by the program from that line on.
///
/// `lines` is the program text the records were parsed from; blank and
/// comment-only lines are skipped when matching records to lines. The preamble
/// reflects the state in effect *before* `from_line` runs. Returns `None` when
/// no record carries `from_line`.
pub fn resume_program<S: AsRef<str>>(records: &[CommandRecord], lines: &[S], from_line: u32) -> Option<Vec<String>> {
    let index = records.iter().position(|r| r.line_number == from_line)?;
    let modal = match index {
        0 => ModalState {
            active_work_offset: records[0].modal.active_work_offset,
            ..ModalState::default()
        },
        _ => records[index - 1].modal.clone(),
    };

    let mut out = modal_preamble(&modal);
    let mut seen = 0usize;
    let tail = lines.iter().map(AsRef::<str>::as_ref).skip_while(|line| {
        if strip_comments(line).trim().is_empty() {
            return true;
        }
        seen += 1;
        seen <= index
    });
    out.extend(tail.map(|line| line.trim().to_string()).filter(|l| !l.is_empty()));
    Some(out)
}
