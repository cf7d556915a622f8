//! The loaded program and the one send run active against it.

use chrono::{DateTime, Utc};
use millstream_shared::gcode::{line_number_tag, strip_line_number};
use millstream_shared::{CommandRecord, GCodeParser, OffsetId, OffsetTable, add_line_numbers, clean_gcode_text, parse};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a session is streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferType {
    Program,
    Reverse,
    Resume,
}

/// Program text as loaded, plus its parsed records.
#[derive(Debug, Clone, Default)]
pub struct ProgramStore {
    lines: Vec<String>,
    records: Vec<CommandRecord>,
}

impl ProgramStore {
    /// Cleans and numbers `text`, then parses it against `offsets`.
    pub fn load(text: &str, offsets: &OffsetTable, active: OffsetId) -> Self {
        let numbered = add_line_numbers(&clean_gcode_text(text));
        let lines: Vec<String> = numbered.lines().map(str::to_string).collect();
        let records = parse(&lines, offsets, active);
        tracing::info!("Loaded program: {} lines, {} moves", lines.len(), records.iter().filter(|r| r.has_move).count());
        Self { lines, records }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn records(&self) -> &[CommandRecord] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn record_index(&self, line_number: u32) -> Option<usize> {
        self.records.iter().position(|r| r.line_number == line_number)
    }
}

/// Mutable state of one forward or reversed run.
#[derive(Debug, Clone)]
pub struct StreamingSession {
    pub id: Uuid,
    pub buffer_type: BufferType,
    pub program: Vec<String>,
    /// `N` tag of each program line. Preamble lines carry none.
    pub line_numbers: Vec<Option<u32>>,
    pub next_line_index: usize,
    pub acknowledged_count: usize,
    pub selected_line: Option<u32>,
    pub started_at: DateTime<Utc>,
    cursor_index: Option<usize>,
    motion_count: usize,
    last_motion_index: Option<usize>,
}

impl StreamingSession {
    pub fn new(program: Vec<String>, buffer_type: BufferType) -> Self {
        let line_numbers = program.iter().map(|line| line_number_tag(line)).collect();

        // Motion detection only; offsets do not matter here.
        let mut parser = GCodeParser::new(OffsetTable::new(), OffsetId::G54);
        let motion: Vec<usize> = program
            .iter()
            .enumerate()
            .filter(|(_, line)| parser.parse_line(line).is_some_and(|r| r.has_move))
            .map(|(i, _)| i)
            .collect();

        Self {
            id: Uuid::new_v4(),
            buffer_type,
            program,
            line_numbers,
            next_line_index: 0,
            acknowledged_count: 0,
            selected_line: None,
            started_at: Utc::now(),
            cursor_index: None,
            motion_count: motion.len(),
            last_motion_index: motion.last().copied(),
        }
    }

    pub fn len(&self) -> usize {
        self.program.len()
    }

    pub fn is_empty(&self) -> bool {
        self.program.is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.next_line_index - self.acknowledged_count
    }

    pub fn all_sent(&self) -> bool {
        self.next_line_index >= self.program.len()
    }

    /// Index of the line the controller is believed to be executing. Falls back
    /// to the last acknowledged line until the controller reports `Ln`.
    pub fn execution_index(&self) -> usize {
        self.cursor_index.unwrap_or_else(|| self.acknowledged_count.saturating_sub(1))
    }

    /// Moves the cursor to the first sent line at or after the current cursor
    /// carrying `line_number`. Reversed programs repeat numbers, hence the
    /// forward-only search.
    pub fn observe_line(&mut self, line_number: u32) {
        self.selected_line = Some(line_number);
        let from = self.cursor_index.unwrap_or(0);
        let found = self.line_numbers[..self.next_line_index.min(self.line_numbers.len())]
            .iter()
            .enumerate()
            .skip(from)
            .find(|(_, n)| **n == Some(line_number))
            .map(|(i, _)| i);
        if let Some(index) = found {
            self.cursor_index = Some(index);
        }
    }

    /// Counts an acknowledgement. Acks never run ahead of the lines sent.
    pub fn acknowledge(&mut self) -> bool {
        if self.acknowledged_count < self.next_line_index {
            self.acknowledged_count += 1;
            true
        } else {
            false
        }
    }

    pub fn is_complete(&self) -> bool {
        if !self.all_sent() {
            return false;
        }
        match self.last_motion_index {
            Some(last) if self.motion_count >= 2 => self.execution_index() >= last,
            _ => true,
        }
    }

    /// Text of the line at `index` without its `N` tag.
    pub fn body(&self, index: usize) -> Option<&str> {
        self.program.get(index).map(|l| strip_line_number(l))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(lines: &[&str]) -> StreamingSession {
        StreamingSession::new(lines.iter().map(|s| s.to_string()).collect(), BufferType::Program)
    }

    #[test]
    fn line_numbers_come_from_tags() {
        let s = session(&["N10 G21", "G90", "N30 G0 X1"]);
        assert_eq!(s.line_numbers, vec![Some(10), None, Some(30)]);
    }

    #[test]
    fn cursor_only_moves_forward_over_sent_lines() {
        let mut s = session(&["N2 G1 X1", "N2 G3 X0 Y0 I1", "N1 G1 X0"]);
        s.next_line_index = 2;
        s.observe_line(2);
        assert_eq!(s.execution_index(), 0);
        s.observe_line(1);
        assert_eq!(s.execution_index(), 0, "line 1 is not sent yet");
        assert_eq!(s.selected_line, Some(1));
    }

    #[test]
    fn completion_waits_for_the_last_move() {
        let mut s = session(&["N1 G21", "N2 G1 X1 F100", "N3 G1 X2", "N4 M5"]);
        s.next_line_index = 4;
        assert!(!s.is_complete());
        s.observe_line(3);
        assert!(s.is_complete());
    }

    #[test]
    fn short_programs_complete_once_sent() {
        let mut s = session(&["N1 G21", "N2 G0 X1"]);
        s.next_line_index = 2;
        assert!(s.is_complete());
    }

    #[test]
    fn acknowledgements_are_clamped() {
        let mut s = session(&["G0 X1", "G0 X2"]);
        assert!(!s.acknowledge());
        s.next_line_index = 1;
        assert!(s.acknowledge());
        assert!(!s.acknowledge());
        assert_eq!(s.in_flight(), 0);
    }
}
