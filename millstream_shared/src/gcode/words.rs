//! Word scanner: splits a comment-free line into `<letter><number>` words.

/// A single address word such as `G1`, `X-10.5` or `N120`.
#[derive(Debug, Clone, PartialEq)]
pub struct Word<'a> {
    pub letter: char,
    pub value: f64,
    /// The word as written, letter included.
    pub raw: &'a str,
}

impl Word<'_> {
    /// Normalized code form: `G01` -> `G1`, `G92.1` stays `G92.1`.
    pub fn code(&self) -> String {
        if self.value.fract() == 0.0 {
            format!("{}{}", self.letter, self.value as i64)
        } else {
            format!("{}{}", self.letter, self.value)
        }
    }

    pub fn is(&self, letter: char, value: f64) -> bool {
        self.letter == letter && (self.value - value).abs() < 1e-9
    }
}

/// Scans `line` into words. Works on spaced (`G1 X10`) and packed (`G1X10`) text.
///
/// Words whose number does not parse are dropped on their own; the rest of the
/// line is still scanned. Characters that cannot start a word are skipped.
pub fn tokenize(line: &str) -> Vec<Word<'_>> {
    let bytes = line.as_bytes();
    let mut words = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let c = bytes[pos] as char;
        if !c.is_ascii_alphabetic() {
            pos += 1;
            continue;
        }
        let start = pos;
        pos += 1;
        while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        let number_start = pos;
        while pos < bytes.len() && matches!(bytes[pos], b'0'..=b'9' | b'.' | b'+' | b'-') {
            pos += 1;
        }
        let number = &line[number_start..pos];
        match number.parse::<f64>() {
            Ok(value) if value.is_finite() => words.push(Word {
                letter: c.to_ascii_uppercase(),
                value,
                raw: line[start..pos].trim(),
            }),
            _ => tracing::trace!("skipping unparsable word '{}'", &line[start..pos]),
        }
    }
    words
}
