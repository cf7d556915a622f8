//! Text-to-text transforms applied to a program before it is parsed or streamed.

use crate::gcode::words::tokenize;

/// Removes `;` comments (to end of line) and `( ... )` comments.
/// An unterminated `(` comments out the rest of the line.
pub fn strip_comments(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut depth = 0usize;
    for c in line.chars() {
        match c {
            ';' if depth == 0 => break,
            '(' => depth += 1,
            ')' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

/// Drops a leading `N<digits>` tag and the whitespace after it.
pub fn strip_line_number(line: &str) -> &str {
    let trimmed = line.trim_start();
    let Some(rest) = trimmed.strip_prefix(['N', 'n']) else {
        return trimmed;
    };
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return trimmed;
    }
    rest[digits..].trim_start()
}

/// The value of a leading `N<digits>` tag, if the line has one.
pub fn line_number_tag(line: &str) -> Option<u32> {
    let rest = line.trim_start().strip_prefix(['N', 'n'])?;
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    rest[..digits].parse().ok()
}

fn is_blank_or_comment(line: &str) -> bool {
    strip_comments(line).trim().is_empty()
}

/// Prefixes every non-blank, non-comment line with a sequential `N<k>` tag,
/// replacing any tag already present. Running it twice yields the same text.
pub fn add_line_numbers(text: &str) -> String {
    let mut next = 0u32;
    text.lines()
        .map(|line| {
            if is_blank_or_comment(line) {
                return line.to_string();
            }
            next += 1;
            let body = strip_line_number(line.trim()).trim_end();
            if body.is_empty() {
                format!("N{next}")
            } else {
                format!("N{next} {body}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

const MODAL_PREFIX_CODES: [&str; 13] = [
    "G17", "G18", "G19", "G20", "G21", "G54", "G55", "G56", "G57", "G58", "G59", "G90", "G91",
];

/// Upper-cases, strips comments, collapses whitespace and drops blank lines.
///
/// A line that mixes `G53` with modal words (plane, units, work offset,
/// distance mode) is split in two: the modal words first, then the `G53`
/// move, so the one-line machine-coordinate mode never swallows a modal change.
pub fn clean_gcode_text(text: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    for line in text.lines() {
        let upper = line.to_ascii_uppercase();
        let stripped = strip_comments(&upper);
        let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            continue;
        }
        let words = tokenize(&collapsed);
        let has_g53 = words.iter().any(|w| w.is('G', 53.0));
        let is_modal = |code: &str| MODAL_PREFIX_CODES.contains(&code);
        if has_g53 && words.iter().any(|w| is_modal(&w.code())) {
            let (modal, motion): (Vec<_>, Vec<_>) =
                words.iter().partition(|w| w.letter == 'N' || is_modal(&w.code()));
            out.push(modal.iter().map(|w| w.raw).collect::<Vec<_>>().join(" "));
            out.push(motion.iter().map(|w| w.raw).collect::<Vec<_>>().join(" "));
        } else {
            out.push(collapsed);
        }
    }
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_are_removed() {
        assert_eq!(strip_comments("G1 X1 ; move"), "G1 X1 ");
        assert_eq!(strip_comments("G1 (fast) X1"), "G1  X1");
        assert_eq!(strip_comments("(header only"), "");
    }

    #[test]
    fn line_number_tags() {
        assert_eq!(line_number_tag("N120 G1 X1"), Some(120));
        assert_eq!(line_number_tag("n7G0"), Some(7));
        assert_eq!(line_number_tag("G1 N5"), None);
        assert_eq!(line_number_tag("N"), None);
    }

    #[test]
    fn numbering_skips_comments_and_blanks() {
        let numbered = add_line_numbers("G21\n\n; setup\nN40 G0 X1\nG1 X2");
        assert_eq!(numbered, "N1 G21\n\n; setup\nN2 G0 X1\nN3 G1 X2");
    }

    #[test]
    fn numbering_is_idempotent() {
        let text = clean_gcode_text("g90 g53 g0 z0 ; park\n(comment)\nN7G1 X5 F300\n\nM5\nN9");
        let once = add_line_numbers(&text);
        let twice = add_line_numbers(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn clean_splits_modal_words_off_machine_moves() {
        let cleaned = clean_gcode_text("G90 G53 G0 Z-5\nG53 G0 Z0\n  \ng1   x1 ;c");
        assert_eq!(cleaned, "G90\nG53 G0 Z-5\nG53 G0 Z0\nG1 X1");
    }

    #[test]
    fn clean_keeps_system_commands() {
        assert_eq!(clean_gcode_text("$h\n$X"), "$H\n$X");
    }

    #[test]
    fn strip_line_number_requires_digits() {
        assert_eq!(strip_line_number("N12 G1"), "G1");
        assert_eq!(strip_line_number("NOTE"), "NOTE");
    }
}
