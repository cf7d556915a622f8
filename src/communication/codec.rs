//! Inbound byte stream to logical lines.

use millstream_shared::status::ControllerResponse;
use millstream_shared::classify_response;

/// Longest line kept. Anything longer is noise on the wire and is dropped up
/// to the next newline.
pub const MAX_LINE_BYTES: usize = 4096;

/// Splits the stream on `\n` and drops the bare `ok` the controller sends
/// right after a status telegram, so the pair surfaces as one status line.
#[derive(Debug, Default)]
pub struct LineCodec {
    buffer: Vec<u8>,
    coalesce_status_ok: bool,
    after_status: bool,
    overflowed: bool,
}

impl LineCodec {
    pub fn new(coalesce_status_ok: bool) -> Self {
        Self { buffer: Vec::new(), coalesce_status_ok, after_status: false, overflowed: false }
    }

    /// Consumes `bytes` and returns every complete line. Partial input is kept
    /// for the next call. Empty lines are dropped, `\r` is trimmed.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in bytes {
            if byte != b'\n' {
                if self.overflowed {
                    continue;
                }
                if self.buffer.len() >= MAX_LINE_BYTES {
                    tracing::warn!("Dropping inbound line longer than {} bytes", MAX_LINE_BYTES);
                    self.buffer.clear();
                    self.overflowed = true;
                    continue;
                }
                self.buffer.push(byte);
                continue;
            }
            if std::mem::take(&mut self.overflowed) {
                continue;
            }
            let raw = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&raw).trim_end_matches('\r').trim().to_string();
            if line.is_empty() {
                continue;
            }
            if self.coalesce_status_ok && self.after_status && line == "ok" {
                self.after_status = false;
                tracing::trace!("coalesced ok after status telegram");
                continue;
            }
            self.after_status = matches!(classify_response(&line), ControllerResponse::Status(_));
            lines.push(line);
        }
        lines
    }

    /// Bytes received since the last complete line.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.after_status = false;
        self.overflowed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_across_reads() {
        let mut codec = LineCodec::new(true);
        assert!(codec.feed(b"o").is_empty());
        assert_eq!(codec.pending(), 1);
        assert_eq!(codec.feed(b"k\r\nerror:2"), vec!["ok"]);
        assert_eq!(codec.feed(b"0\r\n\r\n"), vec!["error:20"]);
    }

    #[test]
    fn ok_after_status_is_swallowed_once() {
        let mut codec = LineCodec::new(true);
        let lines = codec.feed(b"<Idle|MPos:0,0,0>\nok\nok\n");
        assert_eq!(lines, vec!["<Idle|MPos:0,0,0>", "ok"]);
    }

    #[test]
    fn coalescing_can_be_disabled() {
        let mut codec = LineCodec::new(false);
        let lines = codec.feed(b"<Idle|MPos:0,0,0>\nok\n");
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn only_a_directly_following_ok_is_dropped() {
        let mut codec = LineCodec::new(true);
        let lines = codec.feed(b"<Run|MPos:0,0,0>\n[GC:G0 G54]\nok\n");
        assert_eq!(lines, vec!["<Run|MPos:0,0,0>", "[GC:G0 G54]", "ok"]);
    }

    #[test]
    fn overlong_lines_are_dropped_to_the_next_newline() {
        let mut codec = LineCodec::new(true);
        let noise = vec![b'x'; MAX_LINE_BYTES + 100];
        assert!(codec.feed(&noise).is_empty());
        assert_eq!(codec.pending(), 0);
        assert!(codec.feed(b"tail of the noise\n").is_empty());
        assert_eq!(codec.feed(b"ok\n"), vec!["ok"]);
    }
}
