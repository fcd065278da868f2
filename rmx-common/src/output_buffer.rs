//! Job output with carriage-return rewrites and resumable reads.
//!
//! The buffer is a plain state machine; `rmxd` wraps it in a lock and a
//! condition variable so one poller can append while sessions read.
//!
//! A `\r` discards the partially drawn current line before being stored
//! itself, so a progress bar that redraws itself a thousand times costs one
//! line of memory. Readers hold a [`Cursor`]; when the line they were
//! watching has been redrawn since their last read, they get the whole
//! current line again rather than a meaningless tail of it.

use serde::{Deserialize, Serialize};

/// A reader's bookmark. Opaque to everyone but the buffer that issued it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub line: u64,
    pub line_version: u64,
    pub index: usize,
}

#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    value: String,
    /// Byte offset just past the most recent `\n`.
    last_newline: usize,
    line: u64,
    /// Rewrites of the current line since it started.
    line_version: u64,
    total_appended: u64,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, c: char) {
        match c {
            '\r' => {
                self.value.truncate(self.last_newline);
                self.line_version += 1;
                self.value.push(c);
            }
            '\n' => {
                self.value.push(c);
                self.last_newline = self.value.len();
                self.line_version = 0;
                self.line += 1;
            }
            _ => self.value.push(c),
        }
        self.total_appended += 1;
    }

    pub fn append_str(&mut self, text: &str) {
        for c in text.chars() {
            self.append(c);
        }
    }

    /// Everything new for `cursor`, and the cursor to present next time.
    pub fn read(&self, cursor: &Cursor) -> (String, Cursor) {
        let stale_line = cursor.line == self.line && cursor.line_version < self.line_version;
        let start = if stale_line {
            self.last_newline
        } else {
            cursor.index
        };
        // A cursor from another buffer (or a corrupted one) restarts at the
        // current line instead of panicking on a bad slice.
        let text = self
            .value
            .get(start..)
            .or_else(|| self.value.get(self.last_newline..))
            .unwrap_or_default()
            .to_string();
        (text, self.cursor())
    }

    /// The cursor of a reader that has seen everything.
    pub fn cursor(&self) -> Cursor {
        Cursor {
            line: self.line,
            line_version: self.line_version,
            index: self.value.len(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Whether anything was ever appended, even if rewrites erased it since.
    pub fn has_output(&self) -> bool {
        self.total_appended > 0
    }

    pub fn lines_completed(&self) -> u64 {
        self.line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(text: &str) -> OutputBuffer {
        let mut buf = OutputBuffer::new();
        buf.append_str(text);
        buf
    }

    #[test]
    fn test_fresh_read_returns_everything() {
        let buf = buffer("hello\nworld");
        let (text, cursor) = buf.read(&Cursor::default());
        assert_eq!(text, "hello\nworld");
        assert_eq!(cursor, Cursor { line: 1, line_version: 0, index: 11 });
    }

    #[test]
    fn test_incremental_reads_are_contiguous() {
        let mut buf = OutputBuffer::new();
        let mut cursor = Cursor::default();
        let mut seen = String::new();
        for chunk in ["a", "bc\n", "", "def", "\ng"] {
            buf.append_str(chunk);
            let (text, next) = buf.read(&cursor);
            seen.push_str(&text);
            cursor = next;
        }
        assert_eq!(seen, "abc\ndef\ng");
        assert_eq!(buf.read(&cursor).0, "");
    }

    #[test]
    fn test_rewrite_then_newline_between_reads() {
        let mut buf = buffer("ab");
        let (_, cursor) = buf.read(&Cursor::default());
        buf.append_str("\rX\n");

        // The reader moved off the rewritten line, so no rewind applies.
        let (text, cursor) = buf.read(&cursor);
        assert_eq!(text, "\n");
        assert_eq!(cursor.line, 1);

        buf.append_str("next\n");
        assert_eq!(buf.read(&cursor).0, "next\n");
        assert_eq!(buf.read(&Cursor::default()).0, "\rX\nnext\n");
    }

    #[test]
    fn test_carriage_return_discards_current_line() {
        let buf = buffer("ab\rcd\n");
        assert_eq!(buf.as_str(), "\rcd\n");
        // Replay keeps the control character so a terminal redraws correctly.
        assert_eq!(buf.read(&Cursor::default()).0, "\rcd\n");
    }

    #[test]
    fn test_carriage_return_keeps_previous_lines() {
        let buf = buffer("done\n10%\r20%\r30%");
        assert_eq!(buf.as_str(), "done\n\r30%");
        assert_eq!(buf.lines_completed(), 1);
    }

    #[test]
    fn test_stale_reader_gets_whole_rewritten_line() {
        let mut buf = buffer("log\nab");
        let (first, cursor) = buf.read(&Cursor::default());
        assert_eq!(first, "log\nab");

        buf.append_str("\rcd");
        let (text, cursor) = buf.read(&cursor);
        // From the start of the line, not the tail past the old index.
        assert_eq!(text, "\rcd");
        assert_eq!(cursor.line_version, 1);

        buf.append_str("e");
        assert_eq!(buf.read(&cursor).0, "e");
    }

    #[test]
    fn test_reader_from_previous_line_is_not_rewound() {
        let mut buf = buffer("ab");
        let (_, cursor) = buf.read(&Cursor::default());
        buf.append_str("\n\rx");
        let (text, _) = buf.read(&cursor);
        assert_eq!(text, "\n\rx");
    }

    #[test]
    fn test_independent_cursors() {
        let mut buf = buffer("one\n");
        let (_, early) = buf.read(&Cursor::default());
        buf.append_str("two\n");
        assert_eq!(buf.read(&early).0, "two\n");
        assert_eq!(buf.read(&Cursor::default()).0, "one\ntwo\n");
    }

    #[test]
    fn test_out_of_range_cursor_restarts_at_line() {
        let buf = buffer("a\nbc");
        let bogus = Cursor { line: 0, line_version: 0, index: 999 };
        assert_eq!(buf.read(&bogus).0, "bc");
    }

    #[test]
    fn test_has_output_survives_rewrites() {
        let buf = buffer("x\r");
        assert_eq!(buf.as_str(), "\r");
        assert!(buf.has_output());
        assert!(!OutputBuffer::new().has_output());
    }

    #[test]
    fn test_multibyte_characters() {
        let mut buf = buffer("héllo ");
        let (_, cursor) = buf.read(&Cursor::default());
        buf.append_str("wörld");
        assert_eq!(buf.read(&cursor).0, "wörld");
    }
}
