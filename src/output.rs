//! Output buffering for instance logs.
//!
//! Each instance gets one `LogBuffer` shared by its stdout and stderr, so the
//! retained history interleaves both streams in arrival order.

use std::collections::VecDeque;
use std::fmt;

use strip_ansi_escapes::strip;

/// Indicates the source stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Stdout => write!(f, "stdout"),
            StreamKind::Stderr => write!(f, "stderr"),
        }
    }
}

/// A fixed-capacity ring buffer of log lines.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    max_lines: usize,
    lines: VecDeque<String>,
}

impl LogBuffer {
    /// Creates a new `LogBuffer` with the specified maximum capacity.
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            lines: VecDeque::with_capacity(max_lines.min(1024)),
        }
    }

    /// Adds a line to the buffer, dropping the oldest lines beyond capacity.
    pub fn push(&mut self, line: String) {
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    /// Copies the retained lines, oldest first.
    pub fn to_vec(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

/// Sanitizes text for display, optionally stripping ANSI escape codes.
///
/// If `strip_ansi` is true, ANSI codes are removed. Invalid UTF-8 sequences are replaced.
pub fn sanitize_text(text: &str, strip_ansi: bool) -> String {
    if !strip_ansi {
        return text.to_string();
    }
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}

/// Decodes one raw line read from a pipe.
pub fn decode_line(mut bytes: Vec<u8>) -> String {
    if bytes.last() == Some(&b'\r') {
        bytes.pop();
    }
    match String::from_utf8(bytes) {
        Ok(line) => line,
        Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_buffer_drops_oldest() {
        let mut buffer = LogBuffer::new(2);
        buffer.push("a".into());
        buffer.push("b".into());
        buffer.push("c".into());
        assert_eq!(buffer.to_vec(), vec!["b", "c"]);
    }

    #[test]
    fn log_buffer_keeps_most_recent_thousand() {
        let mut buffer = LogBuffer::new(1000);
        for i in 0..1500 {
            buffer.push(format!("line {i}"));
        }
        let lines = buffer.to_vec();
        assert_eq!(lines.len(), 1000);
        assert_eq!(lines[0], "line 500");
        assert_eq!(lines[999], "line 1499");
    }

    #[test]
    fn sanitize_strips_ansi() {
        assert_eq!(sanitize_text("\u{1b}[31mred\u{1b}[0m", true), "red");
        assert_eq!(sanitize_text("\u{1b}[31mred", false), "\u{1b}[31mred");
    }

    #[test]
    fn decode_line_is_lossy_and_trims_cr() {
        assert_eq!(decode_line(b"hello\r".to_vec()), "hello");
        assert_eq!(decode_line(vec![b'a', 0xff, b'b']), "a\u{fffd}b");
    }
}
