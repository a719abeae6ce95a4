use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use crate::{
    constants::{CONSOLE_INPUT_LINE_END, CONSOLE_INPUT_LINE_START},
    core::console::{BoundedWriter, ConsoleInterrupt},
};

/// Replays a pre-supplied list of input lines.
///
/// Every consumed line is announced on the output as `[ConsoleInputLine_{i}]`.
/// The input itself is not echoed.
#[derive(Clone, Debug)]
pub struct ReplayReader {
    lines: Arc<[String]>,
    cursor: Arc<AtomicUsize>,
}

pub fn input_marker(index: usize) -> String {
    format!("{}{}{}", CONSOLE_INPUT_LINE_START, index, CONSOLE_INPUT_LINE_END)
}

impl ReplayReader {
    pub fn new(lines: Vec<String>) -> Self {
        Self {
            lines: lines.into(),
            cursor: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn read_line(&self, out: &BoundedWriter) -> Result<String, ConsoleInterrupt> {
        let index = self.cursor.load(Ordering::SeqCst);
        let Some(line) = self.lines.get(index) else {
            tracing::debug!(consumed = index, "replay input exhausted");
            return Err(ConsoleInterrupt::InputRequested);
        };

        out.write_line(&input_marker(index))?;
        self.cursor.store(index + 1, Ordering::SeqCst);

        Ok(line.clone())
    }

    pub fn read_char(&self) -> Result<char, ConsoleInterrupt> {
        Err(ConsoleInterrupt::ReadCharUnsupported)
    }

    pub fn consumed(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }

    pub fn remaining(&self) -> usize {
        self.lines.len().saturating_sub(self.consumed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_format() {
        assert_eq!(input_marker(0), "[ConsoleInputLine_0]");
        assert_eq!(input_marker(12), "[ConsoleInputLine_12]");
    }

    #[test]
    fn test_lines_replayed_in_order_with_markers() {
        let out = BoundedWriter::new(1024);
        let reader = ReplayReader::new(vec!["Mike".to_string(), "42".to_string()]);

        assert_eq!(reader.read_line(&out).unwrap(), "Mike");
        out.write_line("next").unwrap();
        assert_eq!(reader.read_line(&out).unwrap(), "42");

        assert_eq!(
            out.contents(),
            "[ConsoleInputLine_0]\nnext\n[ConsoleInputLine_1]\n"
        );
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_exhausted_input_requests_more() {
        let out = BoundedWriter::new(1024);
        let reader = ReplayReader::new(vec!["only".to_string()]);

        reader.read_line(&out).unwrap();

        assert!(matches!(
            reader.read_line(&out),
            Err(ConsoleInterrupt::InputRequested)
        ));
        assert_eq!(out.contents(), "[ConsoleInputLine_0]\n");
    }

    #[test]
    fn test_empty_input_requests_immediately() {
        let out = BoundedWriter::new(1024);
        let reader = ReplayReader::new(Vec::new());

        assert!(matches!(
            reader.read_line(&out),
            Err(ConsoleInterrupt::InputRequested)
        ));
        assert!(out.contents().is_empty());
    }

    #[test]
    fn test_marker_counts_towards_output_capacity() {
        let out = BoundedWriter::new(5);
        let reader = ReplayReader::new(vec!["x".to_string()]);

        assert!(matches!(
            reader.read_line(&out),
            Err(ConsoleInterrupt::LimitExceeded(_))
        ));
        assert_eq!(reader.consumed(), 0);
    }

    #[test]
    fn test_read_char_is_unsupported() {
        let reader = ReplayReader::new(vec!["abc".to_string()]);

        assert!(matches!(
            reader.read_char(),
            Err(ConsoleInterrupt::ReadCharUnsupported)
        ));
        assert_eq!(reader.consumed(), 0);
    }
}
