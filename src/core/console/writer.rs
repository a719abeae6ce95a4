use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::{console::ConsoleInterrupt, domain::LimitKind};

/// Output sink with a fixed character capacity.
///
/// Once a write would exceed the capacity the writer keeps the prefix that fits,
/// reports [`LimitKind::CodeOutput`] and refuses every later write.
#[derive(Clone, Debug)]
pub struct BoundedWriter {
    inner: Arc<Mutex<WriterState>>,
}

#[derive(Debug)]
struct WriterState {
    buffer: String,
    chars: usize,
    capacity: usize,
    overflowed: bool,
}

impl BoundedWriter {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(WriterState {
                buffer: String::new(),
                chars: 0,
                capacity,
                overflowed: false,
            })),
        }
    }

    pub fn write(&self, text: &str) -> Result<(), ConsoleInterrupt> {
        let mut state = self.inner.lock();
        if state.overflowed {
            return Err(ConsoleInterrupt::LimitExceeded(LimitKind::CodeOutput));
        }

        let incoming = text.chars().count();
        if state.chars + incoming <= state.capacity {
            state.buffer.push_str(text);
            state.chars += incoming;
            return Ok(());
        }

        let room = state.capacity - state.chars;
        let end = text
            .char_indices()
            .nth(room)
            .map(|(idx, _)| idx)
            .unwrap_or(text.len());
        state.buffer.push_str(&text[..end]);
        state.chars = state.capacity;
        state.overflowed = true;
        tracing::debug!(capacity = state.capacity, "console output capacity exceeded");

        Err(ConsoleInterrupt::LimitExceeded(LimitKind::CodeOutput))
    }

    pub fn write_line(&self, text: &str) -> Result<(), ConsoleInterrupt> {
        self.write(text)?;
        self.write("\n")
    }

    pub fn contents(&self) -> String {
        self.inner.lock().buffer.clone()
    }

    pub fn char_count(&self) -> usize {
        self.inner.lock().chars
    }

    pub fn overflowed(&self) -> bool {
        self.inner.lock().overflowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_within_capacity() {
        let writer = BoundedWriter::new(16);

        writer.write("Hello").unwrap();
        writer.write_line(", World").unwrap();

        assert_eq!(writer.contents(), "Hello, World\n");
        assert_eq!(writer.char_count(), 13);
        assert!(!writer.overflowed());
    }

    #[test]
    fn test_exact_capacity_is_allowed() {
        let writer = BoundedWriter::new(5);

        assert!(writer.write("12345").is_ok());
        assert!(matches!(
            writer.write("6"),
            Err(ConsoleInterrupt::LimitExceeded(LimitKind::CodeOutput))
        ));
    }

    #[test]
    fn test_single_large_write_keeps_prefix() {
        let writer = BoundedWriter::new(4);

        let result = writer.write("abcdefgh");

        assert!(matches!(
            result,
            Err(ConsoleInterrupt::LimitExceeded(LimitKind::CodeOutput))
        ));
        assert_eq!(writer.contents(), "abcd");
    }

    #[test]
    fn test_many_small_writes_overflow_the_same_way() {
        let writer = BoundedWriter::new(10);

        let first_failure = (0..20).position(|_| writer.write("x").is_err());

        assert_eq!(first_failure, Some(10));
        assert_eq!(writer.contents(), "x".repeat(10));
    }

    #[test]
    fn test_writes_after_overflow_keep_failing() {
        let writer = BoundedWriter::new(2);
        let _ = writer.write("abc");

        assert!(writer.write("").is_err());
        assert!(writer.write("d").is_err());
        assert_eq!(writer.contents(), "ab");
    }

    #[test]
    fn test_capacity_counts_chars_not_bytes() {
        let writer = BoundedWriter::new(3);

        assert!(writer.write("ёжи").is_ok());
        assert!(writer.write("й").is_err());
        assert_eq!(writer.contents(), "ёжи");
    }
}
