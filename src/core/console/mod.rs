//! Console redirection for user programs: bounded output and replayed input.

mod reader;
mod writer;

pub use reader::{ReplayReader, input_marker};
pub use writer::BoundedWriter;

use crate::core::domain::LimitKind;

/// Why a console operation stopped the user program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConsoleInterrupt {
    #[error("{0}")]
    LimitExceeded(LimitKind),
    #[error("console input requested")]
    InputRequested,
    #[error("single character reads are not supported")]
    ReadCharUnsupported,
}

/// The console a single run sees. Cheap to clone, all clones share state.
#[derive(Clone, Debug)]
pub struct Console {
    writer: BoundedWriter,
    reader: ReplayReader,
}

impl Console {
    pub fn new(output_capacity: usize, input: Vec<String>) -> Self {
        Self {
            writer: BoundedWriter::new(output_capacity),
            reader: ReplayReader::new(input),
        }
    }

    pub fn write(&self, text: &str) -> Result<(), ConsoleInterrupt> {
        self.writer.write(text)
    }

    pub fn write_line(&self, text: &str) -> Result<(), ConsoleInterrupt> {
        self.writer.write_line(text)
    }

    pub fn read_line(&self) -> Result<String, ConsoleInterrupt> {
        self.reader.read_line(&self.writer)
    }

    pub fn read_char(&self) -> Result<char, ConsoleInterrupt> {
        self.reader.read_char()
    }

    pub fn output(&self) -> String {
        self.writer.contents()
    }

    pub fn writer(&self) -> &BoundedWriter {
        &self.writer
    }

    pub fn reader(&self) -> &ReplayReader {
        &self.reader
    }
}
