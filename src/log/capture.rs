use super::{LogLevel, Logger};
use std::fmt::Arguments;
use std::sync::{Mutex, PoisonError};

/// Records every message for assertions in tests.
#[derive(Debug, Default)]
pub struct CapturingLogger {
    records: Mutex<Vec<(LogLevel, String)>>,
}

impl CapturingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<(LogLevel, String)> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Messages at `level` containing `needle`.
    pub fn count(&self, level: LogLevel, needle: &str) -> usize {
        self.records()
            .iter()
            .filter(|(l, msg)| *l == level && msg.contains(needle))
            .count()
    }
}

impl Logger for CapturingLogger {
    fn log(&self, level: LogLevel, args: Arguments<'_>) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((level, args.to_string()));
    }
}
