//! Shared helpers for integration tests: a `log` backend that records
//! every line so tests can assert on harness output.

#![allow(dead_code)]

use std::string::String;
use std::sync::{Mutex, Once};
use std::vec::Vec;

use log::{Level, LevelFilter, Log, Metadata, Record};

struct CaptureLogger {
    lines: Mutex<Vec<(Level, String)>>,
}

impl Log for CaptureLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let line = format!("{}", record.args());
        if let Ok(mut lines) = self.lines.lock() {
            lines.push((record.level(), line));
        }
    }

    fn flush(&self) {}
}

static LOGGER: CaptureLogger = CaptureLogger {
    lines: Mutex::new(Vec::new()),
};
static INIT: Once = Once::new();

/// Install the capturing logger. Safe to call from every test.
pub fn init_logger() {
    INIT.call_once(|| {
        log::set_logger(&LOGGER).expect("logger already set");
        log::set_max_level(LevelFilter::Trace);
    });
}

/// Captured lines containing `needle`, at any level.
///
/// Tests share one logger, so needles should include a symbol name unique
/// to the test.
pub fn lines_containing(needle: &str) -> Vec<(Level, String)> {
    LOGGER
        .lines
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, line)| line.contains(needle))
        .cloned()
        .collect()
}

/// Number of captured lines at `level` containing every needle.
pub fn count_lines(level: Level, needles: &[&str]) -> usize {
    LOGGER
        .lines
        .lock()
        .unwrap()
        .iter()
        .filter(|(l, line)| *l == level && needles.iter().all(|n| line.contains(n)))
        .count()
}
