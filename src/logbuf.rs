//! Bounded line buffer for captured process output
//!
//! Each managed process owns one [`LogBuffer`]. The output-streaming tasks
//! append to it while HTTP handlers read from it, so every operation takes
//! the internal lock for the shortest possible time.

use parking_lot::Mutex;
use std::collections::VecDeque;

/// Default number of lines kept per process
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// FIFO ring of text lines; the oldest line is evicted once capacity is reached.
#[derive(Debug)]
pub struct LogBuffer {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl LogBuffer {
    /// Create a buffer holding at most `capacity` lines (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Split `data` on newlines and append every non-empty line.
    ///
    /// Invalid UTF-8 is replaced rather than rejected. Returns the number of
    /// bytes consumed, which is always `data.len()`.
    pub fn write(&self, data: &[u8]) -> usize {
        let text = String::from_utf8_lossy(data);
        let mut lines = self.lines.lock();
        for line in text.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() {
                continue;
            }
            if lines.len() == self.capacity {
                lines.pop_front();
            }
            lines.push_back(line.to_string());
        }
        data.len()
    }

    /// Independent copy of the buffered lines, oldest first.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }

    /// The last `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let lines = self.lines.lock();
        let skip = lines.len().saturating_sub(n);
        lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }
}
