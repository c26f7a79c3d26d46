//! Streaming log sinks.
//!
//! Every stage line goes to a [`LogSink`]. Families run concurrently, so each
//! implementation serializes its own writes.

use parking_lot::Mutex;
use std::io::Write;

pub trait LogSink: Send + Sync {
    fn write(&self, line: &str);
}

/// Writes lines to stdout.
#[derive(Debug, Default)]
pub struct StdoutSink {
    lock: Mutex<()>,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogSink for StdoutSink {
    fn write(&self, line: &str) {
        let _guard = self.lock.lock();
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{}", line);
    }
}

/// Keeps lines in memory for inspection.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|l| l.contains(needle))
    }
}

impl LogSink for MemorySink {
    fn write(&self, line: &str) {
        self.lines.lock().push(line.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_sink_memory_records_in_order() {
        let sink = MemorySink::new();
        sink.write("a");
        sink.write("b");
        assert_eq!(sink.lines(), vec!["a", "b"]);
        assert!(sink.contains("b"));
        assert!(!sink.contains("c"));
    }

    #[test]
    fn test_sink_concurrent_writers() {
        let sink = Arc::new(MemorySink::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let sink = sink.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        sink.write(&format!("{}-{}", t, i));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(sink.lines().len(), 200);
    }
}
