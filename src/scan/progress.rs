//! Progress accounting with throttled reporting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::status::{Progress, StatusSink};

/// Reports on growth of the total, on completion, and otherwise at most once
/// per interval.
pub struct ProgressTracker {
    started:   Instant,
    interval:  Duration,
    scanned:   AtomicU64,
    total:     AtomicU64,
    last_emit: Mutex<Instant>,
}

impl ProgressTracker {
    pub fn new(interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            started:   now,
            interval,
            scanned:   AtomicU64::new(0),
            total:     AtomicU64::new(0),
            last_emit: Mutex::new(now),
        }
    }

    pub fn snapshot(&self) -> Progress {
        Progress {
            elapsed:       self.started.elapsed(),
            scanned_bytes: self.scanned.load(Ordering::Acquire),
            total_bytes:   self.total.load(Ordering::Acquire),
        }
    }

    /// A new input of `bytes` was discovered.
    pub fn grow_total(&self, bytes: u64, sink: &dyn StatusSink) {
        if bytes == 0 {
            return;
        }
        self.total.fetch_add(bytes, Ordering::AcqRel);
        self.emit(sink);
    }

    pub fn add_scanned(&self, bytes: u64, sink: &dyn StatusSink) {
        self.scanned.fetch_add(bytes, Ordering::AcqRel);
        let due = {
            let mut last = self.last_emit.lock();
            let due = last.elapsed() >= self.interval;
            if due {
                *last = Instant::now();
            }
            due
        };
        if due {
            sink.scan_progress(&self.snapshot());
        }
    }

    /// Report now, regardless of the interval.
    pub fn emit(&self, sink: &dyn StatusSink) {
        *self.last_emit.lock() = Instant::now();
        sink.scan_progress(&self.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Progress>>);

    impl StatusSink for Recorder {
        fn scan_progress(&self, p: &Progress) {
            self.0.lock().push(*p);
        }
    }

    #[test]
    fn growth_always_reports_scans_are_throttled() {
        let sink = Recorder::default();
        let t = ProgressTracker::new(Duration::from_secs(3600));
        t.grow_total(100, &sink);
        t.add_scanned(10, &sink);
        t.add_scanned(10, &sink);
        t.grow_total(0, &sink);
        assert_eq!(sink.0.lock().len(), 1);

        t.emit(&sink);
        let last = *sink.0.lock().last().unwrap();
        assert_eq!((last.scanned_bytes, last.total_bytes), (20, 100));
    }

    #[test]
    fn zero_interval_reports_every_step() {
        let sink = Recorder::default();
        let t = ProgressTracker::new(Duration::ZERO);
        t.add_scanned(1, &sink);
        t.add_scanned(1, &sink);
        assert_eq!(sink.0.lock().len(), 2);
    }
}
