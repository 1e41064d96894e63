//! Scan status reporting.

use std::time::Duration;

use serde::Serialize;
use tracing::{error, info};

use crate::scan::ScanError;
use crate::tree::{NodeId, ResultTree};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub elapsed:       Duration,
    pub scanned_bytes: u64,
    pub total_bytes:   u64,
}

impl Progress {
    /// Scanned share of the bytes discovered so far, in `0.0..=1.0`.
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            1.0
        } else {
            self.scanned_bytes as f64 / self.total_bytes as f64
        }
    }
}

/// Receives scan events.  Called from worker threads.
pub trait StatusSink: Send + Sync {
    fn scan_started(&self) {}

    fn scan_finished(&self) {}

    fn scan_progress(&self, progress: &Progress) {
        let _ = progress;
    }

    /// `node` is the highest node published by one completed unit of work;
    /// everything below it is committed and consistent.
    fn scan_result(&self, tree: &ResultTree, node: NodeId) {
        let _ = (tree, node);
    }

    fn scan_exception(&self, error: &ScanError) {
        let _ = error;
    }
}

/// Ignores every event.
pub struct NullSink;

impl StatusSink for NullSink {}

/// Reports scan events through `tracing`.
pub struct LogSink;

impl StatusSink for LogSink {
    fn scan_started(&self) {
        info!("scan started");
    }

    fn scan_finished(&self) {
        info!("scan finished");
    }

    fn scan_progress(&self, p: &Progress) {
        info!(
            scanned = p.scanned_bytes,
            total   = p.total_bytes,
            elapsed_ms = p.elapsed.as_millis() as u64,
            "progress {:.1}%",
            p.fraction() * 100.0
        );
    }

    fn scan_exception(&self, e: &ScanError) {
        error!(error = %e, "scan error");
    }
}
