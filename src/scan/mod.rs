//! Scan coordinator.
//!
//! A scan is a set of region tasks run by a fixed pool of worker threads
//! fed from one channel.  A region task walks `[start, end)` of one input:
//!
//! - ask the matcher for candidates at the position and try them in order,
//! - on the first decode that yields data, move past it; if the result
//!   starts after the position, the skipped gap becomes a task of its own,
//! - if nothing decodes, step one byte; consecutive skipped bytes become
//!   one `data` node when the run ends,
//! - inputs decoded out of encoded spans become new tasks once their parent
//!   is committed.
//!
//! Tasks never wait on each other.  A live-task counter, raised on submit
//! and lowered when a task ends, detects completion: when it drops to zero
//! the channel is closed, the workers exit and the sink hears
//! `scan_finished`.

pub mod progress;

use std::io;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheError, DecodeCache};
use crate::config::{ConfigError, ScanConfig};
use crate::format::{DecodeError, FormatPlugin, FormatSet, RawData};
use crate::input::{InputRange, RangeReader};
use crate::matcher::FormatMatcher;
use crate::session::{DecodeContext, DecodeSession};
use crate::status::{Progress, StatusSink};
use crate::tree::{NodeId, NodeKey, NodeView, Origin, ResultTree, View};

use self::progress::ProgressTracker;

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("I/O error while scanning '{input}': {source}")]
    Io {
        input:  String,
        #[source]
        source: io::Error,
    },
    #[error("nested stream decode failed: {0}")]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot start scan worker: {0}")]
    Spawn(#[source] io::Error),
}

// ── Tasks ────────────────────────────────────────────────────────────────────

struct RegionTask {
    node:  NodeId,
    input: InputRange,
    start: u64,
    end:   u64,
    /// First pass over a whole input; enables trailer probing at 0.
    fresh: bool,
}

const RUNNING: u8 = 0;
const DRAINING: u8 = 1;
const CANCELLED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Every worker has exited.
    Stopped,
    /// Stop requested; the caller chose not to wait.
    Requested,
    /// Workers were still busy when the wait ran out.
    TimedOut,
}

// ── Shared state ─────────────────────────────────────────────────────────────

struct ScanShared {
    ctx:      DecodeContext,
    sink:     Arc<dyn StatusSink>,
    config:   ScanConfig,
    raw:      Arc<dyn FormatPlugin>,
    sender:   Mutex<Option<Sender<RegionTask>>>,
    live:     AtomicUsize,
    state:    AtomicU8,
    progress: ProgressTracker,
    done:     Mutex<bool>,
    done_cv:  Condvar,
}

/// Lowers the live count when a task ends, including by panic.
struct TaskGuard<'a>(&'a ScanShared);

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        self.0.task_ended();
    }
}

impl ScanShared {
    fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    fn submit(&self, task: RegionTask) {
        if self.state() != RUNNING {
            debug!(input = task.input.name(), start = task.start, end = task.end, "scan stopping, task dropped");
            return;
        }
        self.live.fetch_add(1, Ordering::AcqRel);
        let sent = match &*self.sender.lock() {
            Some(tx) => tx.send(task).is_ok(),
            None     => false,
        };
        if !sent {
            self.task_ended();
        }
    }

    fn task_ended(&self) {
        if self.live.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finish();
        }
    }

    fn finish(&self) {
        self.sender.lock().take();
        self.progress.emit(self.sink.as_ref());
        let p = self.progress.snapshot();
        info!(
            scanned    = p.scanned_bytes,
            total      = p.total_bytes,
            elapsed_ms = p.elapsed.as_millis() as u64,
            "scan complete"
        );
        self.sink.scan_finished();
        *self.done.lock() = true;
        self.done_cv.notify_all();
    }

    fn worker(&self, rx: Receiver<RegionTask>) {
        while let Ok(task) = rx.recv() {
            let _guard = TaskGuard(self);
            if self.state() == CANCELLED {
                continue;
            }
            let name = task.input.name().to_owned();
            if let Err(e) = self.scan_region(task) {
                error!(input = %name, error = %e, "input scan aborted");
                self.sink.scan_exception(&e);
            }
        }
    }

    fn scan_region(&self, task: RegionTask) -> Result<(), ScanError> {
        let io_err = |source: io::Error| ScanError::Io { input: task.input.name().to_owned(), source };
        let mut reader  = RangeReader::new(task.input.clone(), self.config.page_size);
        let mut matcher = FormatMatcher::new(Arc::clone(&self.ctx.formats));
        let mut pos     = task.start;
        let mut unknown: Option<u64> = None;

        while pos < task.end {
            if self.state() == CANCELLED {
                break;
            }
            let fresh = task.fresh && pos == 0;
            let candidates = matcher.candidates(&mut reader, pos, fresh).map_err(io_err)?;

            let mut decoded = None;
            for plugin in candidates {
                let mut session = DecodeSession::new(&self.ctx, &mut reader, &mut matcher, task.node, pos, task.end);
                match session.decode_composite(&plugin) {
                    Ok(node) => {
                        decoded = Some((node, session.position(), session.take_published(), session.take_pending()));
                        break;
                    }
                    Err(DecodeError::Io(source)) => return Err(io_err(source)),
                    Err(DecodeError::Cache(e)) => {
                        warn!(format = plugin.name(), position = pos, error = %e, "nested stream failed, trying next format");
                        self.sink.scan_exception(&ScanError::Cache(e));
                    }
                    Err(e) => {
                        debug!(format = plugin.name(), position = pos, error = %e, "candidate rejected");
                    }
                }
            }

            let Some((node, cursor, published, pending)) = decoded else {
                unknown.get_or_insert(pos);
                pos += 1;
                continue;
            };

            if let Some(from) = unknown.take() {
                self.commit_unknown(&task, from, pos);
            }
            let start = self.ctx.tree.start(node);
            // A relocated child can extend the node past the session cursor.
            let end = cursor.max(self.ctx.tree.end(node, View::Committed).unwrap_or(cursor));
            if start > pos {
                self.submit(RegionTask { node: task.node, input: task.input.clone(), start: pos, end: start, fresh: false });
            }
            for top in published {
                self.sink.scan_result(&self.ctx.tree, top);
            }
            for p in pending {
                self.progress.grow_total(p.input.len(), self.sink.as_ref());
                let end = p.input.len();
                self.submit(RegionTask { node: p.node, input: p.input, start: 0, end, fresh: true });
            }
            self.progress.add_scanned(end - start, self.sink.as_ref());
            pos = end;
        }

        if let Some(from) = unknown {
            self.commit_unknown(&task, from, pos);
        }
        Ok(())
    }

    /// Publish an unrecognized run as a `data` node.
    fn commit_unknown(&self, task: &RegionTask, start: u64, end: u64) {
        let tree = &self.ctx.tree;
        let node = tree.add_node(task.node, Origin::Format(Arc::clone(&self.raw)), start);
        if let Some(top) = tree.update_and_commit(node, Some(end), true) {
            self.sink.scan_result(tree, top);
        }
        self.progress.add_scanned(end - start, self.sink.as_ref());
    }
}

// ── Public entry point ───────────────────────────────────────────────────────

/// Handle to a running scan.  Dropping it stops the scan immediately.
pub struct ScanHandle {
    shared:  Arc<ScanShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Start scanning `input` with `formats` on a new worker pool.
pub fn scan(
    input:   InputRange,
    formats: Arc<FormatSet>,
    sink:    Arc<dyn StatusSink>,
    config:  ScanConfig,
) -> Result<ScanHandle, ScanError> {
    config.validate()?;
    let tree  = Arc::new(ResultTree::new(input.clone()));
    let cache = Arc::new(DecodeCache::new(config.cache_dir.clone(), config.write_chunk_size));
    let (tx, rx) = unbounded();

    let shared = Arc::new(ScanShared {
        ctx:      DecodeContext { tree: Arc::clone(&tree), cache, formats },
        sink,
        progress: ProgressTracker::new(config.progress_interval()),
        config,
        raw:      Arc::new(RawData),
        sender:   Mutex::new(Some(tx)),
        live:     AtomicUsize::new(0),
        state:    AtomicU8::new(RUNNING),
        done:     Mutex::new(false),
        done_cv:  Condvar::new(),
    });

    info!(
        input   = input.name(),
        bytes   = input.len(),
        formats = shared.ctx.formats.len(),
        workers = shared.config.workers,
        "scan started"
    );
    shared.sink.scan_started();

    let mut workers = Vec::with_capacity(shared.config.workers);
    for i in 0..shared.config.workers {
        let s  = Arc::clone(&shared);
        let rx = rx.clone();
        let spawned = thread::Builder::new()
            .name(format!("binscan-worker-{i}"))
            .spawn(move || s.worker(rx));
        match spawned {
            Ok(handle) => workers.push(handle),
            Err(e) => {
                shared.sender.lock().take();
                return Err(ScanError::Spawn(e));
            }
        }
    }
    drop(rx);

    shared.progress.grow_total(input.len(), shared.sink.as_ref());
    let end = input.len();
    shared.submit(RegionTask { node: tree.root(), input, start: 0, end, fresh: true });

    Ok(ScanHandle { shared, workers: Mutex::new(workers) })
}

impl ScanHandle {
    pub fn tree(&self) -> &Arc<ResultTree> {
        &self.shared.ctx.tree
    }

    pub fn progress(&self) -> Progress {
        self.shared.progress.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        *self.shared.done.lock()
    }

    /// Resolve a node key to its committed root-first chain.
    pub fn resolve_path(&self, key: &NodeKey) -> Option<Vec<NodeView>> {
        let tree = self.tree();
        tree.resolve_path(key)?.into_iter().map(|id| tree.view(id)).collect()
    }

    /// Block until the scan completes.
    pub fn wait(&self) {
        {
            let mut done = self.shared.done.lock();
            while !*done {
                self.shared.done_cv.wait(&mut done);
            }
        }
        self.join_workers();
    }

    /// Block until the scan completes or `timeout` passes; `true` if it
    /// completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        {
            let mut done = self.shared.done.lock();
            while !*done {
                if self.shared.done_cv.wait_until(&mut done, deadline).timed_out() {
                    return *done;
                }
            }
        }
        self.join_workers();
        true
    }

    /// Stop the scan.
    ///
    /// Graceful stop lets queued and running tasks finish but accepts no new
    /// ones; immediate stop also drops queued tasks and ends running ones at
    /// their next position.  With `wait`, block up to that long for the
    /// workers to exit.
    pub fn stop(&self, immediate: bool, wait: Option<Duration>) -> StopOutcome {
        let target = if immediate { CANCELLED } else { DRAINING };
        self.shared.state.fetch_max(target, Ordering::AcqRel);
        debug!(immediate, "scan stop requested");
        match wait {
            None => StopOutcome::Requested,
            Some(timeout) if self.wait_timeout(timeout) => StopOutcome::Stopped,
            Some(timeout) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "scan workers still running after stop timeout");
                StopOutcome::TimedOut
            }
        }
    }

    /// Graceful stop bounded by the configured stop timeout.
    pub fn shutdown(&self) -> StopOutcome {
        self.stop(false, Some(self.shared.config.stop_timeout()))
    }

    fn join_workers(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(panic) = handle.join() {
                std::panic::resume_unwind(panic);
            }
        }
    }
}

impl Drop for ScanHandle {
    fn drop(&mut self) {
        if !self.is_finished() && !thread::panicking() {
            self.stop(true, Some(self.shared.config.stop_timeout()));
        }
    }
}
