use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use proptest::prelude::*;
use tempfile::NamedTempFile;

use binscan::format::block::encode_block;
use binscan::{
    render_tree, scan, BytePattern, CodecId, DecodeError, DecodeSession, FormatPlugin, FormatSet,
    InputRange, InputSource, NodeId, NodeKind, Progress, ResultTree, ScanConfig, ScanError,
    ScanHandle, StatusSink, StopOutcome, View,
};

// ── Helpers ──────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Recorder {
    started:  AtomicUsize,
    finished: AtomicUsize,
    results:  Mutex<Vec<NodeId>>,
    errors:   Mutex<Vec<String>>,
    progress: Mutex<Vec<Progress>>,
}

impl StatusSink for Recorder {
    fn scan_started(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }
    fn scan_finished(&self) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
    fn scan_progress(&self, p: &Progress) {
        self.progress.lock().push(*p);
    }
    fn scan_result(&self, _: &ResultTree, node: NodeId) {
        self.results.lock().push(node);
    }
    fn scan_exception(&self, e: &ScanError) {
        let kind = match e {
            ScanError::Io { .. } => "io",
            ScanError::Cache(_)  => "cache",
            _                    => "other",
        };
        self.errors.lock().push(kind.to_owned());
    }
}

fn config() -> ScanConfig {
    ScanConfig { workers: 3, page_size: 256, ..ScanConfig::default() }
}

fn run(data: Vec<u8>, formats: FormatSet) -> (ScanHandle, Arc<Recorder>) {
    let sink = Arc::new(Recorder::default());
    let handle = scan(InputRange::from_bytes(data, "input"), Arc::new(formats), sink.clone(), config()).unwrap();
    handle.wait();
    (handle, sink)
}

fn spans(tree: &ResultTree, id: NodeId) -> Vec<(u64, u64, String)> {
    tree.children(id)
        .into_iter()
        .map(|c| {
            let v = tree.view(c).unwrap();
            (v.start, v.end, v.name)
        })
        .collect()
}

/// Every INPUT node's children tile `[0, len)` exactly.
fn assert_inputs_tiled(tree: &ResultTree, id: NodeId) {
    let view = tree.view(id).unwrap();
    if view.kind == NodeKind::Input {
        let mut at = 0;
        for child in &view.children {
            let c = tree.view(*child).unwrap();
            assert_eq!(c.start, at, "gap or overlap under {}", view.name);
            at = c.end;
        }
        assert_eq!(at, view.end - view.start, "coverage of {}", view.name);
    }
    for child in view.children {
        assert_inputs_tiled(tree, child);
    }
}

fn all_committed(tree: &ResultTree, id: NodeId, out: &mut Vec<NodeId>) {
    out.push(id);
    for child in tree.children(id) {
        all_committed(tree, child, out);
    }
}

/// Finds itself: claims `[20, 50)` from any earlier position.
struct Span20To50;

impl FormatPlugin for Span20To50 {
    fn name(&self) -> &str {
        "span"
    }

    fn decode(&self, s: &mut DecodeSession<'_>) -> Result<(), DecodeError> {
        if s.position() > 20 {
            return Err(DecodeError::Mismatch("past the span".into()));
        }
        s.relocate_start(20)?;
        s.seek(50)
    }
}

/// Header-discriminated record: `MAGC` then 26 more bytes.
struct Magic30 {
    headers: Vec<BytePattern>,
}

impl Magic30 {
    fn new() -> Self {
        Self { headers: vec![BytePattern::exact(b"MAGC")] }
    }
}

impl FormatPlugin for Magic30 {
    fn name(&self) -> &str {
        "magic"
    }

    fn header_patterns(&self) -> &[BytePattern] {
        &self.headers
    }

    fn decode(&self, s: &mut DecodeSession<'_>) -> Result<(), DecodeError> {
        s.skip(30)
    }
}

/// Absolute record with a 4-byte header that points at a body further ahead.
struct ForwardRef;

impl FormatPlugin for ForwardRef {
    fn name(&self) -> &str {
        "parent"
    }

    fn is_absolute(&self) -> bool {
        true
    }

    fn decode(&self, s: &mut DecodeSession<'_>) -> Result<(), DecodeError> {
        s.skip(4)?;
        let body: Arc<dyn FormatPlugin> = Arc::new(Body10);
        s.decode_composite_at(&body, 10, 0)?;
        Ok(())
    }
}

struct Body10;

impl FormatPlugin for Body10 {
    fn name(&self) -> &str {
        "body"
    }

    fn decode(&self, s: &mut DecodeSession<'_>) -> Result<(), DecodeError> {
        s.skip(10)
    }
}

// ── Scenario ─────────────────────────────────────────────────────────────────

#[test]
fn relocated_match_yields_gap_match_and_tail() {
    let (handle, sink) = run(vec![0xAB; 100], FormatSet::new().with(Arc::new(Span20To50)));
    let tree = handle.tree();

    assert_eq!(
        spans(tree, tree.root()),
        vec![(0, 20, "data".into()), (20, 50, "span".into()), (50, 100, "data".into())],
    );
    for child in tree.children(tree.root()) {
        assert!(tree.children(child).is_empty());
    }
    assert_eq!(handle.progress().scanned_bytes, 100);
    assert_eq!(handle.progress().total_bytes, 100);
    assert_eq!(sink.results.lock().len(), 3);
    assert_eq!(sink.started.load(Ordering::SeqCst), 1);
    assert_eq!(sink.finished.load(Ordering::SeqCst), 1);
    assert_eq!(sink.progress.lock().last().unwrap().scanned_bytes, 100);
}

#[test]
fn header_match_after_unrecognized_prefix() {
    let mut data = vec![0u8; 100];
    data[20..24].copy_from_slice(b"MAGC");
    let (handle, sink) = run(data, FormatSet::new().with(Arc::new(Magic30::new())));
    let tree = handle.tree();

    assert_eq!(
        spans(tree, tree.root()),
        vec![(0, 20, "data".into()), (20, 50, "magic".into()), (50, 100, "data".into())],
    );
    assert_eq!(handle.progress().scanned_bytes, 100);
    assert!(sink.errors.lock().is_empty());
}

#[test]
fn scan_resumes_after_forward_referenced_child() {
    let (handle, sink) = run(vec![0u8; 100], FormatSet::new().with(Arc::new(ForwardRef)));
    let tree = handle.tree();

    assert_eq!(
        spans(tree, tree.root()),
        vec![(0, 20, "parent".into()), (20, 100, "data".into())],
    );
    let parent = tree.children(tree.root())[0];
    assert_eq!(spans(tree, parent), vec![(10, 20, "body".into())]);
    assert_inputs_tiled(tree, tree.root());
    assert_eq!(handle.progress().scanned_bytes, 100);
    assert_eq!(sink.results.lock().len(), 2);
}

// ── Nested streams ───────────────────────────────────────────────────────────

fn nested_sample() -> (Vec<u8>, Vec<u8>) {
    let text = b"The quick brown fox jumps over the lazy dog. ".repeat(20);
    let mut inner_stream = vec![0x11u8; 7];
    inner_stream.extend_from_slice(&encode_block(2, 64, &text, CodecId::Lz4, 0).unwrap());
    inner_stream.extend_from_slice(&[0x22u8; 5]);

    let mut data = vec![0xEEu8; 10];
    data.extend_from_slice(&encode_block(1, 0, &inner_stream, CodecId::Zstd, 3).unwrap());
    data.extend_from_slice(&[0xFFu8; 9]);
    (data, text)
}

#[test]
fn nested_blocks_are_rescanned() {
    let (data, text) = nested_sample();
    let len = data.len() as u64;
    let (handle, sink) = run(data, FormatSet::builtin());
    let tree = handle.tree();

    let top = tree.children(tree.root());
    assert_eq!(top.len(), 3);
    let outer = top[1];
    assert_eq!(tree.name(outer), "blck");
    assert_eq!(tree.value(outer, "codec", View::Committed).and_then(|v| v.as_str().map(str::to_owned)), Some("zstd".into()));

    let encoded = tree.children(outer);
    assert_eq!(encoded.len(), 1);
    assert_eq!(tree.kind(encoded[0]), NodeKind::EncodedInput);
    let nested = tree.children(encoded[0]);
    assert_eq!(nested.len(), 1);
    assert_eq!(tree.kind(nested[0]), NodeKind::Input);

    let inner_spans = spans(tree, nested[0]);
    assert_eq!(inner_spans.len(), 3);
    assert_eq!(inner_spans[1].2, "blck");

    let inner_block = tree.children(nested[0])[1];
    let deepest = tree.children(tree.children(inner_block)[0])[0];
    let decoded = tree.input(deepest).unwrap();
    assert_eq!(decoded.read_vec(0, decoded.len()).unwrap(), text);

    assert_inputs_tiled(tree, tree.root());
    let p = handle.progress();
    assert_eq!(p.scanned_bytes, p.total_bytes);
    assert!(p.total_bytes > len);
    assert!(sink.errors.lock().is_empty());

    let mut listing = Vec::new();
    render_tree(tree, &mut listing).unwrap();
    let listing = String::from_utf8(listing).unwrap();
    assert!(listing.contains("zstd payload"));
    assert!(listing.contains("lz4 payload"));

    // One result per completed unit of work: each top-level decode or data
    // run in each scanned input publishes exactly once.
    let mut nodes = Vec::new();
    all_committed(tree, tree.root(), &mut nodes);
    let units = nodes
        .iter()
        .filter(|&&n| tree.kind(n) == NodeKind::Format && tree.parent(n).map(|p| tree.kind(p)) == Some(NodeKind::Input))
        .count();
    assert_eq!(units, 7);
    assert_eq!(sink.results.lock().len(), units);
}

#[test]
fn every_committed_key_resolves_to_its_chain() {
    let (data, _) = nested_sample();
    let (handle, _) = run(data, FormatSet::builtin());
    let tree = handle.tree();

    let mut nodes = Vec::new();
    all_committed(tree, tree.root(), &mut nodes);
    assert!(nodes.len() > 8);
    for id in nodes {
        let key = tree.key(id).unwrap();
        assert_eq!(tree.resolve_path(&key), Some(tree.ancestors(id)), "key {key}");
        let views = handle.resolve_path(&key).unwrap();
        assert_eq!(views.last().map(|v| v.id), Some(id));
    }
}

#[test]
fn failed_nested_stream_is_reported_and_skipped() {
    let mut block = encode_block(0, 0, b"payload payload payload", CodecId::Zstd, 3).unwrap();
    // Corrupt the frame, then fix the CRC so only the decoder notices.
    let payload_len = block.len() - 28;
    for b in &mut block[28..28 + payload_len / 2] {
        *b ^= 0x5A;
    }
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&block[28..]);
    block[24..28].copy_from_slice(&hasher.finalize().to_le_bytes());

    let len = block.len() as u64;
    let (handle, sink) = run(block, FormatSet::builtin());
    let tree = handle.tree();

    assert_eq!(*sink.errors.lock(), vec!["cache".to_owned()]);
    assert_eq!(spans(tree, tree.root()), vec![(0, len, "data".into())]);
}

// ── Failures and stopping ────────────────────────────────────────────────────

struct BrokenDisk;

impl InputSource for BrokenDisk {
    fn len(&self) -> u64 {
        4096
    }

    fn read_at(&self, _pos: u64, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::Other, "sector not found"))
    }
}

#[test]
fn unreadable_input_reports_one_exception() {
    let sink = Arc::new(Recorder::default());
    let input = InputRange::new(Arc::new(BrokenDisk), "broken");
    let handle = scan(input, Arc::new(FormatSet::builtin()), sink.clone(), config()).unwrap();
    handle.wait();

    assert_eq!(*sink.errors.lock(), vec!["io".to_owned()]);
    assert!(handle.tree().children(handle.tree().root()).is_empty());
    assert_eq!(sink.finished.load(Ordering::SeqCst), 1);
}

#[test]
fn immediate_stop_ends_the_scan() {
    let sink = Arc::new(Recorder::default());
    let input = InputRange::zeros(64 * 1024 * 1024, "zeros");
    let handle = scan(input, Arc::new(FormatSet::builtin()), sink.clone(), config()).unwrap();

    assert_eq!(handle.stop(true, Some(Duration::from_secs(30))), StopOutcome::Stopped);
    assert!(handle.is_finished());
    assert_eq!(sink.finished.load(Ordering::SeqCst), 1);
    assert!(handle.progress().scanned_bytes <= handle.progress().total_bytes);
}

#[test]
fn scans_files_on_disk() {
    let (data, _) = nested_sample();
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&data).unwrap();
    file.flush().unwrap();

    let sink = Arc::new(Recorder::default());
    let input = InputRange::open_file(file.path()).unwrap();
    let handle = scan(input, Arc::new(FormatSet::builtin()), sink.clone(), config()).unwrap();
    handle.wait();

    assert_inputs_tiled(handle.tree(), handle.tree().root());
    assert_eq!(handle.tree().children(handle.tree().root()).len(), 3);
}

// ── Properties ───────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn scan_covers_every_byte(
        pieces in prop::collection::vec(
            (prop::collection::vec(any::<u8>(), 0..64), any::<bool>(), 0u8..6),
            1..6,
        ),
    ) {
        let mut data = Vec::new();
        for (bytes, wrap, codec) in &pieces {
            if *wrap {
                let codec = CodecId::from_u8(*codec).unwrap();
                data.extend_from_slice(&encode_block(0, 0, bytes, codec, 3).unwrap());
            } else {
                data.extend_from_slice(bytes);
            }
        }
        let len = data.len() as u64;
        let (handle, _) = run(data, FormatSet::builtin());
        let tree = handle.tree();

        assert_inputs_tiled(tree, tree.root());
        let p = handle.progress();
        prop_assert_eq!(p.scanned_bytes, p.total_bytes);
        prop_assert!(p.total_bytes >= len);
    }

    #[test]
    fn end_never_decreases(ends in prop::collection::vec(0u64..1000, 1..20)) {
        let tree = ResultTree::new(InputRange::from_bytes(vec![0u8; 1000], "t"));
        let node = tree.add_node(tree.root(), binscan::tree::Origin::Format(Arc::new(binscan::RawData)), 0);
        let mut high = 0;
        for (i, end) in ends.into_iter().enumerate() {
            tree.update_and_commit(node, Some(end), i % 2 == 0);
            high = high.max(end);
            prop_assert_eq!(tree.end(node, View::Current), Some(high));
            if let Some(committed) = tree.end(node, View::Committed) {
                prop_assert!(committed <= high);
            }
        }
    }
}
