use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use binscan::format::block::encode_block;
use binscan::{scan, CodecId, FormatSet, InputRange, NullSink, ScanConfig};

fn sample(blocks: usize) -> Vec<u8> {
    let text = b"binscan benchmark payload, moderately compressible. ".repeat(64);
    let mut data = Vec::new();
    for i in 0..blocks {
        data.extend_from_slice(&[0x5Au8; 97]);
        let codec = if i % 2 == 0 { CodecId::Zstd } else { CodecId::Lz4 };
        data.extend_from_slice(&encode_block(i as u32, 0, &text, codec, 3).unwrap());
    }
    data
}

fn bench_scan(c: &mut Criterion) {
    let formats = Arc::new(FormatSet::builtin());
    let config  = ScanConfig { workers: 4, ..ScanConfig::default() };

    let nested = sample(32);
    c.bench_function("scan_32_nested_blocks", |b| {
        b.iter(|| {
            let input  = InputRange::from_bytes(black_box(nested.clone()), "bench");
            let handle = scan(input, Arc::clone(&formats), Arc::new(NullSink), config.clone()).unwrap();
            handle.wait();
        })
    });

    let junk = vec![0x33u8; 256 * 1024];
    c.bench_function("scan_256k_unrecognized", |b| {
        b.iter(|| {
            let input  = InputRange::from_bytes(black_box(junk.clone()), "bench");
            let handle = scan(input, Arc::clone(&formats), Arc::new(NullSink), config.clone()).unwrap();
            handle.wait();
        })
    });
}

criterion_group!(benches, bench_scan);
criterion_main!(benches);
