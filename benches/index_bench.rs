//! Benchmarks TAR indexing throughput and stenciled-read latency, the
//! successor to the teacher's compression benchmark now that there is no
//! custom codec left to measure.

use std::io::Cursor;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use ratarkit::index::{IndexCandidate, SQLiteIndex};
use ratarkit::stencil::{shared, StenciledFile};
use ratarkit::tarindex::{TarIndexOptions, TarIndexer};

fn build_fixture_tar(member_count: usize, member_size: usize) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let data = vec![b'x'; member_size];
    for i in 0..member_count {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, format!("file_{i:05}.bin"), data.as_slice()).unwrap();
    }
    builder.into_inner().unwrap()
}

fn bench_indexing(c: &mut Criterion) {
    let mut group = c.benchmark_group("tar_indexing");
    for member_count in [100usize, 1000] {
        let fixture = build_fixture_tar(member_count, 256);
        group.bench_with_input(BenchmarkId::from_parameter(member_count), &fixture, |b, fixture| {
            b.iter(|| {
                let mut index = SQLiteIndex::create(&IndexCandidate::Memory, "tar").unwrap();
                let indexer = TarIndexer::new(TarIndexOptions::default());
                let mut cursor = Cursor::new(fixture.clone());
                indexer.build(&mut cursor, &mut index, 0, 0, None, None).unwrap();
                index.finalize().unwrap();
            })
        });
    }
    group.finish();
}

fn bench_stenciled_read(c: &mut Criterion) {
    let data = vec![0u8; 16 * 1024 * 1024];
    let source = shared(Cursor::new(data));
    c.bench_function("stenciled_sequential_read_16mib", |b| {
        b.iter(|| {
            let mut file = StenciledFile::new(vec![(source.clone(), 0, 16 * 1024 * 1024)]);
            let mut out = Vec::new();
            std::io::Read::read_to_end(&mut file, &mut out).unwrap();
        })
    });
}

criterion_group!(benches, bench_indexing, bench_stenciled_read);
criterion_main!(benches);
