//! 분할/재조립 벤치마크 (병렬 암호화 + 세그먼트 인코딩)

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use jobrelay::chunk::{reassemble, ContentType, SegmentSet, Splitter};
use jobrelay::{CipherStrategy, Segment, SymmetricKey};

/// 테스트용 텍스트 데이터
fn test_data(size: usize) -> Vec<u8> {
    let pattern = b"[build] compiling jobrelay v0.1.0 ... ok\n";
    pattern.iter().copied().cycle().take(size).collect()
}

fn cipher() -> CipherStrategy {
    CipherStrategy::Symmetric(SymmetricKey::from_secret(b"bench-secret"))
}

fn bench_split(c: &mut Criterion) {
    let mut group = c.benchmark_group("split");
    let content_type = ContentType::File("build.log".into());

    for mb in [1usize, 8] {
        let data = test_data(mb * 1024 * 1024);
        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(format!("{}MB", mb)), &data, |b, data| {
            let splitter = Splitter::new(cipher(), jobrelay::DEFAULT_SEGMENT_SIZE);
            b.iter(|| {
                let segments = splitter.split(black_box(data), "bench", &content_type).unwrap();
                black_box(segments.iter().map(Segment::encode).collect::<Vec<_>>())
            });
        });
    }

    group.finish();
}

fn bench_reassemble(c: &mut Criterion) {
    let mut group = c.benchmark_group("reassemble");
    let data = test_data(8 * 1024 * 1024);
    let encoded: Vec<Vec<u8>> = Splitter::new(cipher(), jobrelay::DEFAULT_SEGMENT_SIZE)
        .split(&data, "bench", &ContentType::File("build.log".into()))
        .unwrap()
        .iter()
        .map(Segment::encode)
        .collect();

    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("8MB", |b| {
        let cipher = cipher();
        b.iter(|| {
            let segments: Vec<Segment> = encoded.iter().map(|e| Segment::decode(e).unwrap()).collect();
            let mut set = SegmentSet::new(&segments[0]);
            for segment in segments {
                set.insert(segment).unwrap();
            }
            black_box(reassemble(set, &cipher).unwrap())
        });
    });

    group.finish();
}

criterion_group!(benches, bench_split, bench_reassemble);
criterion_main!(benches);
