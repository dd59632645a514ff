use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use bacnet_sc_transport::datalink::bsc::reassembly::{FragmentBuffer, FrameKind};

fn bench_reassembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("reassembly");
    let payload = vec![0x5Au8; 64 * 1024];

    for fragments in [1usize, 4, 16, 64] {
        let chunk = payload.len() / fragments;
        group.bench_with_input(
            BenchmarkId::from_parameter(fragments),
            &fragments,
            |b, &fragments| {
                let mut buffer = FragmentBuffer::new(4096, payload.len());
                b.iter(|| {
                    let mut message = None;
                    for (i, part) in payload.chunks(chunk).enumerate() {
                        let fin = i + 1 == fragments;
                        message = buffer
                            .push(FrameKind::Binary, fin, black_box(part))
                            .unwrap();
                    }
                    black_box(message)
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_reassembly);
criterion_main!(benches);
