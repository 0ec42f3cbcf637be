use asgd_comm::ring::{ChannelConfig, Endpoint, RingReader, RingWriter};
use asgd_comm::transport::{LocalFabric, Transport};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;

fn benchmark_ring(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring");
    let capacity = 1 << 16;

    for len in [64usize, 4000, 30000] {
        let fabric = LocalFabric::new(2);
        let writer_side = Arc::new(fabric.transport(0).unwrap());
        let reader_side = Arc::new(fabric.transport(1).unwrap());
        let bytes = capacity * std::mem::size_of::<f32>();
        writer_side.segment_create(1, bytes).unwrap();
        reader_side.segment_create(1, bytes).unwrap();

        let a = Endpoint { rank: 0, segment: 1, notification: 0, offset: 0 };
        let b = Endpoint { rank: 1, ..a };
        let mut writer = RingWriter::<f32, _>::new(
            writer_side,
            ChannelConfig { capacity, local: a, remote: b, queue: 0, queue_margin: 3 },
        )
        .unwrap();
        let mut reader = RingReader::<f32, _>::new(
            reader_side,
            ChannelConfig { capacity, local: b, remote: a, queue: 0, queue_margin: 1 },
        )
        .unwrap();

        let data = vec![1.0f32; len];
        let mut out = vec![0.0f32; len];
        group.throughput(Throughput::Bytes((len * 4) as u64));

        // Lengths that do not divide the capacity exercise the wrapping path too.
        group.bench_with_input(BenchmarkId::new("write_read", len), &len, |bench, _| {
            bench.iter(|| {
                writer.write(black_box(&data)).unwrap();
                reader.read(&mut out).unwrap();
                black_box(&out);
            })
        });
        group.bench_with_input(BenchmarkId::new("write_add", len), &len, |bench, _| {
            bench.iter(|| {
                writer.write(black_box(&data)).unwrap();
                reader.add(&mut out).unwrap();
                black_box(&out);
            })
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_ring);
criterion_main!(benches);
