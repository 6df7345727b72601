//! Benchmarks for the GeoPhoto codec
//!
//! Run with: cargo bench

use chrono::NaiveDate;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use geophoto::codec::*;

fn create_test_message(image_size: usize) -> GeoPhotoMessage {
    let mut image = vec![0xFF, 0xD8, 0xFF, 0xE0];
    image.extend((0..image_size).map(|i| (i % 251) as u8));
    image.extend([0xFF, 0xD9]);

    GeoPhotoMessage::new(
        Coordinates::new(37.774929, -122.419416),
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        image,
    )
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");

    // Thumbnail, phone photo, large photo
    for size in [16 * 1024, 512 * 1024, 4 * 1024 * 1024] {
        let message = create_test_message(size);

        group.throughput(Throughput::Bytes(size as u64));

        group.bench_function(format!("encode_{}k", size / 1024), |b| {
            b.iter(|| encode(black_box(&message)).unwrap())
        });

        let frame = encode(&message).unwrap();

        group.bench_function(format!("decode_{}k", size / 1024), |b| {
            b.iter(|| decode(black_box(&frame)).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, bench_codec);
criterion_main!(benches);
