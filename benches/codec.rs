//! Benchmarks for the frame codec
//!
//! Encodes and decodes a frame carrying every record kind, at the newest layout and at the
//! oldest one still carrying per-body marker details.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use natnet::Version;
use natnet::protocol::{self, Message};
use natnet::test_utils::{fit_frame_to, rich_description, rich_frame};
use std::hint::black_box;

const VERSIONS: [Version; 2] = [Version::new(2, 11), Version::LATEST];

fn bench_frame_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");
    for version in VERSIONS {
        let message = Message::FrameOfData(fit_frame_to(rich_frame(1234), version));
        let size = protocol::encode(&message, version).expect("encode").len();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(version), &message, |b, message| {
            b.iter(|| black_box(protocol::encode(black_box(message), version).expect("encode")))
        });
    }
    group.finish();
}

fn bench_frame_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");
    for version in VERSIONS {
        let message = Message::FrameOfData(fit_frame_to(rich_frame(1234), version));
        let bytes = protocol::encode(&message, version).expect("encode");
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(version), &bytes, |b, bytes| {
            b.iter(|| black_box(protocol::decode_datagram(black_box(bytes), version).expect("decode")))
        });
    }
    group.finish();
}

fn bench_description_decode(c: &mut Criterion) {
    let bytes = protocol::encode(&Message::ModelDef(rich_description()), Version::LATEST)
        .expect("encode");

    let mut group = c.benchmark_group("description_decode");
    group.throughput(Throughput::Bytes(bytes.len() as u64));
    group.bench_function("latest", |b| {
        b.iter(|| {
            black_box(protocol::decode_datagram(black_box(&bytes), Version::LATEST).expect("decode"))
        })
    });
    group.finish();
}

criterion_group!(benches, bench_frame_encode, bench_frame_decode, bench_description_decode);
criterion_main!(benches);
