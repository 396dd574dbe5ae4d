use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use msgpack_lz4::*;

fn sample_words(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("word-{}", i % 32)).collect()
}

fn bench_serialize(c: &mut Criterion) {
    let standard = StandardResolver::new();
    let resolver: &dyn FormatterResolver = &standard;
    let serializer = Lz4Serializer::default();

    let mut group = c.benchmark_group("serialize");
    for count in [4usize, 4096] {
        let words = sample_words(count);
        let plain_len = to_msgpack(&words, resolver).expect("sample must encode").len();
        group.throughput(Throughput::Bytes(plain_len as u64));

        group.bench_with_input(BenchmarkId::new("plain", count), &words, |b, words| {
            b.iter(|| black_box(to_msgpack(black_box(words), resolver).expect("encode")));
        });
        group.bench_with_input(BenchmarkId::new("lz4", count), &words, |b, words| {
            b.iter(|| black_box(serializer.serialize(black_box(words), resolver).expect("encode")));
        });
    }
    group.finish();
}

fn bench_deserialize(c: &mut Criterion) {
    let standard = StandardResolver::new();
    let resolver: &dyn FormatterResolver = &standard;
    let serializer = Lz4Serializer::default();

    let mut group = c.benchmark_group("deserialize");
    for count in [4usize, 4096] {
        let words = sample_words(count);
        let framed = serializer.serialize(&words, resolver).expect("sample must encode");
        group.throughput(Throughput::Bytes(framed.len() as u64));

        group.bench_with_input(BenchmarkId::new("lz4", count), &framed, |b, bytes| {
            b.iter(|| {
                let decoded: Vec<String> = serializer.deserialize(black_box(bytes), resolver).expect("decode");
                black_box(decoded)
            });
        });
    }
    group.finish();
}

fn bench_dynamic_dispatch(c: &mut Criterion) {
    let mut registry = TypeRegistry::new();
    registry.register::<String>().expect("register");
    let embedded = EmbeddedTypeFormatter::new(Arc::new(registry));
    let resolver = EmbeddedTypeResolver::new(embedded, Vec::new());
    let resolver: &dyn FormatterResolver = &resolver;

    let value: Option<BoxedValue> = Some(Box::new("embedded".to_string()));

    c.bench_function("dynamic/embedded_roundtrip", |b| {
        b.iter(|| {
            let encoded = to_msgpack(black_box(&value), resolver).expect("encode");
            let decoded: Option<BoxedValue> = from_msgpack(black_box(&encoded), resolver).expect("decode");
            black_box(decoded)
        });
    });

    c.bench_function("dynamic/cached_lookup", |b| {
        let ty = RuntimeType::of::<String>();
        b.iter(|| black_box(resolver.get_formatter_dynamic(black_box(ty)).expect("lookup")));
    });
}

criterion_group!(benches, bench_serialize, bench_deserialize, bench_dynamic_dispatch);
criterion_main!(benches);
