//! Benchmarks for the sync hot paths
//!
//! Run with: cargo bench -p livenotes-core
//!
//! Baselines for:
//! - Envelope encode/decode at realistic dataset sizes
//! - Upsert and wholesale replace on the dataset
//! - Chunking and reassembly of oversize pushes

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use livenotes_core::sync::framing::{PayloadMode, PushFramer, Reassembler, DEFAULT_PAYLOAD_CEILING};
use livenotes_core::{decode, encode, Dataset, Envelope, Note, Project};

fn dataset_envelope(notes: usize) -> Envelope {
    Envelope::snapshot(
        (0..notes)
            .map(|i| {
                Note::new(format!("Note {}", i), "Some content that looks like a short note")
                    .with_id(i as i64)
                    .with_project(if i % 2 == 0 { "Work" } else { "Home" })
                    .with_color("#90CAF9")
                    .with_updated_at(1_700_000_000_000 + i as i64)
            })
            .collect(),
        vec![Project::new("Home", "#B0BEC5"), Project::new("Work", "#FFB74D")],
    )
}

// ============================================================================
// Codec Benchmarks
// ============================================================================

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");

    for size in [1usize, 10, 100, 1000] {
        let envelope = dataset_envelope(size);
        let bytes = encode(&envelope);
        group.throughput(Throughput::Bytes(bytes.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", size), &envelope, |b, env| {
            b.iter(|| black_box(encode(env)))
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &bytes, |b, bytes| {
            b.iter(|| black_box(decode(bytes).unwrap()))
        });
    }

    group.finish();
}

// ============================================================================
// Dataset Benchmarks
// ============================================================================

fn bench_dataset(c: &mut Criterion) {
    let mut group = c.benchmark_group("dataset");

    for size in [10usize, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("upsert_existing", size), &size, |b, &size| {
            b.iter_batched(
                || Dataset::from_envelope(dataset_envelope(size)),
                |mut dataset| {
                    let note = Note::new("Edited", "content").with_id((size / 2) as i64);
                    black_box(dataset.apply_new_note(note, 1).unwrap())
                },
                criterion::BatchSize::SmallInput,
            )
        });

        group.bench_with_input(BenchmarkId::new("prepend", size), &size, |b, &size| {
            b.iter_batched(
                || Dataset::from_envelope(dataset_envelope(size)),
                |mut dataset| black_box(dataset.apply_new_note(Note::new("New", "note"), 1).unwrap()),
                criterion::BatchSize::SmallInput,
            )
        });

        group.bench_with_input(BenchmarkId::new("replace_wholesale", size), &size, |b, &size| {
            let envelope = dataset_envelope(size);
            b.iter_batched(
                Dataset::new,
                |mut dataset| black_box(dataset.replace_wholesale(envelope.clone())),
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

// ============================================================================
// Framing Benchmarks
// ============================================================================

fn bench_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("framing");
    let payload = encode(&dataset_envelope(50));
    group.throughput(Throughput::Bytes(payload.len() as u64));

    group.bench_function("chunk", |b| {
        let mut framer = PushFramer::new(PayloadMode::Chunked, DEFAULT_PAYLOAD_CEILING);
        b.iter(|| black_box(framer.frame(&payload).unwrap()))
    });

    group.bench_function("chunk_and_reassemble", |b| {
        let mut framer = PushFramer::new(PayloadMode::Chunked, DEFAULT_PAYLOAD_CEILING);
        b.iter(|| {
            let mut reassembler = Reassembler::new();
            let mut out = None;
            for frame in framer.frame(&payload).unwrap() {
                out = reassembler.accept(frame);
            }
            black_box(out)
        })
    });

    group.finish();
}

criterion_group!(benches, bench_codec, bench_dataset, bench_framing);
criterion_main!(benches);
