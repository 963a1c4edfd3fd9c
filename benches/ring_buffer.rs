//! Criterion benchmarks for buffer ring hot paths.
//!
//! The fill/mark/take/release cycle runs once per frame, so its overhead
//! bounds the frame rate the core can sustain independent of the camera.
//!
//! Key metrics:
//! - Single-threaded cycle cost for various frame sizes
//! - Producer/consumer throughput across threads
//! - Cost of a non-blocking poll on an empty ring
//!
//! Run with: cargo bench --bench ring_buffer

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use hamamatsu_dcam::ring::{BufferRing, FrameStamp, RingOptions};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn stamp(sequence: u64) -> FrameStamp {
    FrameStamp {
        sequence,
        timestamp: Duration::from_micros(sequence),
        complete: true,
    }
}

/// One frame through the ring on a single thread, writing the whole buffer.
fn ring_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_cycle");

    // Common sensor readouts: 512x512, 1024x1024 and 2048x2048 MONO16
    let sizes = vec![("512KB", 512 * 512 * 2), ("2MB", 1024 * 1024 * 2), ("8MB", 2048 * 2048 * 2)];

    for (name, size) in sizes {
        let ring = BufferRing::allocate(4, size).unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("fill_take_release", name), &size, |b, _| {
            b.iter(|| {
                let mut slot = ring.begin_fill().unwrap();
                slot.data_mut().fill(0x5A);
                let (index, sequence) = (slot.index, slot.sequence);
                drop(slot);
                ring.mark_ready(index, stamp(sequence)).unwrap();
                let frame = ring.take_next(Duration::from_secs(1)).unwrap();
                black_box(frame.data()[0]);
            });
        });
    }

    group.finish();
}

/// Producer thread against a consumer, as in a running stream.
fn ring_threaded_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_threaded");
    const FRAMES: u64 = 1_000;
    group.throughput(Throughput::Elements(FRAMES));

    for capacity in [2usize, 8, 32] {
        group.bench_with_input(BenchmarkId::new("frames", capacity), &capacity, |b, &capacity| {
            b.iter(|| {
                let ring = Arc::new(
                    BufferRing::with_options(
                        capacity,
                        64 * 1024,
                        RingOptions {
                            frame_limit: Some(FRAMES),
                            ..Default::default()
                        },
                    )
                    .unwrap(),
                );

                let producer = {
                    let ring = Arc::clone(&ring);
                    thread::spawn(move || {
                        while let Some(slot) = ring.begin_fill() {
                            let (index, sequence) = (slot.index, slot.sequence);
                            drop(slot);
                            if ring.mark_ready(index, stamp(sequence)).is_err() {
                                break;
                            }
                        }
                    })
                };

                let mut received = 0u64;
                while let Ok(frame) = ring.take_next(Duration::from_secs(1)) {
                    black_box(frame.stamp());
                    received += 1;
                }
                producer.join().unwrap();
                assert_eq!(received, FRAMES);
            });
        });
    }

    group.finish();
}

/// Non-blocking poll of an empty ring, as done by cooperative scheduling.
fn ring_empty_poll(c: &mut Criterion) {
    let ring = BufferRing::allocate(8, 1024).unwrap();

    c.bench_function("ring_try_take_empty", |b| {
        b.iter(|| {
            black_box(ring.try_take_next().unwrap().is_none());
        });
    });

    c.bench_function("ring_stats", |b| {
        b.iter(|| {
            black_box(ring.stats());
        });
    });
}

criterion_group!(benches, ring_cycle, ring_threaded_throughput, ring_empty_poll);
criterion_main!(benches);
