//! Ring buffer and jitter buffer throughput

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::thread;

use bytes::Bytes;
use voip_core::audio::{JitterBuffer, JitterConfig, RingBuffer};

const FRAME: usize = 960;

fn ring_single_thread(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_push_pop");

    for chunk in [64usize, 480, FRAME] {
        group.throughput(Throughput::Elements(chunk as u64));
        group.bench_with_input(BenchmarkId::from_parameter(chunk), &chunk, |b, &chunk| {
            let (mut producer, mut consumer) = RingBuffer::<f32>::new(FRAME * 8);
            let input = vec![0.25f32; chunk];
            let mut output = vec![0.0f32; chunk];
            b.iter(|| {
                producer.push(black_box(&input));
                consumer.pop(black_box(&mut output));
            })
        });
    }

    group.finish();
}

fn ring_cross_thread(c: &mut Criterion) {
    const TOTAL: usize = FRAME * 1000;

    let mut group = c.benchmark_group("ring_cross_thread");
    group.throughput(Throughput::Elements(TOTAL as u64));
    group.sample_size(20);

    group.bench_function("spsc_frames", |b| {
        b.iter(|| {
            let (mut producer, mut consumer) = RingBuffer::<f32>::new(FRAME * 4);
            let writer = thread::spawn(move || {
                let frame = vec![1.0f32; FRAME];
                let mut sent = 0;
                while sent < TOTAL {
                    let n = producer.push(&frame[..FRAME.min(TOTAL - sent)]);
                    if n == 0 {
                        std::hint::spin_loop();
                    }
                    sent += n;
                }
            });

            let mut scratch = vec![0.0f32; FRAME];
            let mut received = 0;
            while received < TOTAL {
                let n = consumer.pop(&mut scratch);
                if n == 0 {
                    std::hint::spin_loop();
                }
                received += n;
            }
            let _ = writer.join();
            black_box(received)
        })
    });

    group.finish();
}

fn jitter_in_order(c: &mut Criterion) {
    let payload = Bytes::from_static(&[0u8; 80]);

    c.bench_function("jitter_add_get", |b| {
        let jitter = JitterBuffer::new(JitterConfig::default());
        let mut sequence = 0u32;
        b.iter(|| {
            jitter.add_packet(payload.clone(), sequence, FRAME as u32);
            black_box(jitter.get_next_packet());
            sequence = sequence.wrapping_add(1);
        })
    });
}

criterion_group!(benches, ring_single_thread, ring_cross_thread, jitter_in_order);
criterion_main!(benches);
