#[macro_use]
extern crate criterion;

use criterion::{BenchmarkId, Criterion};
use std::hint::black_box;

use cow_buffer::CowBuffer;

static SIZES: [usize; 4] = [16, 256, 4096, 65536];

fn share_vs_fork(c: &mut Criterion) {
    let mut g = c.benchmark_group("share");
    for size in &SIZES {
        let src: CowBuffer<u32> = (0..*size as u32).collect();
        g.bench_with_input(BenchmarkId::new("share", size), size, |b, _| {
            b.iter(|| black_box(src.share()))
        });
        g.bench_with_input(BenchmarkId::new("fork u32", size), size, |b, _| {
            b.iter(|| {
                let mut copy = src.share();
                copy.ensure_exclusive().unwrap();
                black_box(copy)
            })
        });
        g.bench_with_input(BenchmarkId::new("vec clone", size), size, |b, _| {
            let v: Vec<u32> = src.as_slice().to_vec();
            b.iter(|| black_box(v.clone()))
        });
    }
}

fn grow(c: &mut Criterion) {
    let mut g = c.benchmark_group("grow");
    for size in &SIZES {
        g.bench_with_input(BenchmarkId::new("resize u32", size), size, |b, size| {
            b.iter(|| {
                let mut v: CowBuffer<u32> = CowBuffer::new();
                v.resize(*size).unwrap();
                black_box(v)
            })
        });
        g.bench_with_input(BenchmarkId::new("resize string", size), size, |b, size| {
            b.iter(|| {
                let mut v: CowBuffer<String> = CowBuffer::new();
                v.resize(*size).unwrap();
                black_box(v)
            })
        });
        g.bench_with_input(BenchmarkId::new("push u32", size), size, |b, size| {
            b.iter(|| {
                let mut v: CowBuffer<u32> = CowBuffer::new();
                for i in 0..*size as u32 {
                    v.push(i).unwrap();
                }
                black_box(v)
            })
        });
        g.bench_with_input(BenchmarkId::new("vec push u32", size), size, |b, size| {
            b.iter(|| {
                let mut v: Vec<u32> = Vec::new();
                for i in 0..*size as u32 {
                    v.push(i);
                }
                black_box(v)
            })
        });
    }
}

fn insert_front(c: &mut Criterion) {
    let mut g = c.benchmark_group("insert front");
    for size in &SIZES[..3] {
        g.bench_with_input(BenchmarkId::new("cow", size), size, |b, size| {
            b.iter(|| {
                let mut v: CowBuffer<u32> = CowBuffer::new();
                for i in 0..*size as u32 {
                    v.insert(0, i).unwrap();
                }
                black_box(v)
            })
        });
    }
}

criterion_group!(buffer, share_vs_fork, grow, insert_front);
criterion_main!(buffer);
