use core::ptr::null_mut;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

use zoneheap::{HeapConfig, NativeHeap, PurgeTag, ZoneAlloc, ZoneHeap};

const OPS: u64 = 100_000;

/// Arena heap alloc/free throughput.
fn arena_malloc_free(heap: &mut ZoneHeap, size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = heap.malloc(size, PurgeTag::Static, null_mut());
      black_box(ptr);
      heap.free(ptr);
    }
  }
}

/// Native heap alloc/free throughput.
fn native_malloc_free(heap: &mut NativeHeap, size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = heap.malloc(size, PurgeTag::Static, null_mut());
      black_box(ptr);
      heap.free(ptr);
    }
  }
}

/// libc alloc/free throughput for reference.
fn libc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = libc::malloc(size);
      black_box(ptr);
      libc::free(ptr);
    }
  }
}

fn benchmark_zone_throughput(c: &mut Criterion) {
  let mut group = c.benchmark_group("zone_throughput");

  for size in [16, 64, 256, 1024, 4096] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("arena", size), &size, |b, &size| {
      let mut heap = ZoneHeap::new(HeapConfig::default());
      b.iter(|| arena_malloc_free(&mut heap, size))
    });

    group.bench_with_input(BenchmarkId::new("native", size), &size, |b, &size| {
      let mut heap = NativeHeap::new();
      b.iter(|| native_malloc_free(&mut heap, size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
}

criterion_group!(benches, benchmark_zone_throughput);
criterion_main!(benches);
