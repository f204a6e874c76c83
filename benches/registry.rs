//! Microbenchmarks for the fixed-descriptor registry hot paths.
//!
//! Pure userspace: the kernel sync is stubbed out so these measure the
//! slot-table bookkeeping itself.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use uring_engine::FdRegistry;

fn bench_bind_free(c: &mut Criterion) {
    c.bench_function("registry_bind_free", |b| {
        let mut registry = FdRegistry::new(64);
        registry.init_with(|_| Ok(()));
        b.iter(|| {
            let slot = registry.bind(black_box(3)).unwrap();
            registry.free_slot(slot);
            black_box(slot)
        });
    });
}

fn bench_bind_commit_cycle(c: &mut Criterion) {
    c.bench_function("registry_bind_commit_cycle", |b| {
        let mut registry = FdRegistry::new(64);
        registry.init_with(|_| Ok(()));
        b.iter(|| {
            let mut slots = [0u32; 16];
            for (i, slot) in slots.iter_mut().enumerate() {
                *slot = registry.bind(100 + i as i32).unwrap();
            }
            registry.commit_with(|_, files| {
                black_box(files);
                Ok(())
            });
            for &slot in &slots {
                registry.free_slot(slot);
            }
        });
    });
}

fn bench_shared_binding(c: &mut Criterion) {
    c.bench_function("registry_shared_binding", |b| {
        let mut registry = FdRegistry::new(8);
        registry.init_with(|_| Ok(()));
        let base = registry.bind(7).unwrap();
        registry.commit_with(|_, _| Ok(()));
        b.iter(|| {
            let slot = registry.bind(black_box(7)).unwrap();
            registry.free_slot(slot);
            black_box(slot)
        });
        registry.free_slot(base);
    });
}

criterion_group!(
    benches,
    bench_bind_free,
    bench_bind_commit_cycle,
    bench_shared_binding
);
criterion_main!(benches);
