//! Allocator hot-path benchmarks: `malloc`/`free`/`realloc` through the
//! real engine, with and without page protection toggling, since that
//! toggle is the single biggest cost guard-mode bookkeeping adds over a
//! bare system allocator.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

use leakspector_core::{AllocKind, CallContext, Config, Engine, GuardMode};
use leakspector_shim::providers::{OsPageProvider, OsStackWalker, OsSymbolResolver};

fn engine_with(guard_mode: GuardMode, no_protect: bool) -> Engine {
    let mut config = Config::default();
    config.guard_mode = guard_mode;
    config.flags.no_protect = no_protect;
    config.flags.check_allocs = false;
    config.flags.check_frees = false;
    Engine::new(config, Box::new(OsPageProvider::new()), Box::new(OsStackWalker), Box::new(OsSymbolResolver))
}

fn bench_alloc_free_cycle(c: &mut Criterion) {
    let sizes: &[usize] = &[16, 64, 256, 1024, 4096, 32768];
    let mut group = c.benchmark_group("alloc_free_cycle");

    for &size in sizes {
        for (label, guard_mode, no_protect) in [
            ("byte_guard", GuardMode::Byte, true),
            ("page_guard_protected", GuardMode::Page, false),
        ] {
            let mut engine = engine_with(guard_mode, no_protect);
            group.bench_with_input(BenchmarkId::new(label, size), &size, |b, &sz| {
                b.iter(|| {
                    let base = engine.get_memory(sz, 0, AllocKind::General, CallContext::internal(0)).expect("alloc");
                    engine.free_memory(Some(base), AllocKind::Release, CallContext::internal(0)).expect("free");
                    criterion::black_box(base);
                });
            });
        }
    }
    group.finish();
}

fn bench_realloc_growth(c: &mut Criterion) {
    let mut group = c.benchmark_group("realloc_growth");

    for (label, guard_mode, no_protect) in [
        ("byte_guard", GuardMode::Byte, true),
        ("page_guard_protected", GuardMode::Page, false),
    ] {
        group.bench_function(label, |b| {
            b.iter(|| {
                let mut engine = engine_with(guard_mode, no_protect);
                let base = engine.get_memory(64, 0, AllocKind::General, CallContext::internal(0)).expect("alloc");
                let grown = engine
                    .resize_memory(Some(base), 4096, 0, AllocKind::Resize, CallContext::internal(0))
                    .expect("realloc")
                    .expect("non-null");
                engine.free_memory(Some(grown), AllocKind::Release, CallContext::internal(0)).expect("free");
                criterion::black_box(grown);
            });
        });
    }
    group.finish();
}

fn bench_alloc_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_burst");

    for (label, guard_mode, no_protect) in [
        ("byte_guard", GuardMode::Byte, true),
        ("page_guard_protected", GuardMode::Page, false),
    ] {
        group.bench_function(label, |b| {
            b.iter(|| {
                let mut engine = engine_with(guard_mode, no_protect);
                let bases: Vec<usize> = (0..256)
                    .map(|_| engine.get_memory(64, 0, AllocKind::General, CallContext::internal(0)).expect("alloc"))
                    .collect();
                for base in &bases {
                    engine.free_memory(Some(*base), AllocKind::Release, CallContext::internal(0)).expect("free");
                }
                criterion::black_box(bases);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_alloc_free_cycle, bench_realloc_growth, bench_alloc_burst);
criterion_main!(benches);
