use criterion::{criterion_group, criterion_main, Criterion};

use a0_sync::mtx::Mtx;
use a0_sync::rwmtx::RwMtx;

fn uncontended_lock(c: &mut Criterion) {
    let mtx = Mtx::new();
    c.bench_function("mtx lock+unlock uncontended", |b| {
        b.iter(|| {
            let _ = mtx.lock().unwrap();
            mtx.unlock().unwrap();
        });
    });
    c.bench_function("mtx try_lock+unlock uncontended", |b| {
        b.iter(|| {
            let _ = mtx.try_lock().unwrap();
            mtx.unlock().unwrap();
        });
    });
}

fn uncontended_rlock(c: &mut Criterion) {
    let rw = RwMtx::new();
    let slots = [Mtx::new(), Mtx::new(), Mtx::new(), Mtx::new()];
    c.bench_function("rwmtx rlock+unlock uncontended", |b| {
        b.iter(|| {
            let tkn = rw.rlock(&slots).unwrap();
            rw.unlock(tkn).unwrap();
        });
    });
}

criterion_group!(benches, uncontended_lock, uncontended_rlock);
criterion_main!(benches);
