use flowtable::{chain, id32, modulo};

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn bench_modulo_single_thread(c: &mut Criterion) {
    let mut group = c.benchmark_group("modulo: single threaded");

    for &numel in [512u64, 4096, 32768].iter() {
        group.bench_with_input(BenchmarkId::new("insert_or_update", numel), &numel, |b, &numel| {
            let table: modulo::HashTable<u64, u64> = modulo::HashTable::new(numel as usize);

            for i in 0..numel {
                let _ = table.insert_or_update(i, i);
            }

            let mut key = 0;

            b.iter(|| {
                key = (key + 1) % numel;

                table.insert_or_update(black_box(key), key)
            })
        });

        group.bench_with_input(BenchmarkId::new("lookup", numel), &numel, |b, &numel| {
            let table: modulo::HashTable<u64, u64> = modulo::HashTable::new(numel as usize);

            for i in 0..numel {
                let _ = table.insert_or_update(i, i);
            }

            let mut key = 0;

            b.iter(|| {
                key = (key + 1) % numel;

                table.lookup(black_box(&key)).map(|guard| *guard)
            })
        });
    }

    group.finish();
}

fn bench_chain_locked_multi_thread(c: &mut Criterion) {
    let num_threads = 4;

    let table: Arc<chain::locked::HashTable<u64, u64>> =
        Arc::new(chain::locked::HashTable::new(32768, 32768));
    let keep_going = Arc::new(AtomicBool::new(true));

    let threads: Vec<_> = (0..num_threads - 1)
        .map(|i| {
            let table = table.clone();
            let keep_going = keep_going.clone();

            thread::spawn(move || {
                let mut key = i as u64;

                while keep_going.load(Ordering::Relaxed) {
                    let _ = table.insert(black_box(key), key);
                    table.remove(&key);
                    key = key.wrapping_add(num_threads as u64);
                }
            })
        })
        .collect();

    c.bench_function("chain locked: contended insert/remove", {
        let table = table.clone();

        move |b| {
            let mut key = u64::MAX;

            b.iter(|| {
                let _ = table.insert(black_box(key), key);
                table.remove(&key);
                key = key.wrapping_sub(1);
            })
        }
    });

    keep_going.store(false, Ordering::Relaxed);

    let _: Vec<_> = threads.into_iter().map(|t| t.join()).collect();
}

fn bench_id32_burst(c: &mut Criterion) {
    let table: id32::HashTable<u32> = id32::HashTable::new(16384);

    for key in 0..32768u32 {
        let _ = table.insert(key, key);
    }

    let keys: Vec<u32> = (0..32).collect();

    c.bench_function("id32: burst of 32", move |b| {
        let mut results = [0u32; 32];

        b.iter(|| {
            table.lookup_burst(black_box(&keys), &mut results);
            results[31]
        })
    });
}

criterion_group!(
    benches,
    bench_modulo_single_thread,
    bench_chain_locked_multi_thread,
    bench_id32_burst,
);
criterion_main!(benches);
