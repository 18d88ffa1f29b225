use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn bench_single_thread(c: &mut Criterion) {
    let mut group = c.benchmark_group("mutexed std map: single threaded");

    for &numel in [512u64, 4096, 32768].iter() {
        group.bench_with_input(BenchmarkId::new("insert", numel), &numel, |b, &numel| {
            let map = Mutex::new(HashMap::new());

            for i in 0..numel {
                map.lock().unwrap().insert(i, i);
            }

            let mut key = 0;

            b.iter(|| {
                key = (key + 1) % numel;

                map.lock().unwrap().insert(black_box(key), key)
            })
        });

        group.bench_with_input(BenchmarkId::new("lookup", numel), &numel, |b, &numel| {
            let map = Mutex::new(HashMap::new());

            for i in 0..numel {
                map.lock().unwrap().insert(i, i);
            }

            let mut key = 0;

            b.iter(|| {
                key = (key + 1) % numel;

                map.lock().unwrap().get(black_box(&key)).copied()
            })
        });
    }

    group.finish();
}

fn bench_multi_thread(c: &mut Criterion) {
    let num_threads = 4;

    let map = Arc::new(Mutex::new(HashMap::new()));
    let keep_going = Arc::new(AtomicBool::new(true));

    let threads: Vec<_> = (0..num_threads - 1)
        .map(|i| {
            let map = map.clone();
            let keep_going = keep_going.clone();

            thread::spawn(move || {
                let mut key = i as u64;

                while keep_going.load(Ordering::Relaxed) {
                    map.lock().unwrap().insert(black_box(key), key);
                    map.lock().unwrap().remove(&key);
                    key = key.wrapping_add(num_threads as u64);
                }
            })
        })
        .collect();

    c.bench_function("mutexed std map: contended insert/remove", {
        let map = map.clone();

        move |b| {
            let mut key = u64::MAX;

            b.iter(|| {
                map.lock().unwrap().insert(black_box(key), key);
                map.lock().unwrap().remove(&key);
                key = key.wrapping_sub(1);
            })
        }
    });

    keep_going.store(false, Ordering::Relaxed);

    let _: Vec<_> = threads.into_iter().map(|t| t.join()).collect();
}

criterion_group!(benches, bench_single_thread, bench_multi_thread);
criterion_main!(benches);
