// MIT License
//
// Copyright (c) 2020 Gregory Meyer
//
// Permission is hereby granted, free of charge, to any person
// obtaining a copy of this software and associated documentation files
// (the "Software"), to deal in the Software without restriction,
// including without limitation the rights to use, copy, modify, merge,
// publish, distribute, sublicense, and/or sell copies of the Software,
// and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:
//
// The above copyright notice and this permission notice shall be
// included in all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND,
// EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF
// MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND
// NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS
// BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER IN AN
// ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! Fixed-capacity, chunked, concurrent hash tables for the data path of
//! a packet-processing engine.
//!
//! Every table in this crate maps fixed-width keys to fixed-width values
//! inside a contiguous array of cache-line-aligned chunks. Capacity is
//! chosen at creation and never changes: there is no resizing, no
//! rehashing, and no allocation on the steady-state path. Chunk memory
//! holds no process-local pointers, so a table image can live in shared
//! memory mapped by several processes.
//!
//! Four variants cover the usual data-path roles:
//!
//! - [`chain::HashTable`]: chain-with-overflow table for externally
//!   synchronized use; the fastest lookups when concurrency is handled
//!   elsewhere.
//! - [`chain::locked::HashTable`]: the same layout behind a recursive
//!   spinlock per chunk, for multi-writer/multi-reader flow state.
//! - [`modulo::HashTable`]: open-addressed within a single chunk,
//!   non-recursive spinlock per chunk, no chaining; the general-purpose
//!   concurrent table. [`modulo::dynamic::HashTable`] is its
//!   runtime-sized twin running over caller-provisioned memory.
//! - [`id32::HashTable`]: compact table for 31-bit payloads with a
//!   validity bit in the value and batched (`lookup_burst`) reads; the
//!   ACL/config fast path.
//!
//! Hashing is injected per table as a [`BuildHasher`] type parameter;
//! [`DefaultHashBuilder`] is fixed-seed [aHash] so processes sharing an
//! image agree on chunk selection.
//!
//! [aHash]: https://docs.rs/ahash
//! [`BuildHasher`]: std::hash::BuildHasher

mod common;

pub mod chain;
pub mod error;
pub mod id32;
pub mod modulo;

pub use common::hash::DefaultHashBuilder;
pub use common::lock::{RawLock, ReentrantSpinlock, Spinlock, ValueGuard};
pub use common::stats::Stats;
pub use error::InsertError;

/// Decision returned by iteration and sweep visitors.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Visit {
    /// Leave the entry in place.
    Keep,
    /// Clear the entry's slot.
    Remove,
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn chain_locked_concurrent_insertion() {
        const NUM_THREADS: usize = 8;
        const KEYS_PER_THREAD: u64 = 1024;
        const TOTAL: u64 = NUM_THREADS as u64 * KEYS_PER_THREAD;

        let table: Arc<chain::locked::HashTable<u64, u64>> =
            Arc::new(chain::locked::HashTable::new(4096, 4096));
        let barrier = Arc::new(Barrier::new(NUM_THREADS));

        let threads: Vec<_> = (0..NUM_THREADS)
            .map(|i| {
                let table = table.clone();
                let barrier = barrier.clone();

                thread::spawn(move || {
                    barrier.wait();

                    for j in (0..KEYS_PER_THREAD).map(|j| j + (i as u64 * KEYS_PER_THREAD)) {
                        assert_eq!(table.insert(j, j * 2), Ok(()));
                    }
                })
            })
            .collect();

        for result in threads.into_iter().map(|t| t.join()) {
            assert!(result.is_ok());
        }

        assert_eq!(table.len() as u64, TOTAL);

        for i in 0..TOTAL {
            assert_eq!(*table.lookup(&i).unwrap(), i * 2);
        }
    }

    #[test]
    fn chain_locked_concurrent_insertion_and_removal() {
        const NUM_THREADS: usize = 8;
        const KEYS_PER_THREAD: u64 = 512;
        const MIDPOINT: u64 = NUM_THREADS as u64 * KEYS_PER_THREAD;

        let table: Arc<chain::locked::HashTable<u64, u64>> =
            Arc::new(chain::locked::HashTable::new(2048, 4096));

        for i in MIDPOINT..(2 * MIDPOINT) {
            assert_eq!(table.insert(i, i), Ok(()));
        }

        let barrier = Arc::new(Barrier::new(NUM_THREADS * 2));

        let insert_threads: Vec<_> = (0..NUM_THREADS)
            .map(|i| {
                let table = table.clone();
                let barrier = barrier.clone();

                thread::spawn(move || {
                    barrier.wait();

                    for j in (0..KEYS_PER_THREAD).map(|j| j + (i as u64 * KEYS_PER_THREAD)) {
                        assert_eq!(table.insert(j, j), Ok(()));
                    }
                })
            })
            .collect();

        let remove_threads: Vec<_> = (0..NUM_THREADS)
            .map(|i| {
                let table = table.clone();
                let barrier = barrier.clone();

                thread::spawn(move || {
                    barrier.wait();

                    for j in
                        (0..KEYS_PER_THREAD).map(|j| MIDPOINT + j + (i as u64 * KEYS_PER_THREAD))
                    {
                        assert!(table.remove(&j));
                    }
                })
            })
            .collect();

        for result in insert_threads
            .into_iter()
            .chain(remove_threads.into_iter())
            .map(|t| t.join())
        {
            assert!(result.is_ok());
        }

        assert_eq!(table.len() as u64, MIDPOINT);

        for i in 0..MIDPOINT {
            assert_eq!(*table.lookup(&i).unwrap(), i);
        }

        for i in MIDPOINT..(2 * MIDPOINT) {
            assert!(table.lookup(&i).is_none());
        }
    }

    #[test]
    fn modulo_concurrent_insert_or_update_overlapped() {
        const NUM_THREADS: u64 = 8;
        const MAX_KEY: u64 = 512;

        let table: Arc<modulo::HashTable<u64, u64, DefaultHashBuilder, 32>> =
            Arc::new(modulo::HashTable::new(64));

        let threads: Vec<_> = (0..NUM_THREADS)
            .map(|i| {
                let table = table.clone();

                thread::spawn(move || {
                    for key in 0..MAX_KEY {
                        table
                            .insert_or_update(key, key * NUM_THREADS + i)
                            .expect("table is sized for the keyspace");
                    }
                })
            })
            .collect();

        for result in threads.into_iter().map(|t| t.join()) {
            assert!(result.is_ok());
        }

        assert_eq!(table.len() as u64, MAX_KEY);

        // no torn values: every key holds one of the values written for it
        for key in 0..MAX_KEY {
            let value = *table.lookup(&key).unwrap();

            assert_eq!(value / NUM_THREADS, key);
        }
    }

    #[test]
    fn id32_readers_run_against_a_serialized_writer() {
        const MAX_KEY: u32 = 256;
        const NUM_READERS: usize = 4;

        let table: Arc<id32::HashTable<u32, DefaultHashBuilder, 32>> =
            Arc::new(id32::HashTable::new(32));
        let barrier = Arc::new(Barrier::new(NUM_READERS + 1));

        let readers: Vec<_> = (0..NUM_READERS)
            .map(|_| {
                let table = table.clone();
                let barrier = barrier.clone();

                thread::spawn(move || {
                    barrier.wait();

                    // every observed value must be fully published
                    for _ in 0..64 {
                        let keys: Vec<u32> = (0..32).collect();
                        let mut results = [0u32; 32];

                        table.lookup_burst(&keys, &mut results);

                        for (key, result) in keys.iter().zip(results.iter()) {
                            if *result != id32::ABSENT {
                                assert_eq!(*result, (key + 1) | id32::VALID_BIT);
                            }
                        }
                    }
                })
            })
            .collect();

        barrier.wait();

        // a single writer satisfies the external-serialization contract
        for key in 0..MAX_KEY {
            table.insert(key, key + 1).unwrap();
        }

        for result in readers.into_iter().map(|t| t.join()) {
            assert!(result.is_ok());
        }

        for key in 0..MAX_KEY {
            assert_eq!(table.lookup(&key), Some(key + 1));
        }
    }
}
