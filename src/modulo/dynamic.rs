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

//! Runtime-sized modulo table over caller-owned memory.
//!
//! Semantics are identical to [`modulo::HashTable`](super::HashTable);
//! the difference is provisioning. The caller asks
//! [`calculate_sizeof`](HashTable::calculate_sizeof) for the byte
//! requirement, carves a zeroed, 64-byte-aligned region out of whatever
//! memory it manages (typically shared or huge-page space), and installs
//! it through the [`Updater`], the sole mutator of the backing pointer.
//! Until a region is installed the table behaves as empty and full at
//! the same time: lookups miss and inserts report `Full`.
//!
//! Repointing is only legal during a quiescent interval; the table does
//! not provide reader/writer epochs. The `generation` value passed to
//! `update_pointer` is surfaced via [`generation`](HashTable::generation)
//! so observers can tell a logical reset from in-place data updates.

use crate::{
    common::{
        hash::{default_hash_builder, hash_u32, DefaultHashBuilder},
        lock::{Spinlock, ValueGuard},
        stats::{Counters, Stats},
    },
    error::InsertError,
    Visit,
};

use super::Chunk;

use std::{
    hash::{BuildHasher, Hash},
    marker::PhantomData,
    mem, slice,
    sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering},
};

use log::debug;

/// Runtime-sized, chunk-locked hash table whose chunk array lives in
/// memory the caller owns. See the module documentation.
pub struct HashTable<K, V, S = DefaultHashBuilder, const P: usize = 8> {
    chunks: AtomicPtr<Chunk<K, V, P>>,
    num_chunks: AtomicU32,
    generation: AtomicU64,
    counters: Counters,
    build_hasher: S,
}

impl<K: Copy + Eq + Hash, V: Copy, const P: usize> HashTable<K, V, DefaultHashBuilder, P> {
    /// Creates an unbound table with the default fixed-seed hasher.
    pub fn new() -> Self {
        Self::with_hasher(default_hash_builder())
    }
}

impl<K: Copy + Eq + Hash, V: Copy, const P: usize> Default
    for HashTable<K, V, DefaultHashBuilder, P>
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Copy + Eq + Hash, V: Copy, S: BuildHasher, const P: usize> HashTable<K, V, S, P> {
    /// Creates an unbound table that hashes keys with `build_hasher`.
    pub fn with_hasher(build_hasher: S) -> Self {
        assert!(P >= 1 && P <= 32);

        Self {
            chunks: AtomicPtr::new(std::ptr::null_mut()),
            num_chunks: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            counters: Counters::default(),
            build_hasher,
        }
    }

    /// Bytes required for a chunk array of `num_chunks` chunks. The
    /// region handed to [`Updater::update_pointer`] must be at least this
    /// large, zeroed, and 64-byte aligned.
    pub const fn calculate_sizeof(num_chunks: u32) -> usize {
        num_chunks as usize * mem::size_of::<Chunk<K, V, P>>()
    }

    /// The generation installed by the last `update_pointer`.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Handle through which the backing pointer is replaced.
    pub fn updater(&self) -> Updater<'_, K, V, S, P> {
        Updater {
            table: self,
            _marker: PhantomData,
        }
    }

    fn chunk_slice(&self) -> Option<&[Chunk<K, V, P>]> {
        let base = self.chunks.load(Ordering::Acquire);

        if base.is_null() {
            return None;
        }

        let len = self.num_chunks.load(Ordering::Relaxed) as usize;

        if len == 0 {
            return None;
        }

        Some(unsafe { slice::from_raw_parts(base, len) })
    }

    /// Number of live entries. Approximate while writers are active.
    pub fn len(&self) -> usize {
        self.counters.snapshot().pairs as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slots in the installed region; 0 while unbound.
    pub fn capacity(&self) -> usize {
        self.num_chunks.load(Ordering::Relaxed) as usize * P
    }

    /// Samples the health counters; see also
    /// [`sweep_stats`](Self::sweep_stats) for the recounted view.
    pub fn stats(&self) -> Stats {
        self.counters.snapshot()
    }

    /// The table hash of `key`.
    pub fn hash(&self, key: &K) -> u32 {
        hash_u32(&self.build_hasher, key)
    }

    fn chunk_at<'a>(&self, chunks: &'a [Chunk<K, V, P>], hash: u32) -> &'a Chunk<K, V, P> {
        &chunks[hash as usize % chunks.len()]
    }

    /// Inserts with a caller-precomputed hash; replaces the value of an
    /// existing key. Fails with [`InsertError::Full`] when the chunk has
    /// no room, or (without counting) when no region is installed.
    pub fn insert(&self, hash: u32, key: K, value: V) -> Result<(), InsertError> {
        debug_assert_eq!(hash, self.hash(&key));

        match self.chunk_slice() {
            Some(chunks) => self.chunk_at(chunks, hash).insert(key, value, &self.counters),
            None => Err(InsertError::Full),
        }
    }

    /// Hash-and-insert convenience; fails only on a full chunk.
    pub fn insert_or_update(&self, key: K, value: V) -> Result<(), InsertError> {
        self.insert(self.hash(&key), key, value)
    }

    /// Looks up `key`, returning the value bundled with the held chunk
    /// lock. Do not call back into this table while the guard lives.
    pub fn lookup(&self, key: &K) -> Option<ValueGuard<'_, V, Spinlock>> {
        let chunks = self.chunk_slice()?;
        let chunk = self.chunk_at(chunks, self.hash(key));

        chunk
            .lookup(key)
            .map(|value| ValueGuard::new(value, &chunk.lock))
    }

    /// Removes `key`, returning whether it was present.
    pub fn remove(&self, key: &K) -> bool {
        match self.chunk_slice() {
            Some(chunks) => self
                .chunk_at(chunks, self.hash(key))
                .remove(key, &self.counters),
            None => false,
        }
    }

    /// Empties the installed region chunk by chunk; a no-op while
    /// unbound.
    pub fn clear(&self) {
        if let Some(chunks) = self.chunk_slice() {
            for chunk in chunks.iter() {
                chunk.clear();
            }

            self.counters.reset();
        }
    }

    /// Visits every live entry under the chunk locks; the visitor must
    /// not call back into the table.
    pub fn iterate<F: FnMut(&K, &mut V) -> Visit>(&self, mut f: F) {
        if let Some(chunks) = self.chunk_slice() {
            for chunk in chunks.iter() {
                chunk.visit(&mut f, &self.counters);
            }
        }
    }

    /// Incremental statistics recount. Only chunks whose generation moved
    /// since `sweeper` last saw them are relocked and recounted; the
    /// cache is rebuilt wholesale when the table generation (or the
    /// region size) changed. A freshly zeroed region needs no recount at
    /// all: the zeroed cache is already exact.
    pub fn sweep_stats(&self, sweeper: &mut StatsSweeper) -> Stats {
        let insert_failed = self.counters.snapshot().insert_failed;

        let chunks = match self.chunk_slice() {
            Some(chunks) => chunks,
            None => {
                sweeper.generations.clear();
                sweeper.occupancy.clear();

                return Stats {
                    insert_failed,
                    ..Stats::default()
                };
            }
        };

        let table_generation = self.generation();

        if sweeper.table_generation != table_generation
            || sweeper.generations.len() != chunks.len()
        {
            sweeper.generations = vec![0; chunks.len()];
            sweeper.occupancy = vec![0; chunks.len()];
            sweeper.table_generation = table_generation;
        }

        let mut pairs = 0u64;
        let mut longest_chain = 0u64;

        for (index, chunk) in chunks.iter().enumerate() {
            if chunk.generation() != sweeper.generations[index] {
                let (generation, occupancy) = chunk.recount();

                sweeper.generations[index] = generation;
                sweeper.occupancy[index] = occupancy;
            }

            pairs += u64::from(sweeper.occupancy[index]);
            longest_chain = longest_chain.max(u64::from(sweeper.occupancy[index]));
        }

        Stats {
            pairs,
            extended_chunks_used: 0,
            longest_chain,
            insert_failed,
        }
    }
}

unsafe impl<K: Send, V: Send, S: Send, const P: usize> Send for HashTable<K, V, S, P> {}
unsafe impl<K: Send + Sync, V: Send + Sync, S: Sync, const P: usize> Sync
    for HashTable<K, V, S, P>
{
}

/// Sole mutator of a dynamic table's backing pointer.
pub struct Updater<'t, K, V, S, const P: usize> {
    table: &'t HashTable<K, V, S, P>,
    _marker: PhantomData<*mut Chunk<K, V, P>>,
}

impl<K: Copy + Eq + Hash, V: Copy, S: BuildHasher, const P: usize> Updater<'_, K, V, S, P> {
    /// Points the table at a chunk array of `num_chunks` chunks starting
    /// at `base` and records `generation`. Passing a null `base` detaches
    /// the table.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of
    /// [`calculate_sizeof(num_chunks)`](HashTable::calculate_sizeof)
    /// bytes, zeroed, 64-byte aligned, and immovable for as long as the
    /// table refers to it. The table must be quiescent: no other thread
    /// may be inside any table operation during the call.
    pub unsafe fn update_pointer(&mut self, base: *mut u8, generation: u64, num_chunks: u32) {
        debug_assert!(base.is_null() || base as usize % 64 == 0);

        debug!(
            "dynamic modulo table repointed: {} chunks of {} pairs, generation {}",
            num_chunks, P, generation
        );

        self.table.num_chunks.store(num_chunks, Ordering::Relaxed);
        self.table.generation.store(generation, Ordering::Relaxed);
        self.table
            .chunks
            .store(base as *mut Chunk<K, V, P>, Ordering::Release);
        self.table.counters.reset();
    }
}

/// Per-chunk generation and occupancy cache driven by
/// [`HashTable::sweep_stats`].
#[derive(Debug, Default)]
pub struct StatsSweeper {
    generations: Vec<u32>,
    occupancy: Vec<u32>,
    table_generation: u64,
}

impl StatsSweeper {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::alloc::{alloc_zeroed, dealloc, Layout};

    fn region_for(num_chunks: u32) -> (*mut u8, Layout) {
        let layout =
            Layout::from_size_align(HashTable::<u64, u64>::calculate_sizeof(num_chunks), 64)
                .unwrap();

        (unsafe { alloc_zeroed(layout) }, layout)
    }

    #[test]
    fn unbound_table_degrades_gracefully() {
        let table: HashTable<u64, u64> = HashTable::new();

        assert!(table.lookup(&1).is_none());
        assert_eq!(table.insert_or_update(1, 1), Err(InsertError::Full));
        assert!(!table.remove(&1));
        assert_eq!(table.capacity(), 0);

        // the unbound Full is a provisioning problem, not a sizing one
        assert_eq!(table.stats().insert_failed, 0);

        table.clear();
        table.iterate(|_, _| Visit::Keep);
    }

    #[test]
    fn install_then_operate() {
        let table: HashTable<u64, u64> = HashTable::new();
        let (base, layout) = region_for(64);

        let mut updater = table.updater();
        unsafe { updater.update_pointer(base, 1, 64) };

        assert_eq!(table.generation(), 1);
        assert_eq!(table.capacity(), 64 * 8);

        let hash = table.hash(&42);
        assert_eq!(table.insert(hash, 42, 1000), Ok(()));
        assert_eq!(*table.lookup(&42).unwrap(), 1000);
        assert_eq!(table.stats().pairs, 1);

        assert!(table.remove(&42));
        assert!(table.lookup(&42).is_none());

        unsafe { updater.update_pointer(std::ptr::null_mut(), 2, 0) };
        unsafe { dealloc(base, layout) };
    }

    #[test]
    fn full_chunk_without_chaining() {
        let table: HashTable<u64, u64, DefaultHashBuilder, 4> = HashTable::new();
        let layout = Layout::from_size_align(
            HashTable::<u64, u64, DefaultHashBuilder, 4>::calculate_sizeof(1),
            64,
        )
        .unwrap();
        let base = unsafe { alloc_zeroed(layout) };

        let mut updater = table.updater();
        unsafe { updater.update_pointer(base, 0, 1) };

        for key in 1..=4 {
            table.insert_or_update(key, key).unwrap();
        }

        assert_eq!(table.insert_or_update(5, 5), Err(InsertError::Full));
        assert_eq!(table.stats().insert_failed, 1);
        assert_eq!(table.stats().pairs, 4);

        unsafe { updater.update_pointer(std::ptr::null_mut(), 0, 0) };
        unsafe { dealloc(base, layout) };
    }

    #[test]
    fn incremental_stats_touch_only_changed_chunks() {
        let table: HashTable<u64, u64, DefaultHashBuilder, 32> = HashTable::new();
        let layout = Layout::from_size_align(
            HashTable::<u64, u64, DefaultHashBuilder, 32>::calculate_sizeof(32),
            64,
        )
        .unwrap();
        let base = unsafe { alloc_zeroed(layout) };

        let mut updater = table.updater();
        unsafe { updater.update_pointer(base, 7, 32) };

        let mut sweeper = StatsSweeper::new();

        // a zeroed region sweeps to zero without recounts
        assert_eq!(table.sweep_stats(&mut sweeper).pairs, 0);

        for key in 0..100 {
            table.insert_or_update(key, key).unwrap();
        }

        let stats = table.sweep_stats(&mut sweeper);
        assert_eq!(stats.pairs, 100);
        assert!(stats.longest_chain >= 1);

        table.remove(&12);
        let stats = table.sweep_stats(&mut sweeper);
        assert_eq!(stats.pairs, 99);

        // idempotent when nothing changed
        assert_eq!(table.sweep_stats(&mut sweeper).pairs, 99);

        unsafe { updater.update_pointer(std::ptr::null_mut(), 8, 0) };
        unsafe { dealloc(base, layout) };
    }

    #[test]
    fn repointing_resets_the_sweeper() {
        let table: HashTable<u64, u64> = HashTable::new();
        let (first, first_layout) = region_for(16);
        let (second, second_layout) = region_for(16);

        let mut updater = table.updater();
        unsafe { updater.update_pointer(first, 1, 16) };

        for key in 0..10 {
            table.insert_or_update(key, key).unwrap();
        }

        let mut sweeper = StatsSweeper::new();
        assert_eq!(table.sweep_stats(&mut sweeper).pairs, 10);

        unsafe { updater.update_pointer(second, 2, 16) };

        // fresh region, fresh generation: the sweeper starts over
        assert_eq!(table.sweep_stats(&mut sweeper).pairs, 0);
        assert_eq!(table.generation(), 2);

        unsafe { updater.update_pointer(std::ptr::null_mut(), 3, 0) };
        unsafe { dealloc(first, first_layout) };
        unsafe { dealloc(second, second_layout) };
    }
}
