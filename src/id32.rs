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

//! Compact table for 32-bit values with batched lookup.
//!
//! Values carry their own validity in the top bit ([`VALID_BIT`]); the
//! low 31 bits are caller payload. There is no chaining and there are no
//! locks: this is the ACL/config fast path, read constantly and written
//! rarely. Writers must be externally serialized. Readers run
//! concurrently with a writer under a publish-last protocol: the key is
//! written first and the value (with its validity bit) is stored with
//! release ordering afterwards, so a reader that observes a valid value
//! also observes the key it belongs to.
//!
//! Slot reuse is not protected from in-flight readers: a reader that
//! overlaps a `remove` of the key it is probing may miss it, and the
//! application must quiesce readers before recycling a slot for a
//! different key (the usual config-swap pattern already does).
//!
//! [`lookup_burst`] is the batch entry point: it hashes and prefetches
//! every target chunk before probing any of them, keeping up to
//! [`BURST_MAX`] independent memory accesses in flight.
//!
//! [`lookup_burst`]: HashTable::lookup_burst

#[cfg(all(
    any(target_arch = "x86", target_arch = "x86_64"),
    target_feature = "sse2"
))]
#[path = "id32/arch/sse2.rs"]
mod arch;

#[cfg(not(all(
    any(target_arch = "x86", target_arch = "x86_64"),
    target_feature = "sse2"
)))]
#[path = "id32/arch/generic.rs"]
mod arch;

use crate::{
    common::{
        boxed_zeroed_slice,
        hash::{default_hash_builder, hash_u32, DefaultHashBuilder},
        stats::{Counters, Stats},
    },
    error::InsertError,
    Visit,
};

use std::{
    cell::UnsafeCell,
    hash::{BuildHasher, Hash},
    mem::MaybeUninit,
    sync::atomic::{AtomicU32, Ordering},
};

use log::debug;

/// Top bit of a stored value: set iff the slot is live. The redundant
/// per-chunk validity mask allows masked scans without touching values.
pub const VALID_BIT: u32 = 0x8000_0000;

/// What [`HashTable::lookup_burst`] reports for a key that is not
/// present: a value with the validity bit clear.
pub const ABSENT: u32 = 0;

/// Upper bound on the number of keys in one burst.
pub const BURST_MAX: usize = 32;

#[repr(C)]
struct Slot<K> {
    key: UnsafeCell<MaybeUninit<K>>,
    value: AtomicU32,
}

#[repr(C, align(64))]
struct Chunk<K, const P: usize> {
    valid_mask: AtomicU32,
    _pad: u32,
    slots: [Slot<K>; P],
}

/// Fixed-capacity table mapping keys to 31-bit payloads, optimized for
/// batch lookup. See the module documentation for the write contract.
pub struct HashTable<K, S = DefaultHashBuilder, const P: usize = 4> {
    chunks: Box<[Chunk<K, P>]>,
    counters: Counters,
    build_hasher: S,
}

impl<K: Copy + Eq + Hash, const P: usize> HashTable<K, DefaultHashBuilder, P> {
    /// Creates a table of `num_chunks` chunks with the default fixed-seed
    /// hasher.
    pub fn new(num_chunks: usize) -> Self {
        Self::with_hasher(num_chunks, default_hash_builder())
    }
}

impl<K: Copy + Eq + Hash, S: BuildHasher, const P: usize> HashTable<K, S, P> {
    /// Creates a table that hashes keys with `build_hasher`.
    pub fn with_hasher(num_chunks: usize, build_hasher: S) -> Self {
        assert!(num_chunks > 0);
        assert!(P >= 1 && P <= 32);

        let chunks = unsafe { boxed_zeroed_slice(num_chunks) };

        debug!("id32 table: {} chunks of {} slots", num_chunks, P);

        Self {
            chunks,
            counters: Counters::default(),
            build_hasher,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.counters.snapshot().pairs as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.chunks.len() * P
    }

    /// Samples the health counters; `longest_chain` reports the fullest
    /// chunk occupancy observed.
    pub fn stats(&self) -> Stats {
        self.counters.snapshot()
    }

    fn chunk_index(&self, key: &K) -> usize {
        hash_u32(&self.build_hasher, key) as usize % self.chunks.len()
    }

    /// Inserts `key` with a 31-bit `payload` (the top bit must be clear;
    /// it belongs to the table). Re-inserting a resident key overwrites
    /// its payload. Fails with [`InsertError::Full`] when the chunk has
    /// no free slot; there is no chaining to fall back on.
    ///
    /// Writers must be externally serialized; this call may run
    /// concurrently with readers.
    pub fn insert(&self, key: K, payload: u32) -> Result<(), InsertError> {
        debug_assert_eq!(payload & VALID_BIT, 0);

        let chunk = &self.chunks[self.chunk_index(&key)];

        loop {
            let mask = chunk.valid_mask.load(Ordering::Acquire);

            // resident key: overwrite the payload in place
            let mut scan = mask;

            while scan != 0 {
                let slot = scan.trailing_zeros() as usize;
                scan &= scan - 1;

                let slot_ref = &chunk.slots[slot];

                if slot_ref.value.load(Ordering::Acquire) & VALID_BIT != 0
                    && unsafe { (*slot_ref.key.get()).assume_init() } == key
                {
                    slot_ref.value.store(payload | VALID_BIT, Ordering::Release);

                    return Ok(());
                }
            }

            let free = !mask & low_bits(P);

            if free == 0 {
                self.counters.note_insert_failed();

                return Err(InsertError::Full);
            }

            let slot = free.trailing_zeros() as usize;
            let bit = 1 << slot;

            // claim the slot in the mask first; a lost race (a second
            // writer despite the serialization contract) rescans instead
            // of tearing a key
            let previous = chunk.valid_mask.fetch_or(bit, Ordering::AcqRel);

            if previous & bit != 0 {
                continue;
            }

            let slot_ref = &chunk.slots[slot];

            unsafe { *slot_ref.key.get() = MaybeUninit::new(key) };
            // publish last: readers that see the validity bit also see
            // the key written above
            slot_ref.value.store(payload | VALID_BIT, Ordering::Release);

            self.counters.pair_added();
            self.counters
                .note_chain_len(u64::from((previous | bit).count_ones()));

            return Ok(());
        }
    }

    fn probe(&self, chunk: &Chunk<K, P>, key: &K) -> Option<(usize, u32)> {
        let mut mask = chunk.valid_mask.load(Ordering::Acquire);

        while mask != 0 {
            let slot = mask.trailing_zeros() as usize;
            mask &= mask - 1;

            let slot_ref = &chunk.slots[slot];
            let value = slot_ref.value.load(Ordering::Acquire);

            if value & VALID_BIT == 0 {
                // claimed but not yet published, or just removed
                continue;
            }

            if unsafe { (*slot_ref.key.get()).assume_init() } == *key {
                return Some((slot, value));
            }
        }

        None
    }

    /// Looks up a single key, returning its 31-bit payload.
    pub fn lookup(&self, key: &K) -> Option<u32> {
        let chunk = &self.chunks[self.chunk_index(key)];

        self.probe(chunk, key).map(|(_, value)| value & !VALID_BIT)
    }

    /// Batched lookup of up to [`BURST_MAX`] keys. `results[i]` receives
    /// the stored value for `keys[i]` (validity bit set) or [`ABSENT`].
    ///
    /// The first pass hashes every key and prefetches its chunk; the
    /// second pass probes. An empty burst is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if `keys` and `results` differ in length or exceed
    /// [`BURST_MAX`].
    pub fn lookup_burst(&self, keys: &[K], results: &mut [u32]) {
        assert_eq!(keys.len(), results.len());
        assert!(keys.len() <= BURST_MAX);

        let mut indices = [0usize; BURST_MAX];

        for (i, key) in keys.iter().enumerate() {
            let index = self.chunk_index(key);

            indices[i] = index;
            arch::prefetch(&self.chunks[index] as *const Chunk<K, P>);
        }

        for (i, key) in keys.iter().enumerate() {
            results[i] = self
                .probe(&self.chunks[indices[i]], key)
                .map(|(_, value)| value)
                .unwrap_or(ABSENT);
        }
    }

    /// Removes `key`, returning whether it was present. Writers must be
    /// externally serialized.
    pub fn remove(&self, key: &K) -> bool {
        let chunk = &self.chunks[self.chunk_index(key)];

        match self.probe(chunk, key) {
            Some((slot, _)) => {
                // invalidate the value before freeing the slot so
                // readers stop matching first
                chunk.slots[slot].value.store(0, Ordering::Release);
                chunk.valid_mask.fetch_and(!(1 << slot), Ordering::Release);

                self.counters.pair_removed();

                true
            }
            None => false,
        }
    }

    /// Empties the table. Exclusive access stands in for the write
    /// serialization *and* reader quiescence this needs.
    pub fn clear(&mut self) {
        for chunk in self.chunks.iter() {
            for slot in chunk.slots.iter() {
                slot.value.store(0, Ordering::Relaxed);
            }

            chunk.valid_mask.store(0, Ordering::Relaxed);
        }

        self.counters.reset();
    }

    /// Visits every live entry with its payload (validity bit stripped).
    /// Entries for which the visitor returns [`Visit::Remove`] are
    /// cleared.
    pub fn iterate<F: FnMut(&K, u32) -> Visit>(&mut self, mut f: F) {
        for chunk in self.chunks.iter() {
            let mut mask = chunk.valid_mask.load(Ordering::Relaxed);

            while mask != 0 {
                let slot = mask.trailing_zeros() as usize;
                mask &= mask - 1;

                let slot_ref = &chunk.slots[slot];
                let value = slot_ref.value.load(Ordering::Relaxed);

                if value & VALID_BIT == 0 {
                    continue;
                }

                let key = unsafe { (*slot_ref.key.get()).assume_init() };

                if f(&key, value & !VALID_BIT) == Visit::Remove {
                    slot_ref.value.store(0, Ordering::Relaxed);
                    chunk
                        .valid_mask
                        .fetch_and(!(1 << (slot as u32)), Ordering::Relaxed);

                    self.counters.pair_removed();
                }
            }
        }
    }
}

unsafe impl<K: Send, S: Send, const P: usize> Send for HashTable<K, S, P> {}
unsafe impl<K: Send + Sync, S: Sync, const P: usize> Sync for HashTable<K, S, P> {}

fn low_bits(width: usize) -> u32 {
    if width >= 32 {
        u32::MAX
    } else {
        (1 << width) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_lookup() {
        let table: HashTable<u32> = HashTable::new(16);

        assert_eq!(table.insert(5, 500), Ok(()));
        assert_eq!(table.lookup(&5), Some(500));
        assert_eq!(table.lookup(&6), None);
        assert_eq!(table.stats().pairs, 1);
    }

    #[test]
    fn reinsert_overwrites_payload() {
        let table: HashTable<u32> = HashTable::new(16);

        table.insert(5, 1).unwrap();
        table.insert(5, 2).unwrap();

        assert_eq!(table.lookup(&5), Some(2));
        assert_eq!(table.stats().pairs, 1);
    }

    #[test]
    fn full_chunk_fails() {
        let table: HashTable<u32, DefaultHashBuilder, 4> = HashTable::new(1);

        for key in 0..4 {
            table.insert(key, key).unwrap();
        }

        assert_eq!(table.insert(4, 4), Err(InsertError::Full));
        assert_eq!(table.stats().insert_failed, 1);

        // resident keys still update
        assert_eq!(table.insert(2, 22), Ok(()));
        assert_eq!(table.lookup(&2), Some(22));
    }

    #[test]
    fn burst_of_thirty_two() {
        let table: HashTable<u32, DefaultHashBuilder, 32> = HashTable::new(1);

        for key in 0..32 {
            table.insert(key, key + 1).unwrap();
        }

        let keys: Vec<u32> = (0..32).collect();
        let mut results = [0u32; 32];

        table.lookup_burst(&keys, &mut results);

        for (key, result) in keys.iter().zip(results.iter()) {
            assert_eq!(*result, (key + 1) | VALID_BIT);
        }
    }

    #[test]
    fn burst_reports_absent() {
        let table: HashTable<u32> = HashTable::new(16);

        table.insert(1, 10).unwrap();

        let mut results = [0u32; 2];
        table.lookup_burst(&[100, 101], &mut results);

        assert_eq!(results, [ABSENT, ABSENT]);
        assert_eq!(results[0] & VALID_BIT, 0);
    }

    #[test]
    fn empty_burst_is_a_noop() {
        let table: HashTable<u32> = HashTable::new(16);

        let keys: [u32; 0] = [];
        let mut results: [u32; 0] = [];

        table.lookup_burst(&keys, &mut results);
    }

    #[test]
    fn remove_then_slot_reusable() {
        let table: HashTable<u32, DefaultHashBuilder, 4> = HashTable::new(1);

        for key in 0..4 {
            table.insert(key, key).unwrap();
        }

        assert!(table.remove(&1));
        assert!(!table.remove(&1));
        assert_eq!(table.lookup(&1), None);

        assert_eq!(table.insert(9, 90), Ok(()));
        assert_eq!(table.lookup(&9), Some(90));
    }

    #[test]
    fn validity_bit_and_mask_agree() {
        let table: HashTable<u32, DefaultHashBuilder, 16> = HashTable::new(1);

        for key in 0..12 {
            table.insert(key, key).unwrap();
        }

        table.remove(&3);
        table.remove(&7);

        for chunk in table.chunks.iter() {
            let mask = chunk.valid_mask.load(Ordering::Relaxed);

            for (slot, slot_ref) in chunk.slots.iter().enumerate() {
                let value_live = slot_ref.value.load(Ordering::Relaxed) & VALID_BIT != 0;
                let mask_live = mask & (1 << slot) != 0;

                assert_eq!(value_live, mask_live);
            }
        }
    }

    #[test]
    fn clear_and_iterate() {
        let mut table: HashTable<u32, DefaultHashBuilder, 32> = HashTable::new(1);

        for key in 0..16 {
            table.insert(key, key * 2).unwrap();
        }

        let mut seen = 0;
        table.iterate(|key, payload| {
            assert_eq!(payload, key * 2);
            seen += 1;

            if key % 2 == 0 {
                Visit::Remove
            } else {
                Visit::Keep
            }
        });

        assert_eq!(seen, 16);
        assert_eq!(table.len(), 8);

        table.clear();

        assert_eq!(table.stats(), Stats::default());
        assert_eq!(table.lookup(&1), None);
    }

    #[test]
    fn extreme_keys() {
        let table: HashTable<u32> = HashTable::new(8);

        table.insert(0, 1).unwrap();
        table.insert(u32::MAX, 2).unwrap();

        assert_eq!(table.lookup(&0), Some(1));
        assert_eq!(table.lookup(&u32::MAX), Some(2));
    }
}
