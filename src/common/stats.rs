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

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

/// Point-in-time table health counters.
///
/// Sampled from concurrently updated tables, this is an approximate view:
/// the counters are individually monotonic between `clear`s but are not
/// sequentially consistent with the data they describe. `longest_chain` in
/// particular is an opportunistic maximum that may lag concurrent growth
/// and over-read after shrinkage; quiesce writers before asserting on it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Live entries across the whole table.
    pub pairs: u64,
    /// Extended chunks currently linked into chains (0 for the modulo
    /// variants).
    pub extended_chunks_used: u64,
    /// Longest chunk chain observed, in chunks (primary plus extended);
    /// for the modulo variants, the fullest chunk occupancy observed.
    pub longest_chain: u64,
    /// Inserts that failed with `Full` since the last `clear`.
    pub insert_failed: u64,
}

/// Atomic counter block for the locked variants. Lives in its own cache
/// line so sampling never contends with chunk traffic.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    inner: CachePadded<Block>,
}

#[derive(Debug, Default)]
struct Block {
    pairs: AtomicU64,
    extended_chunks_used: AtomicU64,
    longest_chain: AtomicU64,
    insert_failed: AtomicU64,
}

impl Counters {
    pub(crate) fn pair_added(&self) {
        self.inner.pairs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn pair_removed(&self) {
        self.inner.pairs.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn extended_added(&self) {
        self.inner.extended_chunks_used.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn extended_removed(&self) {
        self.inner.extended_chunks_used.fetch_sub(1, Ordering::Relaxed);
    }

    /// Records a chain (or occupancy) length; keeps the running maximum.
    pub(crate) fn note_chain_len(&self, len: u64) {
        self.inner.longest_chain.fetch_max(len, Ordering::Relaxed);
    }

    pub(crate) fn note_insert_failed(&self) {
        self.inner.insert_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> Stats {
        Stats {
            pairs: self.inner.pairs.load(Ordering::Relaxed),
            extended_chunks_used: self.inner.extended_chunks_used.load(Ordering::Relaxed),
            longest_chain: self.inner.longest_chain.load(Ordering::Relaxed),
            insert_failed: self.inner.insert_failed.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn reset(&self) {
        self.inner.pairs.store(0, Ordering::Relaxed);
        self.inner.extended_chunks_used.store(0, Ordering::Relaxed);
        self.inner.longest_chain.store(0, Ordering::Relaxed);
        self.inner.insert_failed.store(0, Ordering::Relaxed);
    }
}

/// Plain counter block for the externally synchronized variants, whose
/// mutators hold `&mut self` and need no atomics.
#[derive(Debug, Default)]
pub(crate) struct LocalCounters {
    pub(crate) pairs: u64,
    pub(crate) extended_chunks_used: u64,
    pub(crate) longest_chain: u64,
    pub(crate) insert_failed: u64,
}

impl LocalCounters {
    pub(crate) fn note_chain_len(&mut self, len: u64) {
        if len > self.longest_chain {
            self.longest_chain = len;
        }
    }

    pub(crate) fn snapshot(&self) -> Stats {
        Stats {
            pairs: self.pairs,
            extended_chunks_used: self.extended_chunks_used,
            longest_chain: self.longest_chain,
            insert_failed: self.insert_failed,
        }
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_chain_is_monotonic() {
        let counters = Counters::default();

        counters.note_chain_len(3);
        counters.note_chain_len(2);

        assert_eq!(counters.snapshot().longest_chain, 3);

        counters.note_chain_len(5);
        assert_eq!(counters.snapshot().longest_chain, 5);
    }

    #[test]
    fn reset_zeroes_everything() {
        let counters = Counters::default();

        counters.pair_added();
        counters.extended_added();
        counters.note_insert_failed();
        counters.reset();

        assert_eq!(counters.snapshot(), Stats::default());
    }
}
