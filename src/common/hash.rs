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

use std::hash::{BuildHasher, Hash, Hasher};

/// Default hashing algorithm: [aHash] with fixed seeds.
///
/// The seeds are constants so that two processes mapping the same table
/// image agree on chunk selection. Tables that need a different algorithm
/// (or per-process randomization) inject one through their `with_hasher`
/// constructors; nothing else in the crate depends on the algorithm.
///
/// [aHash]: https://docs.rs/ahash
pub type DefaultHashBuilder = ahash::RandomState;

pub(crate) fn default_hash_builder() -> DefaultHashBuilder {
    DefaultHashBuilder::with_seeds(
        0xbb8c_4848_91ec_6c86,
        0x0522_a25a_e9c7_69f9,
        0xeed2_797b_9571_bc75,
        0x4feb_29c1_fbbd_59d0,
    )
}

/// Hashes `key` and keeps the low 32 bits. Chunk selection divides by the
/// chunk count, so the low bits are the ones that must avalanche.
pub(crate) fn hash_u32<K: Hash + ?Sized, S: BuildHasher>(build_hasher: &S, key: &K) -> u32 {
    let mut hasher = build_hasher.build_hasher();
    key.hash(&mut hasher);

    hasher.finish() as u32
}
