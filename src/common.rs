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

//! Infrastructure shared by every table variant: hashing, spinlocks, and
//! statistics counters.

pub(crate) mod hash;
pub(crate) mod lock;
pub(crate) mod stats;

use std::ptr;

/// Allocates a boxed slice of `length` elements whose bytes are all zero.
///
/// # Safety
///
/// All-zero bytes must be a valid representation of `T`. Every chunk type
/// in this crate is designed so that a zeroed chunk is a valid empty chunk.
pub(crate) unsafe fn boxed_zeroed_slice<T>(length: usize) -> Box<[T]> {
    let mut vec = Vec::with_capacity(length);
    ptr::write_bytes(vec.as_mut_ptr(), 0, length);
    vec.set_len(length);

    vec.into_boxed_slice()
}
