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

//! Errors returned by table mutators.

use thiserror::Error;

/// Possible failures of an insertion.
///
/// Lookup and removal misses are not errors; they are reported as `None`
/// and `false` respectively.
#[derive(Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertError {
    /// The key is already present. Only strict insertion reports this;
    /// update-style operations overwrite instead.
    #[error("key is already present")]
    Duplicate,

    /// The target chunk (and, for chained tables, its overflow chain and
    /// the extended pool) has no room. The table never resizes or evicts;
    /// this is the signal that the caller's sizing assumptions are wrong.
    #[error("no free slot in the target chunk or its chain")]
    Full,
}
