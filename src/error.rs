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

//! Errors surfaced by batched map operations.

use thiserror::Error;

/// Structural failures that abort an entire batched call.
///
/// Per-key conditions (duplicate keys, missing keys) are never errors;
/// they are reported through the output mask arrays. An `Err` from a
/// batched operation means the call was aborted and the map makes no
/// partial-success guarantees about entries touched by that batch.
#[derive(Debug, Error)]
pub enum Error {
    /// The slab node pool ran out of link nodes while extending a bucket
    /// chain. The map is effectively out of chain memory until the next
    /// rehash or clear.
    #[error("slab node pool exhausted")]
    PoolExhausted,

    /// Building a dedicated executor thread pool failed.
    #[error("failed to build executor thread pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
