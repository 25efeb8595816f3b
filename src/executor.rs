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

//! Execution targets for batched operations.

use std::sync::Arc;

use rayon::ThreadPool;

use crate::error::Error;

/// Selects the thread pool that runs a map's parallel stages.
///
/// Each batched operation executes as a sequence of parallel-for stages
/// with a join between them. By default those stages run on rayon's
/// global pool; an `Executor` built with [`new`](#method.new) pins them to
/// a dedicated pool instead, isolating the map's work from the rest of
/// the process.
#[derive(Clone, Debug, Default)]
pub struct Executor {
    pool: Option<Arc<ThreadPool>>,
}

impl Executor {
    /// Returns the executor backed by rayon's global thread pool.
    pub fn global() -> Executor {
        Executor { pool: None }
    }

    /// Builds an executor backed by a dedicated pool of `num_threads`
    /// worker threads.
    ///
    /// If `num_threads` is 0, the pool chooses its own parallelism, as
    /// rayon's builder does.
    pub fn new(num_threads: usize) -> Result<Executor, Error> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()?;

        Ok(Executor {
            pool: Some(Arc::new(pool)),
        })
    }

    /// Runs `op` inside this executor's pool.
    ///
    /// All rayon parallel iterators invoked by `op` are serviced by the
    /// selected pool; the call returns once `op` and every stage it
    /// spawned have completed.
    pub(crate) fn run<R, F>(&self, op: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        match &self.pool {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }
}
