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

//! Pool allocator for the slab nodes that extend bucket chains.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::map::slab::Slab;

/// Fixed pool of slab nodes with a two-level atomic bitmap free list.
///
/// The lower level holds one free bit per node; the upper level holds one
/// bit per lower-level word that may still contain free bits. Allocation
/// scans the upper level from a rotating cursor so concurrent allocators
/// spread across the pool instead of fighting over the first free word.
/// The upper level is a hint only; a final flat sweep of the lower level
/// runs before exhaustion is reported.
///
/// Nodes are scrubbed back to the all-empty lane pattern by `free` and
/// `reset`, so `allocate` always hands out a chain-ready node.
pub(crate) struct SlabPool {
    slabs: Box<[Slab]>,
    free_masks: Box<[AtomicU64]>,
    summary: Box<[AtomicU64]>,
    cursor: AtomicUsize,
}

impl SlabPool {
    /// Creates a pool of at least `nodes` slab nodes, rounded up to a
    /// whole number of bitmap words.
    pub(crate) fn with_node_count(nodes: usize) -> SlabPool {
        let nodes = nodes.max(64).next_multiple_of(64);
        let words = nodes / 64;

        let slabs = (0..nodes).map(|_| Slab::new()).collect();
        let free_masks = (0..words).map(|_| AtomicU64::new(u64::MAX)).collect();
        let summary = (0..words.div_ceil(64))
            .map(|index| AtomicU64::new(summary_word(words, index)))
            .collect();

        SlabPool {
            slabs,
            free_masks,
            summary,
            cursor: AtomicUsize::new(0),
        }
    }

    pub(crate) fn node_count(&self) -> usize {
        self.slabs.len()
    }

    pub(crate) fn slab(&self, node: u32) -> &Slab {
        &self.slabs[node as usize]
    }

    /// Claims a free node, or `None` if the pool is exhausted.
    pub(crate) fn allocate(&self) -> Option<u32> {
        let summary_len = self.summary.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);

        for offset in 0..summary_len {
            let index = (start + offset) % summary_len;
            let mut hint = self.summary[index].load(Ordering::Relaxed);

            while hint != 0 {
                let word_bit = hint.trailing_zeros() as usize;
                let word = index * 64 + word_bit;

                if let Some(node) = self.claim_in(word) {
                    return Some(node);
                }

                // the word drained under us; retract the hint, then
                // restore it if a racing free republished a bit
                self.summary[index].fetch_and(!(1u64 << word_bit), Ordering::Relaxed);

                if self.free_masks[word].load(Ordering::Relaxed) != 0 {
                    self.summary[index].fetch_or(1u64 << word_bit, Ordering::Relaxed);
                }

                hint &= !(1u64 << word_bit);
            }
        }

        for word in 0..self.free_masks.len() {
            if let Some(node) = self.claim_in(word) {
                return Some(node);
            }
        }

        None
    }

    fn claim_in(&self, word: usize) -> Option<u32> {
        let mask = &self.free_masks[word];
        let mut current = mask.load(Ordering::Relaxed);

        while current != 0 {
            let bit = current.trailing_zeros();

            match mask.compare_exchange_weak(
                current,
                current & !(1u64 << bit),
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some((word * 64) as u32 + bit),
                Err(actual) => current = actual,
            }
        }

        None
    }

    /// Returns `node` to the free list.
    ///
    /// The node must not be reachable from any bucket chain. Its lanes are
    /// scrubbed before the free bit is republished.
    pub(crate) fn free(&self, node: u32) {
        self.slabs[node as usize].clear();

        let word = node as usize / 64;
        let bit = node as usize % 64;

        self.free_masks[word].fetch_or(1u64 << bit, Ordering::Release);
        self.summary[word / 64].fetch_or(1u64 << (word % 64), Ordering::Release);
    }

    /// Drops every allocation and refills the free list.
    pub(crate) fn reset(&self) {
        for slab in self.slabs.iter() {
            slab.clear();
        }

        for mask in self.free_masks.iter() {
            mask.store(u64::MAX, Ordering::Relaxed);
        }

        let words = self.free_masks.len();

        for (index, word) in self.summary.iter().enumerate() {
            word.store(summary_word(words, index), Ordering::Relaxed);
        }

        self.cursor.store(0, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn free_node_count(&self) -> usize {
        self.free_masks
            .iter()
            .map(|mask| mask.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }
}

fn summary_word(words: usize, index: usize) -> u64 {
    let bits = words.saturating_sub(index * 64).min(64);

    if bits == 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}
