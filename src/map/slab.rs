// MIT License
//
// Copyright (c) 2021 Gregory Meyer
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

//! Bucket chains built from fixed-capacity slab nodes.
//!
//! Every chain "pointer" is an index into the node pool, and every lane
//! holds a heap slot index rather than the key itself, so the whole table
//! is three flat arrays of `u32` plus the heap. Chains are kept dense:
//! occupied lanes always precede empty lanes in chain order. Insert
//! preserves density by claiming the first empty lane of the first
//! non-full slab; erase restores it by compacting each touched bucket.

use std::sync::atomic::{AtomicU32, Ordering};

use rayon::prelude::*;

use crate::map::{heap::HeapBuffer, pool::SlabPool, BufIndex, INVALID_BUF_INDEX};

/// Entry lanes per slab node. One more `u32` for the chain link rounds a
/// node up to 32 words, matching the warp-wide layout of GPU slab hash
/// tables.
pub(crate) const SLAB_ENTRIES: usize = 31;

/// Lane marker for an entry claimed by an in-flight erase pass.
pub(crate) const TOMBSTONE_INDEX: BufIndex = INVALID_BUF_INDEX - 1;

const EMPTY_NEXT: u32 = u32::MAX;

/// One chain node: 31 slot-index lanes plus a link to the next node.
#[repr(align(128))]
pub(crate) struct Slab {
    entries: [AtomicU32; SLAB_ENTRIES],
    next: AtomicU32,
}

impl Slab {
    pub(crate) fn new() -> Slab {
        Slab {
            entries: std::array::from_fn(|_| AtomicU32::new(INVALID_BUF_INDEX)),
            next: AtomicU32::new(EMPTY_NEXT),
        }
    }

    /// Rewrites every lane to the empty sentinel and drops the link.
    pub(crate) fn clear(&self) {
        for entry in &self.entries {
            entry.store(INVALID_BUF_INDEX, Ordering::Relaxed);
        }

        self.next.store(EMPTY_NEXT, Ordering::Relaxed);
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SlabRef {
    Head(u32),
    Node(u32),
}

/// How a probe-and-link attempt resolved.
pub(crate) enum LinkOutcome {
    /// The reserved slot was linked; a new mapping exists.
    Created,
    /// The key was already present at the returned slot; the reserved
    /// slot is wasted until the next rehash.
    Existing(BufIndex),
}

/// The bucket head slabs and the chain kernels that run over them.
pub(crate) struct BucketTable {
    heads: Box<[Slab]>,
}

impl BucketTable {
    pub(crate) fn new(bucket_count: usize) -> BucketTable {
        BucketTable {
            heads: (0..bucket_count).map(|_| Slab::new()).collect(),
        }
    }

    pub(crate) fn bucket_count(&self) -> usize {
        self.heads.len()
    }

    /// Resets every bucket head to the all-empty pattern.
    pub(crate) fn reset(&self) {
        self.heads.par_iter().for_each(Slab::clear);
    }

    fn slab<'a>(&'a self, pool: &'a SlabPool, slab_ref: SlabRef) -> &'a Slab {
        match slab_ref {
            SlabRef::Head(bucket) => &self.heads[bucket as usize],
            SlabRef::Node(node) => pool.slab(node),
        }
    }

    /// Links `slot` under `key` in `bucket`, or resolves to the existing
    /// mapping if the key is already present. Returns `None` if the pool
    /// ran out of chain nodes.
    ///
    /// Claims only ever target the first empty lane of a freshly loaded
    /// snapshot and retry re-scans the same slab, so two attempts with
    /// the same key always collide on a lane (or one observes the other's
    /// entry), and a key cannot be linked twice. This argument relies on
    /// lanes never transitioning occupied to empty while inserts run,
    /// which holds because erases are a separate batched call.
    pub(crate) fn link<K: Copy + Eq + Default>(
        &self,
        pool: &SlabPool,
        heap: &HeapBuffer<K>,
        bucket: u32,
        key: &K,
        slot: BufIndex,
    ) -> Option<LinkOutcome> {
        let mut current = SlabRef::Head(bucket);

        loop {
            let slab = self.slab(pool, current);

            let mut first_empty = None;
            let mut existing = None;

            for (lane, entry) in slab.entries.iter().enumerate() {
                let occupant = entry.load(Ordering::Acquire);

                if occupant == INVALID_BUF_INDEX {
                    if first_empty.is_none() {
                        first_empty = Some(lane);
                    }
                } else if heap.key(occupant) == *key {
                    existing = Some(occupant);

                    break;
                }
            }

            if let Some(occupant) = existing {
                return Some(LinkOutcome::Existing(occupant));
            }

            if let Some(lane) = first_empty {
                match slab.entries[lane].compare_exchange(
                    INVALID_BUF_INDEX,
                    slot,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Some(LinkOutcome::Created),
                    Err(_) => continue, // lost the lane; re-scan this slab
                }
            }

            let next = slab.next.load(Ordering::Acquire);

            if next != EMPTY_NEXT {
                current = SlabRef::Node(next);

                continue;
            }

            let fresh = pool.allocate()?;

            match slab.next.compare_exchange(
                EMPTY_NEXT,
                fresh,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => current = SlabRef::Node(fresh),
                Err(winner) => {
                    pool.free(fresh);
                    current = SlabRef::Node(winner);
                }
            }
        }
    }

    /// Read-only chain walk; returns the slot mapped to `key`, if any.
    pub(crate) fn find_slot<K: Copy + Eq + Default>(
        &self,
        pool: &SlabPool,
        heap: &HeapBuffer<K>,
        bucket: u32,
        key: &K,
    ) -> Option<BufIndex> {
        let mut current = SlabRef::Head(bucket);

        loop {
            let slab = self.slab(pool, current);

            for entry in &slab.entries {
                let occupant = entry.load(Ordering::Acquire);

                if occupant == INVALID_BUF_INDEX || occupant == TOMBSTONE_INDEX {
                    continue;
                }

                if heap.key(occupant) == *key {
                    return Some(occupant);
                }
            }

            match slab.next.load(Ordering::Acquire) {
                EMPTY_NEXT => return None,
                next => current = SlabRef::Node(next),
            }
        }
    }

    /// Erase pass 0: claim `key`'s lane by swapping it to the tombstone.
    ///
    /// Exactly one of any set of concurrent claims for the same key
    /// succeeds; losers walk off the end of the chain and report false.
    pub(crate) fn claim_erase<K: Copy + Eq + Default>(
        &self,
        pool: &SlabPool,
        heap: &HeapBuffer<K>,
        bucket: u32,
        key: &K,
    ) -> bool {
        let mut current = SlabRef::Head(bucket);

        loop {
            let slab = self.slab(pool, current);

            for entry in &slab.entries {
                let occupant = entry.load(Ordering::Acquire);

                if occupant == INVALID_BUF_INDEX || occupant == TOMBSTONE_INDEX {
                    continue;
                }

                if heap.key(occupant) == *key {
                    return entry
                        .compare_exchange(
                            occupant,
                            TOMBSTONE_INDEX,
                            Ordering::AcqRel,
                            Ordering::Relaxed,
                        )
                        .is_ok();
                }
            }

            match slab.next.load(Ordering::Acquire) {
                EMPTY_NEXT => return false,
                next => current = SlabRef::Node(next),
            }
        }
    }

    /// Appends every live slot index in `bucket`'s chain to `out`.
    pub(crate) fn bucket_entries(&self, pool: &SlabPool, bucket: u32, out: &mut Vec<BufIndex>) {
        let mut current = SlabRef::Head(bucket);

        loop {
            let slab = self.slab(pool, current);

            for entry in &slab.entries {
                let occupant = entry.load(Ordering::Acquire);

                if occupant != INVALID_BUF_INDEX && occupant != TOMBSTONE_INDEX {
                    out.push(occupant);
                }
            }

            match slab.next.load(Ordering::Acquire) {
                EMPTY_NEXT => return,
                next => current = SlabRef::Node(next),
            }
        }
    }

    /// Erase pass 1: rebuild `bucket`'s chain densely, dropping
    /// tombstones and returning emptied tail slabs to the pool.
    ///
    /// The caller must guarantee this thread is the only one touching
    /// `bucket` (erase runs it once per touched bucket after the claim
    /// pass joins), which is why plain relaxed stores suffice.
    pub(crate) fn compact(&self, pool: &SlabPool, bucket: u32) {
        let head = &self.heads[bucket as usize];

        let mut nodes = Vec::new();
        let mut next = head.next.load(Ordering::Relaxed);

        while next != EMPTY_NEXT {
            nodes.push(next);
            next = pool.slab(next).next.load(Ordering::Relaxed);
        }

        let mut live = Vec::new();
        head_and_nodes(head, pool, &nodes, |slab| {
            for entry in &slab.entries {
                let occupant = entry.load(Ordering::Relaxed);

                if occupant != INVALID_BUF_INDEX && occupant != TOMBSTONE_INDEX {
                    live.push(occupant);
                }
            }
        });

        let kept_nodes = live.len().saturating_sub(SLAB_ENTRIES).div_ceil(SLAB_ENTRIES);

        let mut cursor = live.iter().copied();
        rewrite_lanes(head, &mut cursor);

        for &node in nodes.iter().take(kept_nodes) {
            rewrite_lanes(pool.slab(node), &mut cursor);
        }

        let tail = if kept_nodes == 0 {
            head
        } else {
            pool.slab(nodes[kept_nodes - 1])
        };
        tail.next.store(EMPTY_NEXT, Ordering::Relaxed);

        for &node in &nodes[kept_nodes..] {
            pool.free(node);
        }
    }
}

fn head_and_nodes<'a>(
    head: &'a Slab,
    pool: &'a SlabPool,
    nodes: &[u32],
    mut visit: impl FnMut(&'a Slab),
) {
    visit(head);

    for &node in nodes {
        visit(pool.slab(node));
    }
}

fn rewrite_lanes(slab: &Slab, entries: &mut impl Iterator<Item = BufIndex>) {
    for lane in &slab.entries {
        lane.store(
            entries.next().unwrap_or(INVALID_BUF_INDEX),
            Ordering::Relaxed,
        );
    }
}
