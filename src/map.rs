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

//! A batch-parallel hash map of slab-chained buckets over bump-allocated
//! key/value storage.

mod heap;
mod pool;
mod slab;


use std::{
    hash::{BuildHasher, Hash, Hasher},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use rayon::prelude::*;

use crate::{error::Error, executor::Executor};

use self::{
    heap::HeapBuffer,
    pool::SlabPool,
    slab::{BucketTable, LinkOutcome, SLAB_ENTRIES},
};

/// Stable handle into the map's key/value storage, identifying one stored
/// entry. Handles are never reused while their entry is logically
/// present; a rehash may reassign them.
pub type BufIndex = u32;

/// Sentinel written to output index lanes whose mask is false.
pub const INVALID_BUF_INDEX: BufIndex = u32::MAX;

// the two top indices are reserved as lane sentinels
const MAX_CAPACITY: usize = (u32::MAX - 2) as usize;

/// Default hasher for `SlabHashMap`.
///
/// This is currently [aHash], a hashing algorithm designed around
/// acceleration by the [AES-NI] instruction set on x86 processors. aHash
/// is not cryptographically secure, but is fast and resistant to DoS
/// attacks.
///
/// [aHash]: https://docs.rs/ahash
/// [AES-NI]: https://en.wikipedia.org/wiki/AES_instruction_set
pub type DefaultHashBuilder = ahash::RandomState;

/// A hash map that executes every operation over a whole batch of keys at
/// once, as a short sequence of parallel stages with a join between them.
///
/// Buckets are singly linked chains of fixed-capacity slab nodes; each
/// chain lane holds an index into a flat bump-allocated heap where the
/// keys and any declared value columns live (structure of arrays, one
/// byte column per value size passed at construction). This layout comes
/// from GPU slab hash tables: the map trades per-call latency for batch
/// throughput, and what would be a kernel launch there is a [rayon]
/// parallel-for stage here.
///
/// Keys are plain fixed-size values (`Copy + Default`). The hashing
/// algorithm defaults to [aHash] and can be chosen per map with
/// [`with_hasher`]; the thread pool running the stages can be chosen with
/// [`with_hasher_and_executor`].
///
/// Mutating operations take `&mut self`: the map supports exactly one
/// in-flight batched call, whose internal parallelism is the only
/// concurrency. Read-only batches (`find`, the diagnostics) take `&self`.
///
/// Results are reported per key through caller-allocated output slices:
/// `out_masks[i]` is true iff key `i` has a live mapping after the call,
/// and `out_indices[i]` is that mapping's slot index, valid only when the
/// mask is true.
///
/// Re-inserting a present key succeeds with the existing slot index and
/// leaves the stored value untouched; the value written by the original
/// insert stays authoritative until the entry is erased. Overwrites go
/// through [`write_value`].
///
/// [rayon]: https://docs.rs/rayon
/// [aHash]: https://docs.rs/ahash
/// [`with_hasher`]: #method.with_hasher
/// [`with_hasher_and_executor`]: #method.with_hasher_and_executor
/// [`write_value`]: #method.write_value
pub struct SlabHashMap<K, S = DefaultHashBuilder> {
    table: BucketTable,
    pool: SlabPool,
    heap: HeapBuffer<K>,
    len: usize,
    hash_builder: S,
    executor: Executor,
}

impl<K> SlabHashMap<K, DefaultHashBuilder>
where
    K: Copy + Default + Eq + Hash + Send + Sync,
{
    /// Creates a map with room for `initial_capacity` entries and one
    /// value column per element of `value_sizes` (in bytes).
    ///
    /// The bucket count is initialized to twice the capacity. Pass an
    /// empty `value_sizes` for a key-only (slot-assigning) map.
    pub fn new(initial_capacity: usize, value_sizes: &[usize]) -> SlabHashMap<K> {
        SlabHashMap::with_hasher(initial_capacity, value_sizes, DefaultHashBuilder::default())
    }
}

impl<K, S> SlabHashMap<K, S>
where
    K: Copy + Default + Eq + Hash + Send + Sync,
    S: BuildHasher + Send + Sync,
{
    /// Creates a map that will use `hash_builder` to hash keys.
    pub fn with_hasher(
        initial_capacity: usize,
        value_sizes: &[usize],
        hash_builder: S,
    ) -> SlabHashMap<K, S> {
        SlabHashMap::with_hasher_and_executor(
            initial_capacity,
            value_sizes,
            hash_builder,
            Executor::global(),
        )
    }

    /// Creates a map whose parallel stages run on `executor`.
    pub fn with_hasher_and_executor(
        initial_capacity: usize,
        value_sizes: &[usize],
        hash_builder: S,
        executor: Executor,
    ) -> SlabHashMap<K, S> {
        let capacity = initial_capacity.max(1);
        let (table, pool, heap) = components(capacity * 2, capacity, value_sizes);

        SlabHashMap {
            table,
            pool,
            heap,
            len: 0,
            hash_builder,
            executor,
        }
    }

    /// Returns the number of live mappings.
    ///
    /// Wasted duplicate slots and erased slots do not count; they occupy
    /// heap space until the next rehash but have no mapping.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if this map contains no live mappings.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the number of heap slots this map can hand out before its
    /// next automatic rehash.
    pub fn capacity(&self) -> usize {
        self.heap.capacity()
    }

    pub fn bucket_count(&self) -> usize {
        self.table.bucket_count()
    }

    /// Live mappings divided by bucket count.
    pub fn load_factor(&self) -> f32 {
        self.len as f32 / self.bucket_count() as f32
    }

    /// Inserts a batch of keys with their value tuples.
    ///
    /// `values` holds one flat byte column per declared value size, each
    /// of length `keys.len() × size`, or may be empty to assign slots
    /// without writing values (see [`activate`](#method.activate)).
    ///
    /// Runs in three joined stages: one atomic reservation of
    /// `keys.len()` heap slots, a parallel probe-and-link over the bucket
    /// chains, and a parallel value scatter for the newly created
    /// mappings. A key that is already present resolves to its existing
    /// slot with `out_masks` true; its reserved slot is left unused until
    /// the next rehash and its stored value is not overwritten.
    ///
    /// If the reservation would overflow the current capacity the map
    /// first rehashes to `max(2 × bucket_count, ⌈new_size / average
    /// capacity per bucket⌉)` buckets, so insertion only fails if the
    /// slab node pool is exhausted. On `Err` the batch is aborted with no
    /// partial-success guarantees.
    ///
    /// # Panics
    ///
    /// Panics if the output slices are not the same length as `keys`, or
    /// if `values` is non-empty but does not match the declared columns.
    pub fn insert(
        &mut self,
        keys: &[K],
        values: &[&[u8]],
        out_indices: &mut [BufIndex],
        out_masks: &mut [bool],
    ) -> Result<(), Error> {
        self.check_outputs(keys, out_indices, out_masks);
        self.check_values(keys.len(), values);

        if keys.is_empty() {
            return Ok(());
        }

        let executor = self.executor.clone();

        executor.run(|| {
            self.ensure_capacity(keys.len())?;
            self.insert_impl(keys, values, out_indices, out_masks)
        })
    }

    /// Inserts a batch of keys without writing values.
    ///
    /// Equivalent to [`insert`](#method.insert) with empty `values`: each
    /// key gets a slot assignment (new or existing) and the caller
    /// populates value columns later through
    /// [`write_value`](#method.write_value).
    pub fn activate(
        &mut self,
        keys: &[K],
        out_indices: &mut [BufIndex],
        out_masks: &mut [bool],
    ) -> Result<(), Error> {
        self.insert(keys, &[], out_indices, out_masks)
    }

    /// Looks up a batch of keys without mutating the map.
    ///
    /// For each key, `out_masks` reports presence and `out_indices`
    /// receives the mapped slot index, or [`INVALID_BUF_INDEX`] on a
    /// miss.
    ///
    /// # Panics
    ///
    /// Panics if the output slices are not the same length as `keys`.
    pub fn find(&self, keys: &[K], out_indices: &mut [BufIndex], out_masks: &mut [bool]) {
        self.check_outputs(keys, out_indices, out_masks);

        if keys.is_empty() {
            return;
        }

        let table = &self.table;
        let pool = &self.pool;
        let heap = &self.heap;
        let hash_builder = &self.hash_builder;
        let bucket_count = table.bucket_count();

        self.executor.run(|| {
            out_indices
                .par_iter_mut()
                .zip_eq(out_masks.par_iter_mut())
                .enumerate()
                .for_each(|(i, (index, mask))| {
                    let key = &keys[i];
                    let bucket = bucket_index(hash_builder, bucket_count, key);

                    match table.find_slot(pool, heap, bucket, key) {
                        Some(slot) => {
                            *index = slot;
                            *mask = true;
                        }
                        None => {
                            *index = INVALID_BUF_INDEX;
                            *mask = false;
                        }
                    }
                });
        });
    }

    /// Erases a batch of keys.
    ///
    /// `out_masks[i]` is true iff key `i` was present and this call
    /// removed it; erasing an absent key reports false and changes
    /// nothing. When the same key appears twice in one batch, exactly one
    /// occurrence reports success.
    ///
    /// Runs in two joined stages: a parallel claim pass that tombstones
    /// each located entry, then a compaction pass over the touched
    /// buckets that drops the tombstones, keeps every chain dense, and
    /// returns emptied tail slabs to the node pool. Erased heap slots are
    /// not recycled until the next rehash.
    ///
    /// # Panics
    ///
    /// Panics if `out_masks` is not the same length as `keys`.
    pub fn erase(&mut self, keys: &[K], out_masks: &mut [bool]) {
        assert_eq!(
            keys.len(),
            out_masks.len(),
            "one output mask lane per key required"
        );

        if keys.is_empty() {
            return;
        }

        let executor = self.executor.clone();

        executor.run(|| {
            let table = &self.table;
            let pool = &self.pool;
            let heap = &self.heap;
            let hash_builder = &self.hash_builder;
            let bucket_count = table.bucket_count();

            // Pass 0: claim each present entry
            let mut touched: Vec<u32> = out_masks
                .par_iter_mut()
                .enumerate()
                .filter_map(|(i, mask)| {
                    let key = &keys[i];
                    let bucket = bucket_index(hash_builder, bucket_count, key);

                    *mask = table.claim_erase(pool, heap, bucket, key);

                    mask.then_some(bucket)
                })
                .collect();

            let erased = touched.len();

            // Pass 1: one compaction per touched bucket
            touched.par_sort_unstable();
            touched.dedup();
            touched
                .par_iter()
                .for_each(|&bucket| table.compact(pool, bucket));

            self.len -= erased;
        });
    }

    /// Rebuilds the map in place with `bucket_count` buckets, preserving
    /// every live mapping (slot indices may change).
    ///
    /// This is a stop-the-world rebuild: live entries are gathered out of
    /// the heap, the table, node pool, and heap are replaced wholesale
    /// with fresh ones sized for `max(⌈bucket_count × previous average
    /// capacity per bucket⌉, live entries)` slots, and the gathered
    /// entries are re-inserted. Wasted duplicate slots and erased slots
    /// are reclaimed here and nowhere else.
    pub fn rehash(&mut self, bucket_count: usize) -> Result<(), Error> {
        let executor = self.executor.clone();

        executor.run(|| self.rehash_impl(bucket_count))
    }

    /// Drops every mapping without deallocating.
    ///
    /// Bucket heads revert to the all-empty pattern, the node pool
    /// refills its free list, and the heap top rewinds to zero; the same
    /// capacity is immediately reusable.
    pub fn clear(&mut self) {
        self.executor.clone().run(|| {
            self.table.reset();
            self.pool.reset();
        });

        self.heap.reset();
        self.len = 0;
    }

    /// Collects the slot index of every live mapping, in no particular
    /// order.
    pub fn active_indices(&self) -> Vec<BufIndex> {
        self.executor.clone().run(|| self.active_indices_impl())
    }

    /// Returns the number of live mappings in each bucket.
    ///
    /// Computed as a parallel histogram over the heap's reserved slots: a
    /// slot counts for its key's bucket iff the chain maps that key back
    /// to that exact slot, which excludes wasted duplicate slots and
    /// erased slots.
    pub fn bucket_sizes(&self) -> Vec<usize> {
        let table = &self.table;
        let pool = &self.pool;
        let heap = &self.heap;
        let hash_builder = &self.hash_builder;
        let bucket_count = table.bucket_count();

        let counts: Vec<AtomicUsize> = (0..bucket_count).map(|_| AtomicUsize::new(0)).collect();

        self.executor.run(|| {
            (0..heap.top_index()).into_par_iter().for_each(|slot| {
                let key = heap.key(slot);
                let bucket = bucket_index(hash_builder, bucket_count, &key);

                if table.find_slot(pool, heap, bucket, &key) == Some(slot) {
                    counts[bucket as usize].fetch_add(1, Ordering::Relaxed);
                }
            });
        });

        counts.into_iter().map(AtomicUsize::into_inner).collect()
    }

    /// Returns the key stored at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is outside the heap's reserved range.
    pub fn key_at(&self, index: BufIndex) -> K {
        assert!(index < self.heap.top_index(), "slot index never reserved");

        self.heap.key(index)
    }

    /// Returns the bytes stored for `index` in value column `column`.
    ///
    /// # Panics
    ///
    /// Panics if `column` is out of range or `index` is outside the
    /// heap's reserved range.
    pub fn value_at(&self, column: usize, index: BufIndex) -> &[u8] {
        assert!(index < self.heap.top_index(), "slot index never reserved");

        self.heap.value(column, index)
    }

    /// Overwrites the bytes stored for `index` in value column `column`.
    ///
    /// This is the write path for callers that assigned slots through
    /// [`activate`](#method.activate), and the only way to change the
    /// value of an existing mapping.
    ///
    /// # Panics
    ///
    /// Panics if `column` is out of range, `index` is outside the heap's
    /// reserved range, or `value` is not exactly the column's size.
    pub fn write_value(&mut self, column: usize, index: BufIndex, value: &[u8]) {
        assert!(index < self.heap.top_index(), "slot index never reserved");
        assert_eq!(
            value.len(),
            self.heap.value_size(column),
            "value must be exactly one column element"
        );

        // &mut self makes this the only access to the slot
        unsafe { self.heap.write_value(column, index, value) };
    }

    /// Returns the declared value column sizes, in bytes.
    pub fn value_sizes(&self) -> Vec<usize> {
        self.heap.value_sizes()
    }

    fn ensure_capacity(&mut self, incoming: usize) -> Result<(), Error> {
        let required = self.heap.top_index() as usize + incoming;

        if required <= self.capacity() {
            return Ok(());
        }

        // heap_top bounds the trigger rather than len: wasted duplicate
        // slots consume capacity too, and a reservation must never
        // overflow
        let new_size = self.len + incoming;
        let average = self.capacity() as f64 / self.bucket_count() as f64;
        let target = usize::max(
            self.bucket_count() * 2,
            (new_size as f64 / average).ceil() as usize,
        );

        self.rehash_impl(target)
    }

    fn insert_impl(
        &mut self,
        keys: &[K],
        values: &[&[u8]],
        out_indices: &mut [BufIndex],
        out_masks: &mut [bool],
    ) -> Result<(), Error> {
        let count = keys.len();
        let previous_top = self.heap.reserve(count as u32);

        let table = &self.table;
        let pool = &self.pool;
        let heap = &self.heap;
        let hash_builder = &self.hash_builder;
        let bucket_count = table.bucket_count();

        // Pass 0: write each key into its reserved slot
        out_indices
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, index)| {
                let slot = previous_top + i as u32;

                // one writer per reserved slot; readers only after the join
                unsafe { heap.write_key(slot, keys[i]) };
                *index = slot;
            });

        // Pass 1: probe-and-link
        let mut created_flags = vec![false; count];
        let exhausted = AtomicBool::new(false);

        out_indices
            .par_iter_mut()
            .zip_eq(out_masks.par_iter_mut())
            .zip_eq(created_flags.par_iter_mut())
            .enumerate()
            .for_each(|(i, ((index, mask), created))| {
                if exhausted.load(Ordering::Relaxed) {
                    *index = INVALID_BUF_INDEX;
                    *mask = false;

                    return;
                }

                let key = &keys[i];
                let bucket = bucket_index(hash_builder, bucket_count, key);

                match table.link(pool, heap, bucket, key, *index) {
                    Some(LinkOutcome::Created) => {
                        *mask = true;
                        *created = true;
                    }
                    Some(LinkOutcome::Existing(existing)) => {
                        *index = existing;
                        *mask = true;
                    }
                    None => {
                        exhausted.store(true, Ordering::Relaxed);
                        *index = INVALID_BUF_INDEX;
                        *mask = false;
                    }
                }
            });

        if exhausted.into_inner() {
            return Err(Error::PoolExhausted);
        }

        self.len += created_flags.iter().filter(|&&created| created).count();

        // Pass 2: scatter values into newly created mappings
        if !values.is_empty() {
            let heap = &self.heap;

            out_indices
                .par_iter()
                .zip_eq(created_flags.par_iter())
                .enumerate()
                .for_each(|(i, (&index, &created))| {
                    if !created {
                        return;
                    }

                    for (column, bytes) in values.iter().enumerate() {
                        let size = heap.value_size(column);

                        // newly created mappings have pairwise distinct slots
                        unsafe {
                            heap.write_value(column, index, &bytes[i * size..(i + 1) * size])
                        };
                    }
                });
        }

        Ok(())
    }

    fn rehash_impl(&mut self, bucket_count: usize) -> Result<(), Error> {
        let bucket_count = bucket_count.max(1);
        let live = self.active_indices_impl();
        let count = live.len();

        let heap = &self.heap;
        let column_sizes = heap.value_sizes();

        let mut keys = vec![K::default(); count];
        keys.par_iter_mut()
            .zip_eq(live.par_iter())
            .for_each(|(key, &slot)| *key = heap.key(slot));

        let mut gathered: Vec<Vec<u8>> = Vec::with_capacity(column_sizes.len());

        for (column, &size) in column_sizes.iter().enumerate() {
            let mut bytes = vec![0u8; count * size];

            if size > 0 {
                bytes
                    .par_chunks_mut(size)
                    .zip_eq(live.par_iter())
                    .for_each(|(chunk, &slot)| chunk.copy_from_slice(heap.value(column, slot)));
            }

            gathered.push(bytes);
        }

        let average = self.capacity() as f64 / self.bucket_count() as f64;
        let capacity = usize::max((bucket_count as f64 * average).ceil() as usize, count);

        let (table, pool, heap) = components(bucket_count, capacity, &column_sizes);
        self.table = table;
        self.pool = pool;
        self.heap = heap;
        self.len = 0;

        if count > 0 {
            let values: Vec<&[u8]> = gathered.iter().map(Vec::as_slice).collect();
            let mut indices = vec![INVALID_BUF_INDEX; count];
            let mut masks = vec![false; count];

            self.insert_impl(&keys, &values, &mut indices, &mut masks)?;
            debug_assert!(masks.iter().all(|&mask| mask));
        }

        Ok(())
    }

    fn active_indices_impl(&self) -> Vec<BufIndex> {
        let table = &self.table;
        let pool = &self.pool;

        (0..table.bucket_count() as u32)
            .into_par_iter()
            .flat_map_iter(|bucket| {
                let mut entries = Vec::new();
                table.bucket_entries(pool, bucket, &mut entries);

                entries.into_iter()
            })
            .collect()
    }

    fn check_outputs(&self, keys: &[K], out_indices: &[BufIndex], out_masks: &[bool]) {
        assert_eq!(
            keys.len(),
            out_indices.len(),
            "one output index lane per key required"
        );
        assert_eq!(
            keys.len(),
            out_masks.len(),
            "one output mask lane per key required"
        );
    }

    fn check_values(&self, count: usize, values: &[&[u8]]) {
        assert!(
            values.is_empty() || values.len() == self.heap.column_count(),
            "value columns must be absent or match the declared columns"
        );

        for (column, bytes) in values.iter().enumerate() {
            assert_eq!(
                bytes.len(),
                count * self.heap.value_size(column),
                "value column must hold one element per key"
            );
        }
    }
}

fn components<K: Copy + Default>(
    bucket_count: usize,
    capacity: usize,
    value_sizes: &[usize],
) -> (BucketTable, SlabPool, HeapBuffer<K>) {
    assert!(capacity <= MAX_CAPACITY, "capacity exceeds slot index range");
    assert!(
        bucket_count <= u32::MAX as usize,
        "bucket count exceeds index range"
    );

    let table = BucketTable::new(bucket_count);
    let pool = SlabPool::with_node_count(2 * capacity.div_ceil(SLAB_ENTRIES));
    let heap = HeapBuffer::new(capacity, value_sizes);

    (table, pool, heap)
}

fn bucket_index<K: Hash, S: BuildHasher>(hash_builder: &S, bucket_count: usize, key: &K) -> u32 {
    (hash(hash_builder, key) % bucket_count as u64) as u32
}

pub(crate) fn hash<K: ?Sized + Hash, H: BuildHasher>(build_hasher: &H, key: &K) -> u64 {
    let mut hasher = build_hasher.build_hasher();
    key.hash(&mut hasher);

    hasher.finish()
}
