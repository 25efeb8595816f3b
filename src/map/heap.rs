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

//! Bump-allocated key/value storage shared by all bucket chains.

use std::{
    cell::UnsafeCell,
    ptr, slice,
    sync::atomic::{AtomicU32, Ordering},
};

use crossbeam_utils::CachePadded;

use crate::map::BufIndex;

/// Flat structure-of-arrays storage: one key slot array and one byte
/// column per declared value size, all indexed by the same slot index.
///
/// Slots are handed out in contiguous runs by [`reserve`](#method.reserve)
/// and are never returned; erased and duplicate-wasted slots stay reserved
/// until the whole buffer is rebuilt by a rehash. `reset` only rewinds the
/// top-of-heap counter, leaving slot contents to be overwritten by later
/// reservations.
pub(crate) struct HeapBuffer<K> {
    keys: SharedSlice<K>,
    columns: Vec<Column>,
    top: CachePadded<AtomicU32>,
    capacity: usize,
}

impl<K: Copy + Default> HeapBuffer<K> {
    pub(crate) fn new(capacity: usize, value_sizes: &[usize]) -> HeapBuffer<K> {
        let columns = value_sizes
            .iter()
            .map(|&size| Column {
                size,
                bytes: SharedSlice::new(capacity * size),
            })
            .collect();

        HeapBuffer {
            keys: SharedSlice::new(capacity),
            columns,
            top: CachePadded::new(AtomicU32::new(0)),
            capacity,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub(crate) fn value_size(&self, column: usize) -> usize {
        self.columns[column].size
    }

    pub(crate) fn value_sizes(&self) -> Vec<usize> {
        self.columns.iter().map(|c| c.size).collect()
    }

    /// Advances the heap top by `count` and returns the first index of the
    /// freshly reserved run. One atomic op covers the whole batch.
    pub(crate) fn reserve(&self, count: u32) -> BufIndex {
        let previous = self.top.fetch_add(count, Ordering::Relaxed);
        assert!(
            previous as usize + count as usize <= self.capacity,
            "heap reservation overflowed capacity"
        );

        previous
    }

    /// Rewinds the heap top without touching slot contents.
    pub(crate) fn reset(&self) {
        self.top.store(0, Ordering::Relaxed);
    }

    pub(crate) fn top_index(&self) -> BufIndex {
        self.top.load(Ordering::Relaxed)
    }

    pub(crate) fn key(&self, slot: BufIndex) -> K {
        debug_assert!(slot < self.top_index());

        self.keys.get(slot as usize)
    }

    /// Stores `key` into `slot`.
    ///
    /// # Safety
    ///
    /// `slot` must lie in a reserved run, and no other thread may read or
    /// write the same slot until the current parallel stage joins.
    pub(crate) unsafe fn write_key(&self, slot: BufIndex, key: K) {
        unsafe { self.keys.write(slot as usize, key) };
    }

    pub(crate) fn value(&self, column: usize, slot: BufIndex) -> &[u8] {
        let column = &self.columns[column];

        column
            .bytes
            .slice(slot as usize * column.size, column.size)
    }

    /// Copies one value element into `slot`'s lane of `column`.
    ///
    /// # Safety
    ///
    /// Same aliasing contract as [`write_key`](#method.write_key): one
    /// writer per slot per stage, readers only after the stage joins.
    pub(crate) unsafe fn write_value(&self, column: usize, slot: BufIndex, value: &[u8]) {
        let column = &self.columns[column];
        debug_assert_eq!(value.len(), column.size);

        if column.size == 0 {
            return;
        }

        unsafe {
            ptr::copy_nonoverlapping(
                value.as_ptr(),
                column.bytes.ptr(slot as usize * column.size),
                column.size,
            )
        };
    }
}

struct Column {
    size: usize,
    bytes: SharedSlice<u8>,
}

/// A fixed slice with interior mutability, written concurrently at
/// disjoint indices by the parallel stages.
///
/// Slot-level exclusion is coordinated externally: within a stage each
/// index has at most one writer, and cross-stage visibility comes from
/// the join barrier between stages. Reads through `&self` outside a
/// mutating call are race-free because mutating calls require `&mut` on
/// the owning map.
struct SharedSlice<T> {
    data: Box<[UnsafeCell<T>]>,
}

unsafe impl<T: Send + Sync> Send for SharedSlice<T> {}
unsafe impl<T: Send + Sync> Sync for SharedSlice<T> {}

impl<T: Copy + Default> SharedSlice<T> {
    fn new(len: usize) -> SharedSlice<T> {
        SharedSlice {
            data: (0..len).map(|_| UnsafeCell::new(T::default())).collect(),
        }
    }

    fn get(&self, index: usize) -> T {
        unsafe { *self.data[index].get() }
    }

    /// # Safety
    ///
    /// No concurrent access to `index` until the current stage joins.
    unsafe fn write(&self, index: usize, value: T) {
        unsafe { *self.data[index].get() = value };
    }

    fn ptr(&self, index: usize) -> *mut T {
        self.data[index].get()
    }

    fn slice(&self, start: usize, len: usize) -> &[T] {
        assert!(start + len <= self.data.len());

        // UnsafeCell<T> is repr(transparent) over T
        unsafe { slice::from_raw_parts(self.data.as_ptr().cast::<T>().add(start), len) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_is_contiguous() {
        let heap: HeapBuffer<u64> = HeapBuffer::new(128, &[]);

        assert_eq!(heap.reserve(16), 0);
        assert_eq!(heap.reserve(4), 16);
        assert_eq!(heap.top_index(), 20);

        heap.reset();
        assert_eq!(heap.top_index(), 0);
        assert_eq!(heap.reserve(1), 0);
    }

    #[test]
    fn key_round_trip() {
        let heap: HeapBuffer<u64> = HeapBuffer::new(8, &[]);
        heap.reserve(8);

        for slot in 0..8u32 {
            unsafe { heap.write_key(slot, u64::from(slot) * 3) };
        }

        for slot in 0..8u32 {
            assert_eq!(heap.key(slot), u64::from(slot) * 3);
        }
    }

    #[test]
    fn value_round_trip() {
        let heap: HeapBuffer<u64> = HeapBuffer::new(4, &[4, 8]);
        heap.reserve(4);

        unsafe {
            heap.write_value(0, 2, &[1, 2, 3, 4]);
            heap.write_value(1, 2, &[9, 8, 7, 6, 5, 4, 3, 2]);
        }

        assert_eq!(heap.value(0, 2), &[1, 2, 3, 4]);
        assert_eq!(heap.value(1, 2), &[9, 8, 7, 6, 5, 4, 3, 2]);
        assert_eq!(heap.value(0, 0), &[0, 0, 0, 0]);
    }

    #[test]
    #[should_panic]
    fn reserve_past_capacity() {
        let heap: HeapBuffer<u64> = HeapBuffer::new(4, &[]);

        heap.reserve(5);
    }
}
