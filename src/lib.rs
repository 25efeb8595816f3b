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

pub mod error;
pub mod executor;
pub mod map;

pub use error::Error;
pub use executor::Executor;
pub use map::{BufIndex, DefaultHashBuilder, SlabHashMap, INVALID_BUF_INDEX};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_basics() {
        let mut map: SlabHashMap<u64> = SlabHashMap::new(64, &[8]);

        let keys = [3u64, 1, 4, 1, 5];
        let values: Vec<u8> = keys.iter().flat_map(|k| (k * 10).to_le_bytes()).collect();

        let mut indices = vec![INVALID_BUF_INDEX; keys.len()];
        let mut masks = vec![false; keys.len()];

        map.insert(&keys, &[&values], &mut indices, &mut masks)
            .unwrap();

        assert!(masks.iter().all(|&mask| mask));
        assert_eq!(map.len(), 4, "one key repeats within the batch");
        assert_eq!(indices[1], indices[3]);

        map.find(&keys, &mut indices, &mut masks);
        assert!(masks.iter().all(|&mask| mask));
        assert_eq!(map.value_at(0, indices[0]), 30u64.to_le_bytes());

        map.erase(&[4], &mut [false]);
        assert_eq!(map.len(), 3);

        let mut miss_masks = [true];
        map.find(&[4], &mut [0], &mut miss_masks);
        assert!(!miss_masks[0]);
    }

    #[test]
    fn map_growth() {
        const BATCH: usize = 128;
        const BATCHES: u64 = 16;

        let mut map: SlabHashMap<u64> = SlabHashMap::new(BATCH, &[]);

        for batch in 0..BATCHES {
            let keys: Vec<u64> = (0..BATCH as u64).map(|i| batch * BATCH as u64 + i).collect();
            let mut indices = vec![INVALID_BUF_INDEX; BATCH];
            let mut masks = vec![false; BATCH];

            map.activate(&keys, &mut indices, &mut masks).unwrap();
            assert!(masks.iter().all(|&mask| mask));
        }

        assert_eq!(map.len(), BATCH * BATCHES as usize);
        assert!(map.capacity() >= map.len());

        let all: Vec<u64> = (0..BATCH as u64 * BATCHES).collect();
        let mut indices = vec![INVALID_BUF_INDEX; all.len()];
        let mut masks = vec![false; all.len()];

        map.find(&all, &mut indices, &mut masks);
        assert!(masks.iter().all(|&mask| mask));
    }

    #[test]
    fn map_on_dedicated_executor() {
        let executor = Executor::new(2).unwrap();
        let mut map: SlabHashMap<u64> = SlabHashMap::with_hasher_and_executor(
            32,
            &[],
            DefaultHashBuilder::default(),
            executor,
        );

        let keys = [10u64, 20, 30];
        let mut indices = vec![INVALID_BUF_INDEX; keys.len()];
        let mut masks = vec![false; keys.len()];

        map.activate(&keys, &mut indices, &mut masks).unwrap();
        assert_eq!(map.len(), 3);
    }
}
