use slabmap::{SlabHashMap, INVALID_BUF_INDEX};

use std::time::Instant;

fn main() {
    const BATCH: usize = 1 << 16;
    const BATCHES: u64 = 64;

    let mut map = SlabHashMap::<u64>::new(BATCH, &[8]);
    let mut indices = vec![INVALID_BUF_INDEX; BATCH];
    let mut masks = vec![false; BATCH];

    let start = Instant::now();

    for batch in 0..BATCHES {
        let keys: Vec<u64> = (0..BATCH as u64)
            .map(|i| batch * BATCH as u64 + i)
            .collect();
        let values: Vec<u8> = keys.iter().flat_map(|key| key.to_le_bytes()).collect();

        map.insert(&keys, &[&values], &mut indices, &mut masks)
            .unwrap();

        assert!(masks.iter().all(|&mask| mask));
    }

    let elapsed = start.elapsed();
    let total = BATCH as u64 * BATCHES;

    map.find(
        &(0..BATCH as u64).collect::<Vec<_>>(),
        &mut indices,
        &mut masks,
    );
    assert!(masks.iter().all(|&mask| mask));

    println!(
        "inserted {} keys in {:.2?} ({:.0} keys/s); {} buckets, load factor {:.2}",
        total,
        elapsed,
        total as f64 / elapsed.as_secs_f64(),
        map.bucket_count(),
        map.load_factor(),
    );
}
