use std::{ptr::NonNull, thread};

use mpalloc::{Config, MemPool};
use rand::{Rng, SeedableRng, rngs::StdRng};

const THREADS: usize = 8;

/// Raw block pointers moved between threads in these tests.
struct Block(NonNull<u8>);

unsafe impl Send for Block {}
unsafe impl Sync for Block {}

fn pool(classes: &[(usize, usize)]) -> MemPool {
    MemPool::create(Config::new(classes.iter().copied()).with_huge_pages(false)).unwrap()
}

fn assert_consistent(pool: &MemPool) {
    for class in pool.stats().classes {
        for stats in &class.pools {
            assert_eq!(stats.capacity, stats.available + stats.used);
        }
    }
}

#[test]
fn parallel_churn_leaves_no_live_blocks() {
    let pool = pool(&[(8, 16), (32, 16), (128, 8), (512, 4)]);

    thread::scope(|scope| {
        for seed in 0..THREADS {
            let pool = &pool;
            scope.spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed as u64);
                let mut held: Vec<(NonNull<u8>, usize, u8)> = Vec::new();

                for round in 0..5_000 {
                    if held.is_empty() || rng.random_bool(0.55) {
                        let size = rng.random_range(1..=700);
                        let tag = round as u8;
                        let block = pool.allocate(size).unwrap();
                        unsafe { block.as_ptr().write_bytes(tag, size) };
                        held.push((block, size, tag));
                    } else {
                        let at = rng.random_range(0..held.len());
                        let (block, size, tag) = held.swap_remove(at);
                        let bytes = unsafe { std::slice::from_raw_parts(block.as_ptr(), size) };
                        assert!(bytes.iter().all(|&b| b == tag), "block overwritten");
                        unsafe { pool.release(block) }.unwrap();
                    }
                }

                for (block, _, _) in held {
                    unsafe { pool.release(block) }.unwrap();
                }
            });
        }
    });

    assert_consistent(&pool);
    assert_eq!(0, pool.stats().live());
    pool.destroy().unwrap();
}

#[test]
fn concurrent_growth_stays_within_pool_limit() {
    let pool = pool(&[(16, 4)]);

    let blocks: Vec<Block> = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let pool = &pool;
                scope.spawn(move || {
                    (0..10)
                        .map(|_| Block(pool.allocate(16).unwrap()))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect()
    });

    // 80 live blocks: 4 + 8 + 12 + 16 = 40 pooled, the rest spilled.
    let stats = pool.stats();
    assert_eq!(4, stats.classes[0].pools.len());
    assert_eq!(40, stats.classes[0].used());
    assert_eq!(40, stats.fallback_live);
    assert_consistent(&pool);

    // Released from other threads than the ones that allocated.
    thread::scope(|scope| {
        for chunk in blocks.chunks(10) {
            let pool = &pool;
            scope.spawn(move || {
                for Block(block) in chunk {
                    unsafe { pool.release(*block) }.unwrap();
                }
            });
        }
    });

    assert_consistent(&pool);
    assert_eq!(0, pool.stats().live());
    pool.destroy().unwrap();
}

#[test]
fn bursts_grow_and_reclaim_dynamic_pools() {
    let pool = pool(&[(64, 8)]);

    for _ in 0..20 {
        thread::scope(|scope| {
            for _ in 0..4 {
                let pool = &pool;
                scope.spawn(move || {
                    let blocks: Vec<_> = (0..6).map(|_| pool.allocate(64).unwrap()).collect();
                    for block in blocks {
                        unsafe { pool.release(block) }.unwrap();
                    }
                });
            }
        });

        assert_consistent(&pool);
        assert_eq!(0, pool.stats().live());
    }

    pool.destroy().unwrap();
}
