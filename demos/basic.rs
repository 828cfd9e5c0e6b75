//! Registers a small class table, pushes one class past its permanent
//! pool and prints the pool usage along the way.
//!
//! Run with `RUST_LOG=mpalloc=debug` to see pools being created and
//! reclaimed.

use std::ptr::NonNull;

use mpalloc::{Config, MemPool, Stats};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const CONFIG: &str = r#"
max_pools_per_class = 4
huge_pages = false

[[classes]]
size = 8
capacity = 4

[[classes]]
size = 64
capacity = 16

[[classes]]
size = 256
"#;

fn log_alloc(size: usize, addr: NonNull<u8>) {
    println!("Requested {size} bytes of memory");
    println!("Received this address: {addr:?}");
}

fn log_stats(when: &str, stats: &Stats) {
    println!("\n{when}:");
    for class in &stats.classes {
        println!(
            "  class {} ({} bytes): {} used, {} available, {} pool(s)",
            class.id,
            class.size,
            class.used(),
            class.available(),
            class.pools.len()
        );
    }
    println!("  fallback: {} live", stats.fallback_live);
}

fn main() -> mpalloc::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let pool = MemPool::create(Config::from_toml_str(CONFIG)?)?;

    let mut blocks = Vec::new();
    for size in [8, 8, 8, 8, 8, 40, 200, 4096] {
        let block = pool.allocate(size)?;
        log_alloc(size, block);
        blocks.push(block);
    }
    log_stats("After allocating", &pool.stats());

    for block in blocks {
        unsafe { pool.release(block)? };
    }
    log_stats("After releasing", &pool.stats());

    pool.destroy()
}
