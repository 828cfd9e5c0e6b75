//! A size-classed slab allocator that sits in front of a generic heap.
//!
//! Workloads whose request sizes are roughly known ahead of time register
//! a table of size classes. Each class owns a permanent slab pool, mapped
//! once from the kernel, plus a handful of dynamic pools that are created
//! under pressure and reclaimed when they drain. Requests that fit no class,
//! or that hit a class which cannot grow any further, go to the fallback
//! allocator ([`LibcHeap`] unless another one is supplied).
//!
//! Every block carries an 8-byte header in front of the returned pointer
//! recording which class and pool it came from, so [`MemPool::release`]
//! and [`MemPool::resize`] find the owner without any lookup.
//!
//! ```no_run
//! use mpalloc::{Config, MemPool};
//!
//! let pool = MemPool::create(Config::new([(32, 1024), (128, 256)]))?;
//!
//! let block = pool.allocate(24)?;
//! unsafe { pool.release(block)? };
//!
//! pool.destroy()?;
//! # Ok::<(), mpalloc::Error>(())
//! ```

use std::{ptr::NonNull, sync::Arc};

use tracing::error;

mod config;
mod engine;
mod error;
mod fallback;
mod freelist;
mod header;
mod index;
mod kernel;
mod list;
mod method;
mod node;
mod pool;
mod region;
mod stats;
mod utils;

pub use config::{
    ClassSpec, Config, DEFAULT_CAPACITY, DEFAULT_EXACT_TABLE_THRESHOLD, DEFAULT_MAX_POOLS,
    EFFICIENT_CLASS_LIMIT, MAX_CLASSES, MAX_POOLS, SIZE_CLASS_METHOD,
};
pub use engine::SizeClassEngine;
pub use error::{Error, Result};
pub use fallback::{FallbackAllocator, LibcHeap};
pub use header::{FALLBACK_NODE, FALLBACK_POOL, HEADER_SIZE};
pub use index::{SizeClassIndex, ceiling_search};
pub use method::{AllocMethod, MethodCtor, MethodRegistry};
pub use node::SizeClassNode;
pub use pool::SlabPool;
pub use stats::{ClassStats, PoolStats, Stats};

/// Handle to one allocator instance.
///
/// All operations take `&self` and may be called from any number of
/// threads at once.
#[derive(Debug)]
pub struct MemPool {
    /// Only `None` once torn down.
    method: Option<Box<dyn AllocMethod>>,
}

impl MemPool {
    /// Builds the allocator `config` describes, with the C heap as fallback.
    pub fn create(config: Config) -> Result<Self> {
        Self::with_fallback(config, Arc::new(LibcHeap))
    }

    pub fn with_fallback(config: Config, fallback: Arc<dyn FallbackAllocator>) -> Result<Self> {
        Self::with_registry(config, &MethodRegistry::default(), fallback)
    }

    /// Builds the method named by `config.method` from `registry`.
    pub fn with_registry(
        config: Config,
        registry: &MethodRegistry,
        fallback: Arc<dyn FallbackAllocator>,
    ) -> Result<Self> {
        let method = registry.build(&config, fallback)?;
        Ok(Self {
            method: Some(method),
        })
    }

    fn method(&self) -> &dyn AllocMethod {
        match &self.method {
            Some(method) => method.as_ref(),
            None => unreachable!("method is only taken on teardown"),
        }
    }

    /// Returns at least `size` bytes, 8-byte aligned. Sizes no class can
    /// serve are satisfied by the fallback allocator.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        self.method().allocate(size, false)
    }

    /// Returns `count * size` zeroed bytes.
    pub fn zero_allocate(&self, count: usize, size: usize) -> Result<NonNull<u8>> {
        let total = count
            .checked_mul(size)
            .ok_or_else(|| Error::SizeOverflow(format!("{count} x {size} bytes")))?;

        self.method().allocate(total, true)
    }

    /// `realloc`. A `None` block allocates, a zero `size` releases and
    /// returns `None`. A block whose class still holds `size` bytes is
    /// returned unchanged, otherwise its contents move to a new block.
    ///
    /// # Safety
    ///
    /// `block` must come from this allocator and not have been released.
    pub unsafe fn resize(
        &self,
        block: Option<NonNull<u8>>,
        size: usize,
    ) -> Result<Option<NonNull<u8>>> {
        match (block, size) {
            (None, size) => self.allocate(size).map(Some),
            (Some(block), 0) => unsafe { self.release(block) }.map(|()| None),
            (Some(block), size) => unsafe { self.method().resize(block, size) }.map(Some),
        }
    }

    /// `free`.
    ///
    /// # Safety
    ///
    /// `block` must come from this allocator and not have been released.
    pub unsafe fn release(&self, block: NonNull<u8>) -> Result<()> {
        unsafe { self.method().release(block) }
    }

    pub fn stats(&self) -> Stats {
        self.method().stats()
    }

    /// Tears the allocator down. Every block must have been released.
    pub fn destroy(mut self) -> Result<()> {
        match self.method.take() {
            Some(method) => method.destroy(),
            None => Ok(()),
        }
    }
}

impl Drop for MemPool {
    fn drop(&mut self) {
        // Unwinding: drop the pools as they are, leaking any still in use.
        if std::thread::panicking() {
            return;
        }

        if let Some(method) = self.method.take() {
            if let Err(err) = method.destroy() {
                error!(%err, "allocator dropped with outstanding allocations");
            }
        }
    }
}
