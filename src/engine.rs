//! The size-class allocation method.

use std::{
    ptr::{self, NonNull},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use tracing::{debug, error, trace, warn};

use crate::{
    config::{Config, EFFICIENT_CLASS_LIMIT},
    error::{Error, Result},
    fallback::FallbackAllocator,
    header::{self, FALLBACK_NODE, FALLBACK_POOL, HEADER_SIZE, Origin},
    index::SizeClassIndex,
    method::AllocMethod,
    node::SizeClassNode,
    stats::Stats,
};

/// Routes every request to the smallest class that holds it, and
/// everything else to the fallback allocator.
///
/// Node ids are positions in the ascending size table, so the id found in
/// a header indexes straight into `nodes`.
#[derive(Debug)]
pub struct SizeClassEngine {
    nodes: Vec<SizeClassNode>,
    index: SizeClassIndex,
    fallback: Arc<dyn FallbackAllocator>,
    /// Blocks handed out by the fallback and not yet released.
    fallback_live: AtomicUsize,
    strict: bool,
}

impl SizeClassEngine {
    pub fn create(config: &Config, fallback: Arc<dyn FallbackAllocator>) -> Result<Self> {
        config.validate()?;

        let mut classes: Vec<(usize, usize)> = config
            .classes
            .iter()
            .map(|class| (class.size + HEADER_SIZE, config.capacity_of(class)))
            .collect();
        classes.sort_unstable_by_key(|&(size, _)| size);

        if classes.len() > EFFICIENT_CLASS_LIMIT {
            warn!(
                classes = classes.len(),
                limit = EFFICIENT_CLASS_LIMIT,
                "many size classes registered, lookups will be slower"
            );
        }

        // Nodes built before a failure are dropped here, unmapping them.
        let nodes = classes
            .iter()
            .enumerate()
            .map(|(id, &(size, capacity))| {
                SizeClassNode::new(
                    id as u8,
                    size,
                    capacity,
                    config.max_pools_per_class,
                    config.huge_pages,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let index = SizeClassIndex::new(
            classes.iter().map(|&(size, _)| size).collect(),
            config.exact_table_threshold,
        );

        let (min, max) = registered_bytes(&classes, config.max_pools_per_class);
        debug!(
            classes = nodes.len(),
            smallest = classes.first().map_or(0, |&(size, _)| size),
            largest = classes.last().map_or(0, |&(size, _)| size),
            exact_table = index.has_exact_table(),
            min_registered_kb = min / 1024,
            max_registered_kb = max / 1024,
            "size-class engine created"
        );

        Ok(Self {
            nodes,
            index,
            fallback,
            fallback_live: AtomicUsize::new(0),
            strict: config.strict,
        })
    }

    /// [`MethodCtor`](crate::MethodCtor) for the registry.
    pub fn boxed(
        config: &Config,
        fallback: Arc<dyn FallbackAllocator>,
    ) -> Result<Box<dyn AllocMethod>> {
        Ok(Box::new(Self::create(config, fallback)?))
    }

    pub fn nodes(&self) -> &[SizeClassNode] {
        &self.nodes
    }

    /// Logs fatal errors, and panics on them in strict mode.
    fn fatal(&self, err: Error) -> Error {
        if err.is_fatal() {
            error!(%err, "allocator integrity violated");
            if self.strict {
                panic!("{err}");
            }
        }
        err
    }

    fn allocate_fallback(&self, total: usize, zeroed: bool) -> Result<NonNull<u8>> {
        let raw = if zeroed {
            self.fallback.zero_allocate(1, total)
        } else {
            self.fallback.allocate(total)
        };

        let Some(raw) = raw else {
            error!(size = total, "fallback allocator failed");
            return Err(Error::OutOfMemory(format!(
                "fallback allocator refused {total} bytes"
            )));
        };

        self.fallback_live.fetch_add(1, Ordering::Relaxed);
        // SAFETY: the block is `total >= HEADER_SIZE` bytes long.
        let user = unsafe { header::pack(raw, FALLBACK_NODE, FALLBACK_POOL) };
        trace!(size = total, ptr = ?user, "allocated from fallback");

        Ok(user)
    }

    /// Decodes the header in front of `user` and finds the owning node,
    /// `None` standing for the fallback allocator.
    ///
    /// **SAFETY**: the [`HEADER_SIZE`] bytes before `user` must be readable.
    unsafe fn locate(&self, user: NonNull<u8>) -> Result<(Origin, Option<&SizeClassNode>)> {
        let origin = unsafe { header::unpack(user)? };

        if origin.is_fallback() {
            if origin.pool_id != FALLBACK_POOL {
                return Err(Error::Corruption(format!(
                    "fallback block {user:p} carries pool id {}",
                    origin.pool_id
                )));
            }
            return Ok((origin, None));
        }

        match self.nodes.get(origin.node_id as usize) {
            Some(node) => Ok((origin, Some(node))),
            None => Err(Error::Corruption(format!(
                "node id {} of {user:p} out of range, {} classes registered",
                origin.node_id,
                self.nodes.len()
            ))),
        }
    }

    unsafe fn release_block(&self, user: NonNull<u8>) -> Result<()> {
        let (origin, node) = unsafe { self.locate(user)? };

        match node {
            Some(node) => {
                trace!(class = node.id(), pool = origin.pool_id, ptr = ?user, "release");
                node.put_slice(origin.pool_id, origin.raw)
            }
            None => {
                trace!(ptr = ?user, "release to fallback");
                unsafe {
                    header::clear(origin.raw);
                    self.fallback.free(origin.raw);
                }
                self.fallback_live.fetch_sub(1, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    unsafe fn resize_block(&self, user: NonNull<u8>, size: usize) -> Result<NonNull<u8>> {
        let total = total_size(size)?;
        let (origin, node) = unsafe { self.locate(user)? };

        let Some(node) = node else {
            let Some(raw) = (unsafe { self.fallback.resize(origin.raw, total) }) else {
                error!(size = total, "fallback allocator failed to resize");
                return Err(Error::OutOfMemory(format!(
                    "fallback allocator refused to resize to {total} bytes"
                )));
            };
            // SAFETY: the resized block is `total` bytes long.
            return Ok(unsafe { header::pack(raw, FALLBACK_NODE, FALLBACK_POOL) });
        };

        if node.size() >= total {
            return Ok(user);
        }

        let fresh = self.allocate(size, false)?;
        // SAFETY: both blocks hold at least the copied length and are distinct.
        unsafe {
            ptr::copy_nonoverlapping(
                user.as_ptr(),
                fresh.as_ptr(),
                node.usable_size().min(size),
            );
        }

        if let Err(err) = unsafe { self.release_block(user) } {
            // The old block stays with the caller, the new one is given back.
            if let Err(undo) = unsafe { self.release_block(fresh) } {
                error!(%undo, "failed to give back resized block");
            }
            return Err(err);
        }

        Ok(fresh)
    }
}

impl AllocMethod for SizeClassEngine {
    fn allocate(&self, size: usize, zeroed: bool) -> Result<NonNull<u8>> {
        if size == 0 {
            return Err(Error::ZeroSize);
        }
        let total = total_size(size)?;

        if let Some(id) = self.index.find(total) {
            let node = &self.nodes[id];

            if let Some(slice) = node.get_slice() {
                if zeroed {
                    // SAFETY: elements are `node.size()` bytes long.
                    unsafe {
                        slice
                            .element
                            .as_ptr()
                            .add(HEADER_SIZE)
                            .write_bytes(0, node.usable_size());
                    }
                }
                // SAFETY: as above, and `node.size() >= total > HEADER_SIZE`.
                let user = unsafe { header::pack(slice.element, node.id(), slice.pool_id) };
                trace!(class = node.id(), pool = slice.pool_id, ptr = ?user, "allocate");

                return Ok(user);
            }

            warn!(class = id, size, "size class exhausted, using fallback");
        }

        self.allocate_fallback(total, zeroed)
    }

    unsafe fn resize(&self, block: NonNull<u8>, size: usize) -> Result<NonNull<u8>> {
        unsafe { self.resize_block(block, size) }.map_err(|err| self.fatal(err))
    }

    unsafe fn release(&self, block: NonNull<u8>) -> Result<()> {
        unsafe { self.release_block(block) }.map_err(|err| self.fatal(err))
    }

    fn destroy(self: Box<Self>) -> Result<()> {
        let live = self.nodes.iter().map(SizeClassNode::live).sum::<usize>()
            + self.fallback_live.load(Ordering::Relaxed);

        if live > 0 {
            return Err(self.fatal(Error::OutstandingAllocations { live }));
        }

        debug!(classes = self.nodes.len(), "size-class engine destroyed");
        Ok(())
    }

    fn stats(&self) -> Stats {
        Stats {
            classes: self.nodes.iter().map(SizeClassNode::stats).collect(),
            fallback_live: self.fallback_live.load(Ordering::Relaxed),
        }
    }
}

fn total_size(size: usize) -> Result<usize> {
    size.checked_add(HEADER_SIZE)
        .ok_or_else(|| Error::SizeOverflow(format!("{size} bytes plus the header")))
}

/// Bytes mapped with only permanent pools live, and with every pool slot
/// live at the initial capacity.
fn registered_bytes(classes: &[(usize, usize)], max_pools: usize) -> (usize, usize) {
    classes
        .iter()
        .fold((0usize, 0usize), |(min, max), &(size, capacity)| {
            let permanent = size.saturating_mul(capacity);
            (
                min.saturating_add(permanent),
                max.saturating_add(permanent.saturating_mul(max_pools)),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::fallback::LibcHeap;

    fn engine(config: Config) -> SizeClassEngine {
        SizeClassEngine::create(&config.with_huge_pages(false), Arc::new(LibcHeap)).unwrap()
    }

    #[test]
    fn nodes_are_sorted_and_include_the_header() {
        let engine = engine(Config::new([(64, 2), (8, 2), (24, 2)]));

        let sizes: Vec<_> = engine.nodes().iter().map(SizeClassNode::size).collect();
        assert_eq!(vec![16, 32, 72], sizes);
        assert!(
            engine
                .nodes()
                .iter()
                .enumerate()
                .all(|(id, node)| node.id() as usize == id)
        );
    }

    #[test]
    fn smallest_fitting_class_serves() {
        let engine = engine(Config::new([(8, 2), (24, 2), (64, 2)]));

        let block = engine.allocate(9, false).unwrap();
        let origin = unsafe { header::unpack(block) }.unwrap();

        assert_eq!(1, origin.node_id);
        assert_eq!(1, engine.stats().classes[1].used());
        unsafe { engine.release(block) }.unwrap();
        Box::new(engine).destroy().unwrap();
    }

    #[test]
    fn oversized_requests_use_fallback() {
        let engine = engine(Config::new([(8, 2)]));

        let block = engine.allocate(100, false).unwrap();

        assert!(unsafe { header::unpack(block) }.unwrap().is_fallback());
        assert_eq!(1, engine.stats().fallback_live);
        unsafe { engine.release(block) }.unwrap();
        assert_eq!(0, engine.stats().fallback_live);
    }

    #[test]
    fn zeroed_pool_blocks_are_zero() {
        let engine = engine(Config::new([(32, 1)]));

        let block = engine.allocate(32, false).unwrap();
        unsafe {
            block.as_ptr().write_bytes(0xff, 32);
            engine.release(block).unwrap();
        }

        let block = engine.allocate(32, true).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(block.as_ptr(), 32) };
        assert!(bytes.iter().all(|&b| b == 0));
        unsafe { engine.release(block) }.unwrap();
    }

    #[test]
    fn out_of_range_node_id_is_corruption() {
        let engine = engine(Config::new([(8, 2)]));
        let mut storage = [0u64; 4];
        let raw = NonNull::new(storage.as_mut_ptr().cast::<u8>()).unwrap();

        let forged = unsafe { header::pack(raw, 7, 0) };
        assert!(matches!(
            unsafe { engine.release(forged) },
            Err(Error::Corruption(_))
        ));

        let forged = unsafe { header::pack(raw, FALLBACK_NODE, 3) };
        assert!(matches!(
            unsafe { engine.release(forged) },
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn destroy_counts_fallback_blocks() {
        let engine = engine(Config::new([(8, 2)]));
        let _block = engine.allocate(1000, false).unwrap();

        assert!(matches!(
            Box::new(engine).destroy(),
            Err(Error::OutstandingAllocations { live: 1 })
        ));
    }

    #[test]
    fn registered_bytes_counts_every_pool_slot() {
        assert_eq!((16 * 4, 16 * 4 * 4), registered_bytes(&[(16, 4)], 4));
        assert_eq!((64, 64), registered_bytes(&[(16, 4)], 1));
        assert_eq!(
            (16 * 4 + 32 * 2, (16 * 4 + 32 * 2) * 3),
            registered_bytes(&[(16, 4), (32, 2)], 3)
        );
    }
}
