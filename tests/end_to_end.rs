use std::{
    ptr::NonNull,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use mpalloc::{
    Config, Error, FallbackAllocator, HEADER_SIZE, LibcHeap, MemPool, MethodRegistry,
};

fn config(classes: &[(usize, usize)]) -> Config {
    Config::new(classes.iter().copied()).with_huge_pages(false)
}

fn fill(block: NonNull<u8>, len: usize, byte: u8) {
    unsafe { block.as_ptr().write_bytes(byte, len) };
}

fn bytes<'a>(block: NonNull<u8>, len: usize) -> &'a [u8] {
    unsafe { std::slice::from_raw_parts(block.as_ptr(), len) }
}

/// Counts calls on its way to the C heap.
#[derive(Debug, Default)]
struct CountingHeap {
    allocs: AtomicUsize,
    frees: AtomicUsize,
}

unsafe impl FallbackAllocator for CountingHeap {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        self.allocs.fetch_add(1, Ordering::Relaxed);
        LibcHeap.allocate(size)
    }

    fn zero_allocate(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        self.allocs.fetch_add(1, Ordering::Relaxed);
        LibcHeap.zero_allocate(count, size)
    }

    unsafe fn resize(&self, block: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
        unsafe { LibcHeap.resize(block, size) }
    }

    unsafe fn free(&self, block: NonNull<u8>) {
        self.frees.fetch_add(1, Ordering::Relaxed);
        unsafe { LibcHeap.free(block) }
    }
}

#[test]
fn single_class_grows_and_shrinks() {
    let pool = MemPool::create(config(&[(8, 4)])).unwrap();

    let blocks: Vec<_> = (0..5).map(|_| pool.allocate(8).unwrap()).collect();

    let stats = pool.stats();
    let class = &stats.classes[0];
    assert_eq!(8 + HEADER_SIZE, class.size);
    assert_eq!(0, class.pool(0).unwrap().available);
    assert_eq!(8, class.pool(1).unwrap().capacity);
    assert_eq!(1, class.pool(1).unwrap().used);
    assert_eq!(0, stats.fallback_live);

    // Permanent blocks first, so the dynamic pool drains last with slack
    // 4 > 8 / 4 left in the permanent pool.
    for block in blocks {
        unsafe { pool.release(block) }.unwrap();
    }

    let stats = pool.stats();
    assert_eq!(1, stats.classes[0].pools.len());
    assert_eq!(4, stats.classes[0].available());
    pool.destroy().unwrap();
}

#[test]
fn release_restores_available_count() {
    let pool = MemPool::create(config(&[(16, 8), (64, 8)])).unwrap();
    let before = pool.stats();

    let block = pool.allocate(40).unwrap();
    assert_eq!(7, pool.stats().class_for(40).unwrap().available());

    unsafe { pool.release(block) }.unwrap();
    assert_eq!(before, pool.stats());

    pool.destroy().unwrap();
}

#[test]
fn requests_land_in_smallest_fitting_class() {
    let sizes = [8, 16, 24, 48, 100, 256];
    let pool = MemPool::create(config(&sizes.map(|size| (size, 4)))).unwrap();

    for request in 1..=256 {
        let block = pool.allocate(request).unwrap();
        let stats = pool.stats();

        let expected = sizes.iter().position(|&size| size >= request).unwrap();
        for (id, class) in stats.classes.iter().enumerate() {
            assert_eq!(usize::from(id == expected), class.used(), "request {request}");
        }

        unsafe { pool.release(block) }.unwrap();
    }
}

#[test]
fn fallback_serves_oversized_and_exhausted_requests() {
    let heap = Arc::new(CountingHeap::default());
    let pool = MemPool::with_fallback(
        config(&[(32, 2)]).with_max_pools_per_class(1),
        heap.clone(),
    )
    .unwrap();

    let big = pool.allocate(33).unwrap();
    let pooled: Vec<_> = (0..2).map(|_| pool.allocate(32).unwrap()).collect();
    let spilled = pool.allocate(32).unwrap();

    assert_eq!(2, heap.allocs.load(Ordering::Relaxed));
    assert_eq!(2, pool.stats().fallback_live);
    assert_eq!(4, pool.stats().live());

    fill(spilled, 32, 0x5a);
    assert!(bytes(spilled, 32).iter().all(|&b| b == 0x5a));

    for block in pooled.into_iter().chain([big, spilled]) {
        unsafe { pool.release(block) }.unwrap();
    }
    assert_eq!(2, heap.frees.load(Ordering::Relaxed));
    assert_eq!(0, pool.stats().live());
    pool.destroy().unwrap();
}

#[test]
fn zero_allocate_clears_recycled_blocks() {
    let pool = MemPool::create(config(&[(64, 1)])).unwrap();

    let dirty = pool.allocate(64).unwrap();
    fill(dirty, 64, 0xee);
    unsafe { pool.release(dirty) }.unwrap();

    let clean = pool.zero_allocate(8, 8).unwrap();
    assert_eq!(dirty, clean);
    assert!(bytes(clean, 64).iter().all(|&b| b == 0));

    let big = pool.zero_allocate(100, 10).unwrap();
    assert!(bytes(big, 1000).iter().all(|&b| b == 0));

    unsafe {
        pool.release(clean).unwrap();
        pool.release(big).unwrap();
    }
}

#[test]
fn resize_within_class_keeps_the_block() {
    let pool = MemPool::create(config(&[(32, 4), (128, 4)])).unwrap();

    let block = pool.allocate(10).unwrap();
    let same = unsafe { pool.resize(Some(block), 32) }.unwrap();

    assert_eq!(Some(block), same);
    unsafe { pool.release(block) }.unwrap();
}

#[test]
fn resize_moves_contents_between_classes_and_fallback() {
    let pool = MemPool::create(config(&[(32, 4), (128, 4)])).unwrap();

    let small = pool.allocate(32).unwrap();
    for i in 0..32 {
        unsafe { small.as_ptr().add(i).write(i as u8) };
    }

    let grown = unsafe { pool.resize(Some(small), 100) }.unwrap().unwrap();
    assert_ne!(small, grown);
    assert_eq!((0..32).collect::<Vec<u8>>(), bytes(grown, 32));
    assert_eq!(0, pool.stats().classes[0].used());
    assert_eq!(1, pool.stats().classes[1].used());

    let spilled = unsafe { pool.resize(Some(grown), 4096) }.unwrap().unwrap();
    assert_eq!((0..32).collect::<Vec<u8>>(), bytes(spilled, 32));
    assert_eq!(1, pool.stats().fallback_live);

    // Fallback blocks stay in the fallback allocator across resizes.
    let shrunk = unsafe { pool.resize(Some(spilled), 16) }.unwrap().unwrap();
    assert_eq!((0..16).collect::<Vec<u8>>(), bytes(shrunk, 16));
    assert_eq!(1, pool.stats().fallback_live);

    assert_eq!(None, unsafe { pool.resize(Some(shrunk), 0) }.unwrap());
    assert_eq!(0, pool.stats().live());
    pool.destroy().unwrap();
}

#[test]
fn shrinking_resize_stays_in_place() {
    let pool = MemPool::create(config(&[(16, 2), (64, 2)])).unwrap();

    let block = pool.allocate(64).unwrap();
    fill(block, 64, 0x33);

    // Fits the 64-byte class, so nothing moves.
    let same = unsafe { pool.resize(Some(block), 16) }.unwrap().unwrap();
    assert_eq!(block, same);
    assert_eq!(1, pool.stats().classes[1].used());

    unsafe { pool.release(same) }.unwrap();
}

#[test]
fn overwritten_header_is_reported() {
    let pool = MemPool::create(config(&[(16, 4)])).unwrap();
    let block = pool.allocate(16).unwrap();

    let saved = unsafe { block.as_ptr().sub(1).read() };
    unsafe { block.as_ptr().sub(1).write(0) };

    assert!(matches!(
        unsafe { pool.release(block) },
        Err(Error::Corruption(_))
    ));
    // The pool was left untouched.
    assert_eq!(1, pool.stats().live());

    unsafe {
        block.as_ptr().sub(1).write(saved);
        pool.release(block).unwrap();
    }
    pool.destroy().unwrap();
}

#[test]
fn double_release_is_reported() {
    let pool = MemPool::create(config(&[(16, 4)])).unwrap();

    let pooled = pool.allocate(16).unwrap();
    unsafe { pool.release(pooled) }.unwrap();
    assert!(matches!(
        unsafe { pool.release(pooled) },
        Err(Error::Corruption(_))
    ));
    assert_eq!(4, pool.stats().classes[0].available());

    pool.destroy().unwrap();
}

#[test]
fn foreign_pointer_is_reported() {
    let pool = MemPool::create(config(&[(16, 4)])).unwrap();

    let mut storage = [0u64; 4];
    let foreign = NonNull::new(storage.as_mut_ptr().cast::<u8>()).unwrap();
    let foreign = unsafe { foreign.add(HEADER_SIZE) };

    assert!(matches!(
        unsafe { pool.release(foreign) },
        Err(Error::Corruption(_))
    ));
}

#[test]
#[should_panic(expected = "memory corruption detected")]
fn strict_mode_panics_on_corruption() {
    let pool = MemPool::create(config(&[(16, 4)]).with_strict(true)).unwrap();
    let block = pool.allocate(16).unwrap();

    unsafe {
        block.as_ptr().sub(1).write(0);
        let _ = pool.release(block);
    }
}

#[test]
#[should_panic(expected = "outstanding")]
fn strict_mode_panics_on_destroy_with_live_blocks() {
    let pool = MemPool::create(config(&[(16, 4)]).with_strict(true)).unwrap();
    let _block = pool.allocate(16).unwrap();

    let _ = pool.destroy();
}

#[test]
fn configuration_errors() {
    assert!(matches!(
        MemPool::create(config(&[])),
        Err(Error::Config(_))
    ));
    assert!(matches!(
        MemPool::create(config(&[(0, 4)])),
        Err(Error::Config(_))
    ));
    assert!(matches!(
        MemPool::create(config(&[(8, 4)]).with_method("slab")),
        Err(Error::UnknownMethod(_))
    ));
    assert!(matches!(
        MemPool::with_registry(config(&[(8, 4)]), &MethodRegistry::empty(), Arc::new(LibcHeap)),
        Err(Error::UnknownMethod(_))
    ));
}

#[test]
fn toml_configuration() {
    let config = Config::from_toml_str(
        r#"
        huge_pages = false
        default_capacity = 3

        [[classes]]
        size = 24

        [[classes]]
        size = 8
        capacity = 2
        "#,
    )
    .unwrap();

    let pool = MemPool::create(config).unwrap();
    let stats = pool.stats();

    assert_eq!(
        vec![(8 + HEADER_SIZE, 2), (24 + HEADER_SIZE, 3)],
        stats
            .classes
            .iter()
            .map(|class| (class.size, class.pool(0).unwrap().capacity))
            .collect::<Vec<_>>()
    );
    pool.destroy().unwrap();
}

#[test]
fn exact_table_lookups_agree_with_search() {
    let sizes: Vec<usize> = (1..=40).map(|i| i * 8).collect();
    let classes: Vec<_> = sizes.iter().map(|&size| (size, 1)).collect();
    let pool = MemPool::create(config(&classes).with_exact_table_threshold(8)).unwrap();

    for request in [1, 8, 9, 64, 65, 319, 320] {
        let block = pool.allocate(request).unwrap();
        let expected = sizes.iter().position(|&size| size >= request).unwrap();
        assert_eq!(1, pool.stats().classes[expected].used(), "request {request}");
        unsafe { pool.release(block) }.unwrap();
    }
}
