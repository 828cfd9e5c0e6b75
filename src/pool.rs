use std::{fmt, mem::ManuallyDrop, ptr::NonNull};

use parking_lot::Mutex;
use tracing::error;

use crate::{
    error::{Error, Result},
    freelist::FreeList,
    list::NIL,
    region::Region,
    utils::checked_align,
};

/// Size of the tag in front of every slot's element.
const SLOT_TAG_SIZE: usize = 8;

/// Slot strides are padded to this so elements stay 8-byte aligned.
const SLOT_ALIGN: usize = 8;

const SLOT_MAGIC: u8 = 0xb5;

/// Tag written once at construction in front of every element. A release
/// whose tag does not match was pointed at memory that is not one of our
/// slots, or the bytes just before the element were overwritten.
#[repr(C)]
#[derive(Clone, Copy)]
struct SlotTag {
    index: u32,
    reserved: [u8; 3],
    magic: u8,
}

/// A fixed-capacity arena of fixed-size elements.
///
/// The backing [`Region`] is mapped once in [`SlabPool::create`] and carved
/// into `capacity` slots:
///
/// ```text
/// +-----+-----------+-----+-----------+       +-----+-----------+
/// | tag | element 0 | tag | element 1 |  ...  | tag | element n |
/// +-----+-----------+-----+-----------+       +-----+-----------+
///       ^ get() returns pointers here
/// ```
///
/// Slots are taken from the head of the idle list and released to its
/// tail. Every mutating operation holds the pool's own lock for its whole
/// body and never waits for capacity: an exhausted pool simply returns
/// `None`.
pub struct SlabPool {
    id: u8,
    capacity: usize,
    element_size: usize,
    stride: usize,
    region: ManuallyDrop<Region>,
    slots: Mutex<FreeList>,
}

impl SlabPool {
    /// Maps a new pool of `capacity` elements of `element_size` bytes each.
    pub fn create(id: u8, capacity: usize, element_size: usize, huge_pages: bool) -> Result<Self> {
        if capacity == 0 || element_size == 0 {
            return Err(Error::Config(format!(
                "pool needs a non-zero capacity ({capacity}) and element size ({element_size})"
            )));
        }
        if capacity >= NIL as usize {
            return Err(Error::Config(format!("pool capacity {capacity} is too large")));
        }

        let too_large = || {
            Error::OutOfMemory(format!(
                "pool of {capacity} x {element_size} bytes does not fit in memory"
            ))
        };
        let stride = SLOT_TAG_SIZE
            .checked_add(element_size)
            .and_then(|size| checked_align(size, SLOT_ALIGN))
            .ok_or_else(too_large)?;
        let len = stride.checked_mul(capacity).ok_or_else(too_large)?;

        let region = Region::map(len, huge_pages)?;

        for index in 0..capacity {
            let tag = SlotTag {
                index: index as u32,
                reserved: [0; 3],
                magic: SLOT_MAGIC,
            };
            // SAFETY: index < capacity so the tag lies inside the region.
            unsafe {
                region
                    .start()
                    .as_ptr()
                    .add(index * stride)
                    .cast::<SlotTag>()
                    .write_unaligned(tag);
            }
        }

        Ok(Self {
            id,
            capacity,
            element_size,
            stride,
            region: ManuallyDrop::new(region),
            slots: Mutex::new(FreeList::new(capacity as u32)),
        })
    }

    /// Takes one idle element, or returns `None` if every slot is in use.
    pub fn get(&self) -> Option<NonNull<u8>> {
        let index = self.slots.lock().take()?;

        // SAFETY: `take` only yields indices below capacity.
        Some(unsafe { self.region.start().add(index as usize * self.stride + SLOT_TAG_SIZE) })
    }

    /// Returns `element` to the tail of the idle list.
    ///
    /// The pointer is checked against the region bounds, the slot grid and
    /// the slot tag before anything is touched; a pointer that fails any of
    /// these, or a slot that is not currently in use, is reported as
    /// [`Error::Corruption`] and the lists are left unchanged.
    pub fn put(&self, element: NonNull<u8>) -> Result<()> {
        let index = self.locate(element)?;

        if !self.slots.lock().release(index) {
            return Err(Error::Corruption(format!(
                "slot {index} of pool {} released while not in use",
                self.id
            )));
        }

        Ok(())
    }

    fn locate(&self, element: NonNull<u8>) -> Result<u32> {
        let corrupt = |why: &str| {
            Error::Corruption(format!("{element:p} is not an element of pool {}: {why}", self.id))
        };

        let addr = element.as_ptr() as usize;
        if !self.region.contains(addr) {
            return Err(corrupt("outside the pool region"));
        }

        let offset = (addr - self.region.start().as_ptr() as usize)
            .checked_sub(SLOT_TAG_SIZE)
            .ok_or_else(|| corrupt("inside the first slot tag"))?;
        if offset % self.stride != 0 || offset / self.stride >= self.capacity {
            return Err(corrupt("not on a slot boundary"));
        }

        let index = offset / self.stride;
        // SAFETY: the slot start was just bounds checked against the region.
        let tag = unsafe {
            self.region
                .start()
                .as_ptr()
                .add(offset)
                .cast::<SlotTag>()
                .read_unaligned()
        };
        if tag.magic != SLOT_MAGIC || tag.index as usize != index {
            return Err(corrupt("slot tag overwritten"));
        }

        Ok(index as u32)
    }

    #[inline]
    pub fn id(&self) -> u8 {
        self.id
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn element_size(&self) -> usize {
        self.element_size
    }

    /// Number of idle elements.
    pub fn available(&self) -> usize {
        self.slots.lock().available()
    }

    /// Number of elements currently handed out.
    pub fn used(&self) -> usize {
        self.slots.lock().used()
    }

    /// Both counters read under one lock acquisition, so they always add
    /// up to the capacity.
    pub fn counts(&self) -> (usize, usize) {
        let slots = self.slots.lock();
        debug_assert_eq!(slots.capacity(), slots.available() + slots.used());
        (slots.available(), slots.used())
    }

    /// Tears the pool down, returning its region to the kernel.
    ///
    /// Refuses with [`Error::OutstandingAllocations`] if any element is
    /// still in use; the region is then leaked rather than unmapped.
    pub fn destroy(self) -> Result<()> {
        match self.used() {
            0 => Ok(()),
            live => Err(Error::OutstandingAllocations { live }),
        }
    }
}

impl Drop for SlabPool {
    fn drop(&mut self) {
        let live = self.slots.get_mut().used();

        // SAFETY: the region is taken exactly once, here.
        let region = unsafe { ManuallyDrop::take(&mut self.region) };

        if live == 0 {
            drop(region);
        } else {
            error!(
                pool = self.id,
                live,
                len = region.len(),
                "pool dropped with live elements, leaking its region"
            );
            region.leak();
        }
    }
}

impl fmt::Debug for SlabPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (available, used) = self.counts();
        f.debug_struct("SlabPool")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("element_size", &self.element_size)
            .field("available", &available)
            .field("used", &used)
            .field("huge", &self.region.is_huge())
            .finish()
    }
}
