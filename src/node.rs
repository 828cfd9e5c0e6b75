use std::{fmt, ptr::NonNull};

use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::{
    error::{Error, Result},
    header::HEADER_SIZE,
    pool::SlabPool,
    stats::{ClassStats, PoolStats},
};

/// Pool id of the permanent pool of every class.
pub(crate) const PERMANENT_POOL: u8 = 0;

/// An element taken from one of a class's pools.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Slice {
    pub pool_id: u8,
    pub element: NonNull<u8>,
}

/// The dynamic part of a class. Slot `i` holds pool id `i + 1`.
struct DynamicPools {
    slots: Vec<Option<SlabPool>>,
    /// Live pools, the permanent one included.
    active: usize,
}

impl DynamicPools {
    fn take_any(&self) -> Option<Slice> {
        self.slots.iter().flatten().find_map(|pool| {
            pool.get().map(|element| Slice {
                pool_id: pool.id(),
                element,
            })
        })
    }

    /// A dynamic pool is reclaimed once it is idle and the other pools of
    /// the class have more than a quarter of its capacity free between them.
    fn should_reclaim(&self, permanent: &SlabPool, slot: usize) -> bool {
        let Some(pool) = self.slots[slot].as_ref() else {
            return false;
        };
        if pool.used() != 0 {
            return false;
        }

        let slack = permanent.available()
            + self
                .slots
                .iter()
                .enumerate()
                .filter(|&(other, _)| other != slot)
                .filter_map(|(_, pool)| pool.as_ref())
                .map(SlabPool::available)
                .sum::<usize>();

        slack > pool.capacity() / 4
    }
}

/// All pools serving one size class.
///
/// ```text
///               pool 0        pool 1         pool 2         pool 3
///            +-----------+ +-----------+ +-------------+ +-------------+
///  node ---> | permanent | |  dynamic  | |   (empty)   | |   dynamic   |
///            |  cap = c  | | cap = 2c  | |             | |  cap = 3c   |
///            +-----------+ +-----------+ +-------------+ +-------------+
///             no node lock  \______________ behind the RwLock ________/
/// ```
///
/// The permanent pool exists for the node's whole life and is reached
/// without touching the node lock, which keeps the common case (demand
/// within the initial capacity) down to the pool's own mutex. Dynamic pools
/// are created when everything else is full, each larger than the last,
/// and reclaimed when they drain while the rest of the class has slack.
pub struct SizeClassNode {
    id: u8,
    /// Element size, header included.
    size: usize,
    init_capacity: usize,
    huge_pages: bool,
    permanent: SlabPool,
    dynamic: RwLock<DynamicPools>,
}

impl SizeClassNode {
    /// Builds the class and maps its permanent pool. `max_pools` counts the
    /// permanent pool, so `1` disables growth.
    pub fn new(
        id: u8,
        size: usize,
        init_capacity: usize,
        max_pools: usize,
        huge_pages: bool,
    ) -> Result<Self> {
        let permanent = SlabPool::create(PERMANENT_POOL, init_capacity, size, huge_pages)?;

        Ok(Self {
            id,
            size,
            init_capacity,
            huge_pages,
            permanent,
            dynamic: RwLock::new(DynamicPools {
                slots: (1..max_pools.max(1)).map(|_| None).collect(),
                active: 1,
            }),
        })
    }

    /// Takes an element from the permanent pool, then from any live
    /// dynamic pool, and finally by creating a new dynamic pool. `None`
    /// means the class is exhausted; callers fall back to the generic heap.
    pub(crate) fn get_slice(&self) -> Option<Slice> {
        if let Some(element) = self.permanent.get() {
            return Some(Slice {
                pool_id: PERMANENT_POOL,
                element,
            });
        }

        if let Some(slice) = self.dynamic.read().take_any() {
            return Some(slice);
        }

        let mut pools = self.dynamic.write();

        // Someone may have grown the class between the two locks.
        if let Some(slice) = pools.take_any() {
            return Some(slice);
        }

        let Some(slot) = pools.slots.iter().position(Option::is_none) else {
            debug!(class = self.id, "all pools of the class are live and full");
            return None;
        };

        let pool_id = (slot + 1) as u8;
        let Some(capacity) = (pools.active + 1).checked_mul(self.init_capacity) else {
            error!(class = self.id, pool = pool_id, "dynamic pool capacity overflows");
            return None;
        };

        let pool = match SlabPool::create(pool_id, capacity, self.size, self.huge_pages) {
            Ok(pool) => pool,
            Err(err) => {
                error!(class = self.id, pool = pool_id, capacity, %err, "failed to grow class");
                return None;
            }
        };

        let element = pool.get();
        pools.slots[slot] = Some(pool);
        pools.active += 1;

        warn!(
            class = self.id,
            pool = pool_id,
            capacity,
            active = pools.active,
            size = self.size,
            "increased pools"
        );

        element.map(|element| Slice { pool_id, element })
    }

    /// Returns `element` to pool `pool_id`.
    ///
    /// A pool id outside this class, or naming a slot with no live pool,
    /// can only come from a damaged header and is reported as
    /// [`Error::Corruption`].
    pub(crate) fn put_slice(&self, pool_id: u8, element: NonNull<u8>) -> Result<()> {
        if pool_id == PERMANENT_POOL {
            return self.permanent.put(element);
        }

        let slot = pool_id as usize - 1;
        let pools = self.dynamic.read();

        let Some(pool) = pools.slots.get(slot) else {
            return Err(Error::Corruption(format!(
                "pool id {pool_id} out of range for class {}, header overwritten?",
                self.id
            )));
        };
        let Some(pool) = pool.as_ref() else {
            return Err(Error::Corruption(format!(
                "pool {pool_id} of class {} is not live",
                self.id
            )));
        };

        pool.put(element)?;

        if !pools.should_reclaim(&self.permanent, slot) {
            return Ok(());
        }
        drop(pools);

        let mut pools = self.dynamic.write();

        // The pool may have been refilled, reclaimed or replaced while no
        // lock was held, so every condition is checked again.
        if !pools.should_reclaim(&self.permanent, slot) {
            return Ok(());
        }

        if let Some(pool) = pools.slots[slot].take() {
            pools.active -= 1;
            let capacity = pool.capacity();
            pool.destroy()?;

            warn!(
                class = self.id,
                pool = pool_id,
                capacity,
                active = pools.active,
                "decreased pools"
            );
        }

        Ok(())
    }

    #[inline]
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Element size, header included.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes available to the caller in each element.
    #[inline]
    pub fn usable_size(&self) -> usize {
        self.size - HEADER_SIZE
    }

    #[inline]
    pub fn init_capacity(&self) -> usize {
        self.init_capacity
    }

    /// Elements currently handed out across every pool of the class.
    pub fn live(&self) -> usize {
        self.permanent.used()
            + self
                .dynamic
                .read()
                .slots
                .iter()
                .flatten()
                .map(SlabPool::used)
                .sum::<usize>()
    }

    /// Number of live pools, the permanent one included.
    pub fn active_pools(&self) -> usize {
        self.dynamic.read().active
    }

    pub fn stats(&self) -> ClassStats {
        let snapshot = |pool: &SlabPool, permanent| {
            let (available, used) = pool.counts();
            PoolStats {
                id: pool.id(),
                capacity: pool.capacity(),
                available,
                used,
                permanent,
            }
        };

        let pools = self.dynamic.read();
        let mut stats = vec![snapshot(&self.permanent, true)];
        stats.extend(pools.slots.iter().flatten().map(|pool| snapshot(pool, false)));

        ClassStats {
            id: self.id,
            size: self.size,
            pools: stats,
        }
    }
}

impl fmt::Debug for SizeClassNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SizeClassNode")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("init_capacity", &self.init_capacity)
            .field("active_pools", &self.active_pools())
            .finish_non_exhaustive()
    }
}
