//! Point-in-time usage snapshots.

/// Usage of one live slab pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub id: u8,
    pub capacity: usize,
    pub available: usize,
    pub used: usize,
    /// The permanent pool of a class is never reclaimed.
    pub permanent: bool,
}

/// Usage of one size class. `pools` lists only live pools, so an empty
/// dynamic slot simply has no entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassStats {
    pub id: u8,
    /// Element size, header included.
    pub size: usize,
    pub pools: Vec<PoolStats>,
}

impl ClassStats {
    pub fn pool(&self, id: u8) -> Option<&PoolStats> {
        self.pools.iter().find(|pool| pool.id == id)
    }

    pub fn available(&self) -> usize {
        self.pools.iter().map(|pool| pool.available).sum()
    }

    pub fn used(&self) -> usize {
        self.pools.iter().map(|pool| pool.used).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    /// One entry per class, ascending by size.
    pub classes: Vec<ClassStats>,
    /// Blocks currently held from the fallback allocator.
    pub fallback_live: usize,
}

impl Stats {
    /// The smallest class whose element can hold `size` user bytes plus
    /// the header.
    pub fn class_for(&self, size: usize) -> Option<&ClassStats> {
        let total = size.checked_add(crate::HEADER_SIZE)?;
        self.classes.iter().find(|class| class.size >= total)
    }

    /// Blocks live anywhere: in any pool or in the fallback allocator.
    pub fn live(&self) -> usize {
        self.classes.iter().map(ClassStats::used).sum::<usize>() + self.fallback_live
    }
}
