use std::{mem, ptr::NonNull};

use tracing::{debug, error};

use crate::{
    error::{Error, Result},
    kernel::{self, HUGE_PAGE_SIZE},
    utils::checked_align,
};

/// One contiguous backing mapping owned by a [`crate::pool::SlabPool`].
///
/// The region is obtained from the kernel in a single request when the pool
/// is built and handed back in a single request when it is dropped. It is
/// never grown or shrunk in place: a size class that needs more room gets
/// an additional pool (and therefore an additional region).
///
/// ```text
/// start                                                    start + len
/// +-----------+-----------+-----------+- ... -+-----------+-----------+
/// |  slot 0   |  slot 1   |  slot 2   |       | slot n-1  |  padding  |
/// +-----------+-----------+-----------+- ... -+-----------+-----------+
/// ```
pub(crate) struct Region {
    /// Start of the mapping. Always page aligned.
    start: NonNull<u8>,
    /// Length of the mapping in bytes (a whole number of pages).
    len: usize,
    /// Whether the kernel accepted the huge page hint.
    huge: bool,
}

// SAFETY: the region is plain anonymous memory; synchronising access to its
// contents is the job of the pool that owns it.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Maps a region of at least `size` bytes.
    ///
    /// When `huge_pages` is set and the region spans at least one huge page,
    /// huge pages are requested first and regular pages are used if the
    /// kernel refuses.
    pub(crate) fn map(size: usize, huge_pages: bool) -> Result<Self> {
        let too_large = || Error::OutOfMemory(format!("region of {size} bytes is too large"));

        if huge_pages && size >= HUGE_PAGE_SIZE {
            let len = checked_align(size, HUGE_PAGE_SIZE).ok_or_else(too_large)?;
            if let Some(start) = kernel::request_memory(len, true) {
                debug!(len, "mapped region on huge pages");
                return Ok(Self { start, len, huge: true });
            }
            debug!(len, "huge pages unavailable, using regular pages");
        }

        let len = checked_align(size.max(1), kernel::page_size()).ok_or_else(too_large)?;
        match kernel::request_memory(len, false) {
            Some(start) => Ok(Self { start, len, huge: false }),
            None => {
                error!(len, "failed to map pool region");
                Err(Error::OutOfMemory(format!("failed to map {len} bytes")))
            }
        }
    }

    #[inline]
    pub(crate) fn start(&self) -> NonNull<u8> {
        self.start
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn is_huge(&self) -> bool {
        self.huge
    }

    /// Tells whether `addr` falls inside the mapping.
    #[inline]
    pub(crate) fn contains(&self, addr: usize) -> bool {
        let start = self.start.as_ptr() as usize;
        addr >= start && addr - start < self.len
    }

    /// Gives the mapping up without returning it to the kernel. Used when a
    /// pool is dropped while some of its slots are still handed out, so
    /// those pointers never dangle.
    pub(crate) fn leak(self) {
        mem::forget(self);
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: `start`/`len` are exactly what `request_memory` gave us and
        // the region is only dropped once.
        unsafe { kernel::return_memory(self.start, self.len) };
    }
}
