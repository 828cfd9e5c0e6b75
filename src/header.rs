use std::{mem, ptr::NonNull};

use crate::error::{Error, Result};

/// Size in bytes of the [`Header`] written in front of every block. User
/// pointers are the raw block address plus this many bytes.
pub const HEADER_SIZE: usize = mem::size_of::<Header>();

/// Node id recorded for blocks that came from the fallback allocator.
pub const FALLBACK_NODE: u8 = u8::MAX;

/// Pool id recorded for blocks that came from the fallback allocator.
pub const FALLBACK_POOL: u8 = u8::MAX;

const HEADER_MAGIC: u8 = 0xa5;

/// Metadata that precedes every block handed out, whatever its origin.
///
/// ```text
/// raw                                             raw + HEADER_SIZE
/// +---------+---------+--------------------+-------+-------------------+
/// | node id | pool id |   reserved (5b)    | magic |  user data  ...   |
/// +---------+---------+--------------------+-------+-------------------+
///                                                  ^ pointer returned
/// ```
///
/// `node id` and `pool id` locate the owning slab pool in O(1); for
/// fallback blocks both hold the sentinels [`FALLBACK_NODE`] and
/// [`FALLBACK_POOL`]. The magic byte sits right before the user data so a
/// small underrun is the first thing to clobber it.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Header {
    node_id: u8,
    pool_id: u8,
    reserved: [u8; 5],
    magic: u8,
}

/// Where a block came from, as recovered from its header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Origin {
    pub node_id: u8,
    pub pool_id: u8,
    /// Start of the block, i.e. of its header.
    pub raw: NonNull<u8>,
}

impl Origin {
    #[inline]
    pub fn is_fallback(&self) -> bool {
        self.node_id == FALLBACK_NODE
    }
}

/// Writes the header at the start of `raw` and returns the user pointer.
///
/// **SAFETY**: `raw` must be valid for writes of at least [`HEADER_SIZE`]
/// bytes.
#[inline]
pub(crate) unsafe fn pack(raw: NonNull<u8>, node_id: u8, pool_id: u8) -> NonNull<u8> {
    let header = Header {
        node_id,
        pool_id,
        reserved: [0; 5],
        magic: HEADER_MAGIC,
    };

    unsafe {
        raw.as_ptr().cast::<Header>().write_unaligned(header);
        raw.add(HEADER_SIZE)
    }
}

/// Reads back the header in front of `user`.
///
/// Fails with [`Error::Corruption`] when the magic byte is wrong, which
/// means the pointer was not produced by [`pack`] or its header was
/// overwritten since.
///
/// **SAFETY**: the [`HEADER_SIZE`] bytes before `user` must be readable.
#[inline]
pub(crate) unsafe fn unpack(user: NonNull<u8>) -> Result<Origin> {
    if (user.as_ptr() as usize) < HEADER_SIZE {
        return Err(Error::Corruption(format!("pointer {user:p} has no room for a header")));
    }

    let raw = unsafe { user.sub(HEADER_SIZE) };
    let header = unsafe { raw.as_ptr().cast::<Header>().read_unaligned() };

    if header.magic != HEADER_MAGIC {
        return Err(Error::Corruption(format!(
            "bad header magic {:#04x} in front of {user:p}",
            header.magic
        )));
    }

    Ok(Origin {
        node_id: header.node_id,
        pool_id: header.pool_id,
        raw,
    })
}

/// Wipes the magic byte so a stale copy of the user pointer no longer
/// passes [`unpack`].
///
/// **SAFETY**: `raw` must be valid for writes of [`HEADER_SIZE`] bytes.
#[inline]
pub(crate) unsafe fn clear(raw: NonNull<u8>) {
    unsafe { raw.as_ptr().add(HEADER_SIZE - 1).write(0) };
}
