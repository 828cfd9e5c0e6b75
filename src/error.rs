//! Error types shared by every layer of the allocator.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The class table or one of the tuning knobs is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("unknown allocation method `{0}`")]
    UnknownMethod(String),

    #[error("allocation size must be non-zero")]
    ZeroSize,

    #[error("allocation size overflows: {0}")]
    SizeOverflow(String),

    /// The host could not supply memory (mapping or fallback failure).
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// A header or slot tag did not check out. The pointer was never handed
    /// out by this allocator, or the memory around it was overwritten.
    #[error("memory corruption detected: {0}")]
    Corruption(String),

    /// A pool or the whole allocator was torn down while blocks were live.
    #[error("{live} allocation(s) still outstanding")]
    OutstandingAllocations { live: usize },
}

impl Error {
    /// Fatal errors mean the allocator's bookkeeping can no longer be
    /// trusted for the block in question. They panic in strict mode.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Corruption(_) | Error::OutstandingAllocations { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
