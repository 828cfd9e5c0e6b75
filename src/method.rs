//! Pluggable allocation methods.
//!
//! A [`MemPool`](crate::MemPool) does not hard-code its engine: the
//! configuration names a method and the [`MethodRegistry`] maps that name
//! to a constructor. Only the size-class engine ships with the crate, under
//! [`SIZE_CLASS_METHOD`].

use std::{collections::HashMap, fmt, ptr::NonNull, sync::Arc};

use crate::{
    config::{Config, SIZE_CLASS_METHOD},
    engine::SizeClassEngine,
    error::{Error, Result},
    fallback::FallbackAllocator,
    stats::Stats,
};

/// One allocation strategy.
///
/// Size zero, null pointers and resize-to-zero are resolved by the caller
/// before a method is reached.
pub trait AllocMethod: Send + Sync + fmt::Debug {
    /// A block of at least `size` usable bytes, zero-filled if `zeroed`.
    fn allocate(&self, size: usize, zeroed: bool) -> Result<NonNull<u8>>;

    /// Grows or shrinks `block`, possibly moving it.
    ///
    /// # Safety
    ///
    /// `block` must have been returned by this method and not released.
    unsafe fn resize(&self, block: NonNull<u8>, size: usize) -> Result<NonNull<u8>>;

    /// # Safety
    ///
    /// `block` must have been returned by this method and not released.
    unsafe fn release(&self, block: NonNull<u8>) -> Result<()>;

    /// Tears the method down. Fails if any block is still live.
    fn destroy(self: Box<Self>) -> Result<()>;

    fn stats(&self) -> Stats;
}

/// Builds a method from a validated configuration.
pub type MethodCtor = fn(&Config, Arc<dyn FallbackAllocator>) -> Result<Box<dyn AllocMethod>>;

/// Method name -> constructor.
#[derive(Clone)]
pub struct MethodRegistry {
    methods: HashMap<String, MethodCtor>,
}

impl MethodRegistry {
    /// A registry with nothing registered.
    pub fn empty() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }

    /// Registers `ctor` under `name`. Names are unique.
    pub fn register(&mut self, name: impl Into<String>, ctor: MethodCtor) -> Result<()> {
        let name = name.into();
        if self.methods.contains_key(&name) {
            return Err(Error::Config(format!("method `{name}` already registered")));
        }

        self.methods.insert(name, ctor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<MethodCtor> {
        self.methods.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Registered names, in no particular order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// Validates `config` and builds the method it names.
    pub fn build(
        &self,
        config: &Config,
        fallback: Arc<dyn FallbackAllocator>,
    ) -> Result<Box<dyn AllocMethod>> {
        config.validate()?;

        let ctor = self
            .get(&config.method)
            .ok_or_else(|| Error::UnknownMethod(config.method.clone()))?;

        ctor(config, fallback)
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        let mut methods: HashMap<String, MethodCtor> = HashMap::new();
        methods.insert(SIZE_CLASS_METHOD.to_owned(), SizeClassEngine::boxed);
        Self { methods }
    }
}

impl fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("MethodRegistry").field("methods", &names).finish()
    }
}
