//! Allocator configuration.
//!
//! A configuration is mostly the table of size classes the workload is
//! expected to need. It can be built in code or loaded from TOML:
//!
//! ```toml
//! method = "size_class"
//! max_pools_per_class = 4
//!
//! [[classes]]
//! size = 64
//! capacity = 1024
//!
//! [[classes]]
//! size = 256      # capacity omitted: default_capacity is used
//! ```

use std::collections::HashSet;

use serde::Deserialize;

use crate::{
    error::{Error, Result},
    header::{FALLBACK_NODE, FALLBACK_POOL, HEADER_SIZE},
};

/// Elements per pool when a class does not say.
pub const DEFAULT_CAPACITY: usize = 512;

/// Pools per class: one permanent plus three dynamic.
pub const DEFAULT_MAX_POOLS: usize = 4;

/// Above this many classes an exact-size hash table is consulted first.
pub const DEFAULT_EXACT_TABLE_THRESHOLD: usize = 128;

/// Past this many classes lookups stop being cheap; more are accepted but
/// the workload is probably not a good fit.
pub const EFFICIENT_CLASS_LIMIT: usize = 64;

/// Hard limit: node ids are one byte and [`FALLBACK_NODE`] is reserved.
pub const MAX_CLASSES: usize = FALLBACK_NODE as usize;

/// Hard limit: pool ids are one byte and [`FALLBACK_POOL`] is reserved.
pub const MAX_POOLS: usize = FALLBACK_POOL as usize;

/// Name of the built-in size-class method.
pub const SIZE_CLASS_METHOD: &str = "size_class";

/// One registered size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ClassSpec {
    /// Largest request, in bytes, this class serves.
    pub size: usize,
    /// Elements in the class's permanent pool; `0` means
    /// [`Config::default_capacity`].
    #[serde(default)]
    pub capacity: usize,
}

impl ClassSpec {
    pub const fn new(size: usize, capacity: usize) -> Self {
        Self { size, capacity }
    }
}

impl From<(usize, usize)> for ClassSpec {
    fn from((size, capacity): (usize, usize)) -> Self {
        Self { size, capacity }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub classes: Vec<ClassSpec>,
    /// Name of the allocation method to look up in the
    /// [`crate::MethodRegistry`].
    pub method: String,
    /// Pool slots per class, the first of which is permanent.
    pub max_pools_per_class: usize,
    pub exact_table_threshold: usize,
    pub default_capacity: usize,
    /// Ask for huge pages for pool regions of at least one huge page.
    pub huge_pages: bool,
    /// Panic on corruption and on teardown with live allocations instead
    /// of returning the error.
    pub strict: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            classes: Vec::new(),
            method: SIZE_CLASS_METHOD.to_owned(),
            max_pools_per_class: DEFAULT_MAX_POOLS,
            exact_table_threshold: DEFAULT_EXACT_TABLE_THRESHOLD,
            default_capacity: DEFAULT_CAPACITY,
            huge_pages: true,
            strict: false,
        }
    }
}

impl Config {
    /// Default configuration over the given class table.
    pub fn new<I>(classes: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<ClassSpec>,
    {
        Self {
            classes: classes.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_max_pools_per_class(mut self, max_pools: usize) -> Self {
        self.max_pools_per_class = max_pools;
        self
    }

    pub fn with_exact_table_threshold(mut self, threshold: usize) -> Self {
        self.exact_table_threshold = threshold;
        self
    }

    pub fn with_huge_pages(mut self, huge_pages: bool) -> Self {
        self.huge_pages = huge_pages;
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Capacity of a class's permanent pool once defaults are applied.
    pub fn capacity_of(&self, class: &ClassSpec) -> usize {
        match class.capacity {
            0 => self.default_capacity,
            capacity => capacity,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.classes.is_empty() {
            return Err(Error::Config("no size classes registered".into()));
        }
        if self.classes.len() > MAX_CLASSES {
            return Err(Error::Config(format!(
                "{} size classes registered, at most {MAX_CLASSES} are supported",
                self.classes.len()
            )));
        }
        if self.max_pools_per_class == 0 || self.max_pools_per_class > MAX_POOLS {
            return Err(Error::Config(format!(
                "max_pools_per_class must be between 1 and {MAX_POOLS}, got {}",
                self.max_pools_per_class
            )));
        }
        if self.default_capacity == 0 {
            return Err(Error::Config("default_capacity must be non-zero".into()));
        }

        let mut seen = HashSet::with_capacity(self.classes.len());
        for (position, class) in self.classes.iter().enumerate() {
            if class.size == 0 {
                return Err(Error::Config(format!("class {position} has a zero size")));
            }
            if class.size.checked_add(HEADER_SIZE).is_none() {
                return Err(Error::Config(format!(
                    "class {position} size {} is too large",
                    class.size
                )));
            }
            if !seen.insert(class.size) {
                return Err(Error::Config(format!(
                    "class {position} repeats size {}",
                    class.size
                )));
            }
        }

        Ok(())
    }
}
