//! # Memory Configuration
//!
//! Arena and allocator sizing, loaded once at startup from TOML.
//!
//! ```toml
//! arena_size = 67108864     # 64MB backing store
//! alignment = 16
//! free_list_size = 33554432 # carved from the arena
//! ```
//!
//! Every field is optional and falls back to [`MemoryConfig::default`].

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, MemoryResult};
use crate::memory::{FreeListAllocator, MemoryArena};

/// Default arena size: 64MB.
pub const DEFAULT_ARENA_SIZE: usize = 64 * 1024 * 1024;
/// Default payload alignment.
pub const DEFAULT_ALIGNMENT: usize = 16;
/// Default free-list region size: 32MB.
pub const DEFAULT_FREE_LIST_SIZE: usize = 32 * 1024 * 1024;

/// Sizing of the memory core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryConfig {
    /// Bytes reserved for the backing arena.
    #[serde(default = "default_arena_size")]
    pub arena_size: usize,

    /// Alignment of the arena and of every payload.
    #[serde(default = "default_alignment")]
    pub alignment: usize,

    /// Bytes of the arena handed to the free-list allocator.
    #[serde(default = "default_free_list_size")]
    pub free_list_size: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            arena_size: DEFAULT_ARENA_SIZE,
            alignment: DEFAULT_ALIGNMENT,
            free_list_size: DEFAULT_FREE_LIST_SIZE,
        }
    }
}

fn default_arena_size() -> usize {
    DEFAULT_ARENA_SIZE
}

fn default_alignment() -> usize {
    DEFAULT_ALIGNMENT
}

fn default_free_list_size() -> usize {
    DEFAULT_FREE_LIST_SIZE
}

impl MemoryConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidConfig`] for malformed TOML or values
    /// rejected by [`Self::validate`].
    pub fn from_toml_str(source: &str) -> MemoryResult<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|e| MemoryError::InvalidConfig(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidConfig`] when the file cannot be read or
    /// its contents are invalid.
    pub fn from_toml_file(path: impl AsRef<Path>) -> MemoryResult<Self> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|e| {
            MemoryError::InvalidConfig(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&source)
    }

    /// Checks that the values can build a working arena and allocator.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidConfig`] describing the first bad value.
    pub fn validate(&self) -> MemoryResult<()> {
        if !self.alignment.is_power_of_two() || self.alignment < std::mem::size_of::<usize>() {
            return Err(MemoryError::InvalidConfig(format!(
                "alignment {} must be a power of two and at least {}",
                self.alignment,
                std::mem::size_of::<usize>()
            )));
        }
        if self.arena_size == 0 {
            return Err(MemoryError::InvalidConfig("arena_size must be non-zero".into()));
        }
        if self.free_list_size > self.arena_size {
            return Err(MemoryError::InvalidConfig(format!(
                "free_list_size {} exceeds arena_size {}",
                self.free_list_size, self.arena_size
            )));
        }
        Ok(())
    }

    /// Creates the backing arena.
    ///
    /// # Errors
    ///
    /// Propagates [`MemoryArena::new`] errors.
    pub fn create_arena(&self) -> MemoryResult<MemoryArena> {
        MemoryArena::new(self.arena_size, self.alignment)
    }

    /// Carves the free-list region out of `arena`.
    ///
    /// # Errors
    ///
    /// Propagates [`FreeListAllocator::init`] errors.
    pub fn create_free_list<'a>(&self, arena: &'a MemoryArena) -> MemoryResult<FreeListAllocator<'a>> {
        FreeListAllocator::init(arena, self.free_list_size, self.alignment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = MemoryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(MemoryConfig::from_toml_str("").unwrap(), config);
    }

    #[test]
    fn test_partial_override() {
        let config = MemoryConfig::from_toml_str("alignment = 32\nfree_list_size = 4096").unwrap();
        assert_eq!(config.alignment, 32);
        assert_eq!(config.free_list_size, 4096);
        assert_eq!(config.arena_size, DEFAULT_ARENA_SIZE);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            MemoryConfig::from_toml_str("alignment = 24"),
            Err(MemoryError::InvalidConfig(_))
        ));
        assert!(matches!(
            MemoryConfig::from_toml_str("arena_size = 1024\nfree_list_size = 2048"),
            Err(MemoryError::InvalidConfig(_))
        ));
        assert!(matches!(
            MemoryConfig::from_toml_str("arena_sise = 1024"),
            Err(MemoryError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_builds_allocator() {
        let config = MemoryConfig::from_toml_str(
            "arena_size = 65536\nalignment = 16\nfree_list_size = 32768",
        )
        .unwrap();
        let arena = config.create_arena().unwrap();
        let mut heap = config.create_free_list(&arena).unwrap();

        assert_eq!(heap.capacity(), 32768);
        assert!(heap.try_allocate(128).is_ok());
        assert_eq!(heap.used(), 128);
        heap.validate().unwrap();
    }

    #[test]
    fn test_missing_file() {
        let err = MemoryConfig::from_toml_file("/nonexistent/vultr_memory.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read"));
    }
}
