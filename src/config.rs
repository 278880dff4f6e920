//! World sizing configuration.
//!
//! The only tunable that matters to the core is the chunk bit width: it fixes
//! the chunk capacity (`1 << chunk_bit`) and, by subtraction from the 30
//! usable id bits, the number of chunks a pool can ever allocate.

use crate::pool::IdSchema;

/// Preset pool sizes, by chunk bit width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Size {
    /// 1,024-slot chunks, up to 2^20 chunks.
    Small,
    /// 16,384-slot chunks, up to 65,536 chunks.
    Medium,
    /// 65,536-slot chunks, up to 16,384 chunks.
    Large,
}

impl Size {
    /// The chunk bit width for this preset.
    #[inline]
    pub fn chunk_bit(&self) -> u32 {
        match self {
            Size::Small => 10,
            Size::Medium => 14,
            Size::Large => 16,
        }
    }
}

/// Configuration for a [`World`](crate::World).
#[derive(Debug, Clone)]
pub struct WorldConfig {
    /// Name used as the logging subject for this world.
    pub name: String,

    /// Chunk bit width, clamped to [`IdSchema::MIN_CHUNK_BIT`]..=[`IdSchema::MAX_CHUNK_BIT`].
    pub chunk_bit: u32,
}

impl WorldConfig {
    /// Construct a config with the given name and a preset size.
    pub fn new(name: impl Into<String>, size: Size) -> Self {
        Self {
            name: name.into(),
            chunk_bit: size.chunk_bit(),
        }
    }
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self::new("world", Size::Medium)
    }
}

impl From<Size> for WorldConfig {
    fn from(size: Size) -> Self {
        Self::new("world", size)
    }
}

impl From<&WorldConfig> for IdSchema {
    fn from(config: &WorldConfig) -> Self {
        IdSchema::new(config.chunk_bit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_map_to_chunk_bits() {
        assert_eq!(Size::Small.chunk_bit(), 10);
        assert_eq!(Size::Medium.chunk_bit(), 14);
        assert_eq!(Size::Large.chunk_bit(), 16);
    }

    #[test]
    fn default_is_medium() {
        assert_eq!(WorldConfig::default().chunk_bit, 14);
    }
}
