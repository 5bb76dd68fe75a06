//! Logical channel name resolution.
//!
//! A [`ChannelResolver`] maps each logical channel name to the cycle and
//! physical slot it was acquired in, with index symlinks applied once at
//! build time, before any name lookup. Symlinks are strictly directional:
//! `{a: b}` makes the data stored at physical slot `a` readable under the
//! logical name bound to slot `b`, and implies nothing for the reverse
//! direction.

use crate::core::config::AcquisitionConfig;
use crate::core::error::{ChannelError, ConfigError, ConfigResult};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Physical address of a channel: the cycle it was acquired in and its slot
/// within that cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelAddress {
    /// 0-based cycle index.
    pub cycle: usize,
    /// 0-based physical slot within the cycle.
    pub slot: usize,
}

/// Resolves logical channel names to physical acquisition slots.
#[derive(Debug, Clone)]
pub struct ChannelResolver {
    /// Per cycle: logical name -> physical slot, aliases already applied.
    per_cycle: Vec<IndexMap<String, usize>>,
    channels_per_cycle: usize,
}

impl ChannelResolver {
    /// Build the resolver from acquisition metadata.
    ///
    /// The global `channel_names` list is split into cycles: name `i` belongs
    /// to cycle `i / channels_per_cycle` at slot `i % channels_per_cycle`.
    /// Index symlinks then rebind the affected names to their source slot.
    pub fn new(acquisition: &AcquisitionConfig) -> ConfigResult<Self> {
        let cpc = acquisition.channels_per_cycle();
        let expected = acquisition.num_cycles * cpc;
        if acquisition.channel_names.len() != expected {
            return Err(ConfigError::ChannelCountMismatch {
                expected,
                actual: acquisition.channel_names.len(),
            });
        }

        // Symlink {a: b}: the name bound to slot b reads slot a's data.
        let mut slot_override: IndexMap<usize, usize> = IndexMap::new();
        for (&a, &b) in &acquisition.index_symlinks {
            if a >= cpc || b >= cpc {
                return Err(ConfigError::SymlinkOutOfRange {
                    slot: a.max(b),
                    slots_per_cycle: cpc,
                });
            }
            slot_override.insert(b, a);
        }

        let mut per_cycle: Vec<IndexMap<String, usize>> =
            vec![IndexMap::new(); acquisition.num_cycles];
        for (i, name) in acquisition.channel_names.iter().enumerate() {
            let cycle = i / cpc;
            let slot = i % cpc;
            let resolved = slot_override.get(&slot).copied().unwrap_or(slot);
            per_cycle[cycle].insert(name.clone(), resolved);
        }

        Ok(ChannelResolver {
            per_cycle,
            channels_per_cycle: cpc,
        })
    }

    /// Number of physical slots per cycle.
    pub fn channels_per_cycle(&self) -> usize {
        self.channels_per_cycle
    }

    /// Number of cycles.
    pub fn num_cycles(&self) -> usize {
        self.per_cycle.len()
    }

    /// Resolve a logical name to its physical address, searching all cycles.
    pub fn resolve(&self, name: &str) -> Result<ChannelAddress, ChannelError> {
        for (cycle, names) in self.per_cycle.iter().enumerate() {
            if let Some(&slot) = names.get(name) {
                return Ok(ChannelAddress { cycle, slot });
            }
        }
        Err(ChannelError::UnknownChannel {
            name: name.to_string(),
            known: self.names().map(str::to_string).collect(),
        })
    }

    /// Resolve a logical name within one cycle.
    pub fn resolve_in_cycle(&self, cycle: usize, name: &str) -> Result<usize, ChannelError> {
        self.per_cycle
            .get(cycle)
            .and_then(|names| names.get(name).copied())
            .ok_or_else(|| ChannelError::UnknownChannelInCycle {
                name: name.to_string(),
                cycle,
            })
    }

    /// Logical names declared for one cycle, in slot order.
    pub fn cycle_names(&self, cycle: usize) -> impl Iterator<Item = &str> {
        self.per_cycle
            .get(cycle)
            .into_iter()
            .flat_map(|names| names.keys().map(String::as_str))
    }

    /// All logical names, in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.per_cycle
            .iter()
            .flat_map(|names| names.keys().map(String::as_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::tiling::TilingMode;
    use indexmap::IndexMap;

    fn acquisition(symlinks: IndexMap<usize, usize>) -> AcquisitionConfig {
        AcquisitionConfig {
            region_width: 1,
            region_height: 1,
            tile_width: 16,
            tile_height: 16,
            overlap_x: 0,
            overlap_y: 0,
            tiling_mode: TilingMode::Snake,
            num_cycles: 2,
            num_z_planes: 1,
            per_cycle_channel_names: (0..5).map(|i| format!("CH{}", i + 1)).collect(),
            channel_names: vec![
                "DAPI".into(),
                "Blank".into(),
                "CD3".into(),
                "CD4".into(),
                "CD8".into(),
                "DAPI2".into(),
                "CD20".into(),
                "CD45".into(),
                "CD68".into(),
                "Ki67".into(),
            ],
            index_symlinks: symlinks,
            region_indexes: vec![1],
        }
    }

    #[test]
    fn test_basic_resolution() {
        let resolver = ChannelResolver::new(&acquisition(IndexMap::new())).unwrap();
        assert_eq!(
            resolver.resolve("CD3").unwrap(),
            ChannelAddress { cycle: 0, slot: 2 }
        );
        assert_eq!(
            resolver.resolve("CD68").unwrap(),
            ChannelAddress { cycle: 1, slot: 3 }
        );
        assert_eq!(resolver.resolve_in_cycle(1, "Ki67").unwrap(), 4);
    }

    #[test]
    fn test_unknown_channel() {
        let resolver = ChannelResolver::new(&acquisition(IndexMap::new())).unwrap();
        let err = resolver.resolve("GFAP").unwrap_err();
        assert!(matches!(err, ChannelError::UnknownChannel { .. }));
    }

    #[test]
    fn test_symlink_is_directional() {
        // {3: 4}: data at slot 3 is readable under the names bound to slot 4.
        let mut symlinks = IndexMap::new();
        symlinks.insert(3usize, 4usize);
        let resolver = ChannelResolver::new(&acquisition(symlinks)).unwrap();

        // Names bound to slot 4 now read slot 3 in every cycle.
        assert_eq!(
            resolver.resolve("CD8").unwrap(),
            ChannelAddress { cycle: 0, slot: 3 }
        );
        assert_eq!(
            resolver.resolve("Ki67").unwrap(),
            ChannelAddress { cycle: 1, slot: 3 }
        );
        // The reverse is not implied: slot 3's own name still reads slot 3.
        assert_eq!(
            resolver.resolve("CD4").unwrap(),
            ChannelAddress { cycle: 0, slot: 3 }
        );
    }

    #[test]
    fn test_symlink_out_of_range() {
        let mut symlinks = IndexMap::new();
        symlinks.insert(3usize, 9usize);
        assert!(matches!(
            ChannelResolver::new(&acquisition(symlinks)),
            Err(ConfigError::SymlinkOutOfRange { .. })
        ));
    }
}
