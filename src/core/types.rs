//! Core data types shared across the pipeline.
//!
//! Pixel data is modeled on the `image` crate: a plane is a single-channel
//! 16-bit buffer (the acquisition bit depth), and an extracted stack is an
//! ordered list of named planes for one tile at one z index. Geometry and
//! spec types are plain serde-serializable structs so that a whole experiment
//! can be declared in JSON.

use image::{ImageBuffer, Luma};
use indexmap::{IndexMap, IndexSet};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A single 2-D image plane: one tile, one channel, one z index.
pub type Plane = ImageBuffer<Luma<u16>, Vec<u16>>;

/// A per-pixel cell label mask. Label 0 is background.
pub type LabelMask = ImageBuffer<Luma<u32>, Vec<u32>>;

/// A rectangular grid of tiles imaged together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    /// 0-based region index.
    pub region_index: usize,
    /// Tiles across.
    pub width: u32,
    /// Tiles down.
    pub height: u32,
}

impl Region {
    /// Total number of tiles in the region.
    pub fn tile_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// One acquired field of view within a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tile {
    /// 0-based region index.
    pub region: usize,
    /// 0-based grid row within the region.
    pub row: u32,
    /// 0-based grid column within the region.
    pub col: u32,
}

impl fmt::Display for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}({},{})", self.region, self.row, self.col)
    }
}

/// Pixel dimensions and overlap shared by every tile of an acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileGeometry {
    /// Tile width in pixels.
    pub tile_width: u32,
    /// Tile height in pixels.
    pub tile_height: u32,
    /// Horizontal overlap with the neighboring tile, in pixels.
    pub overlap_x: u32,
    /// Vertical overlap with the neighboring tile, in pixels.
    pub overlap_y: u32,
}

/// z-plane selection policy of an extract spec.
///
/// Serialized as the string `"all"`, the string `"best"`, or a bare integer
/// for a fixed plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZPolicy {
    /// Emit one stack per acquired z-plane.
    All,
    /// Emit a single stack at the best-focus plane.
    Best,
    /// Emit a single stack at a fixed plane.
    Fixed(usize),
}

impl Default for ZPolicy {
    fn default() -> Self {
        ZPolicy::Best
    }
}

impl Serialize for ZPolicy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ZPolicy::All => serializer.serialize_str("all"),
            ZPolicy::Best => serializer.serialize_str("best"),
            ZPolicy::Fixed(z) => serializer.serialize_u64(*z as u64),
        }
    }
}

impl<'de> Deserialize<'de> for ZPolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ZPolicyVisitor;

        impl<'de> Visitor<'de> for ZPolicyVisitor {
            type Value = ZPolicy;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("\"all\", \"best\", or a z-plane index")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<ZPolicy, E> {
                match v {
                    "all" => Ok(ZPolicy::All),
                    "best" => Ok(ZPolicy::Best),
                    other => Err(E::unknown_variant(other, &["all", "best"])),
                }
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<ZPolicy, E> {
                Ok(ZPolicy::Fixed(v as usize))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<ZPolicy, E> {
                if v < 0 {
                    return Err(E::custom("z-plane index must be non-negative"));
                }
                Ok(ZPolicy::Fixed(v as usize))
            }
        }

        deserializer.deserialize_any(ZPolicyVisitor)
    }
}

/// Named configuration selecting channels and z-planes to materialize
/// from a tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractSpec {
    /// Unique name, referenced by `extract` steps and montage specs.
    pub name: String,
    /// z-plane policy.
    #[serde(default)]
    pub z: ZPolicy,
    /// Ordered set of channel names to include.
    pub channels: IndexSet<String>,
}

/// RGBA display color.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Color {
    /// Red component.
    pub r: u8,
    /// Green component.
    pub g: u8,
    /// Blue component.
    pub b: u8,
    /// Alpha component.
    pub a: u8,
}

impl Color {
    /// Opaque white; the default channel display color.
    pub const WHITE: Color = Color {
        r: 255,
        g: 255,
        b: 255,
        a: 255,
    };
}

/// Intensity display window for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayRange {
    /// Intensity mapped to black.
    pub min: u16,
    /// Intensity mapped to full brightness.
    pub max: u16,
}

impl Default for DisplayRange {
    fn default() -> Self {
        DisplayRange {
            min: 0,
            max: u16::MAX,
        }
    }
}

/// Presentation parameters for a stitched montage.
///
/// Purely presentational: colors and ranges only affect rendering, never the
/// composited pixel data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MontageSpec {
    /// Unique name, referenced by `montage` steps.
    pub name: String,
    /// The extract spec whose output is stitched.
    pub extract_name: String,
    /// Display color per channel.
    #[serde(default)]
    pub channel_colors: IndexMap<String, Color>,
    /// Display intensity window per channel.
    #[serde(default)]
    pub channel_ranges: IndexMap<String, DisplayRange>,
    /// Color for point overlays drawn by downstream viewers.
    #[serde(default)]
    pub point_color: Option<Color>,
}

/// Which cytometry records survive into the output table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMode {
    /// One row per cell, taken from the best-focus z-plane.
    BestZPlane,
    /// Every record, one row per cell per z-plane.
    All,
}

/// Aggregation policy for the cytometry statistics step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationSpec {
    /// Record selection mode.
    pub mode: AggregationMode,
    /// Optional mode variant.
    #[serde(default)]
    pub variant: Option<String>,
}

impl Default for AggregationSpec {
    fn default() -> Self {
        AggregationSpec {
            mode: AggregationMode::BestZPlane,
            variant: None,
        }
    }
}

/// One named plane within an extracted stack.
#[derive(Debug, Clone)]
pub struct ChannelPlane {
    /// Logical channel name.
    pub name: String,
    /// Pixel data.
    pub plane: Plane,
}

/// An ordered stack of 2-D planes for one tile at one z index.
#[derive(Debug, Clone)]
pub struct ImageStack {
    /// The tile this stack was extracted from.
    pub tile: Tile,
    /// z-plane index the stack was taken at.
    pub z: usize,
    /// Planes in the order requested by the extract spec.
    pub channels: Vec<ChannelPlane>,
}

impl ImageStack {
    /// Look up a plane by channel name.
    pub fn channel(&self, name: &str) -> Option<&Plane> {
        self.channels
            .iter()
            .find(|c| c.name == name)
            .map(|c| &c.plane)
    }

    /// Pixel width, taken from the first plane.
    pub fn width(&self) -> u32 {
        self.channels.first().map(|c| c.plane.width()).unwrap_or(0)
    }

    /// Pixel height, taken from the first plane.
    pub fn height(&self) -> u32 {
        self.channels.first().map(|c| c.plane.height()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_z_policy_roundtrip() {
        let all: ZPolicy = serde_json::from_str("\"all\"").unwrap();
        assert_eq!(all, ZPolicy::All);

        let best: ZPolicy = serde_json::from_str("\"best\"").unwrap();
        assert_eq!(best, ZPolicy::Best);

        let fixed: ZPolicy = serde_json::from_str("3").unwrap();
        assert_eq!(fixed, ZPolicy::Fixed(3));

        assert_eq!(serde_json::to_string(&ZPolicy::All).unwrap(), "\"all\"");
        assert_eq!(serde_json::to_string(&ZPolicy::Fixed(2)).unwrap(), "2");
    }

    #[test]
    fn test_z_policy_rejects_unknown() {
        assert!(serde_json::from_str::<ZPolicy>("\"median\"").is_err());
        assert!(serde_json::from_str::<ZPolicy>("-1").is_err());
    }

    #[test]
    fn test_stack_channel_lookup() {
        let plane = Plane::from_pixel(4, 3, Luma([7u16]));
        let stack = ImageStack {
            tile: Tile {
                region: 0,
                row: 0,
                col: 0,
            },
            z: 0,
            channels: vec![ChannelPlane {
                name: "DAPI".into(),
                plane,
            }],
        };
        assert!(stack.channel("DAPI").is_some());
        assert!(stack.channel("CD4").is_none());
        assert_eq!(stack.width(), 4);
        assert_eq!(stack.height(), 3);
    }

    #[test]
    fn test_region_tile_count() {
        let region = Region {
            region_index: 0,
            width: 3,
            height: 3,
        };
        assert_eq!(region.tile_count(), 9);
    }
}
