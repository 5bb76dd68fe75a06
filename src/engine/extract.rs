//! Per-tile channel/z-plane extraction.
//!
//! The extraction engine materializes an [`ExtractSpec`] for one tile: it
//! resolves each requested channel to a physical slot, picks z-planes
//! according to the spec's policy, and pulls pixel data from the external
//! image provider. Channels that do not resolve to a raw acquisition slot are
//! looked up as derived planes (segmentation overlays, deconvolved channels)
//! before being rejected. The engine performs no disk I/O.

use crate::core::error::{ChannelError, ConfigError, PipelineError, PipelineResult, TileError, TileResult};
use crate::core::types::{ChannelPlane, ExtractSpec, ImageStack, Tile, TileGeometry, ZPolicy};
use crate::geometry::channels::ChannelResolver;
use crate::providers::{select_best_z, FocusScoreProvider, ImageProvider};

/// Extracts image stacks for single tiles.
pub struct ExtractionEngine<'a> {
    resolver: &'a ChannelResolver,
    images: &'a dyn ImageProvider,
    focus: &'a dyn FocusScoreProvider,
    geometry: TileGeometry,
    num_z: usize,
    best_focus_cycle: usize,
}

impl<'a> ExtractionEngine<'a> {
    /// Create an engine over the given collaborators.
    pub fn new(
        resolver: &'a ChannelResolver,
        images: &'a dyn ImageProvider,
        focus: &'a dyn FocusScoreProvider,
        geometry: TileGeometry,
        num_z: usize,
        best_focus_cycle: usize,
    ) -> Self {
        ExtractionEngine {
            resolver,
            images,
            focus,
            geometry,
            num_z,
            best_focus_cycle,
        }
    }

    /// Best-focus z index for a tile/cycle: the plane maximizing the focus
    /// score, ties broken by the lowest z.
    pub fn best_z(&self, tile: Tile, cycle: usize) -> TileResult<usize> {
        let scores = self
            .focus
            .focus_scores(tile, cycle)
            .ok_or(TileError::MissingFocus { tile, cycle })?;
        select_best_z(&scores).ok_or(TileError::MissingFocus { tile, cycle })
    }

    /// Materialize an extract spec for one tile.
    ///
    /// Returns one stack per z-plane for `z: all`, and exactly one stack for
    /// `z: best` or a fixed plane. With `z: best`, each raw channel is pulled
    /// from its own cycle's best-focus plane; the stack is labeled with the
    /// best-focus reference cycle's selection.
    pub fn extract(&self, spec: &ExtractSpec, tile: Tile) -> PipelineResult<Vec<ImageStack>> {
        match spec.z {
            ZPolicy::All => (0..self.num_z)
                .map(|z| self.build_stack(spec, tile, z, |_| Ok(z)))
                .collect(),
            ZPolicy::Fixed(z) => {
                if z >= self.num_z {
                    return Err(ConfigError::ZPlaneOutOfRange {
                        z,
                        num_z: self.num_z,
                    }
                    .into());
                }
                Ok(vec![self.build_stack(spec, tile, z, |_| Ok(z))?])
            }
            ZPolicy::Best => {
                let label_z = self.best_z(tile, self.best_focus_cycle)?;
                Ok(vec![self.build_stack(spec, tile, label_z, |cycle| {
                    self.best_z(tile, cycle)
                })?])
            }
        }
    }

    fn build_stack<F>(
        &self,
        spec: &ExtractSpec,
        tile: Tile,
        label_z: usize,
        channel_z: F,
    ) -> PipelineResult<ImageStack>
    where
        F: Fn(usize) -> TileResult<usize>,
    {
        let mut channels = Vec::with_capacity(spec.channels.len());
        for name in &spec.channels {
            let plane = match self.resolver.resolve(name) {
                Ok(addr) => {
                    let z = channel_z(addr.cycle)?;
                    self.images.acquired_plane(tile, addr.cycle, addr.slot, z)?
                }
                Err(ChannelError::UnknownChannel { .. }) => self
                    .images
                    .derived_plane(tile, name, label_z)?
                    .ok_or_else(|| ChannelError::UnknownChannel {
                        name: name.clone(),
                        known: self.resolver.names().map(str::to_string).collect(),
                    })?,
                Err(other) => return Err(PipelineError::Channel(other)),
            };
            self.check_shape(tile, name, label_z, &plane)?;
            channels.push(ChannelPlane {
                name: name.clone(),
                plane,
            });
        }
        Ok(ImageStack {
            tile,
            z: label_z,
            channels,
        })
    }

    fn check_shape(
        &self,
        tile: Tile,
        channel: &str,
        z: usize,
        plane: &crate::core::types::Plane,
    ) -> TileResult<()> {
        if plane.width() != self.geometry.tile_width || plane.height() != self.geometry.tile_height
        {
            return Err(TileError::ShapeMismatch {
                tile,
                context: format!("channel '{}' z {}", channel, z),
                expected_w: self.geometry.tile_width,
                expected_h: self.geometry.tile_height,
                actual_w: plane.width(),
                actual_h: plane.height(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::AcquisitionConfig;
    use crate::core::types::Plane;
    use crate::geometry::tiling::TilingMode;
    use crate::providers::{InMemoryFocusProvider, InMemoryImageProvider};
    use image::Luma;
    use indexmap::{IndexMap, IndexSet};

    const W: u32 = 8;
    const H: u32 = 6;
    const NUM_Z: usize = 3;

    fn acquisition() -> AcquisitionConfig {
        AcquisitionConfig {
            region_width: 1,
            region_height: 1,
            tile_width: W,
            tile_height: H,
            overlap_x: 0,
            overlap_y: 0,
            tiling_mode: TilingMode::Snake,
            num_cycles: 1,
            num_z_planes: NUM_Z,
            per_cycle_channel_names: vec!["CH1".into(), "CH2".into()],
            channel_names: vec!["DAPI".into(), "CD4".into()],
            index_symlinks: IndexMap::new(),
            region_indexes: vec![1],
        }
    }

    fn tile() -> Tile {
        Tile {
            region: 0,
            row: 0,
            col: 0,
        }
    }

    fn providers() -> (InMemoryImageProvider, InMemoryFocusProvider) {
        let mut images = InMemoryImageProvider::new();
        for z in 0..NUM_Z {
            for slot in 0..2 {
                let value = (100 * (z + 1) + slot) as u16;
                images.insert_acquired(tile(), 0, slot, z, Plane::from_pixel(W, H, Luma([value])));
            }
        }
        let mut focus = InMemoryFocusProvider::new();
        focus.insert(tile(), 0, vec![0.2, 0.9, 0.4]);
        (images, focus)
    }

    fn spec(z: ZPolicy) -> ExtractSpec {
        let mut channels = IndexSet::new();
        channels.insert("DAPI".to_string());
        channels.insert("CD4".to_string());
        ExtractSpec {
            name: "test".into(),
            z,
            channels,
        }
    }

    #[test]
    fn test_z_all_multiplies_output() {
        let acq = acquisition();
        let resolver = ChannelResolver::new(&acq).unwrap();
        let (images, focus) = providers();
        let engine =
            ExtractionEngine::new(&resolver, &images, &focus, acq.tile_geometry(), NUM_Z, 0);

        let stacks = engine.extract(&spec(ZPolicy::All), tile()).unwrap();
        assert_eq!(stacks.len(), NUM_Z);
        for (z, stack) in stacks.iter().enumerate() {
            assert_eq!(stack.z, z);
            assert_eq!(stack.channels.len(), 2);
        }
    }

    #[test]
    fn test_z_best_selects_max_focus() {
        let acq = acquisition();
        let resolver = ChannelResolver::new(&acq).unwrap();
        let (images, focus) = providers();
        let engine =
            ExtractionEngine::new(&resolver, &images, &focus, acq.tile_geometry(), NUM_Z, 0);

        // Focus scores [0.2, 0.9, 0.4] select z=1
        let stacks = engine.extract(&spec(ZPolicy::Best), tile()).unwrap();
        assert_eq!(stacks.len(), 1);
        assert_eq!(stacks[0].z, 1);
        assert_eq!(stacks[0].channel("DAPI").unwrap().get_pixel(0, 0).0[0], 200);
    }

    #[test]
    fn test_z_best_without_scores_is_tile_scoped() {
        let acq = acquisition();
        let resolver = ChannelResolver::new(&acq).unwrap();
        let (images, _) = providers();
        let focus = InMemoryFocusProvider::new();
        let engine =
            ExtractionEngine::new(&resolver, &images, &focus, acq.tile_geometry(), NUM_Z, 0);

        let err = engine.extract(&spec(ZPolicy::Best), tile()).unwrap_err();
        assert!(err.is_tile_scoped());
    }

    #[test]
    fn test_fixed_z_out_of_range() {
        let acq = acquisition();
        let resolver = ChannelResolver::new(&acq).unwrap();
        let (images, focus) = providers();
        let engine =
            ExtractionEngine::new(&resolver, &images, &focus, acq.tile_geometry(), NUM_Z, 0);

        let err = engine.extract(&spec(ZPolicy::Fixed(7)), tile()).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Config(ConfigError::ZPlaneOutOfRange { z: 7, num_z: 3 })
        ));
    }

    #[test]
    fn test_derived_channel_lookup() {
        let acq = acquisition();
        let resolver = ChannelResolver::new(&acq).unwrap();
        let (mut images, focus) = providers();
        images.insert_derived(tile(), "cell_mask", 0, Plane::from_pixel(W, H, Luma([1u16])));
        let engine =
            ExtractionEngine::new(&resolver, &images, &focus, acq.tile_geometry(), NUM_Z, 0);

        let mut channels = IndexSet::new();
        channels.insert("cell_mask".to_string());
        let spec = ExtractSpec {
            name: "masks".into(),
            z: ZPolicy::Fixed(0),
            channels,
        };
        let stacks = engine.extract(&spec, tile()).unwrap();
        assert_eq!(stacks[0].channels[0].name, "cell_mask");
    }

    #[test]
    fn test_unknown_channel_is_fatal() {
        let acq = acquisition();
        let resolver = ChannelResolver::new(&acq).unwrap();
        let (images, focus) = providers();
        let engine =
            ExtractionEngine::new(&resolver, &images, &focus, acq.tile_geometry(), NUM_Z, 0);

        let mut channels = IndexSet::new();
        channels.insert("GFAP".to_string());
        let spec = ExtractSpec {
            name: "bad".into(),
            z: ZPolicy::Fixed(0),
            channels,
        };
        let err = engine.extract(&spec, tile()).unwrap_err();
        assert!(!err.is_tile_scoped());
        assert!(matches!(err, PipelineError::Channel(_)));
    }

    #[test]
    fn test_shape_mismatch_detected() {
        let acq = acquisition();
        let resolver = ChannelResolver::new(&acq).unwrap();
        let mut images = InMemoryImageProvider::new();
        // Wrong dimensions on purpose
        images.insert_acquired(tile(), 0, 0, 0, Plane::from_pixel(4, 4, Luma([1u16])));
        images.insert_acquired(tile(), 0, 1, 0, Plane::from_pixel(4, 4, Luma([1u16])));
        let focus = InMemoryFocusProvider::new();
        let engine =
            ExtractionEngine::new(&resolver, &images, &focus, acq.tile_geometry(), NUM_Z, 0);

        let err = engine.extract(&spec(ZPolicy::Fixed(0)), tile()).unwrap_err();
        match err {
            PipelineError::Tile(TileError::ShapeMismatch {
                expected_w,
                actual_w,
                ..
            }) => {
                assert_eq!(expected_w, W);
                assert_eq!(actual_w, 4);
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
