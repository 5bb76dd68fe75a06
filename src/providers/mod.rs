//! External collaborator interfaces.
//!
//! The pipeline never decodes instrument files or runs GPU kernels itself;
//! pixel data, derived channels, and focus scores come in through these
//! traits. In-memory implementations are provided for tests and the
//! demonstration CLI, plus an LRU caching wrapper that plays the role of the
//! tile prefetch buffer.

use crate::core::error::{PipelineError, PipelineResult};
use crate::core::types::{Plane, Tile};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;

/// Supplies raw and derived pixel planes.
///
/// Raw planes are addressed by physical acquisition coordinates; derived
/// planes (processed/segmentation overlays, deconvolved channels) by logical
/// name.
pub trait ImageProvider: Send + Sync {
    /// Pixel data for an acquired plane.
    fn acquired_plane(
        &self,
        tile: Tile,
        cycle: usize,
        slot: usize,
        z: usize,
    ) -> PipelineResult<Plane>;

    /// Pixel data for a derived channel, or `None` if the provider does not
    /// produce that channel.
    fn derived_plane(&self, tile: Tile, channel: &str, z: usize) -> PipelineResult<Option<Plane>>;
}

/// Supplies per-tile, per-cycle focus scores, one per z-plane.
pub trait FocusScoreProvider: Send + Sync {
    /// Focus scores indexed by z, or `None` when no scores exist for the
    /// tile/cycle.
    fn focus_scores(&self, tile: Tile, cycle: usize) -> Option<Vec<f32>>;
}

/// Select the best-focus z index: the plane maximizing the focus score, with
/// ties broken by the lowest z index.
pub fn select_best_z(scores: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (z, &score) in scores.iter().enumerate() {
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((z, score)),
        }
    }
    best.map(|(z, _)| z)
}

/// Map-backed image provider for tests and demonstrations.
#[derive(Debug, Default)]
pub struct InMemoryImageProvider {
    acquired: HashMap<(Tile, usize, usize, usize), Plane>,
    derived: HashMap<(Tile, String, usize), Plane>,
}

impl InMemoryImageProvider {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an acquired plane.
    pub fn insert_acquired(&mut self, tile: Tile, cycle: usize, slot: usize, z: usize, plane: Plane) {
        self.acquired.insert((tile, cycle, slot, z), plane);
    }

    /// Store a derived plane under a logical channel name.
    pub fn insert_derived(&mut self, tile: Tile, channel: &str, z: usize, plane: Plane) {
        self.derived.insert((tile, channel.to_string(), z), plane);
    }
}

impl ImageProvider for InMemoryImageProvider {
    fn acquired_plane(
        &self,
        tile: Tile,
        cycle: usize,
        slot: usize,
        z: usize,
    ) -> PipelineResult<Plane> {
        self.acquired
            .get(&(tile, cycle, slot, z))
            .cloned()
            .ok_or_else(|| {
                PipelineError::Other(format!(
                    "no acquired plane for tile {} cycle {} slot {} z {}",
                    tile, cycle, slot, z
                ))
            })
    }

    fn derived_plane(&self, tile: Tile, channel: &str, z: usize) -> PipelineResult<Option<Plane>> {
        Ok(self.derived.get(&(tile, channel.to_string(), z)).cloned())
    }
}

/// Map-backed focus score provider.
#[derive(Debug, Default)]
pub struct InMemoryFocusProvider {
    scores: HashMap<(Tile, usize), Vec<f32>>,
}

impl InMemoryFocusProvider {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store focus scores for a tile/cycle.
    pub fn insert(&mut self, tile: Tile, cycle: usize, scores: Vec<f32>) {
        self.scores.insert((tile, cycle), scores);
    }
}

impl FocusScoreProvider for InMemoryFocusProvider {
    fn focus_scores(&self, tile: Tile, cycle: usize) -> Option<Vec<f32>> {
        self.scores.get(&(tile, cycle)).cloned()
    }
}

/// LRU caching wrapper over an image provider.
///
/// Bounds the number of raw planes held in memory while extraction and
/// cytometry revisit the same tile across channels and specs.
pub struct CachingImageProvider<P> {
    inner: P,
    cache: Mutex<LruCache<(Tile, usize, usize, usize), Plane>>,
}

impl<P: ImageProvider> CachingImageProvider<P> {
    /// Wrap a provider with a cache holding up to `capacity` planes.
    pub fn new(inner: P, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        CachingImageProvider {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }
}

impl<P: ImageProvider> ImageProvider for CachingImageProvider<P> {
    fn acquired_plane(
        &self,
        tile: Tile,
        cycle: usize,
        slot: usize,
        z: usize,
    ) -> PipelineResult<Plane> {
        let key = (tile, cycle, slot, z);
        if let Some(plane) = self.cache.lock().get(&key) {
            return Ok(plane.clone());
        }
        let plane = self.inner.acquired_plane(tile, cycle, slot, z)?;
        self.cache.lock().put(key, plane.clone());
        Ok(plane)
    }

    fn derived_plane(&self, tile: Tile, channel: &str, z: usize) -> PipelineResult<Option<Plane>> {
        self.inner.derived_plane(tile, channel, z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn tile() -> Tile {
        Tile {
            region: 0,
            row: 0,
            col: 0,
        }
    }

    #[test]
    fn test_best_z_selection() {
        // Reference scenario: scores [0.2, 0.9, 0.4] select z=1
        assert_eq!(select_best_z(&[0.2, 0.9, 0.4]), Some(1));
        // Ties break to the lowest z
        assert_eq!(select_best_z(&[0.5, 0.5, 0.1]), Some(0));
        assert_eq!(select_best_z(&[]), None);
    }

    #[test]
    fn test_in_memory_provider_roundtrip() {
        let mut provider = InMemoryImageProvider::new();
        let plane = Plane::from_pixel(2, 2, Luma([9u16]));
        provider.insert_acquired(tile(), 0, 1, 2, plane.clone());

        let fetched = provider.acquired_plane(tile(), 0, 1, 2).unwrap();
        assert_eq!(fetched, plane);
        assert!(provider.acquired_plane(tile(), 1, 1, 2).is_err());
        assert!(provider.derived_plane(tile(), "mask", 0).unwrap().is_none());
    }

    #[test]
    fn test_caching_provider_hits() {
        let mut inner = InMemoryImageProvider::new();
        inner.insert_acquired(tile(), 0, 0, 0, Plane::from_pixel(2, 2, Luma([1u16])));
        let caching = CachingImageProvider::new(inner, 4);

        let first = caching.acquired_plane(tile(), 0, 0, 0).unwrap();
        let second = caching.acquired_plane(tile(), 0, 0, 0).unwrap();
        assert_eq!(first, second);
    }
}
