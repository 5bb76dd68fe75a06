//! Tile placement and acquisition-order computation.
//!
//! A [`TileIndex`] resolves the region grid into two independent things: a
//! placement offset in the shared canvas coordinate space for every
//! `(row, col)`, and a deterministic acquisition order. Placement is always
//! computed from the grid position directly, so it is invariant to the
//! traversal direction of the tiling mode.

use crate::core::error::{Axis, ConfigError, ConfigResult};
use crate::core::types::{Region, Tile, TileGeometry};
use serde::{Deserialize, Serialize};

/// Tile traversal order used during acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TilingMode {
    /// Rows top-to-bottom; column direction alternates per row.
    Snake,
    /// Rows top-to-bottom; columns always left-to-right.
    RowMajor,
}

impl Default for TilingMode {
    fn default() -> Self {
        TilingMode::Snake
    }
}

/// Per-region tile placement and ordering.
#[derive(Debug, Clone)]
pub struct TileIndex {
    region: Region,
    geometry: TileGeometry,
    mode: TilingMode,
}

impl TileIndex {
    /// Build a tile index, validating the geometry.
    ///
    /// Fails when an overlap is not smaller than the tile extent (degenerate
    /// or negative effective stride) or the region holds no tiles.
    pub fn new(region: Region, geometry: TileGeometry, mode: TilingMode) -> ConfigResult<Self> {
        if region.tile_count() == 0 {
            return Err(ConfigError::EmptyRegion {
                region: region.region_index,
                width: region.width,
                height: region.height,
            });
        }
        if geometry.overlap_x >= geometry.tile_width {
            return Err(ConfigError::DegenerateOverlap {
                axis: Axis::X,
                overlap: geometry.overlap_x,
                extent: geometry.tile_width,
            });
        }
        if geometry.overlap_y >= geometry.tile_height {
            return Err(ConfigError::DegenerateOverlap {
                axis: Axis::Y,
                overlap: geometry.overlap_y,
                extent: geometry.tile_height,
            });
        }
        Ok(TileIndex {
            region,
            geometry,
            mode,
        })
    }

    /// The region this index covers.
    pub fn region(&self) -> Region {
        self.region
    }

    /// The shared tile geometry.
    pub fn geometry(&self) -> TileGeometry {
        self.geometry
    }

    /// Number of tiles in the region.
    pub fn tile_count(&self) -> usize {
        self.region.tile_count()
    }

    /// Effective stride between adjacent tile origins, in pixels.
    pub fn stride(&self) -> (u32, u32) {
        (
            self.geometry.tile_width - self.geometry.overlap_x,
            self.geometry.tile_height - self.geometry.overlap_y,
        )
    }

    /// Canvas-space placement offset for a grid position.
    ///
    /// Independent of the tiling mode: `x = col * (tile_width - overlap_x)`,
    /// `y = row * (tile_height - overlap_y)`.
    pub fn placement(&self, row: u32, col: u32) -> (u32, u32) {
        let (sx, sy) = self.stride();
        (col * sx, row * sy)
    }

    /// Size of the composite canvas covering the whole region.
    pub fn canvas_size(&self) -> (u32, u32) {
        let g = self.geometry;
        let w = self.region.width * g.tile_width - (self.region.width - 1) * g.overlap_x;
        let h = self.region.height * g.tile_height - (self.region.height - 1) * g.overlap_y;
        (w, h)
    }

    /// Grid position `(col, row)` of the tile at a 0-based acquisition index.
    pub fn coordinates_from_index(&self, index: usize) -> ConfigResult<(u32, u32)> {
        if index >= self.tile_count() {
            return Err(ConfigError::TileIndexOutOfRange {
                index,
                count: self.tile_count(),
            });
        }
        let w = self.region.width as usize;
        let row = index / w;
        let col_offset = index % w;
        let col = match self.mode {
            TilingMode::RowMajor => col_offset,
            TilingMode::Snake => {
                if row % 2 == 0 {
                    col_offset
                } else {
                    w - 1 - col_offset
                }
            }
        };
        Ok((col as u32, row as u32))
    }

    /// 0-based acquisition index of a grid position.
    pub fn index_from_coordinates(&self, row: u32, col: u32) -> usize {
        let w = self.region.width as usize;
        let (row, col) = (row as usize, col as usize);
        let col_offset = match self.mode {
            TilingMode::RowMajor => col,
            TilingMode::Snake => {
                if row % 2 == 0 {
                    col
                } else {
                    w - 1 - col
                }
            }
        };
        row * w + col_offset
    }

    /// All tiles of the region in acquisition order.
    pub fn acquisition_order(&self) -> Vec<Tile> {
        (0..self.tile_count())
            .map(|i| {
                // index < tile_count, cannot fail
                let (col, row) = self.coordinates_from_index(i).unwrap();
                Tile {
                    region: self.region.region_index,
                    row,
                    col,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn index_3x3(mode: TilingMode) -> TileIndex {
        TileIndex::new(
            Region {
                region_index: 0,
                width: 3,
                height: 3,
            },
            TileGeometry {
                tile_width: 1344,
                tile_height: 1008,
                overlap_x: 576,
                overlap_y: 432,
            },
            mode,
        )
        .unwrap()
    }

    #[test]
    fn test_snake_order_3x3() {
        let index = index_3x3(TilingMode::Snake);
        let order: Vec<(u32, u32)> = index
            .acquisition_order()
            .iter()
            .map(|t| (t.row, t.col))
            .collect();
        assert_eq!(
            order,
            vec![
                (0, 0),
                (0, 1),
                (0, 2),
                (1, 2),
                (1, 1),
                (1, 0),
                (2, 0),
                (2, 1),
                (2, 2),
            ]
        );
    }

    #[test]
    fn test_row_major_order_3x3() {
        let index = index_3x3(TilingMode::RowMajor);
        let order: Vec<(u32, u32)> = index
            .acquisition_order()
            .iter()
            .map(|t| (t.row, t.col))
            .collect();
        assert_eq!(order[3], (1, 0));
        assert_eq!(order[5], (1, 2));
    }

    #[test]
    fn test_canvas_size_reference_scenario() {
        // 3x3 region, 1344x1008 tiles, 576/432 overlap
        let index = index_3x3(TilingMode::Snake);
        assert_eq!(index.canvas_size(), (2880, 2160));
    }

    #[test]
    fn test_placement_independent_of_mode() {
        let snake = index_3x3(TilingMode::Snake);
        let row_major = index_3x3(TilingMode::RowMajor);
        for row in 0..3 {
            for col in 0..3 {
                assert_eq!(snake.placement(row, col), row_major.placement(row, col));
            }
        }
        assert_eq!(snake.placement(1, 2), (2 * (1344 - 576), 1008 - 432));
    }

    #[test]
    fn test_index_coordinate_roundtrip() {
        let index = index_3x3(TilingMode::Snake);
        for i in 0..index.tile_count() {
            let (col, row) = index.coordinates_from_index(i).unwrap();
            assert_eq!(index.index_from_coordinates(row, col), i);
        }
    }

    #[test]
    fn test_out_of_range_index_rejected() {
        let index = index_3x3(TilingMode::Snake);
        assert!(matches!(
            index.coordinates_from_index(9),
            Err(ConfigError::TileIndexOutOfRange { index: 9, count: 9 })
        ));
    }

    #[test]
    fn test_degenerate_overlap_rejected() {
        let result = TileIndex::new(
            Region {
                region_index: 0,
                width: 2,
                height: 2,
            },
            TileGeometry {
                tile_width: 100,
                tile_height: 100,
                overlap_x: 100,
                overlap_y: 0,
            },
            TilingMode::Snake,
        );
        assert!(matches!(
            result,
            Err(ConfigError::DegenerateOverlap { axis: Axis::X, .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_canvas_size_formula(
            rw in 1u32..8,
            rh in 1u32..8,
            tw in 2u32..64,
            th in 2u32..64,
            ox_frac in 0u32..100,
            oy_frac in 0u32..100,
        ) {
            let ox = ox_frac * (tw - 1) / 100;
            let oy = oy_frac * (th - 1) / 100;
            let index = TileIndex::new(
                Region { region_index: 0, width: rw, height: rh },
                TileGeometry { tile_width: tw, tile_height: th, overlap_x: ox, overlap_y: oy },
                TilingMode::Snake,
            ).unwrap();
            let (w, h) = index.canvas_size();
            prop_assert_eq!(w, rw * tw - (rw - 1) * ox);
            prop_assert_eq!(h, rh * th - (rh - 1) * oy);
        }

        #[test]
        fn prop_acquisition_order_visits_every_tile_once(
            rw in 1u32..8,
            rh in 1u32..8,
        ) {
            let index = TileIndex::new(
                Region { region_index: 0, width: rw, height: rh },
                TileGeometry { tile_width: 10, tile_height: 10, overlap_x: 2, overlap_y: 2 },
                TilingMode::Snake,
            ).unwrap();
            let order = index.acquisition_order();
            prop_assert_eq!(order.len(), (rw * rh) as usize);
            let mut seen: Vec<(u32, u32)> = order.iter().map(|t| (t.row, t.col)).collect();
            seen.sort_unstable();
            seen.dedup();
            prop_assert_eq!(seen.len(), (rw * rh) as usize);
        }

        #[test]
        fn prop_adjacent_in_order_are_grid_neighbors(
            rw in 1u32..8,
            rh in 1u32..8,
        ) {
            let index = TileIndex::new(
                Region { region_index: 0, width: rw, height: rh },
                TileGeometry { tile_width: 10, tile_height: 10, overlap_x: 2, overlap_y: 2 },
                TilingMode::Snake,
            ).unwrap();
            let order = index.acquisition_order();
            for pair in order.windows(2) {
                let dr = pair[0].row.abs_diff(pair[1].row);
                let dc = pair[0].col.abs_diff(pair[1].col);
                prop_assert_eq!(dr + dc, 1);
            }
        }
    }
}
