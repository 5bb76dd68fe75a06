//! Morphology and intensity feature computation.
//!
//! Morphology comes from the label mask alone: pixel counts, boundary
//! lengths, and second-order moments. Intensity statistics are computed per
//! channel over the pixels of each label, restricted to the statistics the
//! configuration asks for; anything not requested is omitted from the result,
//! never defaulted.

use crate::core::config::{FeatureConfig, Statistic};
use crate::core::types::{LabelMask, Plane};
use crate::cytometry::{CellFeatures, IntensityStats, Segmentation};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::f64::consts::PI;

/// Shape features of one labeled cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Morphology {
    /// Pixel count.
    pub area: f64,
    /// Boundary pixel count (4-connectivity).
    pub perimeter: f64,
    /// Elongation in `[0, 1)` from second-order moments.
    pub eccentricity: f64,
    /// Diameter of the circle with the same area.
    pub equivalent_diameter: f64,
    /// Bounding box origin x.
    pub bbox_x: u32,
    /// Bounding box origin y.
    pub bbox_y: u32,
    /// Bounding box width.
    pub bbox_w: u32,
    /// Bounding box height.
    pub bbox_h: u32,
}

#[derive(Debug, Clone, Default)]
struct MomentAccumulator {
    count: u64,
    sum_x: f64,
    sum_y: f64,
    sum_xx: f64,
    sum_yy: f64,
    sum_xy: f64,
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
    perimeter: u64,
}

fn accumulate_moments(mask: &LabelMask) -> IndexMap<u32, MomentAccumulator> {
    let (w, h) = (mask.width(), mask.height());
    let mut acc: IndexMap<u32, MomentAccumulator> = IndexMap::new();

    for (x, y, pixel) in mask.enumerate_pixels() {
        let label = pixel.0[0];
        if label == 0 {
            continue;
        }
        let entry = acc.entry(label).or_insert_with(|| MomentAccumulator {
            min_x: x,
            min_y: y,
            max_x: x,
            max_y: y,
            ..Default::default()
        });
        entry.count += 1;
        entry.sum_x += f64::from(x);
        entry.sum_y += f64::from(y);
        entry.sum_xx += f64::from(x) * f64::from(x);
        entry.sum_yy += f64::from(y) * f64::from(y);
        entry.sum_xy += f64::from(x) * f64::from(y);
        entry.min_x = entry.min_x.min(x);
        entry.min_y = entry.min_y.min(y);
        entry.max_x = entry.max_x.max(x);
        entry.max_y = entry.max_y.max(y);

        // Boundary: any 4-neighbor with a different label, or the image edge.
        let boundary = x == 0
            || y == 0
            || x + 1 == w
            || y + 1 == h
            || mask.get_pixel(x - 1, y).0[0] != label
            || mask.get_pixel(x + 1, y).0[0] != label
            || mask.get_pixel(x, y - 1).0[0] != label
            || mask.get_pixel(x, y + 1).0[0] != label;
        if boundary {
            entry.perimeter += 1;
        }
    }

    acc.sort_keys();
    acc
}

/// Centroids of all labels in the mask, keyed by label, ascending.
pub fn centroids(mask: &LabelMask) -> IndexMap<u32, (f64, f64)> {
    accumulate_moments(mask)
        .into_iter()
        .map(|(label, acc)| {
            let n = acc.count as f64;
            (label, (acc.sum_x / n, acc.sum_y / n))
        })
        .collect()
}

/// Morphology features of all labels in the mask, keyed by label, ascending.
pub fn morphology(mask: &LabelMask) -> IndexMap<u32, Morphology> {
    accumulate_moments(mask)
        .into_iter()
        .map(|(label, acc)| {
            let n = acc.count as f64;
            let cx = acc.sum_x / n;
            let cy = acc.sum_y / n;
            // Central second-order moments
            let mu20 = acc.sum_xx / n - cx * cx;
            let mu02 = acc.sum_yy / n - cy * cy;
            let mu11 = acc.sum_xy / n - cx * cy;
            let common = (((mu20 - mu02) / 2.0).powi(2) + mu11 * mu11).sqrt();
            let lambda1 = (mu20 + mu02) / 2.0 + common;
            let lambda2 = (mu20 + mu02) / 2.0 - common;
            let eccentricity = if lambda1 > 0.0 {
                (1.0 - (lambda2 / lambda1).max(0.0)).sqrt()
            } else {
                0.0
            };
            (
                label,
                Morphology {
                    area: n,
                    perimeter: acc.perimeter as f64,
                    eccentricity,
                    equivalent_diameter: 2.0 * (n / PI).sqrt(),
                    bbox_x: acc.min_x,
                    bbox_y: acc.min_y,
                    bbox_w: acc.max_x - acc.min_x + 1,
                    bbox_h: acc.max_y - acc.min_y + 1,
                },
            )
        })
        .collect()
}

/// Intensity statistics for every label over one channel plane.
///
/// Only the requested statistics are computed and returned.
pub fn intensity_stats(
    mask: &LabelMask,
    plane: &Plane,
    stats: &[Statistic],
) -> IndexMap<u32, IndexMap<Statistic, f64>> {
    if stats.is_empty() {
        return IndexMap::new();
    }
    let need_values = stats.contains(&Statistic::Median);

    #[derive(Default)]
    struct Acc {
        count: u64,
        sum: f64,
        sum_sq: f64,
        min: f64,
        max: f64,
        values: Vec<u16>,
    }

    let mut per_label: HashMap<u32, Acc> = HashMap::new();
    for (pixel, label_pixel) in plane.pixels().zip(mask.pixels()) {
        let label = label_pixel.0[0];
        if label == 0 {
            continue;
        }
        let v = f64::from(pixel.0[0]);
        let acc = per_label.entry(label).or_insert_with(|| Acc {
            min: v,
            max: v,
            ..Default::default()
        });
        acc.count += 1;
        acc.sum += v;
        acc.sum_sq += v * v;
        acc.min = acc.min.min(v);
        acc.max = acc.max.max(v);
        if need_values {
            acc.values.push(pixel.0[0]);
        }
    }

    let mut result: IndexMap<u32, IndexMap<Statistic, f64>> = IndexMap::new();
    let mut labels: Vec<u32> = per_label.keys().copied().collect();
    labels.sort_unstable();
    for label in labels {
        let acc = per_label.get_mut(&label).unwrap();
        let n = acc.count as f64;
        let mean = acc.sum / n;
        let mut entry = IndexMap::new();
        for stat in stats {
            let value = match stat {
                Statistic::Mean => mean,
                Statistic::Sum => acc.sum,
                Statistic::Var => acc.sum_sq / n - mean * mean,
                Statistic::Min => acc.min,
                Statistic::Max => acc.max,
                Statistic::Median => {
                    acc.values.sort_unstable();
                    let mid = acc.values.len() / 2;
                    if acc.values.len() % 2 == 0 {
                        (f64::from(acc.values[mid - 1]) + f64::from(acc.values[mid])) / 2.0
                    } else {
                        f64::from(acc.values[mid])
                    }
                }
            };
            entry.insert(*stat, value);
        }
        result.insert(label, entry);
    }
    result
}

/// Quantify all cells in a segmentation against one image stack.
///
/// The shared implementation behind every built-in cytometer's `quantify`.
pub fn quantify(
    segmentation: &Segmentation,
    stack: &crate::core::types::ImageStack,
    features: &FeatureConfig,
) -> Vec<CellFeatures> {
    let cell_centroids = centroids(&segmentation.cells);
    let morph = if features.morphology {
        Some(morphology(&segmentation.cells))
    } else {
        None
    };

    // channel name -> label -> stats, gathered per mask target
    let mut cell_stats: IndexMap<String, IndexMap<u32, IndexMap<Statistic, f64>>> = IndexMap::new();
    let mut nucleus_stats: IndexMap<String, IndexMap<u32, IndexMap<Statistic, f64>>> =
        IndexMap::new();
    for channel in &stack.channels {
        if !features.cell_intensity.is_empty() {
            cell_stats.insert(
                channel.name.clone(),
                intensity_stats(&segmentation.cells, &channel.plane, &features.cell_intensity),
            );
        }
        if !features.nucleus_intensity.is_empty() {
            nucleus_stats.insert(
                channel.name.clone(),
                intensity_stats(
                    &segmentation.nuclei,
                    &channel.plane,
                    &features.nucleus_intensity,
                ),
            );
        }
    }

    cell_centroids
        .iter()
        .map(|(&label, &centroid)| {
            let pick = |source: &IndexMap<String, IndexMap<u32, IndexMap<Statistic, f64>>>| {
                let mut stats: IntensityStats = IndexMap::new();
                for (name, per_label) in source {
                    if let Some(entry) = per_label.get(&label) {
                        stats.insert(name.clone(), entry.clone());
                    }
                }
                stats
            };
            CellFeatures {
                cell_id: label,
                centroid,
                morphology: morph.as_ref().and_then(|m| m.get(&label).cloned()),
                cell_intensity: pick(&cell_stats),
                nucleus_intensity: pick(&nucleus_stats),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    /// 6x4 mask with two rectangles: label 1 (2x2) and label 2 (3x2).
    fn mask() -> LabelMask {
        let mut mask = LabelMask::from_pixel(6, 4, Luma([0u32]));
        for y in 0..2 {
            for x in 0..2 {
                mask.put_pixel(x, y, Luma([1u32]));
            }
        }
        for y in 2..4 {
            for x in 3..6 {
                mask.put_pixel(x, y, Luma([2u32]));
            }
        }
        mask
    }

    #[test]
    fn test_centroids() {
        let c = centroids(&mask());
        assert_eq!(c[&1], (0.5, 0.5));
        assert_eq!(c[&2], (4.0, 2.5));
    }

    #[test]
    fn test_morphology_area_and_bbox() {
        let m = morphology(&mask());
        assert_eq!(m[&1].area, 4.0);
        assert_eq!(m[&2].area, 6.0);
        assert_eq!((m[&2].bbox_x, m[&2].bbox_y), (3, 2));
        assert_eq!((m[&2].bbox_w, m[&2].bbox_h), (3, 2));
        // Every pixel of a 2x2 square is on the boundary.
        assert_eq!(m[&1].perimeter, 4.0);
    }

    #[test]
    fn test_eccentricity_ordering() {
        let mut elongated = LabelMask::from_pixel(10, 3, Luma([0u32]));
        for x in 0..10 {
            elongated.put_pixel(x, 1, Luma([1u32]));
        }
        let m_line = morphology(&elongated);
        let m_square = morphology(&mask());
        assert!(m_line[&1].eccentricity > 0.9);
        assert!(m_square[&1].eccentricity < 0.1);
    }

    #[test]
    fn test_intensity_stats_requested_only() {
        let mask = mask();
        let mut plane = Plane::from_pixel(6, 4, Luma([0u16]));
        // Label 1 pixels: 10, 20, 30, 40
        plane.put_pixel(0, 0, Luma([10]));
        plane.put_pixel(1, 0, Luma([20]));
        plane.put_pixel(0, 1, Luma([30]));
        plane.put_pixel(1, 1, Luma([40]));

        let stats = intensity_stats(
            &mask,
            &plane,
            &[Statistic::Mean, Statistic::Sum, Statistic::Var],
        );
        let cell = &stats[&1];
        assert_eq!(cell[&Statistic::Mean], 25.0);
        assert_eq!(cell[&Statistic::Sum], 100.0);
        assert_eq!(cell[&Statistic::Var], 125.0);
        assert!(!cell.contains_key(&Statistic::Max));
    }

    #[test]
    fn test_median() {
        let mask = mask();
        let mut plane = Plane::from_pixel(6, 4, Luma([0u16]));
        plane.put_pixel(0, 0, Luma([10]));
        plane.put_pixel(1, 0, Luma([20]));
        plane.put_pixel(0, 1, Luma([30]));
        plane.put_pixel(1, 1, Luma([400]));

        let stats = intensity_stats(&mask, &plane, &[Statistic::Median]);
        assert_eq!(stats[&1][&Statistic::Median], 25.0);
    }

    #[test]
    fn test_empty_stat_list_yields_nothing() {
        let stats = intensity_stats(&mask(), &Plane::from_pixel(6, 4, Luma([5u16])), &[]);
        assert!(stats.is_empty());
    }

    #[test]
    fn test_quantify_omits_disabled_targets() {
        use crate::core::types::{ChannelPlane, ImageStack, Tile};

        let seg = Segmentation {
            cells: mask(),
            nuclei: mask(),
        };
        let stack = ImageStack {
            tile: Tile {
                region: 0,
                row: 0,
                col: 0,
            },
            z: 0,
            channels: vec![ChannelPlane {
                name: "CD4".into(),
                plane: Plane::from_pixel(6, 4, Luma([100u16])),
            }],
        };
        let features = FeatureConfig {
            cell_intensity: vec![Statistic::Mean, Statistic::Sum, Statistic::Var],
            nucleus_intensity: Vec::new(),
            morphology: true,
            cell_graph: false,
            neighbor_distance: 10.0,
        };

        let cells = quantify(&seg, &stack, &features);
        assert_eq!(cells.len(), 2);
        let first = &cells[0];
        assert_eq!(first.cell_id, 1);
        assert!(first.cell_intensity["CD4"].contains_key(&Statistic::Mean));
        assert!(first.cell_intensity["CD4"].contains_key(&Statistic::Var));
        // nucleus_intensity disabled: no nucleus-level fields at all
        assert!(first.nucleus_intensity.is_empty());
        assert!(first.morphology.is_some());
    }
}
