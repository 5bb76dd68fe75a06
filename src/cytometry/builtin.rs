//! Built-in cytometer implementations.
//!
//! `threshold` segments nuclei by Otsu thresholding the nuclei channel and
//! labeling connected components; cells equal nuclei. `spheroid` grows each
//! nucleus outward by a bounded expansion to approximate whole-cell extents
//! in dense spheroid cultures, optionally constrained to membrane-positive
//! pixels.

use crate::core::config::FeatureConfig;
use crate::core::error::{ConfigError, ConfigResult, PipelineError, PipelineResult};
use crate::core::types::{ImageStack, LabelMask, Plane};
use crate::cytometry::registry::CytometerRegistry;
use crate::cytometry::{features, CellFeatures, Cytometer, Segmentation};
use image::{GrayImage, Luma};
use imageproc::region_labelling::{connected_components, Connectivity};
use serde::Deserialize;
use std::collections::HashMap;

/// Register the built-in cytometers.
pub fn register_all(registry: &mut CytometerRegistry) {
    registry.register("threshold", |params| {
        Ok(Box::new(ThresholdCytometer::from_params(params)?) as Box<dyn Cytometer>)
    });
    registry.register("spheroid", |params| {
        Ok(Box::new(SpheroidCytometer::from_params(params)?) as Box<dyn Cytometer>)
    });
}

fn parse_params<'de, T: Deserialize<'de> + Default>(
    name: &str,
    params: &'de serde_json::Value,
) -> ConfigResult<T> {
    if params.is_null() {
        return Ok(T::default());
    }
    T::deserialize(params).map_err(|e| ConfigError::InvalidCytometerParams {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

/// Rescale a 16-bit plane into 8 bits for thresholding.
fn to_gray8(plane: &Plane) -> GrayImage {
    let max = plane.pixels().map(|p| p.0[0]).max().unwrap_or(0);
    if max == 0 {
        return GrayImage::new(plane.width(), plane.height());
    }
    GrayImage::from_fn(plane.width(), plane.height(), |x, y| {
        let v = plane.get_pixel(x, y).0[0] as u32;
        Luma([(v * 255 / max as u32) as u8])
    })
}

/// Otsu-threshold a plane and label connected foreground components.
fn label_foreground(plane: &Plane, min_area: u32) -> LabelMask {
    let gray = to_gray8(plane);
    let level = imageproc::contrast::otsu_level(&gray);
    let binary = GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        if gray.get_pixel(x, y).0[0] > level {
            Luma([255u8])
        } else {
            Luma([0u8])
        }
    });
    let mut labels = connected_components(&binary, Connectivity::Eight, Luma([0u8]));

    if min_area > 1 {
        let mut areas: HashMap<u32, u32> = HashMap::new();
        for pixel in labels.pixels() {
            if pixel.0[0] != 0 {
                *areas.entry(pixel.0[0]).or_insert(0) += 1;
            }
        }
        for pixel in labels.pixels_mut() {
            let label = pixel.0[0];
            if label != 0 && areas[&label] < min_area {
                pixel.0[0] = 0;
            }
        }
    }
    labels
}

/// Otsu foreground of a plane as a boolean mask.
fn foreground_mask(plane: &Plane) -> Vec<bool> {
    let gray = to_gray8(plane);
    let level = imageproc::contrast::otsu_level(&gray);
    gray.pixels().map(|p| p.0[0] > level).collect()
}

/// Grow labels outward into unlabeled pixels.
///
/// Each iteration claims background pixels 4-adjacent to a labeled pixel;
/// when several labels compete the lowest wins, keeping the result
/// deterministic. `allowed`, when present, restricts which pixels may be
/// claimed.
fn expand_labels(mask: &LabelMask, iterations: u32, allowed: Option<&[bool]>) -> LabelMask {
    let (w, h) = (mask.width(), mask.height());
    let mut current = mask.clone();
    for _ in 0..iterations {
        let mut next = current.clone();
        for y in 0..h {
            for x in 0..w {
                if current.get_pixel(x, y).0[0] != 0 {
                    continue;
                }
                if let Some(allowed) = allowed {
                    if !allowed[(y * w + x) as usize] {
                        continue;
                    }
                }
                let mut claim = 0u32;
                let mut consider = |label: u32| {
                    if label != 0 && (claim == 0 || label < claim) {
                        claim = label;
                    }
                };
                if x > 0 {
                    consider(current.get_pixel(x - 1, y).0[0]);
                }
                if x + 1 < w {
                    consider(current.get_pixel(x + 1, y).0[0]);
                }
                if y > 0 {
                    consider(current.get_pixel(x, y - 1).0[0]);
                }
                if y + 1 < h {
                    consider(current.get_pixel(x, y + 1).0[0]);
                }
                if claim != 0 {
                    next.put_pixel(x, y, Luma([claim]));
                }
            }
        }
        current = next;
    }
    current
}

fn missing_channel(name: &str) -> PipelineError {
    PipelineError::Other(format!(
        "segmentation stack is missing channel '{}'",
        name
    ))
}

/// Parameters for [`ThresholdCytometer`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThresholdParams {
    /// Channel segmented for nuclei.
    pub nuclei_channel: String,
    /// Components smaller than this many pixels are discarded.
    pub min_area: u32,
}

impl Default for ThresholdParams {
    fn default() -> Self {
        ThresholdParams {
            nuclei_channel: "DAPI".to_string(),
            min_area: 4,
        }
    }
}

/// Otsu threshold + connected components; cells equal nuclei.
#[derive(Debug, Clone)]
pub struct ThresholdCytometer {
    params: ThresholdParams,
}

impl ThresholdCytometer {
    /// Build from constructor parameters.
    pub fn from_params(params: &serde_json::Value) -> ConfigResult<Self> {
        Ok(ThresholdCytometer {
            params: parse_params("threshold", params)?,
        })
    }
}

impl Cytometer for ThresholdCytometer {
    fn name(&self) -> &str {
        "threshold"
    }

    fn segmentation_channels(&self) -> Vec<String> {
        vec![self.params.nuclei_channel.clone()]
    }

    fn segment(&self, stack: &ImageStack) -> PipelineResult<Segmentation> {
        let plane = stack
            .channel(&self.params.nuclei_channel)
            .ok_or_else(|| missing_channel(&self.params.nuclei_channel))?;
        let nuclei = label_foreground(plane, self.params.min_area);
        Ok(Segmentation {
            cells: nuclei.clone(),
            nuclei,
        })
    }

    fn quantify(
        &self,
        segmentation: &Segmentation,
        stack: &ImageStack,
        config: &FeatureConfig,
    ) -> PipelineResult<Vec<CellFeatures>> {
        Ok(features::quantify(segmentation, stack, config))
    }
}

/// Parameters for [`SpheroidCytometer`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpheroidParams {
    /// Channel segmented for nuclei.
    pub nuclei_channel: String,
    /// Optional membrane channel bounding cell expansion.
    pub membrane_channel: Option<String>,
    /// Components smaller than this many pixels are discarded.
    pub min_area: u32,
    /// Number of expansion steps growing nuclei into cell extents.
    pub expansion: u32,
}

impl Default for SpheroidParams {
    fn default() -> Self {
        SpheroidParams {
            nuclei_channel: "DAPI".to_string(),
            membrane_channel: None,
            min_area: 4,
            expansion: 3,
        }
    }
}

/// Spheroid-specific cytometer: nuclei expanded into cell extents.
#[derive(Debug, Clone)]
pub struct SpheroidCytometer {
    params: SpheroidParams,
}

impl SpheroidCytometer {
    /// Build from constructor parameters.
    pub fn from_params(params: &serde_json::Value) -> ConfigResult<Self> {
        Ok(SpheroidCytometer {
            params: parse_params("spheroid", params)?,
        })
    }
}

impl Cytometer for SpheroidCytometer {
    fn name(&self) -> &str {
        "spheroid"
    }

    fn segmentation_channels(&self) -> Vec<String> {
        let mut channels = vec![self.params.nuclei_channel.clone()];
        if let Some(membrane) = &self.params.membrane_channel {
            channels.push(membrane.clone());
        }
        channels
    }

    fn segment(&self, stack: &ImageStack) -> PipelineResult<Segmentation> {
        let plane = stack
            .channel(&self.params.nuclei_channel)
            .ok_or_else(|| missing_channel(&self.params.nuclei_channel))?;
        let nuclei = label_foreground(plane, self.params.min_area);

        let allowed = match &self.params.membrane_channel {
            Some(name) => {
                let membrane = stack
                    .channel(name)
                    .ok_or_else(|| missing_channel(name))?;
                Some(foreground_mask(membrane))
            }
            None => None,
        };
        let cells = expand_labels(&nuclei, self.params.expansion, allowed.as_deref());
        Ok(Segmentation { cells, nuclei })
    }

    fn quantify(
        &self,
        segmentation: &Segmentation,
        stack: &ImageStack,
        config: &FeatureConfig,
    ) -> PipelineResult<Vec<CellFeatures>> {
        Ok(features::quantify(segmentation, stack, config))
    }
}
