//! Acquisition geometry: tile placement and channel resolution.

pub mod channels;
pub mod tiling;
