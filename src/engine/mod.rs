//! Extraction and montage assembly engines.

pub mod extract;
pub mod montage;
