//! Reorders a folder of photos so visually similar shots sit together.
//!
//! Images are embedded, compared by cosine distance, grouped with
//! agglomerative clustering and written back out as an ordered manifest.

pub mod bridge;
pub mod config;
pub mod core;

pub use config::{DEFAULTS, Device, Linkage, ParamError, PipelineParams, Pooling, Preprocess};
