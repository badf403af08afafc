pub mod clustering;
pub mod discovery;
pub mod embedding;
pub mod manifest;
pub mod ordering;
pub mod pipeline;
pub mod similarity;

pub use clustering::{ClusterResult, cluster};
pub use embedding::{Embedder, Embeddings, ThumbnailEmbedder};
pub use ordering::{OrderedPhoto, build_sequence};
pub use pipeline::{Pipeline, PipelineError, PipelineOutcome, PipelineStep, StepInfo, spawn_pipeline};
pub use similarity::{compute_distance, compute_similarity};
