use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{ParamError, PipelineParams};
use crate::core::clustering::cluster;
use crate::core::discovery::{DiscoveryError, discover_images};
use crate::core::embedding::{EmbedError, EmbedOptions, Embedder};
use crate::core::manifest::{
    ManifestError, ManifestParameters, manifest_path_for_input, write_manifest,
};
use crate::core::ordering::{OrderedPhoto, SequenceError, build_sequence};
use crate::core::similarity::{compute_distance, compute_similarity};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Params(#[from] ParamError),

    #[error("Input directory does not exist: {path}")]
    InputNotFound { path: String },

    #[error("No supported images found in {path}")]
    NoImages { path: String },

    #[error("Discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Embedding failed: {0}")]
    Embed(#[from] EmbedError),

    #[error("Ordering failed: {0}")]
    Sequence(#[from] SequenceError),

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Operation cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStep {
    Discover,
    Model,
    Embed,
    Similarity,
    Cluster,
    Output,
}

impl PipelineStep {
    pub const ALL: [PipelineStep; 6] = [
        PipelineStep::Discover,
        PipelineStep::Model,
        PipelineStep::Embed,
        PipelineStep::Similarity,
        PipelineStep::Cluster,
        PipelineStep::Output,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStep::Discover => "discover",
            PipelineStep::Model => "model",
            PipelineStep::Embed => "embed",
            PipelineStep::Similarity => "similarity",
            PipelineStep::Cluster => "cluster",
            PipelineStep::Output => "output",
        }
    }
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A progress report; `processed`/`total` are 0 when a step has no count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInfo {
    pub step: PipelineStep,
    pub detail: String,
    pub processed: usize,
    pub total: usize,
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub manifest_path: PathBuf,
    pub ordered: Vec<OrderedPhoto>,
    pub n_clusters: usize,
    /// Discovered images that could not be embedded.
    pub skipped: usize,
}

impl PipelineOutcome {
    pub fn total_ordered(&self) -> usize {
        self.ordered.len()
    }
}

/// Runs discovery, embedding, clustering and ordering for one folder.
pub struct Pipeline<E: Embedder> {
    params: PipelineParams,
    embedder: E,
    cancellation_token: Arc<AtomicBool>,
}

impl<E: Embedder> Pipeline<E> {
    pub fn new(params: PipelineParams, embedder: E) -> Self {
        Self {
            params,
            embedder,
            cancellation_token: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share an externally owned cancellation flag.
    pub fn with_cancellation(mut self, token: Arc<AtomicBool>) -> Self {
        self.cancellation_token = token;
        self
    }

    pub fn cancellation_token(&self) -> Arc<AtomicBool> {
        self.cancellation_token.clone()
    }

    pub fn cancel(&self) {
        self.cancellation_token.store(true, Ordering::Relaxed);
    }

    pub fn params(&self) -> &PipelineParams {
        &self.params
    }

    fn check_cancelled(&self) -> Result<(), PipelineError> {
        if self.cancellation_token.load(Ordering::Relaxed) {
            info!("Pipeline cancelled");
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }

    /// Run every step in order, reporting before and after each one.
    ///
    /// Cancellation is honoured between steps only.
    pub fn run(
        &self,
        on_progress: &mut dyn FnMut(StepInfo),
    ) -> Result<PipelineOutcome, PipelineError> {
        let params = &self.params;
        params.validate()?;

        let not_found = || PipelineError::InputNotFound {
            path: params.input_dir.to_string_lossy().to_string(),
        };
        if !params.input_dir.is_dir() {
            return Err(not_found());
        }
        let input_dir = fs::canonicalize(&params.input_dir).map_err(|_| not_found())?;
        self.check_cancelled()?;

        emit(on_progress, PipelineStep::Discover, "Scanning for images", 0, 0);
        let paths = timed("discovery", || discover_images(&input_dir))?;
        if paths.is_empty() {
            return Err(PipelineError::NoImages {
                path: input_dir.to_string_lossy().to_string(),
            });
        }
        let found = paths.len();
        emit(
            on_progress,
            PipelineStep::Discover,
            format!("Found {} images", found),
            found,
            found,
        );
        self.check_cancelled()?;

        let name = self.embedder.name().to_string();
        emit(
            on_progress,
            PipelineStep::Model,
            format!("Loading {} embedder", name),
            0,
            1,
        );
        let device = self.embedder.resolve_device(params.device)?;
        info!("Using {} embedder on {}", name, device);
        emit(
            on_progress,
            PipelineStep::Model,
            format!("{} ready on {}", name, device),
            1,
            1,
        );
        self.check_cancelled()?;

        emit(
            on_progress,
            PipelineStep::Embed,
            "Extracting embeddings",
            0,
            found,
        );
        let options = EmbedOptions {
            batch_size: params.batch_size,
            pooling: params.pooling,
            preprocess: params.preprocess,
        };
        let embeddings = timed("embedding extraction", || {
            self.embedder
                .extract(&paths, &options, &mut |processed, total| {
                    emit(
                        on_progress,
                        PipelineStep::Embed,
                        format!("Embedded {}/{}", processed, total),
                        processed,
                        total,
                    )
                })
        })?;

        let skipped = found - embeddings.valid_indices.len();
        if skipped > 0 {
            warn!("Skipped {} of {} images that failed to load", skipped, found);
        }
        let valid_paths: Vec<PathBuf> = embeddings
            .valid_indices
            .iter()
            .map(|&idx| paths[idx].clone())
            .collect();
        emit(
            on_progress,
            PipelineStep::Embed,
            format!("Embedded {} images ({} skipped)", valid_paths.len(), skipped),
            found,
            found,
        );
        self.check_cancelled()?;

        emit(
            on_progress,
            PipelineStep::Similarity,
            "Computing similarity matrix",
            0,
            0,
        );
        let distance = timed("similarity", || {
            let similarity = compute_similarity(embeddings.matrix.view());
            compute_distance(similarity.view(), params.temporal_weight)
        });
        emit(
            on_progress,
            PipelineStep::Similarity,
            format!("{0}x{0} distance matrix ready", distance.nrows()),
            0,
            0,
        );
        self.check_cancelled()?;

        emit(
            on_progress,
            PipelineStep::Cluster,
            format!("Clustering with {} linkage", params.linkage),
            0,
            0,
        );
        let clusters = timed("clustering", || {
            cluster(distance.view(), params.distance_threshold, params.linkage)
        });
        info!(
            "Grouped {} photos into {} clusters",
            valid_paths.len(),
            clusters.n_clusters
        );
        emit(
            on_progress,
            PipelineStep::Cluster,
            format!("Found {} clusters", clusters.n_clusters),
            0,
            0,
        );
        self.check_cancelled()?;

        emit(on_progress, PipelineStep::Output, "Writing manifest", 0, 0);
        let ordered = build_sequence(
            &valid_paths,
            &clusters.labels,
            Some(&embeddings.valid_indices),
        )?;
        let manifest_path = manifest_path_for_input(&input_dir);
        let recorded = ManifestParameters {
            distance_threshold: Some(params.distance_threshold),
            temporal_weight: Some(params.temporal_weight),
            linkage: Some(params.linkage),
            pooling: Some(params.pooling),
            batch_size: Some(params.batch_size),
            device: Some(device),
        };
        write_manifest(&ordered, &manifest_path, &input_dir, recorded)?;
        emit(
            on_progress,
            PipelineStep::Output,
            format!("Manifest written to {}", manifest_path.display()),
            ordered.len(),
            ordered.len(),
        );

        Ok(PipelineOutcome {
            manifest_path,
            ordered,
            n_clusters: clusters.n_clusters,
            skipped,
        })
    }
}

fn emit(
    on_progress: &mut dyn FnMut(StepInfo),
    step: PipelineStep,
    detail: impl Into<String>,
    processed: usize,
    total: usize,
) {
    let detail = detail.into();
    debug!("[{}] {}", step, detail);
    on_progress(StepInfo {
        step,
        detail,
        processed,
        total,
    });
}

fn timed<T, F: FnOnce() -> T>(label: &str, f: F) -> T {
    let start = Instant::now();
    let result = f();
    debug!("⏱ {} took {:.2?}", label, start.elapsed());
    result
}

/// Run `pipeline` on a blocking worker, streaming its progress.
///
/// The receiver closes once the run finishes.
pub fn spawn_pipeline<E: Embedder + 'static>(
    pipeline: Pipeline<E>,
) -> (
    JoinHandle<Result<PipelineOutcome, PipelineError>>,
    mpsc::UnboundedReceiver<StepInfo>,
) {
    let (progress_tx, progress_rx) = mpsc::unbounded_channel();
    let handle = tokio::task::spawn_blocking(move || {
        pipeline.run(&mut |info| {
            // The receiver may already be gone; the run still completes.
            let _ = progress_tx.send(info);
        })
    });
    (handle, progress_rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Device, Linkage};
    use crate::core::embedding::{Embeddings, ThumbnailEmbedder, l2_normalize_rows};
    use crate::core::manifest::Manifest;
    use image::{ImageBuffer, Rgb};
    use ndarray::Array2;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    /// Hands out a fixed vector per discovered file; listed indices fail to load.
    struct FixedEmbedder {
        vectors: Vec<Vec<f32>>,
        unreadable: Vec<usize>,
    }

    impl FixedEmbedder {
        fn new(vectors: Vec<Vec<f32>>) -> Self {
            Self {
                vectors,
                unreadable: Vec::new(),
            }
        }
    }

    impl Embedder for FixedEmbedder {
        fn name(&self) -> &str {
            "fixed"
        }

        fn resolve_device(&self, _requested: Device) -> Result<String, EmbedError> {
            Ok("cpu".to_string())
        }

        fn extract(
            &self,
            paths: &[PathBuf],
            options: &EmbedOptions,
            on_batch: &mut dyn FnMut(usize, usize),
        ) -> Result<Embeddings, EmbedError> {
            let dim = self.vectors[0].len();
            let mut flat = Vec::new();
            let mut valid_indices = Vec::new();
            for start in (0..paths.len()).step_by(options.batch_size) {
                let end = (start + options.batch_size).min(paths.len());
                for idx in start..end {
                    if !self.unreadable.contains(&idx) {
                        flat.extend_from_slice(&self.vectors[idx]);
                        valid_indices.push(idx);
                    }
                }
                on_batch(end, paths.len());
            }
            if valid_indices.is_empty() {
                return Err(EmbedError::NoImagesLoaded);
            }
            let mut matrix = Array2::from_shape_vec((valid_indices.len(), dim), flat)?;
            l2_normalize_rows(&mut matrix);
            Ok(Embeddings {
                matrix,
                valid_indices,
            })
        }
    }

    fn two_groups() -> Vec<Vec<f32>> {
        vec![
            vec![1.0, 0.05, 0.0],
            vec![1.0, 0.0, 0.05],
            vec![1.0, 0.03, 0.03],
            vec![0.05, 1.0, 0.0],
            vec![0.0, 1.0, 0.05],
            vec![0.03, 1.0, 0.03],
        ]
    }

    fn photo_dir(count: usize) -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        for i in 1..=count {
            fs::write(temp_dir.path().join(format!("IMG_{}.jpg", i)), b"x").unwrap();
        }
        temp_dir
    }

    fn params(dir: &Path) -> PipelineParams {
        PipelineParams::new(dir)
            .with_distance_threshold(0.5)
            .with_linkage(Linkage::Average)
            .with_batch_size(4)
    }

    #[test]
    fn test_two_groups_end_to_end() {
        let temp_dir = photo_dir(6);
        let pipeline = Pipeline::new(params(temp_dir.path()), FixedEmbedder::new(two_groups()));

        let outcome = pipeline.run(&mut |_| {}).unwrap();

        assert_eq!(outcome.n_clusters, 2);
        assert_eq!(outcome.total_ordered(), 6);
        assert_eq!(outcome.skipped, 0);
        let first: Vec<usize> = outcome.ordered[..3].iter().map(|p| p.original_index).collect();
        let second: Vec<usize> = outcome.ordered[3..].iter().map(|p| p.original_index).collect();
        assert_eq!(first, vec![0, 1, 2]);
        assert_eq!(second, vec![3, 4, 5]);
        assert_eq!(
            outcome.ordered[0].path.file_name().unwrap().to_string_lossy(),
            "IMG_1.jpg"
        );

        let root = fs::canonicalize(temp_dir.path()).unwrap();
        assert_eq!(
            outcome.manifest_path,
            root.join("PhotoSorter_Cache").join("manifest.json")
        );
        let manifest = Manifest::load(&outcome.manifest_path).unwrap();
        assert_eq!(manifest.total, 6);
        assert_eq!(manifest.clusters.len(), 2);
        assert_eq!(manifest.parameters.linkage, Some(Linkage::Average));
        assert_eq!(manifest.parameters.device.as_deref(), Some("cpu"));
    }

    #[test]
    fn test_input_dir_is_resolved_to_absolute_path() {
        let temp_dir = photo_dir(6);
        let nested = temp_dir.path().join("nested");
        fs::create_dir(&nested).unwrap();
        let indirect = nested.join("..");
        let pipeline = Pipeline::new(params(&indirect), FixedEmbedder::new(two_groups()));

        let outcome = pipeline.run(&mut |_| {}).unwrap();

        let root = fs::canonicalize(temp_dir.path()).unwrap();
        assert!(outcome.manifest_path.is_absolute());
        assert_eq!(
            outcome.manifest_path,
            root.join("PhotoSorter_Cache").join("manifest.json")
        );
        let manifest = Manifest::load(&outcome.manifest_path).unwrap();
        assert_eq!(manifest.input_dir, root.to_string_lossy());
    }

    #[test]
    fn test_progress_covers_every_step() {
        let temp_dir = photo_dir(6);
        let pipeline = Pipeline::new(params(temp_dir.path()), FixedEmbedder::new(two_groups()));
        let mut events = Vec::new();

        pipeline.run(&mut |info| events.push(info)).unwrap();

        for step in PipelineStep::ALL {
            let count = events.iter().filter(|e| e.step == step).count();
            assert!(count >= 2, "step {} reported {} times", step, count);
        }
        let batch_updates: Vec<(usize, usize)> = events
            .iter()
            .filter(|e| e.step == PipelineStep::Embed && e.detail.starts_with("Embedded 4"))
            .map(|e| (e.processed, e.total))
            .collect();
        assert_eq!(batch_updates, vec![(4, 6)]);

        let last = events.last().unwrap();
        assert_eq!(last.step, PipelineStep::Output);
        assert_eq!(last.processed, last.total);
    }

    #[test]
    fn test_skipped_images_keep_original_indices() {
        let temp_dir = photo_dir(6);
        let mut embedder = FixedEmbedder::new(two_groups());
        embedder.unreadable = vec![1];
        let pipeline = Pipeline::new(params(temp_dir.path()), embedder);

        let outcome = pipeline.run(&mut |_| {}).unwrap();

        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.total_ordered(), 5);
        let order: Vec<usize> = outcome.ordered.iter().map(|p| p.original_index).collect();
        assert_eq!(order, vec![0, 2, 3, 4, 5]);
        let positions: Vec<usize> = outcome.ordered.iter().map(|p| p.position).collect();
        assert_eq!(positions, vec![0, 1, 2, 3, 4]);
        assert_eq!(
            outcome.ordered[1].path.file_name().unwrap().to_string_lossy(),
            "IMG_3.jpg"
        );
    }

    #[test]
    fn test_cancelled_before_start() {
        let temp_dir = photo_dir(6);
        let pipeline = Pipeline::new(params(temp_dir.path()), FixedEmbedder::new(two_groups()));
        pipeline.cancel();

        let result = pipeline.run(&mut |_| {});

        assert!(matches!(result, Err(PipelineError::Cancelled)));
        assert!(!temp_dir.path().join("PhotoSorter_Cache").exists());
    }

    #[test]
    fn test_cancellation_stops_at_next_step() {
        let temp_dir = photo_dir(6);
        let token = Arc::new(AtomicBool::new(false));
        let pipeline = Pipeline::new(params(temp_dir.path()), FixedEmbedder::new(two_groups()))
            .with_cancellation(token.clone());
        let mut steps = Vec::new();

        let result = pipeline.run(&mut |info| {
            if info.step == PipelineStep::Similarity {
                token.store(true, Ordering::Relaxed);
            }
            steps.push(info.step);
        });

        assert!(matches!(result, Err(PipelineError::Cancelled)));
        assert_eq!(steps.last(), Some(&PipelineStep::Similarity));
        assert!(!steps.contains(&PipelineStep::Cluster));
    }

    #[test]
    fn test_invalid_params_rejected_before_any_work() {
        let pipeline = Pipeline::new(
            PipelineParams::new("/definitely/not/here").with_distance_threshold(0.0),
            FixedEmbedder::new(two_groups()),
        );
        let mut events = 0;

        let result = pipeline.run(&mut |_| events += 1);

        assert!(matches!(
            result,
            Err(PipelineError::Params(ParamError::ThresholdNotPositive(_)))
        ));
        assert_eq!(events, 0);
    }

    #[test]
    fn test_missing_input_dir() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("missing");
        let pipeline = Pipeline::new(params(&missing), FixedEmbedder::new(two_groups()));

        let result = pipeline.run(&mut |_| {});
        assert!(matches!(result, Err(PipelineError::InputNotFound { .. })));
    }

    #[test]
    fn test_empty_input_dir() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("notes.txt"), b"x").unwrap();
        let pipeline = Pipeline::new(params(temp_dir.path()), FixedEmbedder::new(two_groups()));

        let result = pipeline.run(&mut |_| {});
        assert!(matches!(result, Err(PipelineError::NoImages { .. })));
    }

    #[test]
    fn test_unavailable_device_is_reported() {
        let temp_dir = photo_dir(2);
        let pipeline = Pipeline::new(
            params(temp_dir.path()).with_device(Device::Cuda),
            ThumbnailEmbedder::new(),
        );

        let result = pipeline.run(&mut |_| {});
        assert!(matches!(
            result,
            Err(PipelineError::Embed(EmbedError::DeviceUnavailable { .. }))
        ));
    }

    #[test]
    fn test_thumbnail_embedder_groups_by_colour() {
        let temp_dir = TempDir::new().unwrap();
        let colours: [[u8; 3]; 4] = [[220, 30, 30], [30, 30, 220], [225, 35, 25], [25, 35, 225]];
        for (i, colour) in colours.iter().enumerate() {
            let img = ImageBuffer::from_pixel(64, 48, Rgb(*colour));
            img.save(temp_dir.path().join(format!("IMG_{}.png", i + 1)))
                .unwrap();
        }
        let pipeline = Pipeline::new(
            PipelineParams::new(temp_dir.path()),
            ThumbnailEmbedder::new(),
        );

        let outcome = pipeline.run(&mut |_| {}).unwrap();

        assert_eq!(outcome.n_clusters, 2);
        let order: Vec<usize> = outcome.ordered.iter().map(|p| p.original_index).collect();
        assert_eq!(order, vec![0, 2, 1, 3]);
        assert!(outcome.manifest_path.exists());
    }

    #[tokio::test]
    async fn test_spawned_pipeline_streams_progress() {
        let temp_dir = photo_dir(6);
        let pipeline = Pipeline::new(params(temp_dir.path()), FixedEmbedder::new(two_groups()));

        let (handle, mut progress_rx) = spawn_pipeline(pipeline);
        let mut events = Vec::new();
        while let Some(info) = progress_rx.recv().await {
            events.push(info);
        }
        let outcome = handle.await.unwrap().unwrap();

        assert_eq!(outcome.n_clusters, 2);
        assert_eq!(events.first().map(|e| e.step), Some(PipelineStep::Discover));
        assert_eq!(events.last().map(|e| e.step), Some(PipelineStep::Output));
    }
}
