use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::{DEFAULTS, Linkage, Pooling};
use crate::core::ordering::OrderedPhoto;

pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid manifest JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Cache directory for a selected input folder.
pub fn cache_dir_for_input(input_dir: &Path) -> PathBuf {
    input_dir.join(DEFAULTS.cache_dirname)
}

/// Manifest location inside the cache directory.
pub fn manifest_path_for_input(input_dir: &Path) -> PathBuf {
    cache_dir_for_input(input_dir).join(DEFAULTS.manifest_filename)
}

/// Parameters recorded alongside the grouping; unset ones are omitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporal_weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linkage: Option<Linkage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pooling: Option<Pooling>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestPhoto {
    pub position: usize,
    pub original_index: usize,
    pub filename: String,
    pub original_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestCluster {
    pub cluster_id: usize,
    pub count: usize,
    pub photos: Vec<ManifestPhoto>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub input_dir: String,
    pub total: usize,
    pub generated_at: String,
    pub parameters: ManifestParameters,
    pub clusters: Vec<ManifestCluster>,
}

impl Manifest {
    /// Group an ordered sequence by cluster, clusters in order of first appearance.
    pub fn from_sequence(
        ordered: &[OrderedPhoto],
        input_dir: &Path,
        parameters: ManifestParameters,
    ) -> Self {
        let mut clusters: Vec<ManifestCluster> = Vec::new();
        let mut slot_of_cluster: HashMap<usize, usize> = HashMap::new();
        for photo in ordered {
            let entry = ManifestPhoto {
                position: photo.position,
                original_index: photo.original_index,
                filename: photo
                    .path
                    .file_name()
                    .unwrap_or_default()
                    .to_string_lossy()
                    .to_string(),
                original_path: resolve_path(&photo.path).to_string_lossy().to_string(),
            };
            let slot = *slot_of_cluster.entry(photo.cluster_id).or_insert_with(|| {
                clusters.push(ManifestCluster {
                    cluster_id: photo.cluster_id,
                    count: 0,
                    photos: Vec::new(),
                });
                clusters.len() - 1
            });
            let cluster = &mut clusters[slot];
            cluster.count += 1;
            cluster.photos.push(entry);
        }

        Self {
            version: MANIFEST_VERSION,
            input_dir: input_dir.to_string_lossy().to_string(),
            total: ordered.len(),
            generated_at: Utc::now().to_rfc3339(),
            parameters,
            clusters,
        }
    }

    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let content = fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_string_lossy().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write pretty-printed JSON, creating parent directories as needed.
    pub fn write(&self, path: &Path) -> Result<(), ManifestError> {
        let io_err = |source| ManifestError::Io {
            path: path.to_string_lossy().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(self)? + "\n";
        fs::write(path, json).map_err(io_err)?;
        log::info!("Manifest written to {}", path.display());
        Ok(())
    }
}

/// Absolute form of `path`; falls back to joining the working directory
/// when the file cannot be canonicalized.
fn resolve_path(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    })
}

/// Build the manifest for `ordered` and write it to `output_path`.
pub fn write_manifest(
    ordered: &[OrderedPhoto],
    output_path: &Path,
    input_dir: &Path,
    parameters: ManifestParameters,
) -> Result<Manifest, ManifestError> {
    let manifest = Manifest::from_sequence(ordered, input_dir, parameters);
    manifest.write(output_path)?;
    Ok(manifest)
}
