use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Default values shared by the CLI, the bridge and the pipeline.
#[derive(Debug, Clone, Copy)]
pub struct Defaults {
    pub batch_size: usize,
    pub pooling: Pooling,
    pub preprocess: Preprocess,
    pub device: Device,

    pub resize_size: u32,
    pub crop_size: u32,
    pub imagenet_mean: [f32; 3],
    pub imagenet_std: [f32; 3],

    pub distance_threshold: f64,
    pub linkage: Linkage,
    pub temporal_weight: f64,

    pub manifest_filename: &'static str,
    pub cache_dirname: &'static str,

    pub image_extensions: &'static [&'static str],
    pub raw_extensions: &'static [&'static str],

    /// Images whose long edge exceeds this are downsampled before preprocessing.
    pub prescale_size: u32,
}

pub const DEFAULTS: Defaults = Defaults {
    batch_size: 16,
    pooling: Pooling::Avg,
    preprocess: Preprocess::Letterbox,
    device: Device::Auto,
    resize_size: 256,
    crop_size: 256,
    imagenet_mean: [0.485, 0.456, 0.406],
    imagenet_std: [0.229, 0.224, 0.225],
    distance_threshold: 0.2,
    linkage: Linkage::Complete,
    temporal_weight: 0.0,
    manifest_filename: "manifest.json",
    cache_dirname: "PhotoSorter_Cache",
    image_extensions: &["jpg", "jpeg", "png", "tiff", "tif", "bmp", "webp"],
    raw_extensions: &["arw", "dng", "cr2", "cr3", "nef", "orf", "raf", "rw2"],
    prescale_size: 512,
};

/// Upper bound for a cosine distance threshold.
pub const MAX_DISTANCE_THRESHOLD: f64 = 2.0;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParamError {
    #[error("--{flag} must be one of {choices}, got '{value}'")]
    InvalidChoice {
        flag: &'static str,
        choices: &'static str,
        value: String,
    },

    #[error("--distance-threshold must be > 0, got {0}")]
    ThresholdNotPositive(f64),

    #[error("--distance-threshold must be <= 2.0, got {0}")]
    ThresholdTooLarge(f64),

    #[error("--temporal-weight must be >= 0, got {0}")]
    NegativeTemporalWeight(f64),

    #[error("--batch-size must be >= 1, got {0}")]
    BatchSizeTooSmall(usize),
}

/// Rule for measuring the distance between two clusters during merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Linkage {
    /// Mean pairwise distance between members.
    Average,
    /// Largest pairwise distance; produces tight clusters.
    Complete,
    /// Smallest pairwise distance; prone to chaining.
    Single,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Pooling {
    #[serde(rename = "cls")]
    Cls,
    #[serde(rename = "avg")]
    Avg,
    #[serde(rename = "cls+avg")]
    ClsAvg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preprocess {
    /// Fit inside a square and pad the remainder.
    Letterbox,
    /// Resize the shorter side and centre-crop.
    Timm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Auto,
    Cpu,
    Mps,
    Cuda,
}

/// Wire names and values for an option enum, used by `FromStr` and `Display`.
macro_rules! option_names {
    ($ty:ty, $flag:literal, $choices:literal, [$(($variant:path, $name:literal)),+ $(,)?]) => {
        impl $ty {
            pub const ALL: &'static [$ty] = &[$($variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($variant => $name),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParamError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok($variant),)+
                    other => Err(ParamError::InvalidChoice {
                        flag: $flag,
                        choices: $choices,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

option_names!(
    Linkage,
    "linkage",
    "{average, complete, single}",
    [
        (Linkage::Average, "average"),
        (Linkage::Complete, "complete"),
        (Linkage::Single, "single"),
    ]
);
option_names!(
    Pooling,
    "pooling",
    "{cls, avg, cls+avg}",
    [
        (Pooling::Cls, "cls"),
        (Pooling::Avg, "avg"),
        (Pooling::ClsAvg, "cls+avg"),
    ]
);
option_names!(
    Preprocess,
    "preprocess",
    "{letterbox, timm}",
    [(Preprocess::Letterbox, "letterbox"), (Preprocess::Timm, "timm")]
);
option_names!(
    Device,
    "device",
    "{auto, cpu, mps, cuda}",
    [
        (Device::Auto, "auto"),
        (Device::Cpu, "cpu"),
        (Device::Mps, "mps"),
        (Device::Cuda, "cuda"),
    ]
);

/// Everything one pipeline run needs, validated before any work starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineParams {
    pub input_dir: PathBuf,
    pub device: Device,
    pub batch_size: usize,
    pub pooling: Pooling,
    pub preprocess: Preprocess,
    pub distance_threshold: f64,
    pub linkage: Linkage,
    pub temporal_weight: f64,
}

impl PipelineParams {
    pub fn new(input_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
            device: DEFAULTS.device,
            batch_size: DEFAULTS.batch_size,
            pooling: DEFAULTS.pooling,
            preprocess: DEFAULTS.preprocess,
            distance_threshold: DEFAULTS.distance_threshold,
            linkage: DEFAULTS.linkage,
            temporal_weight: DEFAULTS.temporal_weight,
        }
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_pooling(mut self, pooling: Pooling) -> Self {
        self.pooling = pooling;
        self
    }

    pub fn with_preprocess(mut self, preprocess: Preprocess) -> Self {
        self.preprocess = preprocess;
        self
    }

    pub fn with_distance_threshold(mut self, distance_threshold: f64) -> Self {
        self.distance_threshold = distance_threshold;
        self
    }

    pub fn with_linkage(mut self, linkage: Linkage) -> Self {
        self.linkage = linkage;
        self
    }

    pub fn with_temporal_weight(mut self, temporal_weight: f64) -> Self {
        self.temporal_weight = temporal_weight;
        self
    }

    /// Check numeric ranges. Enum-valued options are valid by construction.
    pub fn validate(&self) -> Result<(), ParamError> {
        validate_clustering_parameters(self.distance_threshold, self.temporal_weight)?;
        if self.batch_size < 1 {
            return Err(ParamError::BatchSizeTooSmall(self.batch_size));
        }
        Ok(())
    }

    /// Consume the params, returning them only if they pass [`validate`](Self::validate).
    pub fn validated(self) -> Result<Self, ParamError> {
        self.validate()?;
        Ok(self)
    }
}

/// Range checks for the two clustering scalars.
///
/// NaN is rejected by the lower-bound checks.
pub fn validate_clustering_parameters(
    distance_threshold: f64,
    temporal_weight: f64,
) -> Result<(), ParamError> {
    if distance_threshold.is_nan() || distance_threshold <= 0.0 {
        return Err(ParamError::ThresholdNotPositive(distance_threshold));
    }
    if distance_threshold > MAX_DISTANCE_THRESHOLD {
        return Err(ParamError::ThresholdTooLarge(distance_threshold));
    }
    if temporal_weight.is_nan() || temporal_weight < 0.0 {
        return Err(ParamError::NegativeTemporalWeight(temporal_weight));
    }
    Ok(())
}
