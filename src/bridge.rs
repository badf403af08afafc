//! JSON Lines protocol spoken to the desktop app.
//!
//! Structured messages go to stdout, one object per line. Logging stays on
//! stderr so the stream can be parsed line by line.

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

use crate::config::{DEFAULTS, Device, Linkage, ParamError, PipelineParams, Pooling, Preprocess};
use crate::core::embedding::Embedder;
use crate::core::manifest::manifest_path_for_input;
use crate::core::pipeline::{Pipeline, PipelineError, PipelineOutcome, PipelineStep, StepInfo};

#[derive(Debug, Error, PartialEq)]
pub enum BridgeError {
    #[error(transparent)]
    Param(#[from] ParamError),

    #[error("Parameter '{key}' has an invalid value: {value}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeMessage {
    Progress {
        step: PipelineStep,
        detail: String,
        processed: usize,
        total: usize,
    },
    Complete {
        manifest_path: String,
    },
    Error {
        message: String,
    },
    Manifest {
        exists: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
}

impl From<StepInfo> for BridgeMessage {
    fn from(info: StepInfo) -> Self {
        BridgeMessage::Progress {
            step: info.step,
            detail: info.detail,
            processed: info.processed,
            total: info.total,
        }
    }
}

/// Writes one JSON object per line, flushing after each.
pub struct JsonLines<W: Write> {
    out: W,
}

impl<W: Write> JsonLines<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn emit(&mut self, message: &BridgeMessage) -> io::Result<()> {
        serde_json::to_writer(&mut self.out, message)?;
        self.out.write_all(b"\n")?;
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn emit_or_warn(&mut self, message: BridgeMessage) {
        if let Err(e) = self.emit(&message) {
            warn!("Failed to write bridge message: {}", e);
        }
    }
}

/// Run `pipeline`, streaming progress and a final `complete` or `error` line.
pub fn run_pipeline<E: Embedder, W: Write>(
    pipeline: &Pipeline<E>,
    out: &mut JsonLines<W>,
) -> Result<PipelineOutcome, PipelineError> {
    let result = pipeline.run(&mut |info| out.emit_or_warn(info.into()));
    match &result {
        Ok(outcome) => out.emit_or_warn(BridgeMessage::Complete {
            manifest_path: outcome.manifest_path.to_string_lossy().to_string(),
        }),
        Err(e) => out.emit_or_warn(BridgeMessage::Error {
            message: e.to_string(),
        }),
    }
    result
}

/// Report whether a manifest already exists for `input_dir`.
pub fn check_manifest<W: Write>(input_dir: &Path, out: &mut JsonLines<W>) -> io::Result<bool> {
    let manifest_path = manifest_path_for_input(input_dir);
    let exists = manifest_path.is_file();
    out.emit(&BridgeMessage::Manifest {
        exists,
        path: exists.then(|| manifest_path.to_string_lossy().to_string()),
    })?;
    Ok(exists)
}

const DEVICE_LABELS: &[(&str, &str)] = &[("Auto", "auto"), ("Apple GPU", "mps"), ("CPU", "cpu")];
const POOLING_LABELS: &[(&str, &str)] = &[("CLS", "cls"), ("AVG", "avg"), ("CLS+AVG", "cls+avg")];
const LINKAGE_LABELS: &[(&str, &str)] = &[
    ("Average", "average"),
    ("Complete", "complete"),
    ("Single", "single"),
];

/// Build validated params from the settings the app sends.
///
/// Display labels such as `Apple GPU` are mapped to their option names;
/// anything else is passed through and parsed as-is. Missing keys fall back
/// to the app's defaults, which prefer `cls` pooling and `average` linkage.
pub fn params_from_gui(
    input_dir: impl Into<PathBuf>,
    settings: &Map<String, Value>,
) -> Result<PipelineParams, BridgeError> {
    let device: Device = choice(settings, "device", "Auto", DEVICE_LABELS)?;
    let pooling: Pooling = choice(settings, "pooling", "CLS", POOLING_LABELS)?;
    let linkage: Linkage = choice(settings, "linkage", "Average", LINKAGE_LABELS)?;
    let preprocess: Preprocess = choice(settings, "preprocess", DEFAULTS.preprocess.as_str(), &[])?;

    let params = PipelineParams::new(input_dir)
        .with_device(device)
        .with_pooling(pooling)
        .with_linkage(linkage)
        .with_preprocess(preprocess)
        .with_batch_size(number(settings, "batch_size", DEFAULTS.batch_size)?)
        .with_distance_threshold(number(
            settings,
            "distance_threshold",
            DEFAULTS.distance_threshold,
        )?)
        .with_temporal_weight(number(settings, "temporal_weight", DEFAULTS.temporal_weight)?);

    Ok(params.validated()?)
}

fn text(settings: &Map<String, Value>, key: &str) -> Option<String> {
    match settings.get(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn choice<T: FromStr<Err = ParamError>>(
    settings: &Map<String, Value>,
    key: &str,
    default: &str,
    labels: &[(&str, &str)],
) -> Result<T, BridgeError> {
    let raw = text(settings, key).unwrap_or_else(|| default.to_string());
    let name = labels
        .iter()
        .find(|(label, _)| *label == raw)
        .map_or(raw.as_str(), |(_, name)| *name);
    Ok(name.parse()?)
}

fn number<T: FromStr>(settings: &Map<String, Value>, key: &str, default: T) -> Result<T, BridgeError> {
    match text(settings, key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| BridgeError::InvalidValue {
            key: key.to_string(),
            value: raw,
        }),
    }
}
