use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

use crate::config::DEFAULTS;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Input directory does not exist: {path}")]
    NotADirectory { path: String },

    #[error("Failed to read directory: {0}")]
    Walk(#[from] walkdir::Error),
}

/// One run of a file stem: either text or a run of digits.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum SortPart {
    /// Digit run with leading zeros stripped; `len` first so longer numbers sort later.
    Number { len: usize, digits: String },
    Text(String),
}

/// Sort key that orders digit runs numerically, so `IMG_2` sorts before `IMG_10`.
///
/// Text runs compare case-insensitively. The key always starts with a text
/// run (possibly empty) and alternates, so text is never compared to a number.
pub fn natural_sort_key(path: &Path) -> Vec<SortPart> {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut parts = Vec::new();
    let mut text = String::new();
    let mut digits = String::new();
    for ch in stem.chars() {
        if ch.is_ascii_digit() {
            if digits.is_empty() {
                parts.push(SortPart::Text(std::mem::take(&mut text).to_lowercase()));
            }
            digits.push(ch);
        } else {
            if !digits.is_empty() {
                parts.push(number_part(std::mem::take(&mut digits)));
            }
            text.push(ch);
        }
    }
    if digits.is_empty() {
        parts.push(SortPart::Text(text.to_lowercase()));
    } else {
        parts.push(number_part(digits));
        parts.push(SortPart::Text(String::new()));
    }
    parts
}

fn number_part(digits: String) -> SortPart {
    let trimmed = digits.trim_start_matches('0');
    SortPart::Number {
        len: trimmed.len(),
        digits: trimmed.to_string(),
    }
}

fn natural_cmp(a: &Path, b: &Path) -> Ordering {
    natural_sort_key(a)
        .cmp(&natural_sort_key(b))
        .then_with(|| a.file_name().cmp(&b.file_name()))
}

/// Whether `path` has one of the supported image or RAW extensions.
pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_lowercase();
            DEFAULTS.image_extensions.contains(&ext.as_str())
                || DEFAULTS.raw_extensions.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// List the supported images directly inside `dir`, in natural filename order.
///
/// Subdirectories are not searched.
pub fn discover_images(dir: &Path) -> Result<Vec<PathBuf>, DiscoveryError> {
    if !dir.is_dir() {
        return Err(DiscoveryError::NotADirectory {
            path: dir.to_string_lossy().to_string(),
        });
    }

    let mut images = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
    {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && is_supported_image(path) {
            images.push(path.to_path_buf());
        }
    }

    images.sort_by(|a, b| natural_cmp(a, b));
    log::debug!("Discovered {} images in {}", images.len(), dir.display());
    Ok(images)
}
