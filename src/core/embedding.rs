use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageDecoder, ImageError, ImageReader, ImageResult, Rgb, RgbImage};
use log::{debug, info, warn};
use ndarray::Array2;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::{DEFAULTS, Device, Pooling, Preprocess};

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("No images could be loaded successfully")]
    NoImagesLoaded,

    #[error("Device '{device}' is not available for the {embedder} embedder")]
    DeviceUnavailable { device: Device, embedder: String },

    #[error("Embedding rows have inconsistent shapes: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// Options forwarded from the pipeline parameters to an embedder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmbedOptions {
    pub batch_size: usize,
    pub pooling: Pooling,
    pub preprocess: Preprocess,
}

impl Default for EmbedOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULTS.batch_size,
            pooling: DEFAULTS.pooling,
            preprocess: DEFAULTS.preprocess,
        }
    }
}

/// Unit-norm embeddings for the images that loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct Embeddings {
    /// One L2-normalized row per loaded image.
    pub matrix: Array2<f32>,
    /// `valid_indices[row]` is the index of that row's image in the input path list.
    pub valid_indices: Vec<usize>,
}

/// Turns image files into fixed-length embedding vectors.
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    /// Map a requested device onto the concrete device this embedder will use.
    fn resolve_device(&self, requested: Device) -> Result<String, EmbedError>;

    /// Embed `paths` in batches of `options.batch_size`.
    ///
    /// Images that fail to load are skipped and left out of
    /// `valid_indices`. `on_batch(processed, total)` is called after every
    /// batch. Returned rows must be L2-normalized.
    fn extract(
        &self,
        paths: &[PathBuf],
        options: &EmbedOptions,
        on_batch: &mut dyn FnMut(usize, usize),
    ) -> Result<Embeddings, EmbedError>;
}

/// Scale every row to unit L2 norm. Norms are clamped at `1e-12`, so
/// all-zero rows stay zero.
pub fn l2_normalize_rows(matrix: &mut Array2<f32>) {
    for mut row in matrix.rows_mut() {
        let norm = row.dot(&row).sqrt().max(1e-12);
        row.mapv_inplace(|v| v / norm);
    }
}

/// CPU embedder built from downsampled pixels.
///
/// The image is letterboxed or centre-cropped to a square, normalized with
/// the ImageNet channel statistics and described by
/// - `avg`: the mean colour of every patch, in raster order;
/// - `cls`: a global per-channel colour histogram;
/// - `cls+avg`: both, each scaled to unit length before concatenation.
pub struct ThumbnailEmbedder {
    resize_size: u32,
    crop_size: u32,
    patch_size: u32,
    histogram_bins: usize,
    prescale_size: u32,
    mean: [f32; 3],
    std: [f32; 3],
}

impl ThumbnailEmbedder {
    pub fn new() -> Self {
        Self {
            resize_size: DEFAULTS.resize_size,
            crop_size: DEFAULTS.crop_size,
            patch_size: 16,
            histogram_bins: 8,
            prescale_size: DEFAULTS.prescale_size,
            mean: DEFAULTS.imagenet_mean,
            std: DEFAULTS.imagenet_std,
        }
    }

    /// Length of the vectors produced for `pooling`.
    pub fn dimension(&self, pooling: Pooling) -> usize {
        let grid = (self.crop_size / self.patch_size) as usize;
        let patch_dim = grid * grid * 3;
        let histogram_dim = self.histogram_bins * 3;
        match pooling {
            Pooling::Avg => patch_dim,
            Pooling::Cls => histogram_dim,
            Pooling::ClsAvg => patch_dim + histogram_dim,
        }
    }

    fn embed_one(&self, path: &Path, options: &EmbedOptions) -> ImageResult<Vec<f32>> {
        let img = prescale(load_oriented(path)?, self.prescale_size);
        let square = match options.preprocess {
            Preprocess::Letterbox => letterbox(&img, self.crop_size, self.mean),
            Preprocess::Timm => resize_and_center_crop(&img, self.resize_size, self.crop_size),
        };

        Ok(match options.pooling {
            Pooling::Avg => self.patch_means(&square),
            Pooling::Cls => self.color_histogram(&square),
            Pooling::ClsAvg => {
                let mut global = self.color_histogram(&square);
                let mut patches = self.patch_means(&square);
                unit_scale(&mut global);
                unit_scale(&mut patches);
                global.extend(patches);
                global
            }
        })
    }

    /// Mean of the normalized channels over each `patch_size` square.
    fn patch_means(&self, square: &RgbImage) -> Vec<f32> {
        let grid = square.width() / self.patch_size;
        let area = (self.patch_size * self.patch_size) as f32;
        let mut features = Vec::with_capacity((grid * grid * 3) as usize);

        for py in 0..grid {
            for px in 0..grid {
                let mut sums = [0.0_f32; 3];
                for y in py * self.patch_size..(py + 1) * self.patch_size {
                    for x in px * self.patch_size..(px + 1) * self.patch_size {
                        let Rgb(pixel) = *square.get_pixel(x, y);
                        for c in 0..3 {
                            sums[c] += (f32::from(pixel[c]) / 255.0 - self.mean[c]) / self.std[c];
                        }
                    }
                }
                features.extend(sums.iter().map(|s| s / area));
            }
        }
        features
    }

    /// Fraction of pixels falling into each of `histogram_bins` per channel.
    fn color_histogram(&self, square: &RgbImage) -> Vec<f32> {
        let bins = self.histogram_bins;
        let mut counts = vec![0_u32; bins * 3];
        for Rgb(pixel) in square.pixels() {
            for c in 0..3 {
                let bin = usize::from(pixel[c]) * bins / 256;
                counts[c * bins + bin] += 1;
            }
        }
        let total = (square.width() * square.height()).max(1) as f32;
        counts.into_iter().map(|n| n as f32 / total).collect()
    }
}

impl Default for ThumbnailEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl Embedder for ThumbnailEmbedder {
    fn name(&self) -> &str {
        "thumbnail"
    }

    fn resolve_device(&self, requested: Device) -> Result<String, EmbedError> {
        match requested {
            Device::Auto | Device::Cpu => Ok("cpu".to_string()),
            other => Err(EmbedError::DeviceUnavailable {
                device: other,
                embedder: self.name().to_string(),
            }),
        }
    }

    fn extract(
        &self,
        paths: &[PathBuf],
        options: &EmbedOptions,
        on_batch: &mut dyn FnMut(usize, usize),
    ) -> Result<Embeddings, EmbedError> {
        let total = paths.len();
        let batch_size = options.batch_size.max(1);
        let mut rows: Vec<f32> = Vec::new();
        let mut valid_indices = Vec::with_capacity(total);
        let mut processed = 0;

        info!(
            "Embedding {} images (pooling={}, preprocess={}, batch_size={})",
            total, options.pooling, options.preprocess, batch_size
        );

        for (batch_index, batch) in paths.chunks(batch_size).enumerate() {
            let start = batch_index * batch_size;
            let results: Vec<(usize, ImageResult<Vec<f32>>)> = batch
                .par_iter()
                .enumerate()
                .map(|(offset, path)| (start + offset, self.embed_one(path, options)))
                .collect();

            for (index, result) in results {
                match result {
                    Ok(features) => {
                        rows.extend(features);
                        valid_indices.push(index);
                    }
                    Err(e) => {
                        let name = paths[index]
                            .file_name()
                            .unwrap_or_default()
                            .to_string_lossy();
                        warn!("Skipping {}: {}", name, e);
                    }
                }
            }

            processed += batch.len();
            debug!("Embedded batch {} ({}/{})", batch_index, processed, total);
            on_batch(processed, total);
        }

        if valid_indices.is_empty() {
            return Err(EmbedError::NoImagesLoaded);
        }

        let mut matrix = Array2::from_shape_vec(
            (valid_indices.len(), self.dimension(options.pooling)),
            rows,
        )?;
        l2_normalize_rows(&mut matrix);

        Ok(Embeddings {
            matrix,
            valid_indices,
        })
    }
}

/// Decode an image and apply its EXIF orientation.
fn load_oriented(path: &Path) -> ImageResult<DynamicImage> {
    let mut decoder = ImageReader::open(path)
        .and_then(|reader| reader.with_guessed_format())
        .map_err(ImageError::IoError)?
        .into_decoder()?;
    let orientation = decoder.orientation()?;
    let mut img = DynamicImage::from_decoder(decoder)?;
    img.apply_orientation(orientation);
    Ok(img)
}

/// Downsample so the long edge is at most `limit`; smaller images pass through.
fn prescale(img: DynamicImage, limit: u32) -> DynamicImage {
    if img.width().max(img.height()) > limit {
        img.thumbnail(limit, limit)
    } else {
        img
    }
}

/// Fit `img` inside a `size` square and pad the remainder with `fill`.
pub fn letterbox(img: &DynamicImage, size: u32, fill: [f32; 3]) -> RgbImage {
    let (width, height) = (img.width().max(1), img.height().max(1));
    let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
    let new_width = ((width as f32 * scale).round() as u32).clamp(1, size);
    let new_height = ((height as f32 * scale).round() as u32).clamp(1, size);

    let resized = img
        .resize_exact(new_width, new_height, FilterType::CatmullRom)
        .to_rgb8();
    if (new_width, new_height) == (size, size) {
        return resized;
    }

    let fill = Rgb(fill.map(|c| (c * 255.0).round() as u8));
    let mut canvas = RgbImage::from_pixel(size, size, fill);
    let x = (size - new_width) / 2;
    let y = (size - new_height) / 2;
    imageops::overlay(&mut canvas, &resized, i64::from(x), i64::from(y));
    canvas
}

/// Resize the shorter side to `resize`, then cut a centred `crop` square.
pub fn resize_and_center_crop(img: &DynamicImage, resize: u32, crop: u32) -> RgbImage {
    let (width, height) = (img.width().max(1), img.height().max(1));
    let scale = resize as f32 / width.min(height) as f32;
    let new_width = ((width as f32 * scale).round() as u32).max(crop);
    let new_height = ((height as f32 * scale).round() as u32).max(crop);

    let resized = img.resize_exact(new_width, new_height, FilterType::CatmullRom);
    let x = (new_width - crop) / 2;
    let y = (new_height - crop) / 2;
    resized.crop_imm(x, y, crop, crop).to_rgb8()
}

fn unit_scale(values: &mut [f32]) {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt().max(1e-12);
    values.iter_mut().for_each(|v| *v /= norm);
}
