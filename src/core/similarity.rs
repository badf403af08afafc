use ndarray::{Array2, ArrayView2};

/// Cosine similarity between every pair of embedding rows.
///
/// Rows must already be L2-normalized. This is not re-checked here; rows
/// that are not unit vectors yield values outside `[-1, 1]`.
///
/// The lower triangle is mirrored from the upper one so the result is
/// exactly symmetric regardless of how the matrix product was blocked.
pub fn compute_similarity(embeddings: ArrayView2<'_, f32>) -> Array2<f32> {
    let mut similarity = embeddings.dot(&embeddings.t());
    let n = similarity.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            similarity[[j, i]] = similarity[[i, j]];
        }
    }
    similarity
}

/// Convert a similarity matrix into a distance matrix.
///
/// The base distance is `clip(1 - similarity, 0, 2)`. With a positive
/// `temporal_weight`, `temporal_weight * |i - j| / max(n - 1, 1)` is added so
/// that photos far apart in the input order are pushed further apart.
pub fn compute_distance(similarity: ArrayView2<'_, f32>, temporal_weight: f64) -> Array2<f32> {
    let mut distance = similarity.mapv(|s| (1.0 - s).clamp(0.0, 2.0));

    if temporal_weight > 0.0 {
        let n = distance.nrows();
        let span = n.saturating_sub(1).max(1) as f64;
        for ((i, j), d) in distance.indexed_iter_mut() {
            let temporal = i.abs_diff(j) as f64 / span;
            *d = (f64::from(*d) + temporal_weight * temporal) as f32;
        }
    }

    distance
}
