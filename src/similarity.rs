//! Similarity scoring between CLIP embeddings.

use ndarray::{Array2, ArrayView2, Axis};

use crate::error::{ClipError, Result};

/// Temperature CLIP applies to cosine similarities before softmax.
pub const LOGIT_SCALE: f32 = 100.0;

/// Scaled cosine similarity between every row of `a` and every row of `b`.
///
/// Returns an `[a.rows, b.rows]` matrix of logits suitable for [`softmax`].
pub fn get_similarity_scores(a: ArrayView2<f32>, b: ArrayView2<f32>) -> Result<Array2<f32>> {
    if a.ncols() != b.ncols() {
        return Err(ClipError::shape_mismatch(
            format!("embeddings of dimension {}", a.ncols()),
            format!("dimension {}", b.ncols()),
        ));
    }

    let a = normalize_rows(a);
    let b = normalize_rows(b);

    Ok(a.dot(&b.t()) * LOGIT_SCALE)
}

/// L2-normalize each row; all-zero rows are left as zeros.
pub fn normalize_rows(x: ArrayView2<f32>) -> Array2<f32> {
    let mut out = x.to_owned();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            row.mapv_inplace(|v| v / norm);
        }
    }
    out
}

/// Row-wise softmax.
pub fn softmax(x: ArrayView2<f32>) -> Array2<f32> {
    let mut out = x.to_owned();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        if sum > 0.0 {
            row.mapv_inplace(|v| v / sum);
        }
    }
    out
}

/// Calculate cosine similarity between two embeddings
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a > 0.0 && norm_b > 0.0 {
        dot / (norm_a * norm_b)
    } else {
        0.0
    }
}
