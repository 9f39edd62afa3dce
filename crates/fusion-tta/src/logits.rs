//! Cosine-similarity logits against a zero-shot head

use crate::{Result, TtaError};
use fusion_merging::{normalize_in_place, Matrix};
use std::sync::Arc;

/// Norms below this are clamped before dividing
pub const NORM_EPS: f32 = 1e-12;

/// Values recorded by [`LogitHead::forward`]
#[derive(Debug, Clone)]
pub struct LogitTrace {
    /// Normalized image embeddings, `batch x embed_dim`
    embeds: Matrix,
    /// Clamped pre-normalization norms
    norms: Vec<f32>,
}

/// Projection, normalization and scaled similarity for one task
#[derive(Debug, Clone)]
pub struct LogitHead {
    /// `embed_dim x feature_dim`
    projection: Matrix,
    /// `classes x embed_dim`
    head: Arc<Matrix>,
    scale: f32,
}

impl LogitHead {
    pub fn new(projection: Matrix, head: Arc<Matrix>, scale: f32) -> Self {
        Self {
            projection,
            head,
            scale,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.head.rows
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// `batch x classes` logits in `[-scale, scale]`
    pub fn forward(&self, features: &Matrix) -> Result<(Matrix, LogitTrace)> {
        if features.cols != self.projection.cols {
            return Err(TtaError::Compute(format!(
                "Features have width {}, projection expects {}",
                features.cols, self.projection.cols
            )));
        }
        if self.head.cols != self.projection.rows {
            return Err(TtaError::Compute(format!(
                "Zero-shot head has width {}, projection outputs {}",
                self.head.cols, self.projection.rows
            )));
        }

        let mut embeds = features.matmul_t(&self.projection.data, self.projection.rows)?;
        let mut norms = Vec::with_capacity(embeds.rows);
        for r in 0..embeds.rows {
            norms.push(normalize_in_place(embeds.row_mut(r), NORM_EPS));
        }

        let mut logits = embeds.matmul_t(&self.head.data, self.head.rows)?;
        logits.data.iter_mut().for_each(|v| *v *= self.scale);
        Ok((logits, LogitTrace { embeds, norms }))
    }

    /// `dL/dfeatures` from `dL/dlogits`
    pub fn backward(&self, trace: &LogitTrace, d_logits: &Matrix) -> Result<Matrix> {
        if d_logits.rows != trace.embeds.rows || d_logits.cols != self.head.rows {
            return Err(TtaError::Compute(format!(
                "Logit gradient has shape {:?}, expected ({}, {})",
                d_logits.shape(),
                trace.embeds.rows,
                self.head.rows
            )));
        }

        let mut d_embeds = d_logits.matmul(&self.head.data, self.head.cols)?;
        for r in 0..d_embeds.rows {
            let u = trace.embeds.row(r);
            let n = trace.norms[r];
            let du = d_embeds.row_mut(r);
            du.iter_mut().for_each(|g| *g *= self.scale);
            let proj: f32 = u.iter().zip(du.iter()).map(|(a, b)| a * b).sum();
            for (g, ui) in du.iter_mut().zip(u) {
                *g = (*g - ui * proj) / n;
            }
        }

        Ok(d_embeds.matmul(&self.projection.data, self.projection.cols)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head() -> LogitHead {
        let projection = Matrix::new(
            3,
            4,
            vec![0.5, -0.2, 0.1, 0.3, 0.0, 0.4, -0.6, 0.2, 0.7, 0.1, 0.0, -0.3],
        )
        .unwrap();
        let mut rows = vec![vec![1.0, 0.0, 0.0], vec![0.3, 0.9, -0.2]];
        for r in &mut rows {
            normalize_in_place(r, NORM_EPS);
        }
        LogitHead::new(projection, Arc::new(Matrix::from_rows(&rows).unwrap()), 100.0)
    }

    #[test]
    fn test_shape_and_bounds() {
        let h = head();
        let features = Matrix::new(5, 4, (0..20).map(|i| (i as f32 * 0.37).sin()).collect()).unwrap();
        let (logits, _) = h.forward(&features).unwrap();
        assert_eq!(logits.shape(), (5, 2));
        assert!(logits.data.iter().all(|v| v.abs() <= 100.0 + 1e-3));
    }

    #[test]
    fn test_zero_features_finite() {
        let (logits, trace) = head().forward(&Matrix::zeros(2, 4)).unwrap();
        assert!(logits.is_finite());
        let d = head().backward(&trace, &Matrix::new(2, 2, vec![1.0; 4]).unwrap());
        assert!(d.is_ok());
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        let mut h = head();
        h.scale = 2.0;
        let features = Matrix::new(2, 4, vec![0.3, -0.5, 0.8, 0.1, -0.2, 0.4, 0.6, -0.7]).unwrap();
        let weights = [0.7, -0.4, 0.2, 0.9];
        let loss = |x: &Matrix| -> f32 {
            let (l, _) = h.forward(x).unwrap();
            l.data.iter().zip(weights).map(|(a, b)| a * b).sum()
        };

        let (_, trace) = h.forward(&features).unwrap();
        let d_logits = Matrix::new(2, 2, weights.to_vec()).unwrap();
        let analytic = h.backward(&trace, &d_logits).unwrap();

        let eps = 1e-2;
        for i in 0..features.data.len() {
            let mut plus = features.clone();
            plus.data[i] += eps;
            let mut minus = features.clone();
            minus.data[i] -= eps;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * eps);
            assert!(
                (numeric - analytic.data[i]).abs() < 1e-2,
                "{}: numeric {} vs analytic {}",
                i,
                numeric,
                analytic.data[i]
            );
        }
    }

    #[test]
    fn test_width_mismatch() {
        assert!(matches!(
            head().forward(&Matrix::zeros(1, 3)),
            Err(TtaError::Compute(_))
        ));
    }
}
