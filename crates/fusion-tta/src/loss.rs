//! Unsupervised entropy objective

use crate::{Result, TtaError};
use fusion_merging::Matrix;

/// Mean Shannon entropy of the row-wise softmax of `logits`, together with
/// its gradient with respect to the logits
pub fn entropy_loss(logits: &Matrix) -> Result<(f32, Matrix)> {
    if logits.rows == 0 || logits.cols == 0 {
        return Err(TtaError::Compute(format!(
            "Cannot take entropy of {:?} logits",
            logits.shape()
        )));
    }
    if !logits.is_finite() {
        return Err(TtaError::Compute("Non-finite logits".into()));
    }

    let batch = logits.rows as f32;
    let mut grad = Matrix::zeros(logits.rows, logits.cols);
    let mut total = 0.0f32;

    for r in 0..logits.rows {
        let s = logits.row(r);
        let max = s.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let sum: f32 = s.iter().map(|v| (v - max).exp()).sum();
        let log_z = max + sum.ln();

        // log p computed from logits directly so p = 0 never hits ln(0)
        let log_p: Vec<f32> = s.iter().map(|v| v - log_z).collect();
        let h: f32 = -log_p.iter().map(|lp| lp.exp() * lp).sum::<f32>();
        total += h;

        for (g, lp) in grad.row_mut(r).iter_mut().zip(&log_p) {
            *g = -lp.exp() * (lp + h) / batch;
        }
    }

    Ok((total / batch, grad))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_is_max_entropy() {
        let logits = Matrix::new(2, 4, vec![0.0; 8]).unwrap();
        let (loss, grad) = entropy_loss(&logits).unwrap();
        assert!((loss - 4.0f32.ln()).abs() < 1e-5);
        assert!(grad.data.iter().all(|g| g.abs() < 1e-6));
    }

    #[test]
    fn test_confident_is_low_entropy() {
        let logits = Matrix::new(1, 3, vec![100.0, 0.0, 0.0]).unwrap();
        let (loss, grad) = entropy_loss(&logits).unwrap();
        assert!(loss < 1e-6);
        assert!(grad.is_finite());
    }

    #[test]
    fn test_gradient_matches_finite_differences() {
        let logits = Matrix::new(2, 3, vec![0.4, -1.2, 2.0, 0.1, 0.3, -0.5]).unwrap();
        let (_, grad) = entropy_loss(&logits).unwrap();
        let eps = 1e-2;
        for i in 0..logits.data.len() {
            let mut plus = logits.clone();
            plus.data[i] += eps;
            let mut minus = logits.clone();
            minus.data[i] -= eps;
            let numeric =
                (entropy_loss(&plus).unwrap().0 - entropy_loss(&minus).unwrap().0) / (2.0 * eps);
            assert!((numeric - grad.data[i]).abs() < 1e-3, "{}", i);
        }
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(entropy_loss(&Matrix::zeros(0, 3)).is_err());
        assert!(entropy_loss(&Matrix::new(1, 2, vec![f32::NAN, 0.0]).unwrap()).is_err());
    }
}
