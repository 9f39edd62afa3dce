//! Dense row-major matrices for batched activations

use crate::{MergeError, Result};
use serde::{Deserialize, Serialize};

/// Row-major `rows x cols` matrix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

impl Matrix {
    /// Create a matrix from row-major data
    pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(MergeError::ShapeMismatch {
                expected: vec![rows, cols],
                got: vec![data.len()],
            });
        }
        Ok(Self { rows, cols, data })
    }

    /// Zero matrix
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Stack equally sized rows
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let cols = rows.first().map(|r| r.len()).unwrap_or(0);
        let mut data = Vec::with_capacity(rows.len() * cols);
        for row in rows {
            if row.len() != cols {
                return Err(MergeError::ShapeMismatch {
                    expected: vec![cols],
                    got: vec![row.len()],
                });
            }
            data.extend_from_slice(row);
        }
        Ok(Self {
            rows: rows.len(),
            cols,
            data,
        })
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn row(&self, r: usize) -> &[f32] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn row_mut(&mut self, r: usize) -> &mut [f32] {
        &mut self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn get(&self, r: usize, c: usize) -> f32 {
        self.data[r * self.cols + c]
    }

    /// Copy a single row out as a `1 x cols` matrix
    pub fn select_row(&self, r: usize) -> Self {
        Self {
            rows: 1,
            cols: self.cols,
            data: self.row(r).to_vec(),
        }
    }

    /// `self · wᵀ` where `w` is `out x in` row-major (the layout of a dense layer weight)
    pub fn matmul_t(&self, w: &[f32], out: usize) -> Result<Self> {
        let inp = self.cols;
        if w.len() != out * inp {
            return Err(MergeError::ShapeMismatch {
                expected: vec![out, inp],
                got: vec![w.len()],
            });
        }
        let mut result = Self::zeros(self.rows, out);
        for r in 0..self.rows {
            let x = self.row(r);
            let y = result.row_mut(r);
            for (o, yo) in y.iter_mut().enumerate() {
                let w_row = &w[o * inp..(o + 1) * inp];
                *yo = x.iter().zip(w_row).map(|(a, b)| a * b).sum();
            }
        }
        Ok(result)
    }

    /// `self · w` where `w` is `rows_w x cols_w` row-major and `self.cols == rows_w`
    pub fn matmul(&self, w: &[f32], cols_w: usize) -> Result<Self> {
        let inner = self.cols;
        if w.len() != inner * cols_w {
            return Err(MergeError::ShapeMismatch {
                expected: vec![inner, cols_w],
                got: vec![w.len()],
            });
        }
        let mut result = Self::zeros(self.rows, cols_w);
        for r in 0..self.rows {
            let x = self.row(r);
            let y = result.row_mut(r);
            for (k, &xk) in x.iter().enumerate() {
                if xk == 0.0 {
                    continue;
                }
                let w_row = &w[k * cols_w..(k + 1) * cols_w];
                for (yj, wj) in y.iter_mut().zip(w_row) {
                    *yj += xk * wj;
                }
            }
        }
        Ok(result)
    }

    /// Add a bias vector to every row
    pub fn add_row_vector(&mut self, bias: &[f32]) -> Result<()> {
        if bias.len() != self.cols {
            return Err(MergeError::ShapeMismatch {
                expected: vec![self.cols],
                got: vec![bias.len()],
            });
        }
        for r in 0..self.rows {
            for (v, b) in self.row_mut(r).iter_mut().zip(bias) {
                *v += b;
            }
        }
        Ok(())
    }

    /// Column means (reduces over rows)
    pub fn mean_rows(&self) -> Vec<f32> {
        let mut mean = vec![0.0; self.cols];
        if self.rows == 0 {
            return mean;
        }
        for r in 0..self.rows {
            for (m, v) in mean.iter_mut().zip(self.row(r)) {
                *m += v;
            }
        }
        let n = self.rows as f32;
        mean.iter_mut().for_each(|m| *m /= n);
        mean
    }

    /// Transpose
    pub fn transpose(&self) -> Self {
        let mut t = Self::zeros(self.cols, self.rows);
        for r in 0..self.rows {
            for c in 0..self.cols {
                t.data[c * self.rows + r] = self.data[r * self.cols + c];
            }
        }
        t
    }

    /// True if every element is finite
    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }
}

/// L2 norm of a vector
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Normalize a vector in place, clamping the norm from below by `eps`
pub fn normalize_in_place(v: &mut [f32], eps: f32) -> f32 {
    let norm = l2_norm(v).max(eps);
    v.iter_mut().for_each(|x| *x /= norm);
    norm
}
