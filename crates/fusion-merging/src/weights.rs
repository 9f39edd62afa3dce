//! Named parameter tensors of an encoder

use crate::{MergeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One named parameter, row-major
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Storage precision for task vectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DataType {
    #[default]
    Float32,
    Float16,
    BFloat16,
}

impl DataType {
    /// Accepts `float32`, `fp16`, `bf16`, `torch.bfloat16` and similar spellings
    pub fn parse(s: &str) -> Result<Self> {
        let lowered = s.trim().to_ascii_lowercase();
        match lowered.strip_prefix("torch.").unwrap_or(&lowered) {
            "float32" | "fp32" | "f32" | "float" => Ok(Self::Float32),
            "float16" | "fp16" | "f16" | "half" => Ok(Self::Float16),
            "bfloat16" | "bf16" => Ok(Self::BFloat16),
            _ => Err(MergeError::ConfigError(format!(
                "task_vector_dtype '{}' is not one of float32, float16, bfloat16",
                s
            ))),
        }
    }
}

impl WeightTensor {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(MergeError::ShapeMismatch {
                expected: shape,
                got: vec![data.len()],
            });
        }
        Ok(Self {
            name: name.into(),
            shape,
            data,
        })
    }

    pub fn zeros(name: impl Into<String>, shape: Vec<usize>) -> Self {
        let numel = shape.iter().product();
        Self {
            name: name.into(),
            shape,
            data: vec![0.0; numel],
        }
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// `self - base`, keeping this tensor's name
    pub fn delta_from(&self, base: &Self) -> Result<Self> {
        self.same_shape(base)?;
        Ok(Self {
            name: self.name.clone(),
            shape: self.shape.clone(),
            data: self.data.iter().zip(&base.data).map(|(e, b)| e - b).collect(),
        })
    }

    /// Frobenius inner product
    pub fn dot(&self, other: &Self) -> Result<f32> {
        self.same_shape(other)?;
        Ok(self.data.iter().zip(&other.data).map(|(a, b)| a * b).sum())
    }

    fn same_shape(&self, other: &Self) -> Result<()> {
        if self.shape == other.shape {
            Ok(())
        } else {
            Err(MergeError::ShapeMismatch {
                expected: self.shape.clone(),
                got: other.shape.clone(),
            })
        }
    }
}

/// Every parameter of one model, keyed by tensor name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelWeights {
    pub name: String,
    pub layers: BTreeMap<String, WeightTensor>,
    /// Free-form provenance, e.g. the merge mode of a merged model
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ModelWeights {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Insert (or replace) a tensor under its own name
    pub fn add_layer(&mut self, tensor: WeightTensor) {
        self.layers.insert(tensor.name.clone(), tensor);
    }

    pub fn get_layer(&self, name: &str) -> Option<&WeightTensor> {
        self.layers.get(name)
    }

    /// Tensor `name`, or `MissingLayer` naming both model and tensor
    pub fn require(&self, name: &str) -> Result<&WeightTensor> {
        self.layers
            .get(name)
            .ok_or_else(|| MergeError::MissingLayer(format!("{}: {}", self.name, name)))
    }
}
