//! Task vectors: frozen expert-minus-base deltas
//!
//! Deltas are computed once at construction and may be stored at reduced
//! precision. Merged weights are always materialized into fresh buffers; the
//! stored base and deltas are never written after construction.

use crate::{DataType, EncoderArch, MergeError, ModelWeights, Result, VisionEncoder, WeightTensor};
use half::{bf16, f16};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Delta values in their storage precision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoredTensor {
    F32(Vec<f32>),
    F16(Vec<f16>),
    BF16(Vec<bf16>),
}

impl StoredTensor {
    pub fn from_f32(data: &[f32], dtype: DataType) -> Self {
        match dtype {
            DataType::Float32 => Self::F32(data.to_vec()),
            DataType::Float16 => Self::F16(data.iter().map(|&v| f16::from_f32(v)).collect()),
            DataType::BFloat16 => Self::BF16(data.iter().map(|&v| bf16::from_f32(v)).collect()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::F32(v) => v.len(),
            Self::F16(v) => v.len(),
            Self::BF16(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DataType {
        match self {
            Self::F32(_) => DataType::Float32,
            Self::F16(_) => DataType::Float16,
            Self::BF16(_) => DataType::BFloat16,
        }
    }

    pub fn to_f32(&self) -> Vec<f32> {
        match self {
            Self::F32(v) => v.clone(),
            Self::F16(v) => v.iter().map(|x| x.to_f32()).collect(),
            Self::BF16(v) => v.iter().map(|x| x.to_f32()).collect(),
        }
    }

    /// `out += coeff * self`
    pub fn axpy(&self, coeff: f32, out: &mut [f32]) {
        if coeff == 0.0 {
            return;
        }
        match self {
            Self::F32(v) => out.iter_mut().zip(v).for_each(|(o, x)| *o += coeff * x),
            Self::F16(v) => out
                .iter_mut()
                .zip(v)
                .for_each(|(o, x)| *o += coeff * x.to_f32()),
            Self::BF16(v) => out
                .iter_mut()
                .zip(v)
                .for_each(|(o, x)| *o += coeff * x.to_f32()),
        }
    }

    pub fn dot(&self, other: &[f32]) -> f32 {
        match self {
            Self::F32(v) => v.iter().zip(other).map(|(a, b)| a * b).sum(),
            Self::F16(v) => v.iter().zip(other).map(|(a, b)| a.to_f32() * b).sum(),
            Self::BF16(v) => v.iter().zip(other).map(|(a, b)| a.to_f32() * b).sum(),
        }
    }
}

/// Deltas of one expert, one entry per merged parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskVector {
    /// Task (expert model) name
    pub task: String,
    tensors: Vec<StoredTensor>,
}

impl TaskVector {
    pub fn tensors(&self) -> &[StoredTensor] {
        &self.tensors
    }
}

/// Frozen base weights plus one task vector per expert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskVectorSet {
    arch: EncoderArch,
    param_names: Vec<String>,
    base: ModelWeights,
    task_vectors: Vec<TaskVector>,
    dtype: DataType,
}

impl TaskVectorSet {
    /// Compute `expert - base` for every expert and every parameter
    pub fn new(base: &VisionEncoder, experts: &[VisionEncoder], dtype: DataType) -> Result<Self> {
        if experts.is_empty() {
            return Err(MergeError::InvalidWeights("No expert models provided".into()));
        }

        let arch = base.arch.clone();
        arch.validate(&base.weights)?;
        let param_names = arch.parameter_names();

        let mut task_vectors = Vec::with_capacity(experts.len());
        for expert in experts {
            if expert.arch != arch {
                return Err(MergeError::IncompatibleModels(format!(
                    "{} has layout {:?}, base has {:?}",
                    expert.name(),
                    expert.arch.layer_dims,
                    arch.layer_dims
                )));
            }
            arch.validate(&expert.weights)?;

            let tensors = param_names
                .iter()
                .map(|name| {
                    let delta = expert.weights.require(name)?.delta_from(base.weights.require(name)?)?;
                    Ok(StoredTensor::from_f32(&delta.data, dtype))
                })
                .collect::<Result<Vec<_>>>()?;

            debug!(
                "Computed task vector for '{}' ({} tensors, {:?})",
                expert.name(),
                tensors.len(),
                dtype
            );
            task_vectors.push(TaskVector {
                task: expert.name().to_string(),
                tensors,
            });
        }

        Ok(Self {
            arch,
            param_names,
            base: base.weights.clone(),
            task_vectors,
            dtype,
        })
    }

    pub fn arch(&self) -> &EncoderArch {
        &self.arch
    }

    pub fn base(&self) -> &ModelWeights {
        &self.base
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn task_vectors(&self) -> &[TaskVector] {
        &self.task_vectors
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.task_vectors.iter().map(|tv| tv.task.as_str()).collect()
    }

    pub fn num_tasks(&self) -> usize {
        self.task_vectors.len()
    }

    /// Number of merged parameter tensors (the "layers" of layer-wise merging)
    pub fn num_layers(&self) -> usize {
        self.param_names.len()
    }

    pub fn param_names(&self) -> &[String] {
        &self.param_names
    }

    /// Materialize `base + Σ_t coeff(t, l) · δ_{t,l}` into new weights
    pub fn merge_with<F>(&self, coeff: F) -> Result<ModelWeights>
    where
        F: Fn(usize, usize) -> f32,
    {
        let mut merged = ModelWeights::new("merged");
        for (l, name) in self.param_names.iter().enumerate() {
            let base = self.base.require(name)?;
            let mut data = base.data.clone();
            for (t, tv) in self.task_vectors.iter().enumerate() {
                tv.tensors[l].axpy(coeff(t, l), &mut data);
            }
            merged.add_layer(WeightTensor {
                name: name.clone(),
                shape: base.shape.clone(),
                data,
            });
        }
        Ok(merged)
    }

    /// `dL/dλ_{t,l} = <dL/dW_l, δ_{t,l}>` for every task and parameter
    pub fn coefficient_gradients(&self, param_grads: &[Vec<f32>]) -> Result<Vec<Vec<f32>>> {
        if param_grads.len() != self.param_names.len() {
            return Err(MergeError::ShapeMismatch {
                expected: vec![self.param_names.len()],
                got: vec![param_grads.len()],
            });
        }
        Ok(self
            .task_vectors
            .iter()
            .map(|tv| {
                tv.tensors
                    .iter()
                    .zip(param_grads)
                    .map(|(delta, grad)| delta.dot(grad))
                    .collect()
            })
            .collect())
    }

    /// Named tensors for checkpointing (`pretrained_model.*`, `task_vectors.{t}.*`)
    pub fn named_tensors(&self) -> Vec<WeightTensor> {
        let mut out = Vec::new();
        for name in &self.param_names {
            if let Some(t) = self.base.get_layer(name) {
                out.push(WeightTensor {
                    name: format!("pretrained_model.{}", name),
                    shape: t.shape.clone(),
                    data: t.data.clone(),
                });
            }
        }
        for (t, tv) in self.task_vectors.iter().enumerate() {
            for (name, delta) in self.param_names.iter().zip(&tv.tensors) {
                let shape = self
                    .base
                    .get_layer(name)
                    .map(|b| b.shape.clone())
                    .unwrap_or_else(|| vec![delta.len()]);
                out.push(WeightTensor {
                    name: format!("task_vectors.{}.{}", t, name),
                    shape,
                    data: delta.to_f32(),
                });
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Activation;

    fn encoder(name: &str, w: [f32; 4], b: [f32; 2]) -> VisionEncoder {
        let arch = EncoderArch::new(vec![2, 2], Activation::Identity).unwrap();
        let mut weights = ModelWeights::new(name);
        weights.add_layer(WeightTensor::new("layers.0.weight", vec![2, 2], w.to_vec()).unwrap());
        weights.add_layer(WeightTensor::new("layers.0.bias", vec![2], b.to_vec()).unwrap());
        VisionEncoder::new(arch, weights).unwrap()
    }

    #[test]
    fn test_deltas() {
        let base = encoder("base", [1.0, 0.0, 0.0, 1.0], [0.0, 0.0]);
        let a = encoder("a", [2.0, 0.0, 0.0, 1.0], [1.0, 0.0]);
        let set = TaskVectorSet::new(&base, &[a], DataType::Float32).unwrap();

        assert_eq!(set.num_tasks(), 1);
        assert_eq!(set.num_layers(), 2);
        assert_eq!(set.task_names(), vec!["a"]);
        assert_eq!(
            set.task_vectors()[0].tensors()[0].to_f32(),
            vec![1.0, 0.0, 0.0, 0.0]
        );
    }

    #[test]
    fn test_merge_with_coefficients() {
        let base = encoder("base", [1.0, 0.0, 0.0, 1.0], [0.0, 0.0]);
        let a = encoder("a", [3.0, 0.0, 0.0, 1.0], [0.0, 0.0]);
        let b = encoder("b", [1.0, 0.0, 0.0, 5.0], [0.0, 2.0]);
        let set = TaskVectorSet::new(&base, &[a, b], DataType::Float32).unwrap();

        let merged = set.merge_with(|t, _| if t == 0 { 0.5 } else { 0.25 }).unwrap();
        assert_eq!(merged.layers["layers.0.weight"].data, vec![2.0, 0.0, 0.0, 2.0]);
        assert_eq!(merged.layers["layers.0.bias"].data, vec![0.0, 0.5]);

        // Stored base untouched
        assert_eq!(set.base().layers["layers.0.weight"].data, vec![1.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_zero_coefficients_reproduce_base() {
        let base = encoder("base", [0.3, -0.1, 0.7, 0.2], [0.1, -0.2]);
        let a = encoder("a", [1.3, 0.4, -0.2, 0.9], [0.0, 0.5]);
        let set = TaskVectorSet::new(&base, &[a], DataType::Float32).unwrap();
        let merged = set.merge_with(|_, _| 0.0).unwrap();
        for name in set.param_names() {
            assert_eq!(merged.layers[name].data, base.weights.layers[name].data);
        }
    }

    #[test]
    fn test_half_precision_storage() {
        let base = encoder("base", [0.0; 4], [0.0; 2]);
        let a = encoder("a", [0.1, 0.2, 0.3, 0.4], [0.5, 0.6]);
        let set = TaskVectorSet::new(&base, &[a], DataType::Float16).unwrap();
        let delta = &set.task_vectors()[0].tensors()[0];
        assert_eq!(delta.dtype(), DataType::Float16);
        for (got, want) in delta.to_f32().iter().zip([0.1, 0.2, 0.3, 0.4]) {
            assert!((got - want).abs() < 1e-3);
        }
    }

    #[test]
    fn test_incompatible_expert() {
        let base = encoder("base", [0.0; 4], [0.0; 2]);
        let arch = EncoderArch::new(vec![2, 3], Activation::Identity).unwrap();
        let mut weights = ModelWeights::new("wide");
        weights.add_layer(WeightTensor::zeros("layers.0.weight", vec![3, 2]));
        weights.add_layer(WeightTensor::zeros("layers.0.bias", vec![3]));
        let wide = VisionEncoder::new(arch, weights).unwrap();
        assert!(matches!(
            TaskVectorSet::new(&base, &[wide], DataType::Float32),
            Err(MergeError::IncompatibleModels(_))
        ));
        assert!(TaskVectorSet::new(&base, &[], DataType::Float32).is_err());
    }

    #[test]
    fn test_coefficient_gradients() {
        let base = encoder("base", [0.0; 4], [0.0; 2]);
        let a = encoder("a", [1.0, 2.0, 3.0, 4.0], [1.0, 1.0]);
        let set = TaskVectorSet::new(&base, &[a], DataType::Float32).unwrap();
        let grads = vec![vec![1.0, 0.0, 0.0, 1.0], vec![2.0, 3.0]];
        let out = set.coefficient_gradients(&grads).unwrap();
        assert_eq!(out, vec![vec![5.0, 5.0]]);
        assert!(set.coefficient_gradients(&grads[..1]).is_err());
    }
}
