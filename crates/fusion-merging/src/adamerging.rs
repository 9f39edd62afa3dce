//! Adaptive merging with learnable task-wise or layer-wise coefficients

use crate::encoder::EncoderTrace;
use crate::param::{MergedModel, Parameterized, StateDict};
use crate::{
    DataType, Matrix, MergeError, ModelWeights, Result, TaskVectorSet, VisionEncoder,
    WeightTensor,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Granularity of the mixing coefficients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// One scalar per task, shared by every merged tensor
    #[default]
    TaskWise,
    /// One scalar per task and merged tensor
    LayerWise,
}

impl MergeMode {
    /// Number of coefficients for `num_tasks` experts over `num_layers` tensors
    pub fn num_coefficients(&self, num_tasks: usize, num_layers: usize) -> usize {
        match self {
            Self::TaskWise => num_tasks,
            Self::LayerWise => num_tasks * num_layers,
        }
    }

    /// Shape of the coefficient tensor
    pub fn coefficient_shape(&self, num_tasks: usize, num_layers: usize) -> Vec<usize> {
        match self {
            Self::TaskWise => vec![num_tasks],
            Self::LayerWise => vec![num_tasks, num_layers],
        }
    }

    /// Coefficient of task `t` for tensor `l` in a flat coefficient vector
    #[inline]
    pub fn index(&self, t: usize, l: usize, num_layers: usize) -> usize {
        match self {
            Self::TaskWise => t,
            Self::LayerWise => t * num_layers + l,
        }
    }

    /// Fold per-(task, tensor) gradients into the flat coefficient layout
    pub fn fold_gradients(&self, per_layer: &[Vec<f32>]) -> Vec<f32> {
        match self {
            Self::TaskWise => per_layer.iter().map(|g| g.iter().sum()).collect(),
            Self::LayerWise => per_layer.iter().flatten().copied().collect(),
        }
    }
}

/// Trace of one [`AdaMergedModel`] forward pass
#[derive(Debug, Clone)]
pub struct AdaTrace {
    weights: ModelWeights,
    encoder: EncoderTrace,
}

/// Base model plus task vectors blended by trainable coefficients
#[derive(Debug, Clone)]
pub struct AdaMergedModel {
    mode: MergeMode,
    vectors: TaskVectorSet,
    merge_weight: WeightTensor,
    grad: Vec<f32>,
}

impl AdaMergedModel {
    /// Name of the coefficient tensor in the state dict
    pub const MERGE_WEIGHT: &'static str = "merge_weight";

    pub fn new(vectors: TaskVectorSet, mode: MergeMode, init_lambda: f32) -> Result<Self> {
        if !init_lambda.is_finite() {
            return Err(MergeError::ConfigError(format!(
                "init_lambda must be finite, got {}",
                init_lambda
            )));
        }
        let shape = mode.coefficient_shape(vectors.num_tasks(), vectors.num_layers());
        let n: usize = shape.iter().product();
        let merge_weight = WeightTensor::new(Self::MERGE_WEIGHT, shape, vec![init_lambda; n])?;

        debug!(
            "AdaMerging model: {:?}, {} tasks, {} tensors, {} coefficients",
            mode,
            vectors.num_tasks(),
            vectors.num_layers(),
            n
        );

        Ok(Self {
            mode,
            vectors,
            merge_weight,
            grad: vec![0.0; n],
        })
    }

    /// Build task vectors from a base and experts, then wrap them
    pub fn from_models(
        base: &VisionEncoder,
        experts: &[VisionEncoder],
        mode: MergeMode,
        init_lambda: f32,
        dtype: DataType,
    ) -> Result<Self> {
        let vectors = TaskVectorSet::new(base, experts, dtype)?;
        Self::new(vectors, mode, init_lambda)
    }

    pub fn mode(&self) -> MergeMode {
        self.mode
    }

    pub fn task_vectors(&self) -> &TaskVectorSet {
        &self.vectors
    }

    /// Current coefficients
    pub fn merge_weight(&self) -> &WeightTensor {
        &self.merge_weight
    }

    /// Accumulated coefficient gradients
    pub fn merge_weight_grad(&self) -> &[f32] {
        &self.grad
    }

    /// Overwrite the coefficients (e.g. when restoring exported merging weights)
    pub fn set_merge_weight(&mut self, values: Vec<f32>) -> Result<()> {
        if values.len() != self.merge_weight.numel() {
            return Err(MergeError::ShapeMismatch {
                expected: self.merge_weight.shape.clone(),
                got: vec![values.len()],
            });
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(MergeError::Numerical("Non-finite merge weight".into()));
        }
        self.merge_weight.data = values;
        Ok(())
    }

    /// Coefficients grouped per task, for export
    pub fn merging_weights(&self) -> Vec<Vec<f32>> {
        let per_task = self.merge_weight.numel() / self.vectors.num_tasks().max(1);
        self.merge_weight
            .data
            .chunks(per_task.max(1))
            .map(<[f32]>::to_vec)
            .collect()
    }

    /// Coefficient applied to task `t` on tensor `l`
    pub fn coefficient(&self, t: usize, l: usize) -> f32 {
        self.merge_weight.data[self.mode.index(t, l, self.vectors.num_layers())]
    }

    /// Effective weights under the current coefficients
    pub fn merged_weights(&self) -> Result<ModelWeights> {
        self.vectors.merge_with(|t, l| self.coefficient(t, l))
    }

    /// Bake the current coefficients into a plain encoder
    pub fn merge_and_unload(&self) -> Result<VisionEncoder> {
        let mut weights = self.merged_weights()?;
        weights.metadata.insert("merge_mode".into(), format!("{:?}", self.mode));
        VisionEncoder::new(self.vectors.arch().clone(), weights)
    }
}

impl Parameterized for AdaMergedModel {
    fn visit_trainable(&mut self, f: &mut dyn FnMut(&str, &mut [f32], &[f32])) {
        f(Self::MERGE_WEIGHT, &mut self.merge_weight.data, &self.grad);
    }

    fn zero_grad(&mut self) {
        self.grad.iter_mut().for_each(|g| *g = 0.0);
    }

    fn num_trainable(&self) -> usize {
        self.merge_weight.numel()
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        state.insert(Self::MERGE_WEIGHT.to_string(), self.merge_weight.clone());
        for tensor in self.vectors.named_tensors() {
            state.insert(tensor.name.clone(), tensor);
        }
        state
    }
}

impl MergedModel for AdaMergedModel {
    type Trace = AdaTrace;

    fn forward(&self, images: &Matrix) -> Result<(Matrix, AdaTrace)> {
        let weights = self.merged_weights()?;
        let (features, encoder) = self.vectors.arch().forward(&weights, images)?;
        Ok((features, AdaTrace { weights, encoder }))
    }

    fn backward(&mut self, trace: &AdaTrace, d_features: &Matrix) -> Result<()> {
        let param_grads = self
            .vectors
            .arch()
            .backward(&trace.weights, &trace.encoder, d_features)?;
        let per_layer = self.vectors.coefficient_gradients(&param_grads)?;
        let folded = self.mode.fold_gradients(&per_layer);
        for (g, d) in self.grad.iter_mut().zip(folded) {
            *g += d;
        }
        Ok(())
    }

    fn feature_dim(&self) -> usize {
        self.vectors.arch().output_dim()
    }
}
