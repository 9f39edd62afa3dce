//! Data-adaptive weight ensembling
//!
//! A frozen [`FeatureExtractor`] embeds each input, and a small trainable
//! [`GateNetwork`] maps the embedding to merge coefficients. The merged
//! encoder is then evaluated with those coefficients, either once per batch
//! (coefficients averaged over the batch) or once per sample.

use crate::adamerging::MergeMode;
use crate::encoder::EncoderTrace;
use crate::param::{MergedModel, Parameterized, StateDict};
use crate::{
    Activation, EncoderArch, Matrix, MergeError, ModelWeights, Result, TaskVectorSet,
    VisionEncoder, WeightTensor,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Frozen model producing the gate's input features
pub trait FeatureExtractor: Send + Sync {
    /// Feature width, when the extractor knows it
    fn hidden_size(&self) -> Option<usize>;

    /// Features for a batch of images, `batch x hidden_size`
    fn extract(&self, images: &Matrix) -> Result<Matrix>;
}

impl FeatureExtractor for VisionEncoder {
    fn hidden_size(&self) -> Option<usize> {
        Some(self.arch.output_dim())
    }

    fn extract(&self, images: &Matrix) -> Result<Matrix> {
        self.forward(images)
    }
}

/// Gate construction options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Gate input width; inferred from the extractor when `None`
    pub hidden_size: Option<usize>,
    /// Hidden layers of width `hidden_size` between input and output
    pub gate_hidden_layers: usize,
    /// Initial coefficient produced for every input
    pub init_lambda: f32,
    /// Average coefficients over the batch and merge once
    pub batch_reduce: bool,
    pub merge_mode: MergeMode,
    /// Seed for hidden-layer initialisation
    pub seed: Option<u64>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            hidden_size: None,
            gate_hidden_layers: 1,
            init_lambda: 0.3,
            batch_reduce: true,
            merge_mode: MergeMode::TaskWise,
            seed: None,
        }
    }
}

/// MLP from extractor features to merge coefficients
#[derive(Debug, Clone)]
pub struct GateNetwork {
    arch: EncoderArch,
    weights: ModelWeights,
    grads: Vec<Vec<f32>>,
}

impl GateNetwork {
    /// Hidden layers get `N(0, 1/fan_in)` weights; the output layer starts at
    /// zero weights and `init_lambda` bias so every input maps to `init_lambda`
    pub fn new<R: Rng + ?Sized>(
        hidden_size: usize,
        hidden_layers: usize,
        outputs: usize,
        init_lambda: f32,
        rng: &mut R,
    ) -> Result<Self> {
        let mut dims = vec![hidden_size; hidden_layers + 1];
        dims.push(outputs);
        let arch = EncoderArch::new(dims, Activation::Relu)?;

        let last = arch.num_layers() - 1;
        let mut weights = ModelWeights::new("gate");
        for (l, (inp, out)) in arch
            .layer_dims
            .iter()
            .zip(arch.layer_dims.iter().skip(1))
            .enumerate()
        {
            let (inp, out) = (*inp, *out);
            if l == last {
                weights.add_layer(WeightTensor::zeros(EncoderArch::weight_name(l), vec![out, inp]));
                weights.add_layer(WeightTensor::new(
                    EncoderArch::bias_name(l),
                    vec![out],
                    vec![init_lambda; out],
                )?);
            } else {
                let normal = Normal::new(0.0f32, 1.0 / (inp as f32).sqrt())
                    .map_err(|e| MergeError::ConfigError(e.to_string()))?;
                let data = (0..out * inp).map(|_| normal.sample(rng)).collect();
                weights.add_layer(WeightTensor::new(EncoderArch::weight_name(l), vec![out, inp], data)?);
                weights.add_layer(WeightTensor::zeros(EncoderArch::bias_name(l), vec![out]));
            }
        }

        let grads = arch
            .parameter_shapes()
            .iter()
            .map(|(_, shape)| vec![0.0; shape.iter().product()])
            .collect();

        Ok(Self {
            arch,
            weights,
            grads,
        })
    }

    pub fn arch(&self) -> &EncoderArch {
        &self.arch
    }

    pub fn weights(&self) -> &ModelWeights {
        &self.weights
    }

    pub fn num_outputs(&self) -> usize {
        self.arch.output_dim()
    }

    pub fn forward(&self, features: &Matrix) -> Result<(Matrix, EncoderTrace)> {
        self.arch.forward(&self.weights, features)
    }

    /// Accumulate parameter gradients given `dL/dcoefficients`
    pub fn backward(&mut self, trace: &EncoderTrace, d_coeffs: &Matrix) -> Result<()> {
        let grads = self.arch.backward(&self.weights, trace, d_coeffs)?;
        for (acc, g) in self.grads.iter_mut().zip(grads) {
            for (a, v) in acc.iter_mut().zip(g) {
                *a += v;
            }
        }
        Ok(())
    }
}

/// Trace of one [`DaweModel`] forward pass
#[derive(Debug, Clone)]
pub struct DaweTrace {
    gate: EncoderTrace,
    merges: Vec<(ModelWeights, EncoderTrace)>,
    batch: usize,
}

/// Merged encoder whose coefficients are predicted per input by a gate
pub struct DaweModel {
    mode: MergeMode,
    batch_reduce: bool,
    hidden_size: usize,
    vectors: TaskVectorSet,
    extractor: Arc<dyn FeatureExtractor>,
    gate: GateNetwork,
}

impl std::fmt::Debug for DaweModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaweModel")
            .field("mode", &self.mode)
            .field("batch_reduce", &self.batch_reduce)
            .field("hidden_size", &self.hidden_size)
            .field("num_tasks", &self.vectors.num_tasks())
            .field("gate", &self.gate.arch.layer_dims)
            .finish()
    }
}

impl DaweModel {
    pub fn new(
        vectors: TaskVectorSet,
        extractor: Arc<dyn FeatureExtractor>,
        config: &GateConfig,
    ) -> Result<Self> {
        let hidden_size = config
            .hidden_size
            .or_else(|| extractor.hidden_size())
            .ok_or_else(|| {
                MergeError::ConfigError(
                    "hidden_size not given and the feature extractor does not report one".into(),
                )
            })?;
        if !config.init_lambda.is_finite() {
            return Err(MergeError::ConfigError(format!(
                "init_lambda must be finite, got {}",
                config.init_lambda
            )));
        }

        let outputs = config
            .merge_mode
            .num_coefficients(vectors.num_tasks(), vectors.num_layers());
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let gate = GateNetwork::new(
            hidden_size,
            config.gate_hidden_layers,
            outputs,
            config.init_lambda,
            &mut rng,
        )?;

        info!(
            "DAWE model: {:?}, hidden_size {}, gate {:?}, batch_reduce {}",
            config.merge_mode, hidden_size, gate.arch.layer_dims, config.batch_reduce
        );

        Ok(Self {
            mode: config.merge_mode,
            batch_reduce: config.batch_reduce,
            hidden_size,
            vectors,
            extractor,
            gate,
        })
    }

    pub fn mode(&self) -> MergeMode {
        self.mode
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn gate(&self) -> &GateNetwork {
        &self.gate
    }

    pub fn task_vectors(&self) -> &TaskVectorSet {
        &self.vectors
    }

    /// Gate output for a batch, `batch x K`
    pub fn coefficients(&self, images: &Matrix) -> Result<Matrix> {
        let features = self.extract(images)?;
        Ok(self.gate.forward(&features)?.0)
    }

    fn extract(&self, images: &Matrix) -> Result<Matrix> {
        let features = self.extractor.extract(images)?;
        if features.cols != self.hidden_size || features.rows != images.rows {
            return Err(MergeError::ShapeMismatch {
                expected: vec![images.rows, self.hidden_size],
                got: vec![features.rows, features.cols],
            });
        }
        Ok(features)
    }

    fn merge(&self, coeffs: &[f32]) -> Result<ModelWeights> {
        let layers = self.vectors.num_layers();
        self.vectors
            .merge_with(|t, l| coeffs[self.mode.index(t, l, layers)])
    }

    fn folded_gradients(
        &self,
        weights: &ModelWeights,
        trace: &EncoderTrace,
        d_features: &Matrix,
    ) -> Result<Vec<f32>> {
        let param_grads = self.vectors.arch().backward(weights, trace, d_features)?;
        let per_layer = self.vectors.coefficient_gradients(&param_grads)?;
        Ok(self.mode.fold_gradients(&per_layer))
    }
}

impl Parameterized for DaweModel {
    fn visit_trainable(&mut self, f: &mut dyn FnMut(&str, &mut [f32], &[f32])) {
        let names = self.gate.arch.parameter_names();
        for (p, name) in names.iter().enumerate() {
            if let Some(tensor) = self.gate.weights.layers.get_mut(name) {
                f(&format!("gate.{}", name), &mut tensor.data, &self.gate.grads[p]);
            }
        }
    }

    fn zero_grad(&mut self) {
        for g in &mut self.gate.grads {
            g.iter_mut().for_each(|v| *v = 0.0);
        }
    }

    fn num_trainable(&self) -> usize {
        self.gate.grads.iter().map(Vec::len).sum()
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        for (name, tensor) in &self.gate.weights.layers {
            let key = format!("gate.{}", name);
            state.insert(
                key.clone(),
                WeightTensor {
                    name: key,
                    shape: tensor.shape.clone(),
                    data: tensor.data.clone(),
                },
            );
        }
        for tensor in self.vectors.named_tensors() {
            state.insert(tensor.name.clone(), tensor);
        }
        state
    }
}

impl MergedModel for DaweModel {
    type Trace = DaweTrace;

    fn forward(&self, images: &Matrix) -> Result<(Matrix, DaweTrace)> {
        let features = self.extract(images)?;
        let (coeffs, gate_trace) = self.gate.forward(&features)?;
        let arch = self.vectors.arch();

        if self.batch_reduce {
            let mean = coeffs.mean_rows();
            let weights = self.merge(&mean)?;
            let (out, trace) = arch.forward(&weights, images)?;
            debug!("DAWE batch coefficients: {:?}", mean);
            return Ok((
                out,
                DaweTrace {
                    gate: gate_trace,
                    merges: vec![(weights, trace)],
                    batch: images.rows,
                },
            ));
        }

        let mut out = Matrix::zeros(images.rows, arch.output_dim());
        let mut merges = Vec::with_capacity(images.rows);
        for b in 0..images.rows {
            let weights = self.merge(coeffs.row(b))?;
            let (y, trace) = arch.forward(&weights, &images.select_row(b))?;
            out.row_mut(b).copy_from_slice(y.row(0));
            merges.push((weights, trace));
        }
        Ok((
            out,
            DaweTrace {
                gate: gate_trace,
                merges,
                batch: images.rows,
            },
        ))
    }

    fn backward(&mut self, trace: &DaweTrace, d_features: &Matrix) -> Result<()> {
        if d_features.rows != trace.batch {
            return Err(MergeError::ShapeMismatch {
                expected: vec![trace.batch, self.feature_dim()],
                got: vec![d_features.rows, d_features.cols],
            });
        }
        let k = self.gate.num_outputs();
        let mut d_coeffs = Matrix::zeros(trace.batch, k);

        if self.batch_reduce {
            let (weights, enc) = trace
                .merges
                .first()
                .ok_or_else(|| MergeError::InvalidWeights("Empty DAWE trace".into()))?;
            let folded = self.folded_gradients(weights, enc, d_features)?;
            let inv = 1.0 / trace.batch.max(1) as f32;
            for b in 0..trace.batch {
                for (d, g) in d_coeffs.row_mut(b).iter_mut().zip(&folded) {
                    *d = g * inv;
                }
            }
        } else {
            for (b, (weights, enc)) in trace.merges.iter().enumerate() {
                let folded = self.folded_gradients(weights, enc, &d_features.select_row(b))?;
                d_coeffs.row_mut(b).copy_from_slice(&folded);
            }
        }

        self.gate.backward(&trace.gate, &d_coeffs)
    }

    fn feature_dim(&self) -> usize {
        self.vectors.arch().output_dim()
    }
}
