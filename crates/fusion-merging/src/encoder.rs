//! Dense feature encoder with explicit backward pass
//!
//! Every model in a merge pool shares one [`EncoderArch`]: a stack of dense
//! layers whose parameters are named `layers.{i}.weight` (`out x in`) and
//! `layers.{i}.bias` (`out`). Hidden layers apply the configured activation,
//! the last layer is linear and produces the pooled features.

use crate::{Matrix, MergeError, ModelWeights, Result, WeightTensor};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

const GELU_K: f32 = 0.797_884_6; // sqrt(2/pi)
const GELU_C: f32 = 0.044_715;

/// Hidden-layer nonlinearity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Identity,
    #[default]
    Relu,
    Tanh,
    /// Tanh approximation of GELU
    Gelu,
}

impl Activation {
    #[inline]
    pub fn apply(&self, z: f32) -> f32 {
        match self {
            Self::Identity => z,
            Self::Relu => z.max(0.0),
            Self::Tanh => z.tanh(),
            Self::Gelu => 0.5 * z * (1.0 + (GELU_K * (z + GELU_C * z * z * z)).tanh()),
        }
    }

    /// Derivative with respect to the pre-activation
    #[inline]
    pub fn derivative(&self, z: f32) -> f32 {
        match self {
            Self::Identity => 1.0,
            Self::Relu => {
                if z > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Tanh => {
                let t = z.tanh();
                1.0 - t * t
            }
            Self::Gelu => {
                let t = (GELU_K * (z + GELU_C * z * z * z)).tanh();
                0.5 * (1.0 + t) + 0.5 * z * (1.0 - t * t) * GELU_K * (1.0 + 3.0 * GELU_C * z * z)
            }
        }
    }
}

/// Layer layout shared by every model in a pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderArch {
    /// `[input, hidden..., output]`
    pub layer_dims: Vec<usize>,
    /// Activation after each hidden layer
    #[serde(default)]
    pub activation: Activation,
}

/// Intermediate values recorded by [`EncoderArch::forward`]
#[derive(Debug, Clone)]
pub struct EncoderTrace {
    inputs: Vec<Matrix>,
    pre_activations: Vec<Matrix>,
}

impl EncoderArch {
    pub fn new(layer_dims: Vec<usize>, activation: Activation) -> Result<Self> {
        if layer_dims.len() < 2 {
            return Err(MergeError::ConfigError(
                "Encoder needs at least an input and an output dimension".into(),
            ));
        }
        if layer_dims.contains(&0) {
            return Err(MergeError::ConfigError(format!(
                "Zero-sized layer in {:?}",
                layer_dims
            )));
        }
        Ok(Self {
            layer_dims,
            activation,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layer_dims.len().saturating_sub(1)
    }

    pub fn input_dim(&self) -> usize {
        self.layer_dims[0]
    }

    pub fn output_dim(&self) -> usize {
        self.layer_dims[self.layer_dims.len() - 1]
    }

    pub fn weight_name(layer: usize) -> String {
        format!("layers.{}.weight", layer)
    }

    pub fn bias_name(layer: usize) -> String {
        format!("layers.{}.bias", layer)
    }

    /// Parameter names in merge order
    pub fn parameter_names(&self) -> Vec<String> {
        (0..self.num_layers())
            .flat_map(|l| [Self::weight_name(l), Self::bias_name(l)])
            .collect()
    }

    /// Parameter names with their shapes, in merge order
    pub fn parameter_shapes(&self) -> Vec<(String, Vec<usize>)> {
        (0..self.num_layers())
            .flat_map(|l| {
                let (inp, out) = (self.layer_dims[l], self.layer_dims[l + 1]);
                [
                    (Self::weight_name(l), vec![out, inp]),
                    (Self::bias_name(l), vec![out]),
                ]
            })
            .collect()
    }

    /// Check that `weights` holds every parameter with the right shape
    pub fn validate(&self, weights: &ModelWeights) -> Result<()> {
        for (name, shape) in self.parameter_shapes() {
            let tensor = weights.require(&name)?;
            if tensor.shape != shape {
                return Err(MergeError::ShapeMismatch {
                    expected: shape,
                    got: tensor.shape.clone(),
                });
            }
        }
        Ok(())
    }

    /// Random weights, `N(0, 1/fan_in)` for matrices and zero biases
    pub fn random_weights<R: Rng + ?Sized>(&self, name: &str, rng: &mut R) -> ModelWeights {
        let mut weights = ModelWeights::new(name);
        for (param, shape) in self.parameter_shapes() {
            let tensor = if shape.len() == 2 {
                let std = 1.0 / (shape[1] as f32).sqrt();
                let data = (0..shape[0] * shape[1])
                    .map(|_| {
                        let z: f32 = StandardNormal.sample(rng);
                        z * std
                    })
                    .collect();
                WeightTensor {
                    name: param,
                    shape,
                    data,
                }
            } else {
                WeightTensor::zeros(param, shape)
            };
            weights.add_layer(tensor);
        }
        weights
    }

    /// Forward pass recording what [`backward`](Self::backward) needs
    pub fn forward(&self, weights: &ModelWeights, input: &Matrix) -> Result<(Matrix, EncoderTrace)> {
        if input.cols != self.input_dim() {
            return Err(MergeError::ShapeMismatch {
                expected: vec![input.rows, self.input_dim()],
                got: vec![input.rows, input.cols],
            });
        }

        let layers = self.num_layers();
        let mut trace = EncoderTrace {
            inputs: Vec::with_capacity(layers),
            pre_activations: Vec::with_capacity(layers),
        };
        let mut x = input.clone();

        for l in 0..layers {
            let out = self.layer_dims[l + 1];
            let w = weights.require(&Self::weight_name(l))?;
            let b = weights.require(&Self::bias_name(l))?;

            let mut z = x.matmul_t(&w.data, out)?;
            z.add_row_vector(&b.data)?;

            let next = if l + 1 < layers {
                let mut a = z.clone();
                a.data.iter_mut().for_each(|v| *v = self.activation.apply(*v));
                a
            } else {
                z.clone()
            };

            trace.inputs.push(x);
            trace.pre_activations.push(z);
            x = next;
        }

        Ok((x, trace))
    }

    /// Gradients of every parameter (in [`parameter_names`](Self::parameter_names)
    /// order) given the gradient of the loss with respect to the output
    pub fn backward(
        &self,
        weights: &ModelWeights,
        trace: &EncoderTrace,
        d_output: &Matrix,
    ) -> Result<Vec<Vec<f32>>> {
        let layers = self.num_layers();
        if trace.inputs.len() != layers {
            return Err(MergeError::InvalidWeights(
                "Trace does not match encoder depth".into(),
            ));
        }
        if d_output.cols != self.output_dim() || d_output.rows != trace.inputs[0].rows {
            return Err(MergeError::ShapeMismatch {
                expected: vec![trace.inputs[0].rows, self.output_dim()],
                got: vec![d_output.rows, d_output.cols],
            });
        }

        let mut grads = vec![Vec::new(); 2 * layers];
        let mut grad = d_output.clone();

        for l in (0..layers).rev() {
            let (inp, out) = (self.layer_dims[l], self.layer_dims[l + 1]);

            if l + 1 < layers {
                for (g, z) in grad.data.iter_mut().zip(&trace.pre_activations[l].data) {
                    *g *= self.activation.derivative(*z);
                }
            }

            let x = &trace.inputs[l];
            let mut dw = vec![0.0f32; out * inp];
            let mut db = vec![0.0f32; out];
            for r in 0..grad.rows {
                let g = grad.row(r);
                let xr = x.row(r);
                for (o, &go) in g.iter().enumerate() {
                    if go == 0.0 {
                        continue;
                    }
                    db[o] += go;
                    for (dwi, xi) in dw[o * inp..(o + 1) * inp].iter_mut().zip(xr) {
                        *dwi += go * xi;
                    }
                }
            }
            grads[2 * l] = dw;
            grads[2 * l + 1] = db;

            if l > 0 {
                let w = weights.require(&Self::weight_name(l))?;
                grad = grad.matmul(&w.data, inp)?;
            }
        }

        Ok(grads)
    }
}

/// A concrete encoder: an architecture plus one set of weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionEncoder {
    pub arch: EncoderArch,
    pub weights: ModelWeights,
}

impl VisionEncoder {
    pub fn new(arch: EncoderArch, weights: ModelWeights) -> Result<Self> {
        arch.validate(&weights)?;
        Ok(Self { arch, weights })
    }

    pub fn name(&self) -> &str {
        &self.weights.name
    }

    /// Pooled features, `batch x output_dim`
    pub fn forward(&self, images: &Matrix) -> Result<Matrix> {
        Ok(self.arch.forward(&self.weights, images)?.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn loss(y: &Matrix) -> f32 {
        // Weighted sum so every output contributes a distinct gradient
        y.data
            .iter()
            .enumerate()
            .map(|(i, v)| v * (i as f32 * 0.1 + 0.3))
            .sum()
    }

    #[test]
    fn test_parameter_names() {
        let arch = EncoderArch::new(vec![4, 3, 2], Activation::Relu).unwrap();
        assert_eq!(
            arch.parameter_names(),
            vec![
                "layers.0.weight",
                "layers.0.bias",
                "layers.1.weight",
                "layers.1.bias"
            ]
        );
        assert_eq!(arch.parameter_shapes()[2].1, vec![2, 3]);
    }

    #[test]
    fn test_invalid_arch() {
        assert!(EncoderArch::new(vec![4], Activation::Relu).is_err());
        assert!(EncoderArch::new(vec![4, 0, 2], Activation::Relu).is_err());
    }

    #[test]
    fn test_forward_shape() {
        let arch = EncoderArch::new(vec![4, 8, 3], Activation::Gelu).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let encoder = VisionEncoder::new(arch.clone(), arch.random_weights("m", &mut rng)).unwrap();
        let x = Matrix::new(5, 4, vec![0.5; 20]).unwrap();
        let y = encoder.forward(&x).unwrap();
        assert_eq!(y.shape(), (5, 3));
    }

    #[test]
    fn test_validate_rejects_wrong_shape() {
        let arch = EncoderArch::new(vec![2, 2], Activation::Identity).unwrap();
        let mut weights = ModelWeights::new("m");
        weights.add_layer(WeightTensor::zeros("layers.0.weight", vec![3, 2]));
        weights.add_layer(WeightTensor::zeros("layers.0.bias", vec![2]));
        assert!(matches!(
            VisionEncoder::new(arch, weights),
            Err(MergeError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        let arch = EncoderArch::new(vec![3, 4, 2], Activation::Tanh).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let mut weights = arch.random_weights("m", &mut rng);
        for tensor in weights.layers.values_mut() {
            for (i, v) in tensor.data.iter_mut().enumerate() {
                *v += 0.05 * (i as f32).sin();
            }
        }
        let x = Matrix::new(2, 3, vec![0.3, -0.2, 0.8, -0.5, 0.1, 0.4]).unwrap();

        let (y, trace) = arch.forward(&weights, &x).unwrap();
        let d_out = Matrix::new(
            y.rows,
            y.cols,
            (0..y.data.len()).map(|i| i as f32 * 0.1 + 0.3).collect(),
        )
        .unwrap();
        let grads = arch.backward(&weights, &trace, &d_out).unwrap();

        let eps = 1e-2;
        for (p, name) in arch.parameter_names().iter().enumerate() {
            for idx in 0..weights.layers[name].data.len() {
                let mut plus = weights.clone();
                plus.layers.get_mut(name).unwrap().data[idx] += eps;
                let mut minus = weights.clone();
                minus.layers.get_mut(name).unwrap().data[idx] -= eps;
                let numeric = (loss(&arch.forward(&plus, &x).unwrap().0)
                    - loss(&arch.forward(&minus, &x).unwrap().0))
                    / (2.0 * eps);
                let analytic = grads[p][idx];
                assert!(
                    (numeric - analytic).abs() < 1e-2,
                    "{}[{}]: numeric {} vs analytic {}",
                    name,
                    idx,
                    numeric,
                    analytic
                );
            }
        }
    }

    #[test]
    fn test_activation_derivatives() {
        for act in [Activation::Relu, Activation::Tanh, Activation::Gelu] {
            for &z in &[-1.3f32, -0.2, 0.4, 1.7] {
                let h = 1e-3;
                let numeric = (act.apply(z + h) - act.apply(z - h)) / (2.0 * h);
                assert!((numeric - act.derivative(z)).abs() < 1e-2, "{:?} at {}", act, z);
            }
        }
    }
}
