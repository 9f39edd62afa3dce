//! Adam optimizer over a model's trainable parameters

use fusion_merging::Parameterized;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Adam hyperparameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamConfig {
    /// Learning rate
    pub lr: f32,
    /// First moment decay
    pub beta1: f32,
    /// Second moment decay
    pub beta2: f32,
    /// Denominator epsilon
    pub eps: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

impl AdamConfig {
    pub fn with_lr(lr: f32) -> Self {
        Self {
            lr,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
struct Moments {
    m: Vec<f32>,
    v: Vec<f32>,
}

/// Adam with bias correction; moments are keyed by parameter name
#[derive(Debug, Clone)]
pub struct Adam {
    config: AdamConfig,
    moments: HashMap<String, Moments>,
    steps: usize,
}

impl Adam {
    pub fn new(config: AdamConfig) -> Self {
        Self {
            config,
            moments: HashMap::new(),
            steps: 0,
        }
    }

    pub fn config(&self) -> &AdamConfig {
        &self.config
    }

    /// Number of updates applied
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Apply one update from the gradients accumulated in `model`
    pub fn step<M: Parameterized + ?Sized>(&mut self, model: &mut M) {
        self.steps += 1;
        let AdamConfig {
            lr,
            beta1,
            beta2,
            eps,
        } = self.config;
        let t = self.steps as i32;
        let bc1 = 1.0 - beta1.powi(t);
        let bc2 = 1.0 - beta2.powi(t);
        let moments = &mut self.moments;

        model.visit_trainable(&mut |name, params, grads| {
            let state = moments.entry(name.to_string()).or_insert_with(|| Moments {
                m: vec![0.0; params.len()],
                v: vec![0.0; params.len()],
            });
            for (((p, g), m), v) in params
                .iter_mut()
                .zip(grads)
                .zip(state.m.iter_mut())
                .zip(state.v.iter_mut())
            {
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                let m_hat = *m / bc1;
                let v_hat = *v / bc2;
                *p -= lr * m_hat / (v_hat.sqrt() + eps);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fusion_merging::{StateDict, WeightTensor};

    struct Quadratic {
        x: Vec<f32>,
        grad: Vec<f32>,
    }

    impl Quadratic {
        fn compute_grad(&mut self) {
            // f(x) = sum (x - 3)^2
            self.grad = self.x.iter().map(|x| 2.0 * (x - 3.0)).collect();
        }
    }

    impl Parameterized for Quadratic {
        fn visit_trainable(&mut self, f: &mut dyn FnMut(&str, &mut [f32], &[f32])) {
            f("x", &mut self.x, &self.grad);
        }

        fn zero_grad(&mut self) {
            self.grad.iter_mut().for_each(|g| *g = 0.0);
        }

        fn num_trainable(&self) -> usize {
            self.x.len()
        }

        fn state_dict(&self) -> StateDict {
            let mut s = StateDict::new();
            s.insert(
                "x".into(),
                WeightTensor::new("x", vec![self.x.len()], self.x.clone()).unwrap(),
            );
            s
        }
    }

    #[test]
    fn test_first_step_moves_by_lr() {
        let mut q = Quadratic {
            x: vec![0.0, 5.0],
            grad: vec![0.0; 2],
        };
        q.compute_grad();
        let mut adam = Adam::new(AdamConfig::with_lr(0.1));
        adam.step(&mut q);
        // Bias-corrected first step is lr * sign(g)
        assert!((q.x[0] - 0.1).abs() < 1e-5);
        assert!((q.x[1] - 4.9).abs() < 1e-5);
        assert_eq!(adam.steps(), 1);
    }

    #[test]
    fn test_converges_on_quadratic() {
        let mut q = Quadratic {
            x: vec![0.0, 10.0, -4.0],
            grad: vec![0.0; 3],
        };
        let mut adam = Adam::new(AdamConfig::with_lr(0.1));
        for _ in 0..1000 {
            q.zero_grad();
            q.compute_grad();
            adam.step(&mut q);
        }
        assert!(q.x.iter().all(|x| (x - 3.0).abs() < 0.1), "{:?}", q.x);
    }
}
