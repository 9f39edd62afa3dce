//! Trainable-parameter plumbing shared by the merged models

use crate::{Matrix, Result, WeightTensor};
use std::collections::BTreeMap;

/// Named parameter state, as written to checkpoints
pub type StateDict = BTreeMap<String, WeightTensor>;

/// A model with trainable parameters and gradient buffers
pub trait Parameterized {
    /// Visit every trainable parameter together with its accumulated gradient
    fn visit_trainable(&mut self, f: &mut dyn FnMut(&str, &mut [f32], &[f32]));

    /// Reset every gradient buffer to zero
    fn zero_grad(&mut self);

    /// Number of trainable scalars
    fn num_trainable(&self) -> usize;

    /// Full parameter state, frozen tensors included
    fn state_dict(&self) -> StateDict;
}

/// A merged encoder whose forward pass can be differentiated with respect to
/// its trainable parameters
pub trait MergedModel: Parameterized {
    /// Values recorded during forward and consumed by backward
    type Trace;

    /// Pooled features for a batch of images
    fn forward(&self, images: &Matrix) -> Result<(Matrix, Self::Trace)>;

    /// Accumulate parameter gradients given `dL/dfeatures`
    fn backward(&mut self, trace: &Self::Trace, d_features: &Matrix) -> Result<()>;

    /// Width of the pooled features
    fn feature_dim(&self) -> usize;
}
