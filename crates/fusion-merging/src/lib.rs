// Test modules have minor lints that don't affect production code
#![cfg_attr(test, allow(clippy::useless_vec))]

//! Adaptive model merging
//!
//! This crate provides the merged models trained at test time:
//! - Task vectors (expert minus base) stored at f32, f16 or bf16
//! - Task-wise and layer-wise AdaMerging with learnable coefficients
//! - Data-adaptive weight ensembling with a trainable gate network
//! - A dense encoder with an explicit backward pass shared by every model

mod adamerging;
mod encoder;
mod error;
mod gating;
mod param;
mod task_vector;
mod tensor;
mod weights;

pub use adamerging::{AdaMergedModel, AdaTrace, MergeMode};
pub use encoder::{Activation, EncoderArch, EncoderTrace, VisionEncoder};
pub use error::{MergeError, Result};
pub use gating::{DaweModel, DaweTrace, FeatureExtractor, GateConfig, GateNetwork};
pub use param::{MergedModel, Parameterized, StateDict};
pub use task_vector::{StoredTensor, TaskVector, TaskVectorSet};
pub use tensor::{l2_norm, normalize_in_place, Matrix};
pub use weights::{DataType, ModelWeights, WeightTensor};
