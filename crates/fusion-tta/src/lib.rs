//! Test-time adaptation of merged models
//!
//! This crate adapts merging coefficients on unlabeled test data:
//! - Endless per-task batch streams with optional prefetch workers
//! - Zero-shot classification heads built from prompt templates and cached
//! - Cosine-similarity logits and an entropy objective with explicit gradients
//! - Adam over the merged model's trainable parameters
//! - Periodic checkpoints and a per-step metrics log
//! - AdaMerging and data-adaptive weight ensembling algorithms

mod algorithm;
mod backbone;
mod checkpoint;
mod config;
mod data;
mod error;
mod logits;
mod loss;
mod optim;
mod pool;
mod registry;
mod stream;
mod tasks;
mod trainer;
mod zeroshot;

pub use algorithm::{
    task_streams, Adapted, ClipAdaMerging, ClipDawe, MergingWeights, TestTimeAdaptation,
};
pub use backbone::{ClipBackbone, HashedTokenEncoder, TextEncoder};
pub use checkpoint::{Checkpoint, Checkpointer};
pub use config::AdaptationConfig;
pub use data::{
    Batch, DataLoader, Dataset, ImageProcessor, InMemoryDataset, LoaderIter, Prefetcher,
    ProcessedDataset, Sample,
};
pub use error::{Result, TtaError};
pub use logits::{LogitHead, LogitTrace, NORM_EPS};
pub use loss::entropy_loss;
pub use optim::{Adam, AdamConfig};
pub use pool::{InMemoryModelPool, ModelConfig, ModelPool, PRETRAINED};
pub use registry::{TaskRegistry, TaskSpec, CLASSNAME_PLACEHOLDER};
pub use stream::{BatchSource, InfiniteStream};
pub use tasks::{CUB_200_2011_CLASSNAMES, CUB_200_2011_TEMPLATES};
pub use trainer::{AdaptationPhase, StepMetrics, TaskStream, TestTimeTrainer, TrainingStats};
pub use zeroshot::{build_head, ZeroShotClassifier, ZeroShotHeadCache};
