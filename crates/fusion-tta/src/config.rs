//! Adaptation configuration.

use crate::{Result, TtaError};
use fusion_merging::{DataType, GateConfig, MergeMode};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Options shared by every test-time adaptation algorithm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdaptationConfig {
    /// Coefficient granularity
    #[serde(default)]
    pub merge_mode: MergeMode,

    /// Initial value of every mixing coefficient
    #[serde(default = "default_init_lambda")]
    pub init_lambda: f32,

    /// Gating: average coefficients over the batch
    #[serde(default = "default_batch_reduce")]
    pub batch_reduce: bool,

    /// Gating: gate input width, inferred from the feature extractor if unset
    #[serde(default)]
    pub hidden_size: Option<usize>,

    /// Gating: hidden layers in the gate network
    #[serde(default = "default_gate_hidden_layers")]
    pub gate_hidden_layers: usize,

    /// Storage precision of task vectors (`float32`, `float16`, `bfloat16`)
    #[serde(default)]
    pub task_vector_dtype: Option<String>,

    /// Optimisation steps
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    /// Checkpoint every N steps
    #[serde(default = "default_save_interval")]
    pub save_interval: usize,

    /// Adam learning rate
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,

    /// Samples per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Prefetch worker threads per loader (0 = load on the caller's thread)
    #[serde(default)]
    pub num_workers: usize,

    /// Accepted for compatibility; host tensors are never pinned
    #[serde(default = "default_pin_memory")]
    pub pin_memory: bool,

    /// Directory for persisted zero-shot heads
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// Directory for checkpoints and the metrics log
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Seed for shuffling and gate initialisation
    #[serde(default)]
    pub seed: Option<u64>,

    /// Write the learned coefficients here as JSON
    #[serde(default)]
    pub save_merging_weights: Option<PathBuf>,
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            merge_mode: MergeMode::default(),
            init_lambda: default_init_lambda(),
            batch_reduce: default_batch_reduce(),
            hidden_size: None,
            gate_hidden_layers: default_gate_hidden_layers(),
            task_vector_dtype: None,
            max_steps: default_max_steps(),
            save_interval: default_save_interval(),
            learning_rate: default_learning_rate(),
            batch_size: default_batch_size(),
            num_workers: 0,
            pin_memory: default_pin_memory(),
            cache_dir: None,
            log_dir: default_log_dir(),
            seed: None,
            save_merging_weights: None,
        }
    }
}

impl AdaptationConfig {
    /// Reject values the adaptation loop cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.save_interval == 0 {
            return Err(TtaError::Configuration("save_interval must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(TtaError::Configuration("batch_size must be positive".into()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(TtaError::Configuration(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !self.init_lambda.is_finite() {
            return Err(TtaError::Configuration(format!(
                "init_lambda must be finite, got {}",
                self.init_lambda
            )));
        }
        if self.hidden_size == Some(0) {
            return Err(TtaError::Configuration("hidden_size must be positive".into()));
        }
        self.dtype()?;
        Ok(())
    }

    /// Parsed task-vector storage precision
    pub fn dtype(&self) -> Result<DataType> {
        match &self.task_vector_dtype {
            Some(s) => Ok(DataType::parse(s)?),
            None => Ok(DataType::Float32),
        }
    }

    /// Gate options for the gating algorithm
    pub fn gate_config(&self) -> GateConfig {
        GateConfig {
            hidden_size: self.hidden_size,
            gate_hidden_layers: self.gate_hidden_layers,
            init_lambda: self.init_lambda,
            batch_reduce: self.batch_reduce,
            merge_mode: self.merge_mode,
            seed: self.seed,
        }
    }

    /// Directory holding step checkpoints
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.log_dir.join("checkpoints")
    }
}

fn default_init_lambda() -> f32 {
    0.3
}

fn default_batch_reduce() -> bool {
    true
}

fn default_gate_hidden_layers() -> usize {
    1
}

fn default_max_steps() -> usize {
    1000
}

fn default_save_interval() -> usize {
    500
}

fn default_learning_rate() -> f32 {
    1e-3
}

fn default_batch_size() -> usize {
    16
}

fn default_pin_memory() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("outputs")
}
