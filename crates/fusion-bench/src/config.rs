//! Run configuration.

use crate::error::{BenchError, Result};
use fusion_tta::{AdaptationConfig, ImageProcessor, ModelConfig, PRETRAINED};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Adaptation algorithm to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    /// Task-wise or layer-wise AdaMerging
    #[default]
    Adamerging,
    /// Data-adaptive weight ensembling
    Dawe,
}

/// Where the pool's models and test data live
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    /// Base model (named `_pretrained_`) followed by the experts
    pub models: Vec<ModelConfig>,

    /// Test dataset file per task
    #[serde(default)]
    pub test_datasets: BTreeMap<String, PathBuf>,

    /// Image preprocessing
    pub processor: ImageProcessor,
}

/// Top-level configuration file
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BenchConfig {
    /// Algorithm to run
    #[serde(default)]
    pub method: Method,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Extra task definitions (JSON) on top of the builtin table
    #[serde(default)]
    pub tasks: Option<PathBuf>,

    /// Encoder used by the gate to read its inputs (gating only)
    #[serde(default)]
    pub dict_extractor: Option<PathBuf>,

    /// Where the adapted model is written
    #[serde(default)]
    pub output: Option<PathBuf>,

    /// Adaptation options
    #[serde(default)]
    pub adaptation: AdaptationConfig,

    /// Model pool
    pub pool: PoolConfig,
}

impl BenchConfig {
    /// Parse TOML, resolving relative paths against `base_dir`
    pub fn from_toml(text: &str, base_dir: &Path) -> Result<Self> {
        let mut config: BenchConfig = toml::from_str(text)?;
        config.resolve_paths(base_dir);
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file; relative paths are taken from the file's directory
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_toml(&text, base_dir)
    }

    pub fn validate(&self) -> Result<()> {
        self.adaptation.validate()?;
        if !self.pool.models.iter().any(|m| m.name == PRETRAINED) {
            return Err(BenchError::Config(format!(
                "pool has no '{}' model",
                PRETRAINED
            )));
        }
        if self.method == Method::Dawe && self.dict_extractor.is_none() {
            return Err(BenchError::Config(
                "dict_extractor is required for dawe".into(),
            ));
        }
        Ok(())
    }

    fn resolve_paths(&mut self, base_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base_dir.join(&*p);
            }
        };
        for model in &mut self.pool.models {
            model.path.iter_mut().for_each(resolve);
            model.pretrained_model_name_or_path.iter_mut().for_each(resolve);
        }
        self.pool.test_datasets.values_mut().for_each(resolve);
        self.tasks.iter_mut().for_each(resolve);
        self.dict_extractor.iter_mut().for_each(resolve);
        self.output.iter_mut().for_each(resolve);
        resolve(&mut self.adaptation.log_dir);
        self.adaptation.cache_dir.iter_mut().for_each(resolve);
        self.adaptation.save_merging_weights.iter_mut().for_each(resolve);
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
