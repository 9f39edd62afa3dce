//! Model pool interface and an in-memory implementation

use crate::backbone::ClipBackbone;
use crate::data::{Dataset, ImageProcessor};
use crate::{Result, TtaError};
use fusion_merging::VisionEncoder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Pool name of the base model
pub const PRETRAINED: &str = "_pretrained_";

/// Where a pool member comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    /// Local path of the weights
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Location of the full pretrained model (backbone), when different from `path`
    #[serde(default)]
    pub pretrained_model_name_or_path: Option<PathBuf>,
}

impl ModelConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: None,
            pretrained_model_name_or_path: None,
        }
    }

    /// Backbone location: `pretrained_model_name_or_path`, else `path`
    pub fn pretrained_path(&self) -> Option<&PathBuf> {
        self.pretrained_model_name_or_path
            .as_ref()
            .or(self.path.as_ref())
    }
}

/// Source of the base model, the experts and their test data
pub trait ModelPool: Send + Sync {
    /// Expert (task) names in enumeration order, base model excluded
    fn model_names(&self) -> Vec<String>;

    fn load_model(&self, name: &str) -> Result<VisionEncoder>;

    fn get_model_config(&self, name: &str) -> Result<ModelConfig>;

    fn load_test_dataset(&self, task: &str) -> Result<Arc<dyn Dataset>>;

    fn load_processor(&self) -> Result<ImageProcessor>;

    /// Every expert, in [`model_names`](Self::model_names) order
    fn models(&self) -> Result<Vec<VisionEncoder>> {
        self.model_names()
            .iter()
            .map(|name| self.load_model(name))
            .collect()
    }

    fn load_pretrained_model(&self) -> Result<VisionEncoder> {
        self.load_model(PRETRAINED)
    }

    /// Backbone referenced by the base model's config
    fn load_backbone(&self) -> Result<ClipBackbone> {
        let config = self.get_model_config(PRETRAINED)?;
        let path = config.pretrained_path().ok_or_else(|| TtaError::ModelLoad {
            name: PRETRAINED.to_string(),
            reason: "no pretrained path configured".into(),
        })?;
        ClipBackbone::from_pretrained(path)
    }
}

/// Pool whose members live in memory
pub struct InMemoryModelPool {
    pretrained: VisionEncoder,
    experts: Vec<VisionEncoder>,
    datasets: HashMap<String, Arc<dyn Dataset>>,
    processor: ImageProcessor,
    backbone: Option<ClipBackbone>,
}

impl InMemoryModelPool {
    pub fn new(pretrained: VisionEncoder, processor: ImageProcessor) -> Self {
        Self {
            pretrained,
            experts: Vec::new(),
            datasets: HashMap::new(),
            processor,
            backbone: None,
        }
    }

    /// Add an expert (named by its weights) and the test data of its task
    pub fn with_expert(mut self, expert: VisionEncoder, dataset: Arc<dyn Dataset>) -> Self {
        self.datasets.insert(expert.name().to_string(), dataset);
        self.experts.push(expert);
        self
    }

    pub fn with_backbone(mut self, backbone: ClipBackbone) -> Self {
        self.backbone = Some(backbone);
        self
    }
}

impl ModelPool for InMemoryModelPool {
    fn model_names(&self) -> Vec<String> {
        self.experts.iter().map(|e| e.name().to_string()).collect()
    }

    fn load_model(&self, name: &str) -> Result<VisionEncoder> {
        if name == PRETRAINED {
            return Ok(self.pretrained.clone());
        }
        self.experts
            .iter()
            .find(|e| e.name() == name)
            .cloned()
            .ok_or_else(|| TtaError::ModelLoad {
                name: name.to_string(),
                reason: "not in pool".into(),
            })
    }

    fn get_model_config(&self, name: &str) -> Result<ModelConfig> {
        if name == PRETRAINED || self.experts.iter().any(|e| e.name() == name) {
            Ok(ModelConfig::new(name))
        } else {
            Err(TtaError::ModelLoad {
                name: name.to_string(),
                reason: "not in pool".into(),
            })
        }
    }

    fn load_test_dataset(&self, task: &str) -> Result<Arc<dyn Dataset>> {
        self.datasets
            .get(task)
            .cloned()
            .ok_or_else(|| TtaError::UnknownTask(task.to_string()))
    }

    fn load_processor(&self) -> Result<ImageProcessor> {
        Ok(self.processor.clone())
    }

    fn load_backbone(&self) -> Result<ClipBackbone> {
        self.backbone.clone().ok_or_else(|| TtaError::ModelLoad {
            name: PRETRAINED.to_string(),
            reason: "no backbone attached to pool".into(),
        })
    }
}
