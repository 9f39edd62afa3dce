//! Model pool backed by files on disk.
//!
//! Models are bincode-encoded [`VisionEncoder`]s, test datasets are
//! bincode-encoded `Vec<Sample>`s.

use crate::config::PoolConfig;
use fusion_merging::VisionEncoder;
use fusion_tta::{
    Dataset, ImageProcessor, InMemoryDataset, ModelConfig, ModelPool, Result, Sample, TtaError,
    PRETRAINED,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Pool whose members are listed in the run configuration
#[derive(Debug, Clone)]
pub struct DirectoryModelPool {
    models: Vec<ModelConfig>,
    test_datasets: BTreeMap<String, PathBuf>,
    processor: ImageProcessor,
}

impl DirectoryModelPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            models: config.models,
            test_datasets: config.test_datasets,
            processor: config.processor,
        }
    }

    /// Write an encoder in the format [`load_model`](ModelPool::load_model) reads
    pub fn save_model(path: &Path, model: &VisionEncoder) -> Result<()> {
        write_bincode(path, model)
    }

    /// Write samples in the format [`load_test_dataset`](ModelPool::load_test_dataset) reads
    pub fn save_dataset(path: &Path, samples: &[Sample]) -> Result<()> {
        write_bincode(path, samples)
    }
}

impl ModelPool for DirectoryModelPool {
    fn model_names(&self) -> Vec<String> {
        self.models
            .iter()
            .filter(|m| m.name != PRETRAINED)
            .map(|m| m.name.clone())
            .collect()
    }

    fn load_model(&self, name: &str) -> Result<VisionEncoder> {
        let config = self.get_model_config(name)?;
        let path = config.path.ok_or_else(|| TtaError::ModelLoad {
            name: name.to_string(),
            reason: "no path configured".into(),
        })?;
        debug!("Loading model '{}' from {}", name, path.display());
        read_model(name, &path)
    }

    fn get_model_config(&self, name: &str) -> Result<ModelConfig> {
        self.models
            .iter()
            .find(|m| m.name == name)
            .cloned()
            .ok_or_else(|| TtaError::ModelLoad {
                name: name.to_string(),
                reason: "not in pool".into(),
            })
    }

    fn load_test_dataset(&self, task: &str) -> Result<Arc<dyn Dataset>> {
        let path = self
            .test_datasets
            .get(task)
            .ok_or_else(|| TtaError::UnknownTask(task.to_string()))?;
        let samples: Vec<Sample> = bincode::deserialize(&std::fs::read(path)?)?;
        debug!("Loaded {} samples for task '{}'", samples.len(), task);
        Ok(Arc::new(InMemoryDataset::new(samples)))
    }

    fn load_processor(&self) -> Result<ImageProcessor> {
        Ok(self.processor.clone())
    }
}

/// Read a bincode-encoded encoder; any failure is reported against `name`
pub fn read_model(name: &str, path: &Path) -> Result<VisionEncoder> {
    let load_err = |reason: String| TtaError::ModelLoad {
        name: name.to_string(),
        reason,
    };
    let bytes = std::fs::read(path).map_err(|e| load_err(format!("{}: {}", path.display(), e)))?;
    let model: VisionEncoder =
        bincode::deserialize(&bytes).map_err(|e| load_err(e.to_string()))?;
    model.arch.validate(&model.weights)?;
    Ok(model)
}

fn write_bincode<T: serde::Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, bincode::serialize(value)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fusion_merging::{Activation, EncoderArch};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn encoder(name: &str, rng: &mut StdRng) -> VisionEncoder {
        let arch = EncoderArch::new(vec![3, 2], Activation::Relu).unwrap();
        VisionEncoder::new(arch.clone(), arch.random_weights(name, rng)).unwrap()
    }

    fn model(name: &str, path: &Path) -> ModelConfig {
        ModelConfig {
            path: Some(path.to_path_buf()),
            ..ModelConfig::new(name)
        }
    }

    #[test]
    fn test_round_trip_through_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let base = encoder(PRETRAINED, &mut rng);
        let expert = encoder("svhn", &mut rng);
        let base_path = dir.path().join("models/base.bin");
        let expert_path = dir.path().join("models/svhn.bin");
        let data_path = dir.path().join("data/svhn.bin");
        DirectoryModelPool::save_model(&base_path, &base).unwrap();
        DirectoryModelPool::save_model(&expert_path, &expert).unwrap();
        DirectoryModelPool::save_dataset(
            &data_path,
            &vec![Sample::new(vec![0.0, 1.0, 2.0], None); 3],
        )
        .unwrap();

        let pool = DirectoryModelPool::new(PoolConfig {
            models: vec![model(PRETRAINED, &base_path), model("svhn", &expert_path)],
            test_datasets: [("svhn".to_string(), data_path)].into_iter().collect(),
            processor: ImageProcessor::new(3),
        });

        assert_eq!(pool.model_names(), vec!["svhn"]);
        assert_eq!(pool.load_pretrained_model().unwrap(), base);
        assert_eq!(pool.models().unwrap(), vec![expert]);
        assert_eq!(pool.load_test_dataset("svhn").unwrap().len(), 3);
        assert!(matches!(
            pool.load_test_dataset("mnist"),
            Err(TtaError::UnknownTask(_))
        ));
    }

    #[test]
    fn test_missing_file_is_model_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let pool = DirectoryModelPool::new(PoolConfig {
            models: vec![
                model(PRETRAINED, &dir.path().join("missing.bin")),
                ModelConfig::new("nopath"),
            ],
            test_datasets: BTreeMap::new(),
            processor: ImageProcessor::new(3),
        });
        assert!(matches!(
            pool.load_pretrained_model(),
            Err(TtaError::ModelLoad { .. })
        ));
        assert!(matches!(
            pool.load_model("nopath"),
            Err(TtaError::ModelLoad { .. })
        ));
        assert!(matches!(
            pool.load_backbone(),
            Err(TtaError::ModelLoad { .. })
        ));
    }
}
