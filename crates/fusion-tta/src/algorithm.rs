//! Test-time adaptation algorithms for CLIP-style classifiers

use crate::config::AdaptationConfig;
use crate::data::{DataLoader, Dataset, ProcessedDataset};
use crate::pool::ModelPool;
use crate::registry::TaskRegistry;
use crate::trainer::{TaskStream, TestTimeTrainer, TrainingStats};
use crate::zeroshot::ZeroShotClassifier;
use crate::{Result, TtaError};
use fusion_merging::{
    AdaMergedModel, DaweModel, FeatureExtractor, Matrix, MergeMode, MergedModel, Parameterized,
    TaskVectorSet,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Result of a completed adaptation run
#[derive(Debug)]
pub struct Adapted<M> {
    pub model: M,
    pub stats: TrainingStats,
    /// Summed entropy per step
    pub losses: Vec<f32>,
}

/// An algorithm that adapts a merged model on unlabeled test data
pub trait TestTimeAdaptation {
    type Model: MergedModel;

    fn config(&self) -> &AdaptationConfig;

    /// Zero-shot classifier, available after [`on_adaptation_start`](Self::on_adaptation_start)
    fn classifier(&self) -> Result<&ZeroShotClassifier>;

    /// Load the backbone and build a zero-shot head for every task
    fn on_adaptation_start(&mut self, pool: &dyn ModelPool) -> Result<()>;

    /// Build the trainable merged model from the pool
    fn construct_model(&mut self, pool: &dyn ModelPool) -> Result<Self::Model>;

    /// Called with the adapted model before it is returned
    fn on_adaptation_end(&mut self, _model: &Self::Model) -> Result<()> {
        Ok(())
    }

    /// `batch x classes` logits of `model` on `images` for `task`
    fn compute_logits(&self, model: &Self::Model, images: &Matrix, task: &str) -> Result<Matrix> {
        let head = self.classifier()?.logit_head(task)?;
        let (features, _) = model.forward(images)?;
        Ok(head.forward(&features)?.0)
    }

    /// Init, adapt for `max_steps`, return the adapted model
    fn run(&mut self, pool: &dyn ModelPool) -> Result<Adapted<Self::Model>> {
        self.config().validate()?;
        self.on_adaptation_start(pool)?;
        let mut model = self.construct_model(pool)?;
        let mut tasks = task_streams(pool, self.classifier()?, self.config())?;

        let mut trainer = TestTimeTrainer::new(self.config().clone())?;
        trainer.run(&mut model, &mut tasks)?;
        self.on_adaptation_end(&model)?;

        Ok(Adapted {
            model,
            stats: trainer.stats().clone(),
            losses: trainer.losses().to_vec(),
        })
    }
}

/// One shuffling, endless stream per pool task, in pool order
pub fn task_streams(
    pool: &dyn ModelPool,
    classifier: &ZeroShotClassifier,
    config: &AdaptationConfig,
) -> Result<Vec<TaskStream>> {
    let processor = pool.load_processor()?;
    pool.model_names()
        .iter()
        .enumerate()
        .map(|(i, task)| {
            info!("Loading test dataset: {}", task);
            let dataset: Arc<dyn Dataset> = Arc::new(ProcessedDataset::new(
                pool.load_test_dataset(task)?,
                processor.clone(),
            ));
            let loader = DataLoader::new(dataset, config.batch_size)?
                .shuffled(config.seed.map(|s| s.wrapping_add(i as u64)))
                .with_workers(config.num_workers)
                .with_pin_memory(config.pin_memory);
            Ok(TaskStream::new(task.as_str(), loader, classifier.logit_head(task)?))
        })
        .collect()
}

fn setup_classifier(
    pool: &dyn ModelPool,
    registry: &TaskRegistry,
    config: &AdaptationConfig,
) -> Result<ZeroShotClassifier> {
    let backbone = pool.load_backbone()?;
    let mut classifier = ZeroShotClassifier::new(backbone, registry.clone(), config.cache_dir.clone());
    let names = pool.model_names();
    classifier.setup(names.iter().map(String::as_str))?;
    Ok(classifier)
}

/// Learned coefficients as written to `save_merging_weights`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergingWeights {
    pub merge_mode: MergeMode,
    pub tasks: Vec<String>,
    /// One row per task: a single value (task-wise) or one per tensor
    pub merging_weights: Vec<Vec<f32>>,
}

impl MergingWeights {
    pub fn from_model(model: &AdaMergedModel) -> Self {
        Self {
            merge_mode: model.mode(),
            tasks: model
                .task_vectors()
                .task_names()
                .into_iter()
                .map(String::from)
                .collect(),
            merging_weights: model.merging_weights(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(serde_json::from_slice(&std::fs::read(path)?)?)
    }
}

/// Task-wise or layer-wise AdaMerging
#[derive(Debug)]
pub struct ClipAdaMerging {
    config: AdaptationConfig,
    registry: TaskRegistry,
    classifier: Option<ZeroShotClassifier>,
}

impl ClipAdaMerging {
    pub fn new(config: AdaptationConfig, registry: TaskRegistry) -> Self {
        Self {
            config,
            registry,
            classifier: None,
        }
    }
}

impl TestTimeAdaptation for ClipAdaMerging {
    type Model = AdaMergedModel;

    fn config(&self) -> &AdaptationConfig {
        &self.config
    }

    fn classifier(&self) -> Result<&ZeroShotClassifier> {
        self.classifier
            .as_ref()
            .ok_or_else(|| TtaError::Configuration("Zero-shot heads not set up".into()))
    }

    fn on_adaptation_start(&mut self, pool: &dyn ModelPool) -> Result<()> {
        self.classifier = Some(setup_classifier(pool, &self.registry, &self.config)?);
        Ok(())
    }

    fn construct_model(&mut self, pool: &dyn ModelPool) -> Result<AdaMergedModel> {
        let base = pool.load_pretrained_model()?;
        let experts = pool.models()?;
        let model = AdaMergedModel::from_models(
            &base,
            &experts,
            self.config.merge_mode,
            self.config.init_lambda,
            self.config.dtype()?,
        )?;
        info!(
            "{:?} AdaMerging over {} experts, {} coefficients",
            self.config.merge_mode,
            experts.len(),
            model.num_trainable()
        );
        Ok(model)
    }

    fn on_adaptation_end(&mut self, model: &AdaMergedModel) -> Result<()> {
        if let Some(path) = &self.config.save_merging_weights {
            MergingWeights::from_model(model).save(path)?;
            info!("Saved merging weights to {}", path.display());
        }
        Ok(())
    }
}

/// Data-adaptive weight ensembling: a gate predicts coefficients per input
pub struct ClipDawe {
    config: AdaptationConfig,
    registry: TaskRegistry,
    extractor: Arc<dyn FeatureExtractor>,
    classifier: Option<ZeroShotClassifier>,
}

impl std::fmt::Debug for ClipDawe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClipDawe")
            .field("config", &self.config)
            .field("extractor_hidden_size", &self.extractor.hidden_size())
            .finish()
    }
}

impl ClipDawe {
    pub fn new(
        config: AdaptationConfig,
        registry: TaskRegistry,
        extractor: Arc<dyn FeatureExtractor>,
    ) -> Self {
        Self {
            config,
            registry,
            extractor,
            classifier: None,
        }
    }
}

impl TestTimeAdaptation for ClipDawe {
    type Model = DaweModel;

    fn config(&self) -> &AdaptationConfig {
        &self.config
    }

    fn classifier(&self) -> Result<&ZeroShotClassifier> {
        self.classifier
            .as_ref()
            .ok_or_else(|| TtaError::Configuration("Zero-shot heads not set up".into()))
    }

    fn on_adaptation_start(&mut self, pool: &dyn ModelPool) -> Result<()> {
        self.classifier = Some(setup_classifier(pool, &self.registry, &self.config)?);
        Ok(())
    }

    fn construct_model(&mut self, pool: &dyn ModelPool) -> Result<DaweModel> {
        let base = pool.load_pretrained_model()?;
        let experts = pool.models()?;
        let vectors = TaskVectorSet::new(&base, &experts, self.config.dtype()?)?;
        Ok(DaweModel::new(
            vectors,
            Arc::clone(&self.extractor),
            &self.config.gate_config(),
        )?)
    }
}
