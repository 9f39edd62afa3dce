//! End-to-end run of one adaptation algorithm.

use crate::config::{BenchConfig, Method};
use crate::error::{BenchError, Result};
use crate::pool::{read_model, DirectoryModelPool};
use fusion_merging::Parameterized;
use fusion_tta::{ClipAdaMerging, ClipDawe, TaskRegistry, TestTimeAdaptation, TrainingStats};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// What a finished run reports
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub method: Method,
    pub stats: TrainingStats,
    /// Loss of the last step, if any step ran
    pub final_loss: Option<f32>,
    /// Where the adapted model was written
    pub output: Option<PathBuf>,
}

/// Task table: builtin tasks plus any loaded from `config.tasks`
pub fn build_registry(config: &BenchConfig) -> Result<TaskRegistry> {
    let mut registry = TaskRegistry::with_builtin();
    if let Some(path) = &config.tasks {
        registry.load_json(path)?;
    }
    Ok(registry)
}

/// Adapt on the configured pool and write the result to `config.output`
///
/// AdaMerging writes the merged encoder; the gating method writes its full
/// state dict, since its merge depends on the input.
pub fn run(config: &BenchConfig) -> Result<RunSummary> {
    let registry = build_registry(config)?;
    let pool = DirectoryModelPool::new(config.pool.clone());
    info!(
        "Running {:?} over {} experts",
        config.method,
        config.pool.models.len().saturating_sub(1)
    );

    let (stats, losses) = match config.method {
        Method::Adamerging => {
            let mut algorithm = ClipAdaMerging::new(config.adaptation.clone(), registry);
            let adapted = algorithm.run(&pool)?;
            if let Some(path) = &config.output {
                let merged = adapted.model.merge_and_unload()?;
                DirectoryModelPool::save_model(path, &merged)?;
                info!("Saved merged encoder to {}", path.display());
            }
            (adapted.stats, adapted.losses)
        }
        Method::Dawe => {
            let path = config
                .dict_extractor
                .as_ref()
                .ok_or_else(|| BenchError::Config("dict_extractor is required for dawe".into()))?;
            let extractor = read_model("dict_extractor", path)?;
            let mut algorithm =
                ClipDawe::new(config.adaptation.clone(), registry, Arc::new(extractor));
            let adapted = algorithm.run(&pool)?;
            if let Some(path) = &config.output {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, bincode::serialize(&adapted.model.state_dict())?)?;
                info!("Saved gated model state to {}", path.display());
            }
            (adapted.stats, adapted.losses)
        }
    };

    Ok(RunSummary {
        method: config.method,
        stats,
        final_loss: losses.last().copied(),
        output: config.output.clone(),
    })
}
