//! Zero-shot classification heads built from prompt embeddings

use crate::backbone::{ClipBackbone, TextEncoder};
use crate::logits::{LogitHead, NORM_EPS};
use crate::registry::{TaskRegistry, TaskSpec};
use crate::{Result, TtaError};
use fusion_merging::{normalize_in_place, Matrix};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Class prototypes for one task, `classes x embed_dim`, rows unit-norm
///
/// Every template is rendered and encoded per class; template embeddings are
/// normalized, averaged, and the mean normalized again.
pub fn build_head(spec: &TaskSpec, encoder: &dyn TextEncoder) -> Result<Matrix> {
    let dim = encoder.embed_dim();
    let mut rows = Vec::with_capacity(spec.num_classes());
    for classname in &spec.classnames {
        let prompts = spec.prompts(classname);
        let mut mean = vec![0.0f32; dim];
        for prompt in &prompts {
            let mut emb = encoder.encode(prompt)?;
            if emb.len() != dim {
                return Err(TtaError::Compute(format!(
                    "Text encoder returned {} values for '{}', expected {}",
                    emb.len(),
                    prompt,
                    dim
                )));
            }
            normalize_in_place(&mut emb, NORM_EPS);
            for (m, e) in mean.iter_mut().zip(&emb) {
                *m += e;
            }
        }
        let n = prompts.len().max(1) as f32;
        mean.iter_mut().for_each(|m| *m /= n);
        normalize_in_place(&mut mean, NORM_EPS);
        rows.push(mean);
    }
    Ok(Matrix::from_rows(&rows)?)
}

/// Per-run memo of zero-shot heads, optionally backed by cache files
#[derive(Debug, Default)]
pub struct ZeroShotHeadCache {
    cache_dir: Option<PathBuf>,
    heads: HashMap<String, Arc<Matrix>>,
}

impl ZeroShotHeadCache {
    pub fn new(cache_dir: Option<PathBuf>) -> Self {
        Self {
            cache_dir,
            heads: HashMap::new(),
        }
    }

    /// `{cache_dir}/{backbone}_{task}_zeroshot_weights.pt`
    pub fn cache_path(&self, backbone: &str, task: &str) -> Option<PathBuf> {
        self.cache_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}_{}_zeroshot_weights.pt", backbone, task)))
    }

    /// Head for `task`, built at most once per cache instance
    pub fn get_or_build(
        &mut self,
        task: &str,
        registry: &TaskRegistry,
        backbone: &ClipBackbone,
    ) -> Result<Arc<Matrix>> {
        if let Some(head) = self.heads.get(task) {
            return Ok(Arc::clone(head));
        }
        let spec = registry.get(task)?;
        let path = self.cache_path(backbone.name(), task);

        let head = match path.as_deref().and_then(|p| load_cached(p, backbone.embed_dim())) {
            Some(head) => {
                info!("Loaded cached zero-shot weights for task: {}", task);
                head
            }
            None => {
                info!("Constructing zero-shot classification head for task: {}", task);
                let head = build_head(spec, backbone.text_encoder())?;
                if let Some(p) = &path {
                    save_cached(p, &head)?;
                    info!("Saved zero-shot weights to {}", p.display());
                }
                head
            }
        };

        let head = Arc::new(head);
        self.heads.insert(task.to_string(), Arc::clone(&head));
        Ok(head)
    }

    /// Memoized head, if already built
    pub fn get(&self, task: &str) -> Option<Arc<Matrix>> {
        self.heads.get(task).cloned()
    }

    pub fn len(&self) -> usize {
        self.heads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }
}

fn load_cached(path: &Path, embed_dim: usize) -> Option<Matrix> {
    if !path.exists() {
        return None;
    }
    let loaded = std::fs::read(path)
        .map_err(TtaError::from)
        .and_then(|bytes| Ok(bincode::deserialize::<Matrix>(&bytes)?));
    match loaded {
        Ok(head) if head.cols == embed_dim && head.rows > 0 => Some(head),
        Ok(head) => {
            warn!(
                "Ignoring cached head {} with shape {:?}",
                path.display(),
                head.shape()
            );
            None
        }
        Err(e) => {
            warn!("Ignoring unreadable cached head {}: {}", path.display(), e);
            None
        }
    }
}

fn save_cached(path: &Path, head: &Matrix) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, bincode::serialize(head)?)?;
    Ok(())
}

/// Backbone, task table and head cache bundled for the adaptation algorithms
#[derive(Debug)]
pub struct ZeroShotClassifier {
    backbone: ClipBackbone,
    registry: TaskRegistry,
    cache: ZeroShotHeadCache,
}

impl ZeroShotClassifier {
    pub fn new(backbone: ClipBackbone, registry: TaskRegistry, cache_dir: Option<PathBuf>) -> Self {
        Self {
            backbone,
            registry,
            cache: ZeroShotHeadCache::new(cache_dir),
        }
    }

    pub fn backbone(&self) -> &ClipBackbone {
        &self.backbone
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &ZeroShotHeadCache {
        &self.cache
    }

    /// Build (or load) the head of every task
    pub fn setup<'a>(&mut self, tasks: impl IntoIterator<Item = &'a str>) -> Result<()> {
        for task in tasks {
            self.cache.get_or_build(task, &self.registry, &self.backbone)?;
        }
        Ok(())
    }

    pub fn head(&self, task: &str) -> Result<Arc<Matrix>> {
        self.cache
            .get(task)
            .ok_or_else(|| TtaError::UnknownTask(task.to_string()))
    }

    /// Logit computation bound to `task`
    pub fn logit_head(&self, task: &str) -> Result<LogitHead> {
        Ok(LogitHead::new(
            self.backbone.visual_projection().clone(),
            self.head(task)?,
            self.backbone.logit_scale_exp(),
        ))
    }
}
