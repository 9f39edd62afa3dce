//! CLIP-style backbone: text encoder, visual projection and logit scale

use crate::{Result, TtaError};
use fusion_merging::Matrix;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use xxhash_rust::xxh3::xxh3_64_with_seed;

/// Maps a prompt to an embedding
pub trait TextEncoder: Send + Sync {
    /// Embedding width
    fn embed_dim(&self) -> usize;

    fn encode(&self, text: &str) -> Result<Vec<f32>>;
}

/// Bag-of-tokens encoder with hash-derived token embeddings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashedTokenEncoder {
    pub embed_dim: usize,
    #[serde(default)]
    pub seed: u64,
}

impl HashedTokenEncoder {
    pub fn new(embed_dim: usize, seed: u64) -> Self {
        Self { embed_dim, seed }
    }

    fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
    }

    fn token_embedding(&self, token: &str, out: &mut [f32]) {
        let h = xxh3_64_with_seed(token.as_bytes(), self.seed);
        for (j, v) in out.iter_mut().enumerate() {
            let bits = xxh3_64_with_seed(&(j as u64).to_le_bytes(), h);
            *v += (bits as f64 / u64::MAX as f64 * 2.0 - 1.0) as f32;
        }
    }
}

impl TextEncoder for HashedTokenEncoder {
    fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    fn encode(&self, text: &str) -> Result<Vec<f32>> {
        let mut out = vec![0.0; self.embed_dim];
        for token in Self::tokens(text) {
            self.token_embedding(&token, &mut out);
        }
        Ok(out)
    }
}

/// On-disk backbone layout
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BackboneFile {
    visual_projection: Matrix,
    logit_scale: f32,
    text_encoder: HashedTokenEncoder,
}

/// Frozen pieces of the pretrained model used for zero-shot classification
#[derive(Clone)]
pub struct ClipBackbone {
    name: String,
    /// `embed_dim x feature_dim`
    visual_projection: Matrix,
    /// Log of the logit temperature
    logit_scale: f32,
    text_encoder: Arc<dyn TextEncoder>,
}

impl std::fmt::Debug for ClipBackbone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClipBackbone")
            .field("name", &self.name)
            .field("projection", &self.visual_projection.shape())
            .field("logit_scale", &self.logit_scale)
            .finish()
    }
}

impl ClipBackbone {
    pub fn new(
        name: impl Into<String>,
        visual_projection: Matrix,
        logit_scale: f32,
        text_encoder: Arc<dyn TextEncoder>,
    ) -> Result<Self> {
        let name = name.into();
        if text_encoder.embed_dim() != visual_projection.rows {
            return Err(TtaError::ModelLoad {
                name,
                reason: format!(
                    "text embeddings have width {}, visual projection outputs {}",
                    text_encoder.embed_dim(),
                    visual_projection.rows
                ),
            });
        }
        if !logit_scale.is_finite() {
            return Err(TtaError::ModelLoad {
                name,
                reason: format!("logit_scale must be finite, got {}", logit_scale),
            });
        }
        Ok(Self {
            name,
            visual_projection,
            logit_scale,
            text_encoder,
        })
    }

    /// Load a backbone written by [`save`](Self::save)
    pub fn from_pretrained(path: &Path) -> Result<Self> {
        let name = basename(path);
        let bytes = std::fs::read(path).map_err(|e| TtaError::ModelLoad {
            name: name.clone(),
            reason: format!("{}: {}", path.display(), e),
        })?;
        let file: BackboneFile = bincode::deserialize(&bytes).map_err(|e| TtaError::ModelLoad {
            name: name.clone(),
            reason: e.to_string(),
        })?;
        info!(
            "Loaded backbone '{}' (projection {:?})",
            name,
            file.visual_projection.shape()
        );
        Self::new(
            name,
            file.visual_projection,
            file.logit_scale,
            Arc::new(file.text_encoder),
        )
    }

    /// Persist a backbone with a hashed text encoder
    pub fn save(
        path: &Path,
        visual_projection: &Matrix,
        logit_scale: f32,
        text_encoder: &HashedTokenEncoder,
    ) -> Result<()> {
        let file = BackboneFile {
            visual_projection: visual_projection.clone(),
            logit_scale,
            text_encoder: text_encoder.clone(),
        };
        std::fs::write(path, bincode::serialize(&file)?)?;
        Ok(())
    }

    /// Last path component of the pretrained location, used in cache file names
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn visual_projection(&self) -> &Matrix {
        &self.visual_projection
    }

    pub fn embed_dim(&self) -> usize {
        self.visual_projection.rows
    }

    pub fn feature_dim(&self) -> usize {
        self.visual_projection.cols
    }

    /// `exp(logit_scale)`
    pub fn logit_scale_exp(&self) -> f32 {
        self.logit_scale.exp()
    }

    pub fn text_encoder(&self) -> &dyn TextEncoder {
        self.text_encoder.as_ref()
    }
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashed_encoder_deterministic() {
        let enc = HashedTokenEncoder::new(16, 0);
        let a = enc.encode("a photo of a Cardinal.").unwrap();
        let b = enc.encode("A photo of a cardinal").unwrap();
        let c = enc.encode("a photo of a Bobolink.").unwrap();
        assert_eq!(a.len(), 16);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip-toy");
        let projection = Matrix::new(4, 2, vec![1.0, 0.0, 0.0, 1.0, 0.5, 0.5, 0.0, 0.0]).unwrap();
        ClipBackbone::save(&path, &projection, 2.0, &HashedTokenEncoder::new(4, 1)).unwrap();

        let backbone = ClipBackbone::from_pretrained(&path).unwrap();
        assert_eq!(backbone.name(), "clip-toy");
        assert_eq!(backbone.visual_projection(), &projection);
        assert_eq!(backbone.feature_dim(), 2);
        assert!((backbone.logit_scale_exp() - 2.0f32.exp()).abs() < 1e-4);
    }

    #[test]
    fn test_missing_backbone() {
        let dir = tempfile::tempdir().unwrap();
        let err = ClipBackbone::from_pretrained(&dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, TtaError::ModelLoad { .. }));

        let garbage = dir.path().join("garbage");
        std::fs::write(&garbage, b"\x01\x02").unwrap();
        assert!(matches!(
            ClipBackbone::from_pretrained(&garbage),
            Err(TtaError::ModelLoad { .. })
        ));
    }

    #[test]
    fn test_projection_width_checked() {
        let projection = Matrix::zeros(3, 2);
        assert!(ClipBackbone::new("x", projection, 0.0, Arc::new(HashedTokenEncoder::new(4, 0))).is_err());
    }
}
