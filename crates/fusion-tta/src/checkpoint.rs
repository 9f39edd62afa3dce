//! Periodic model checkpoints

use crate::{Result, TtaError};
use fusion_merging::{Parameterized, StateDict};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Checkpoint file contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Full model state
    pub model: StateDict,
}

impl Checkpoint {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(bincode::deserialize(&bytes)?)
    }
}

/// Writes `model_{step}.pt` every `save_interval` steps and once more at the
/// end when the last step was not a save point
#[derive(Debug, Clone)]
pub struct Checkpointer {
    dir: PathBuf,
    save_interval: usize,
    last_saved: Option<usize>,
}

impl Checkpointer {
    pub fn new(dir: impl Into<PathBuf>, save_interval: usize) -> Result<Self> {
        if save_interval == 0 {
            return Err(TtaError::Configuration("save_interval must be positive".into()));
        }
        Ok(Self {
            dir: dir.into(),
            save_interval,
            last_saved: None,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, step: usize) -> PathBuf {
        self.dir.join(format!("model_{}.pt", step))
    }

    pub fn is_save_point(&self, step: usize) -> bool {
        (step + 1) % self.save_interval == 0
    }

    /// Save when `step` is a save point; returns the written path
    pub fn maybe_save<M: Parameterized + ?Sized>(
        &mut self,
        step: usize,
        model: &M,
    ) -> Result<Option<PathBuf>> {
        if !self.is_save_point(step) {
            return Ok(None);
        }
        self.save(step, model).map(Some)
    }

    /// Save after the loop unless `last_step` was already saved
    pub fn finalize<M: Parameterized + ?Sized>(
        &mut self,
        last_step: Option<usize>,
        model: &M,
    ) -> Result<Option<PathBuf>> {
        match last_step {
            Some(step) if self.last_saved != Some(step) => self.save(step, model).map(Some),
            _ => Ok(None),
        }
    }

    fn save<M: Parameterized + ?Sized>(&mut self, step: usize, model: &M) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(step);
        let checkpoint = Checkpoint {
            model: model.state_dict(),
        };
        std::fs::write(&path, bincode::serialize(&checkpoint)?)?;
        self.last_saved = Some(step);
        info!("Saved checkpoint to {}", path.display());
        Ok(path)
    }
}
