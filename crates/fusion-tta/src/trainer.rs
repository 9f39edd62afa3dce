//! Entropy-minimization loop shared by every adaptation algorithm

use crate::checkpoint::Checkpointer;
use crate::config::AdaptationConfig;
use crate::data::{Batch, DataLoader};
use crate::logits::LogitHead;
use crate::loss::entropy_loss;
use crate::optim::{Adam, AdamConfig};
use crate::stream::InfiniteStream;
use crate::{Result, TtaError};
use fusion_merging::MergedModel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::time::Instant;
use tracing::{debug, info};

/// Where the loop is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdaptationPhase {
    Init,
    Adapting,
    Done,
}

/// Progress of one adaptation run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingStats {
    pub steps: usize,
    /// Images consumed, summed over tasks
    pub samples: usize,
    pub last_loss: f32,
    /// Exponential moving average of the step loss (decay 0.9)
    pub loss_ema: f32,
    pub best_loss: f32,
    pub elapsed_secs: f64,
    pub samples_per_sec: f32,
}

impl Default for TrainingStats {
    fn default() -> Self {
        Self {
            steps: 0,
            samples: 0,
            last_loss: f32::NAN,
            loss_ema: f32::NAN,
            best_loss: f32::INFINITY,
            elapsed_secs: 0.0,
            samples_per_sec: 0.0,
        }
    }
}

impl TrainingStats {
    /// Fold in one completed step
    pub fn record(&mut self, loss: f32, samples: usize) {
        self.loss_ema = if self.steps == 0 {
            loss
        } else {
            0.9 * self.loss_ema + 0.1 * loss
        };
        self.steps += 1;
        self.samples += samples;
        self.last_loss = loss;
        self.best_loss = self.best_loss.min(loss);
    }

    fn finish(&mut self, elapsed_secs: f64) {
        self.elapsed_secs = elapsed_secs;
        if elapsed_secs > 0.0 {
            self.samples_per_sec = (self.samples as f64 / elapsed_secs) as f32;
        }
    }
}

/// Endless batches of one task plus the head its logits are computed with
pub struct TaskStream {
    task: String,
    stream: InfiniteStream<DataLoader>,
    head: LogitHead,
}

impl TaskStream {
    pub fn new(task: impl Into<String>, loader: DataLoader, head: LogitHead) -> Self {
        Self {
            task: task.into(),
            stream: InfiniteStream::new(loader),
            head,
        }
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn head(&self) -> &LogitHead {
        &self.head
    }

    /// Completed passes over the task's data
    pub fn passes(&self) -> usize {
        self.stream.passes()
    }

    pub fn next_batch(&mut self) -> Result<Batch> {
        match self.stream.next()? {
            Some(batch) => batch,
            None => Err(TtaError::EmptyDataset(self.task.clone())),
        }
    }
}

/// One line of `metrics.jsonl`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepMetrics {
    pub step: usize,
    pub loss: f32,
    pub task_losses: BTreeMap<String, f32>,
}

/// Drives `max_steps` optimisation steps over a set of task streams
#[derive(Debug)]
pub struct TestTimeTrainer {
    config: AdaptationConfig,
    phase: AdaptationPhase,
    stats: TrainingStats,
    losses: Vec<f32>,
}

impl TestTimeTrainer {
    pub fn new(config: AdaptationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            phase: AdaptationPhase::Init,
            stats: TrainingStats::default(),
            losses: Vec::new(),
        })
    }

    pub fn phase(&self) -> AdaptationPhase {
        self.phase
    }

    pub fn stats(&self) -> &TrainingStats {
        &self.stats
    }

    /// Summed loss of every completed step
    pub fn losses(&self) -> &[f32] {
        &self.losses
    }

    /// Run the loop; each step sums the entropy of every task's batch,
    /// backpropagates the sum and takes one Adam step
    pub fn run<M: MergedModel>(&mut self, model: &mut M, tasks: &mut [TaskStream]) -> Result<()> {
        if self.phase != AdaptationPhase::Init {
            return Err(TtaError::Configuration("Trainer has already run".into()));
        }
        if tasks.is_empty() {
            return Err(TtaError::Configuration("No tasks to adapt on".into()));
        }

        let max_steps = self.config.max_steps;
        let mut optimizer = Adam::new(AdamConfig::with_lr(self.config.learning_rate));
        let mut checkpointer = Checkpointer::new(self.config.checkpoint_dir(), self.config.save_interval)?;
        let mut metrics = if max_steps > 0 {
            Some(self.open_metrics()?)
        } else {
            None
        };

        info!(
            "Adapting {} trainable parameters over {} tasks for {} steps",
            model.num_trainable(),
            tasks.len(),
            max_steps
        );
        self.phase = AdaptationPhase::Adapting;
        let start = Instant::now();

        for step in 0..max_steps {
            model.zero_grad();
            let mut total = 0.0f32;
            let mut samples = 0;
            let mut task_losses = BTreeMap::new();

            for task in tasks.iter_mut() {
                let batch = task.next_batch()?;
                let (features, trace) = model.forward(&batch.images)?;
                let (logits, logit_trace) = task.head.forward(&features)?;
                let (loss, d_logits) = entropy_loss(&logits)?;
                let d_features = task.head.backward(&logit_trace, &d_logits)?;
                model.backward(&trace, &d_features)?;

                total += loss;
                samples += batch.len();
                task_losses.insert(task.task.clone(), loss);
            }

            optimizer.step(model);

            self.losses.push(total);
            self.stats.record(total, samples);
            info!("step {}: loss = {:.6}", step, total);
            debug!("step {} task losses: {:?}", step, task_losses);

            if let Some(out) = metrics.as_mut() {
                let line = serde_json::to_string(&StepMetrics {
                    step,
                    loss: total,
                    task_losses,
                })?;
                writeln!(out, "{}", line)?;
            }

            checkpointer.maybe_save(step, &*model)?;
        }

        checkpointer.finalize(max_steps.checked_sub(1), &*model)?;
        if let Some(mut out) = metrics {
            out.flush()?;
        }

        self.stats.finish(start.elapsed().as_secs_f64());
        self.phase = AdaptationPhase::Done;
        info!(
            "Adaptation finished: {} steps, best loss {:.6}, {:.1}s",
            self.stats.steps, self.stats.best_loss, self.stats.elapsed_secs
        );
        Ok(())
    }

    fn open_metrics(&self) -> Result<BufWriter<File>> {
        std::fs::create_dir_all(&self.config.log_dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.config.log_dir.join("metrics.jsonl"))?;
        Ok(BufWriter::new(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_record() {
        let mut stats = TrainingStats::default();
        assert!(stats.loss_ema.is_nan());

        stats.record(2.0, 16);
        assert_eq!(stats.steps, 1);
        assert_eq!(stats.loss_ema, 2.0);

        stats.record(1.0, 16);
        stats.record(1.5, 8);
        assert_eq!(stats.samples, 40);
        assert_eq!(stats.best_loss, 1.0);
        assert_eq!(stats.last_loss, 1.5);
        // 0.9 * (0.9 * 2.0 + 0.1 * 1.0) + 0.1 * 1.5
        assert!((stats.loss_ema - 1.86).abs() < 1e-6);

        stats.finish(2.0);
        assert_eq!(stats.samples_per_sec, 20.0);
    }

    #[test]
    fn test_trainer_rejects_invalid_config() {
        let config = AdaptationConfig {
            save_interval: 0,
            ..Default::default()
        };
        assert!(matches!(
            TestTimeTrainer::new(config),
            Err(TtaError::Configuration(_))
        ));
    }

    #[test]
    fn test_trainer_starts_in_init() {
        let trainer = TestTimeTrainer::new(AdaptationConfig::default()).unwrap();
        assert_eq!(trainer.phase(), AdaptationPhase::Init);
        assert!(trainer.losses().is_empty());
        assert_eq!(trainer.stats().steps, 0);
    }
}
