//! Datasets, image preprocessing and a batching loader with optional
//! prefetch workers

use crate::{Result, TtaError};
use crossbeam_channel::{bounded, unbounded, Receiver};
use fusion_merging::Matrix;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use tracing::debug;

/// Single dataset entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Flattened image values
    pub image: Vec<f32>,
    /// Class label, unused by unsupervised adaptation
    pub label: Option<usize>,
}

impl Sample {
    pub fn new(image: Vec<f32>, label: Option<usize>) -> Self {
        Self { image, label }
    }
}

/// Collated samples
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// `batch x input_dim`
    pub images: Matrix,
    pub labels: Vec<Option<usize>>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.images.rows
    }

    pub fn is_empty(&self) -> bool {
        self.images.rows == 0
    }
}

/// Indexable collection of samples
pub trait Dataset: Send + Sync {
    fn len(&self) -> usize;

    fn get(&self, index: usize) -> Result<Sample>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Dataset held in memory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InMemoryDataset {
    samples: Vec<Sample>,
}

impl InMemoryDataset {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    /// Unlabeled dataset from raw images
    pub fn from_images(images: Vec<Vec<f32>>) -> Self {
        Self {
            samples: images.into_iter().map(|image| Sample::new(image, None)).collect(),
        }
    }
}

impl Dataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> Result<Sample> {
        self.samples.get(index).cloned().ok_or_else(|| {
            TtaError::Compute(format!(
                "Sample index {} out of range ({} samples)",
                index,
                self.samples.len()
            ))
        })
    }
}

/// Converts raw images into encoder inputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageProcessor {
    /// Expected flattened image length
    pub input_dim: usize,
    /// Per-channel mean subtracted before scaling
    #[serde(default)]
    pub mean: f32,
    /// Per-channel standard deviation
    #[serde(default = "default_std")]
    pub std: f32,
}

fn default_std() -> f32 {
    1.0
}

impl ImageProcessor {
    pub fn new(input_dim: usize) -> Self {
        Self {
            input_dim,
            mean: 0.0,
            std: 1.0,
        }
    }

    pub fn with_normalization(mut self, mean: f32, std: f32) -> Self {
        self.mean = mean;
        self.std = std;
        self
    }

    /// `(x - mean) / std` after checking the image length
    pub fn process(&self, image: &[f32]) -> Result<Vec<f32>> {
        if image.len() != self.input_dim {
            return Err(TtaError::Compute(format!(
                "Image has {} values, processor expects {}",
                image.len(),
                self.input_dim
            )));
        }
        if self.std == 0.0 {
            return Err(TtaError::Configuration("Processor std must be non-zero".into()));
        }
        Ok(image.iter().map(|x| (x - self.mean) / self.std).collect())
    }
}

/// Dataset view applying an [`ImageProcessor`] to every sample
pub struct ProcessedDataset {
    inner: Arc<dyn Dataset>,
    processor: ImageProcessor,
}

impl ProcessedDataset {
    pub fn new(inner: Arc<dyn Dataset>, processor: ImageProcessor) -> Self {
        Self { inner, processor }
    }
}

impl Dataset for ProcessedDataset {
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn get(&self, index: usize) -> Result<Sample> {
        let sample = self.inner.get(index)?;
        Ok(Sample {
            image: self.processor.process(&sample.image)?,
            label: sample.label,
        })
    }
}

fn collate(dataset: &dyn Dataset, indices: &[usize]) -> Result<Batch> {
    let mut rows = Vec::with_capacity(indices.len());
    let mut labels = Vec::with_capacity(indices.len());
    for &i in indices {
        let sample = dataset.get(i)?;
        rows.push(sample.image);
        labels.push(sample.label);
    }
    Ok(Batch {
        images: Matrix::from_rows(&rows)?,
        labels,
    })
}

/// Batches a dataset, reshuffling on every pass when enabled
pub struct DataLoader {
    dataset: Arc<dyn Dataset>,
    batch_size: usize,
    shuffle: bool,
    num_workers: usize,
    rng: StdRng,
}

impl std::fmt::Debug for DataLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataLoader")
            .field("len", &self.dataset.len())
            .field("batch_size", &self.batch_size)
            .field("shuffle", &self.shuffle)
            .field("num_workers", &self.num_workers)
            .finish()
    }
}

impl DataLoader {
    pub fn new(dataset: Arc<dyn Dataset>, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(TtaError::Configuration("batch_size must be positive".into()));
        }
        Ok(Self {
            dataset,
            batch_size,
            shuffle: false,
            num_workers: 0,
            rng: StdRng::from_entropy(),
        })
    }

    /// Shuffle every pass; `seed` makes the order sequence reproducible
    pub fn shuffled(mut self, seed: Option<u64>) -> Self {
        self.shuffle = true;
        if let Some(seed) = seed {
            self.rng = StdRng::seed_from_u64(seed);
        }
        self
    }

    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Host tensors are never pinned; the flag is accepted and ignored
    pub fn with_pin_memory(self, pin_memory: bool) -> Self {
        if pin_memory {
            debug!("pin_memory requested; no-op on the host backend");
        }
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Batches per pass (the last batch may be short)
    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// Start a new pass
    pub fn iter(&mut self) -> Result<LoaderIter> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            order.shuffle(&mut self.rng);
        }
        let batches: Vec<Vec<usize>> = order.chunks(self.batch_size).map(<[usize]>::to_vec).collect();

        if self.num_workers == 0 || batches.is_empty() {
            return Ok(LoaderIter::Sequential {
                dataset: Arc::clone(&self.dataset),
                batches: batches.into_iter(),
            });
        }
        LoaderIter::prefetch(Arc::clone(&self.dataset), batches, self.num_workers)
    }
}

/// One pass over a [`DataLoader`]
pub enum LoaderIter {
    Sequential {
        dataset: Arc<dyn Dataset>,
        batches: std::vec::IntoIter<Vec<usize>>,
    },
    Prefetch(Prefetcher),
}

impl LoaderIter {
    fn prefetch(dataset: Arc<dyn Dataset>, batches: Vec<Vec<usize>>, workers: usize) -> Result<Self> {
        let total = batches.len();
        let (job_tx, job_rx) = unbounded::<(usize, Vec<usize>)>();
        for job in batches.into_iter().enumerate() {
            // Receiver is alive; cannot fail
            let _ = job_tx.send(job);
        }
        drop(job_tx);

        let (result_tx, result_rx) = bounded::<(usize, Result<Batch>)>(2 * workers);
        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let jobs = job_rx.clone();
            let results = result_tx.clone();
            let dataset = Arc::clone(&dataset);
            let handle = thread::Builder::new()
                .name(format!("loader-{}", idx))
                .spawn(move || {
                    while let Ok((i, indices)) = jobs.recv() {
                        let batch = collate(dataset.as_ref(), &indices);
                        if results.send((i, batch)).is_err() {
                            break;
                        }
                    }
                })
                .map_err(|e| TtaError::Compute(format!("Failed to spawn loader worker: {}", e)))?;
            handles.push(handle);
        }

        Ok(LoaderIter::Prefetch(Prefetcher {
            results: Some(result_rx),
            pending: BTreeMap::new(),
            next: 0,
            total,
            handles,
        }))
    }
}

impl Iterator for LoaderIter {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            LoaderIter::Sequential { dataset, batches } => {
                let indices = batches.next()?;
                Some(collate(dataset.as_ref(), &indices))
            }
            LoaderIter::Prefetch(p) => p.next_batch(),
        }
    }
}

/// Worker pool feeding batches through a bounded channel, reassembled in order
pub struct Prefetcher {
    results: Option<Receiver<(usize, Result<Batch>)>>,
    pending: BTreeMap<usize, Result<Batch>>,
    next: usize,
    total: usize,
    handles: Vec<thread::JoinHandle<()>>,
}

impl Prefetcher {
    fn next_batch(&mut self) -> Option<Result<Batch>> {
        if self.next >= self.total {
            return None;
        }
        loop {
            if let Some(batch) = self.pending.remove(&self.next) {
                self.next += 1;
                return Some(batch);
            }
            match self.results.as_ref()?.recv() {
                Ok((i, batch)) => {
                    self.pending.insert(i, batch);
                }
                Err(_) => {
                    self.next = self.total;
                    return Some(Err(TtaError::Compute(
                        "Loader workers exited before delivering every batch".into(),
                    )));
                }
            }
        }
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        // Disconnect first so workers blocked on a full channel wake up
        self.results.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
