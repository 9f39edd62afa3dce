//! End-to-end adaptation tests on a synthetic two-class task.
//!
//! The base encoder maps both images to the same features; the single expert
//! separates them. Merging more of the expert makes every prediction more
//! confident, so entropy minimisation should push the coefficient up.

use fusion_merging::{
    Activation, EncoderArch, Matrix, ModelWeights, Parameterized, VisionEncoder, WeightTensor,
};
use fusion_tta::{
    AdaptationConfig, Checkpoint, ClipAdaMerging, ClipBackbone, ClipDawe, Dataset, ImageProcessor,
    InMemoryDataset, InMemoryModelPool, MergingWeights, ModelPool, Result, StepMetrics, TaskRegistry,
    TaskSpec, TestTimeAdaptation, TextEncoder, TtaError, PRETRAINED,
};
use std::path::Path;
use std::sync::Arc;

const TASK: &str = "sides";

/// Prompts mentioning "left" embed to e0, "right" to e1
struct SideEncoder;

impl TextEncoder for SideEncoder {
    fn embed_dim(&self) -> usize {
        2
    }

    fn encode(&self, text: &str) -> Result<Vec<f32>> {
        if text.contains("left") {
            Ok(vec![1.0, 0.0])
        } else if text.contains("right") {
            Ok(vec![0.0, 1.0])
        } else {
            Ok(vec![0.5, 0.5])
        }
    }
}

fn encoder(name: &str, w: [f32; 4]) -> VisionEncoder {
    let arch = EncoderArch::new(vec![2, 2], Activation::Identity).unwrap();
    let mut weights = ModelWeights::new(name);
    weights.add_layer(WeightTensor::new("layers.0.weight", vec![2, 2], w.to_vec()).unwrap());
    weights.add_layer(WeightTensor::zeros("layers.0.bias", vec![2]));
    VisionEncoder::new(arch, weights).unwrap()
}

fn registry() -> TaskRegistry {
    let mut registry = TaskRegistry::with_builtin();
    registry
        .register(
            TASK,
            TaskSpec::new(
                vec!["left".into(), "right".into()],
                vec!["a photo on the {}.".into(), "the {} side.".into()],
            )
            .unwrap(),
        )
        .unwrap();
    registry
}

fn backbone() -> ClipBackbone {
    let identity = Matrix::new(2, 2, vec![1.0, 0.0, 0.0, 1.0]).unwrap();
    ClipBackbone::new("toy-clip", identity, 5.0f32.ln(), Arc::new(SideEncoder)).unwrap()
}

fn pool_with(task: &str, images: Vec<Vec<f32>>) -> InMemoryModelPool {
    let dataset: Arc<dyn Dataset> = Arc::new(InMemoryDataset::from_images(images));
    InMemoryModelPool::new(
        encoder(PRETRAINED, [0.5, 0.5, 0.5, 0.5]),
        ImageProcessor::new(2),
    )
    .with_expert(encoder(task, [1.0, 0.0, 0.0, 1.0]), dataset)
    .with_backbone(backbone())
}

fn pool() -> InMemoryModelPool {
    pool_with(TASK, vec![vec![1.0, 0.0], vec![0.0, 1.0]])
}

fn config(log_dir: &Path, max_steps: usize, save_interval: usize) -> AdaptationConfig {
    AdaptationConfig {
        max_steps,
        save_interval,
        learning_rate: 0.05,
        batch_size: 2,
        seed: Some(7),
        log_dir: log_dir.to_path_buf(),
        ..Default::default()
    }
}

fn checkpoint_steps(log_dir: &Path) -> Vec<usize> {
    let dir = log_dir.join("checkpoints");
    if !dir.exists() {
        return Vec::new();
    }
    let mut steps: Vec<usize> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| {
            let name = e.unwrap().file_name().to_string_lossy().into_owned();
            name.strip_prefix("model_")?
                .strip_suffix(".pt")?
                .parse()
                .ok()
        })
        .collect();
    steps.sort_unstable();
    steps
}

#[test]
fn test_entropy_trend_non_increasing() {
    let dir = tempfile::tempdir().unwrap();
    let mut algo = ClipAdaMerging::new(config(dir.path(), 20, 5), registry());
    let adapted = algo.run(&pool()).unwrap();

    assert_eq!(adapted.losses.len(), 20);
    let windows: Vec<f32> = adapted
        .losses
        .chunks(5)
        .map(|w| w.iter().sum::<f32>() / w.len() as f32)
        .collect();
    for pair in windows.windows(2) {
        assert!(pair[1] <= pair[0] + 1e-6, "window means {:?}", windows);
    }
    assert!(adapted.model.coefficient(0, 0) > 0.3);
    assert_eq!(adapted.stats.steps, 20);
}

#[test]
fn test_checkpoint_coverage() {
    let dir = tempfile::tempdir().unwrap();
    let mut algo = ClipAdaMerging::new(config(dir.path(), 10, 3), registry());
    let adapted = algo.run(&pool()).unwrap();

    assert_eq!(checkpoint_steps(dir.path()), vec![2, 5, 8, 9]);

    let last = Checkpoint::load(&dir.path().join("checkpoints/model_9.pt")).unwrap();
    assert_eq!(
        last.model["merge_weight"].data,
        adapted.model.merge_weight().data
    );
    assert!(last.model.contains_key("pretrained_model.layers.0.weight"));
    assert!(last.model.contains_key("task_vectors.0.layers.0.weight"));
}

#[test]
fn test_final_step_saved_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut algo = ClipAdaMerging::new(config(dir.path(), 6, 3), registry());
    algo.run(&pool()).unwrap();
    assert_eq!(checkpoint_steps(dir.path()), vec![2, 5]);
}

#[test]
fn test_zero_steps_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut algo = ClipAdaMerging::new(config(dir.path(), 0, 3), registry());
    let adapted = algo.run(&pool()).unwrap();

    assert!(adapted.losses.is_empty());
    assert!(checkpoint_steps(dir.path()).is_empty());
    assert!(!dir.path().join("metrics.jsonl").exists());
    assert_eq!(adapted.model.coefficient(0, 0), 0.3);
}

#[test]
fn test_metrics_log() {
    let dir = tempfile::tempdir().unwrap();
    let mut algo = ClipAdaMerging::new(config(dir.path(), 4, 10), registry());
    let adapted = algo.run(&pool()).unwrap();

    let text = std::fs::read_to_string(dir.path().join("metrics.jsonl")).unwrap();
    let lines: Vec<StepMetrics> = text
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[3].step, 3);
    assert!((lines[0].loss - adapted.losses[0]).abs() < 1e-6);
    assert!(lines[0].task_losses.contains_key(TASK));
}

#[test]
fn test_zero_coefficients_reproduce_base_logits() {
    let dir = tempfile::tempdir().unwrap();
    let pool = pool();
    let mut cfg = config(dir.path(), 0, 1);
    cfg.init_lambda = 0.0;
    let mut algo = ClipAdaMerging::new(cfg, registry());
    algo.on_adaptation_start(&pool).unwrap();
    let model = algo.construct_model(&pool).unwrap();

    let images = Matrix::new(2, 2, vec![1.0, 0.0, 0.3, 0.7]).unwrap();
    let merged = algo.compute_logits(&model, &images, TASK).unwrap();

    let base = pool.load_pretrained_model().unwrap();
    let head = algo.classifier().unwrap().logit_head(TASK).unwrap();
    let expected = head.forward(&base.forward(&images).unwrap()).unwrap().0;
    for (a, b) in merged.data.iter().zip(&expected.data) {
        assert!((a - b).abs() < 1e-6);
    }
}

#[test]
fn test_logits_shape_and_bounds() {
    let dir = tempfile::tempdir().unwrap();
    let pool = pool();
    let mut algo = ClipAdaMerging::new(config(dir.path(), 0, 1), registry());
    algo.on_adaptation_start(&pool).unwrap();
    let model = algo.construct_model(&pool).unwrap();

    let images = Matrix::new(3, 2, vec![1.0, 0.0, -2.0, 0.5, 0.0, 0.0]).unwrap();
    let logits = algo.compute_logits(&model, &images, TASK).unwrap();
    assert_eq!(logits.shape(), (3, 2));
    assert!(logits.data.iter().all(|v| v.is_finite() && v.abs() <= 5.0 + 1e-4));
}

#[test]
fn test_layer_wise_with_prefetch_and_half_vectors() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path(), 6, 100);
    cfg.merge_mode = fusion_merging::MergeMode::LayerWise;
    cfg.num_workers = 2;
    cfg.batch_size = 1;
    cfg.task_vector_dtype = Some("float16".into());
    let mut algo = ClipAdaMerging::new(cfg, registry());
    let adapted = algo.run(&pool()).unwrap();

    assert_eq!(adapted.model.merge_weight().shape, vec![1, 2]);
    assert!(adapted.losses.iter().all(|l| l.is_finite()));
    assert_eq!(checkpoint_steps(dir.path()), vec![5]);
}

#[test]
fn test_merging_weights_exported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out/merging_weights.json");
    let mut cfg = config(dir.path(), 3, 10);
    cfg.save_merging_weights = Some(path.clone());
    let mut algo = ClipAdaMerging::new(cfg, registry());
    let adapted = algo.run(&pool()).unwrap();

    let saved = MergingWeights::load(&path).unwrap();
    assert_eq!(saved.tasks, vec![TASK.to_string()]);
    assert_eq!(saved.merging_weights, adapted.model.merging_weights());
}

#[test]
fn test_zero_shot_heads_cached_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let cache = dir.path().join("cache");
    let mut cfg = config(dir.path(), 1, 1);
    cfg.cache_dir = Some(cache.clone());
    let mut algo = ClipAdaMerging::new(cfg, registry());
    algo.run(&pool()).unwrap();

    assert!(cache.join("toy-clip_sides_zeroshot_weights.pt").exists());
}

#[test]
fn test_empty_dataset_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut algo = ClipAdaMerging::new(config(dir.path(), 3, 1), registry());
    let err = algo.run(&pool_with(TASK, Vec::new())).unwrap_err();
    assert!(matches!(err, TtaError::EmptyDataset(task) if task == TASK));
}

#[test]
fn test_unknown_task_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut algo = ClipAdaMerging::new(config(dir.path(), 3, 1), registry());
    let err = algo
        .run(&pool_with("mystery", vec![vec![1.0, 0.0]]))
        .unwrap_err();
    assert!(matches!(err, TtaError::UnknownTask(task) if task == "mystery"));
}

#[test]
fn test_dawe_adapts_gate_only() {
    let dir = tempfile::tempdir().unwrap();
    let dict = encoder("dict", [1.0, 0.0, 0.0, 1.0]);
    let mut cfg = config(dir.path(), 5, 5);
    cfg.batch_reduce = false;
    let mut algo = ClipDawe::new(cfg, registry(), Arc::new(dict));
    let mut adapted = algo.run(&pool()).unwrap();

    assert_eq!(adapted.losses.len(), 5);
    assert!(adapted.losses.iter().all(|l| l.is_finite()));
    assert_eq!(adapted.model.hidden_size(), 2);

    let mut names = Vec::new();
    adapted
        .model
        .visit_trainable(&mut |name, _, _| names.push(name.to_string()));
    assert!(names.iter().all(|n| n.starts_with("gate.")));

    let ckpt = Checkpoint::load(&dir.path().join("checkpoints/model_4.pt")).unwrap();
    assert!(ckpt.model.contains_key("gate.layers.1.bias"));
}

#[test]
fn test_dawe_requires_hidden_size() {
    struct Opaque;

    impl fusion_merging::FeatureExtractor for Opaque {
        fn hidden_size(&self) -> Option<usize> {
            None
        }

        fn extract(&self, images: &Matrix) -> fusion_merging::Result<Matrix> {
            Ok(images.clone())
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let mut algo = ClipDawe::new(config(dir.path(), 1, 1), registry(), Arc::new(Opaque));
    assert!(matches!(
        algo.run(&pool()),
        Err(TtaError::Configuration(_))
    ));
}
