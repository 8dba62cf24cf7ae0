//! 学習・評価ドライバ
//!
//! 1つの実験は次の段階を順に進みます（後戻りなし、失敗したら中断）:
//! `Configured → DataBound → Compiled → Fitting → Evaluating → Persisted`

use anyhow::{Context, Result};
use burn::{data::dataset::Dataset, module::AutodiffModule, tensor::backend::AutodiffBackend};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::backend::{self, CpuBackend, GpuBackend};
use crate::dataset::{BatchGenerator, ChannelStream, ClassLabelMap, ImageCorpus};
use crate::error::ExperimentError;
use crate::ml::callbacks::{
    CsvLogger, EarlyStopping, ModelCheckpoint, ReduceLrOnPlateau, TrainingCallback,
};
use crate::ml::classifier::{CompiledModel, ExpressionClassifier, InputShape};
use crate::ml::evaluation::{materialize, predict};
use crate::ml::history::TrainingHistory;
use crate::ml::training::{fit, FitPlan};
use crate::ml::{build_baseline_cnn, build_efficientnet_b0, build_resnet50};
use crate::model::config::{Architecture, DatasetSettings, DeviceType, ExperimentConfig, SuiteConfig};
use crate::model::{save_trained_model, ModelMetadata};
use crate::report::{save_confusion_heatmap, ClassificationReport, ConfusionMatrix};

/// 実験の進行段階
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunStage {
    Configured,
    DataBound,
    Compiled,
    Fitting,
    Evaluating,
    Persisted,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStage::Configured => "Configured",
            RunStage::DataBound => "DataBound",
            RunStage::Compiled => "Compiled",
            RunStage::Fitting => "Fitting",
            RunStage::Evaluating => "Evaluating",
            RunStage::Persisted => "Persisted",
        };
        f.write_str(name)
    }
}

/// 段階を前にだけ進める
#[derive(Debug)]
struct StageTracker {
    name: String,
    stage: RunStage,
}

impl StageTracker {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            stage: RunStage::Configured,
        }
    }

    fn advance(&mut self, next: RunStage) {
        debug_assert!(next > self.stage, "{} -> {} は逆行です", self.stage, next);
        tracing::info!("[{}] {} -> {}", self.name, self.stage, next);
        self.stage = next;
    }
}

/// train/test の両コーパスとクラス対応表
///
/// 実験スイート内の全実験で共有します。
#[derive(Debug, Clone)]
pub struct BoundData {
    pub labels: ClassLabelMap,
    pub train: Arc<ImageCorpus>,
    pub test: Arc<ImageCorpus>,
}

/// データセットを読み込み、クラス構成を検証する
pub fn bind_data(settings: &DatasetSettings) -> Result<BoundData> {
    let labels = ClassLabelMap::from_directory(&settings.train_dir)?;
    let test_labels = ClassLabelMap::from_directory(&settings.test_dir)?;
    labels.ensure_same_classes(&test_labels)?;

    if labels.len() != settings.num_classes {
        return Err(ExperimentError::ClassCountMismatch {
            expected: settings.num_classes,
            actual: labels.len(),
        }
        .into());
    }

    let train = ImageCorpus::from_directory(&settings.train_dir, &labels, settings.image_size)?;
    let test = ImageCorpus::from_directory(&settings.test_dir, &labels, settings.image_size)?;

    tracing::info!(
        "データセット: train {}枚, test {}枚, クラス {:?}",
        train.len(),
        test.len(),
        labels.names()
    );
    for (name, count) in labels.names().iter().zip(train.class_distribution()) {
        tracing::debug!("  {}: {}枚", name, count);
    }

    Ok(BoundData {
        labels,
        train: Arc::new(train),
        test: Arc::new(test),
    })
}

/// 1実験で書き出したファイル
#[derive(Debug, Clone)]
pub struct ExperimentArtifacts {
    /// `.mpk` を除いたベース名
    pub checkpoint: PathBuf,
    pub training_log: PathBuf,
    pub history_csv: PathBuf,
    pub model: PathBuf,
    pub heatmap: Option<PathBuf>,
}

impl ExperimentArtifacts {
    fn plan(name: &str, suite: &SuiteConfig) -> Self {
        let checkpoint_dir = &suite.output.checkpoint_dir;
        let results_dir = &suite.output.results_dir;
        Self {
            checkpoint: checkpoint_dir.join(format!("{}_best_model", name)),
            training_log: checkpoint_dir.join(format!("{}_training.log", name)),
            history_csv: results_dir.join(format!("{}_training_history.csv", name)),
            model: results_dir.join(format!("{}_model.tar.gz", name)),
            heatmap: suite
                .output
                .render_heatmap
                .then(|| results_dir.join(format!("{}_confusion_matrix.svg", name))),
        }
    }

    pub fn checkpoint_file(&self) -> PathBuf {
        self.checkpoint.with_extension("mpk")
    }
}

/// 1実験の結果
#[derive(Debug, Clone)]
pub struct ExperimentReport {
    pub name: String,
    pub architecture: Architecture,
    pub stage: RunStage,
    pub history: TrainingHistory,
    pub confusion: ConfusionMatrix,
    pub report: ClassificationReport,
    pub stopped_early: bool,
    pub artifacts: ExperimentArtifacts,
}

impl ExperimentReport {
    pub fn summary(&self) -> String {
        let best = self
            .history
            .best_val_loss()
            .map(|logs| format!("{:.4} (epoch {})", logs.val_loss, logs.epoch + 1))
            .unwrap_or_else(|| "-".to_string());
        format!(
            "{}: {}エポック{}, best val_loss {}, test accuracy {:.4}",
            self.name,
            self.history.len(),
            if self.stopped_early { "（早期終了）" } else { "" },
            best,
            self.report.accuracy
        )
    }
}

/// 設定された全実験を順番に実行する
pub fn run_suite(config: &SuiteConfig) -> Result<Vec<ExperimentReport>> {
    tracing::info!("バックエンド: {}", backend::backend_name(config.device_type));
    match config.device_type {
        DeviceType::Wgpu => run_suite_on::<GpuBackend>(config, &backend::gpu_device()),
        DeviceType::Cpu => run_suite_on::<CpuBackend>(config, &backend::cpu_device()),
    }
}

fn run_suite_on<B: AutodiffBackend>(
    config: &SuiteConfig,
    device: &B::Device,
) -> Result<Vec<ExperimentReport>> {
    let data = bind_data(&config.dataset)?;

    config
        .experiments
        .iter()
        .map(|experiment| {
            run_experiment::<B>(experiment, config, &data, device)
                .with_context(|| format!("実験 {} が失敗しました", experiment.name))
        })
        .collect()
}

/// 1つの実験をアーキテクチャに応じて組み立てて実行する
pub fn run_experiment<B: AutodiffBackend>(
    experiment: &ExperimentConfig,
    suite: &SuiteConfig,
    data: &BoundData,
    device: &B::Device,
) -> Result<ExperimentReport> {
    let minimum = experiment.architecture.min_image_size();
    if suite.dataset.image_size < minimum {
        return Err(ExperimentError::ImageTooSmall {
            architecture: experiment.architecture.to_string(),
            size: suite.dataset.image_size,
            minimum,
        }
        .into());
    }

    let mut tracker = StageTracker::new(&experiment.name);
    tracker.advance(RunStage::DataBound);

    let input_shape = InputShape::square(
        suite.dataset.image_size,
        experiment.architecture.input_channels(),
    );
    let num_classes = data.labels.len();

    tracing::info!(
        "[{}] {} を構築: 入力 {}x{}x{}, バッチサイズ {}",
        experiment.name,
        experiment.architecture,
        input_shape.height,
        input_shape.width,
        input_shape.channels,
        experiment.batch_size
    );

    match experiment.architecture {
        Architecture::BaselineCnn => drive::<B, _>(
            build_baseline_cnn::<B>(input_shape, num_classes, device),
            experiment,
            suite,
            data,
            device,
            tracker,
        ),
        Architecture::ResNet50 => drive::<B, _>(
            build_resnet50::<B>(input_shape, num_classes, device),
            experiment,
            suite,
            data,
            device,
            tracker,
        ),
        Architecture::EfficientNetB0 => drive::<B, _>(
            build_efficientnet_b0::<B>(input_shape, num_classes, device),
            experiment,
            suite,
            data,
            device,
            tracker,
        ),
    }
}

fn drive<B, M>(
    compiled: CompiledModel<M>,
    experiment: &ExperimentConfig,
    suite: &SuiteConfig,
    data: &BoundData,
    device: &B::Device,
    mut tracker: StageTracker,
) -> Result<ExperimentReport>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + ExpressionClassifier<B> + 'static,
    M::InnerModule: ExpressionClassifier<B::InnerBackend>,
{
    let name = experiment.name.as_str();
    let batch_size = experiment.batch_size;
    let channels = experiment.architecture.input_channels();
    let augmentation = &suite.dataset.augmentation;
    let artifacts = ExperimentArtifacts::plan(name, suite);

    let compiled = compiled.with_learning_rate(suite.training.learning_rate);
    tracker.advance(RunStage::Compiled);

    let plan = FitPlan::from_samples(
        suite.training.num_epochs,
        data.train.len(),
        data.test.len(),
        batch_size,
    )?;

    let mut train = ChannelStream::new(
        BatchGenerator::training(
            data.train.clone(),
            augmentation,
            batch_size,
            suite.training.seed,
        ),
        channels,
    );
    let test_corpus = data.test.clone();
    let rescale = augmentation.rescale;
    let make_test_stream = move || {
        ChannelStream::new(
            BatchGenerator::evaluation(test_corpus.clone(), rescale, batch_size),
            channels,
        )
    };

    let callback_settings = &suite.callbacks;
    let mut callbacks: Vec<Box<dyn TrainingCallback<B, M>>> = vec![
        Box::new(ModelCheckpoint::new(&artifacts.checkpoint)),
        Box::new(EarlyStopping::<M>::new(
            callback_settings.early_stopping_patience,
            callback_settings.restore_best_weights,
        )),
        Box::new(ReduceLrOnPlateau::new(
            callback_settings.lr_reduce_factor,
            callback_settings.lr_reduce_patience,
            callback_settings.min_learning_rate,
        )),
        Box::new(CsvLogger::new(&artifacts.training_log)),
    ];

    tracker.advance(RunStage::Fitting);
    let outcome = fit(
        compiled,
        &mut train,
        &make_test_stream,
        &plan,
        &mut callbacks,
        device,
    )?;

    tracker.advance(RunStage::Evaluating);
    let test_data = materialize(make_test_stream(), plan.validation_steps)?
        .ok_or_else(|| ExperimentError::EmptyCorpus(data.test.root().to_path_buf()))?;
    let model = outcome.model.valid();
    let predictions = predict::<B::InnerBackend, _>(&model, &test_data, batch_size, device)?;

    let class_names = data.labels.names();
    let confusion =
        ConfusionMatrix::from_predictions(&predictions.y_true, &predictions.y_pred, data.labels.len());
    let report = ClassificationReport::from_confusion(&confusion, class_names);

    println!("\n=== {} 混同行列 ===", name);
    print!("{}", confusion.render(class_names));
    println!("\n=== {} 分類レポート ===", name);
    print!("{}", report);

    if let Some(path) = &artifacts.heatmap {
        save_confusion_heatmap(&confusion, class_names, &format!("{} Confusion Matrix", name), path)
            .with_context(|| format!("ヒートマップの保存に失敗: {}", path.display()))?;
        tracing::info!("[{}] ヒートマップ: {}", name, path.display());
    }

    persist::<B::InnerBackend, _>(
        name,
        experiment,
        &outcome.history,
        &report,
        outcome.learning_rate,
        model,
        &artifacts,
        data,
        suite,
    )?;
    tracker.advance(RunStage::Persisted);

    Ok(ExperimentReport {
        name: name.to_string(),
        architecture: experiment.architecture,
        stage: tracker.stage,
        history: outcome.history,
        confusion,
        report,
        stopped_early: outcome.stopped_early,
        artifacts,
    })
}

#[allow(clippy::too_many_arguments)]
fn persist<B, M>(
    name: &str,
    experiment: &ExperimentConfig,
    history: &TrainingHistory,
    report: &ClassificationReport,
    learning_rate: f64,
    model: M,
    artifacts: &ExperimentArtifacts,
    data: &BoundData,
    suite: &SuiteConfig,
) -> Result<()>
where
    B: burn::tensor::backend::Backend,
    M: burn::module::Module<B>,
{
    ensure_dir(&suite.output.results_dir)?;
    history.write_csv(&artifacts.history_csv)?;

    let metadata = ModelMetadata::new(
        name,
        experiment.architecture,
        data.labels.names().to_vec(),
        InputShape::square(
            suite.dataset.image_size,
            experiment.architecture.input_channels(),
        ),
        experiment.batch_size,
    )
    .with_training_summary(
        history.len(),
        history.best_val_loss().map(|logs| logs.val_loss),
        learning_rate,
    )
    .with_test_accuracy(report.accuracy);

    let saved = save_trained_model::<B, M>(&artifacts.model, &metadata, model)?;
    tracing::info!(
        "[{}] 学習履歴: {}, モデル: {}",
        name,
        artifacts.history_csv.display(),
        saved.display()
    );
    Ok(())
}

fn ensure_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("ディレクトリを作成できません: {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::{CallbackSettings, OutputSettings, TrainingSettings};
    use crate::model::load_metadata;
    use image::{GrayImage, Luma};
    use tempfile::{tempdir, TempDir};

    fn write_tree(root: &Path, classes: &[&str], per_class: usize) {
        for (c, class) in classes.iter().enumerate() {
            let dir = root.join(class);
            std::fs::create_dir_all(&dir).unwrap();
            for i in 0..per_class {
                let value = (c * 120 + i * 20) as u8;
                GrayImage::from_pixel(10, 10, Luma([value]))
                    .save(dir.join(format!("{}.png", i)))
                    .unwrap();
            }
        }
    }

    fn tiny_suite(dir: &TempDir) -> SuiteConfig {
        let root = dir.path();
        write_tree(&root.join("train"), &["angry", "happy"], 2);
        write_tree(&root.join("test"), &["angry", "happy"], 2);

        SuiteConfig {
            device_type: DeviceType::Cpu,
            dataset: DatasetSettings {
                train_dir: root.join("train"),
                test_dir: root.join("test"),
                image_size: 8,
                num_classes: 2,
                augmentation: Default::default(),
            },
            training: TrainingSettings {
                num_epochs: 1,
                ..TrainingSettings::default()
            },
            callbacks: CallbackSettings::default(),
            output: OutputSettings {
                checkpoint_dir: root.join("checkpoints"),
                results_dir: root.join("results"),
                render_heatmap: true,
            },
            experiments: vec![ExperimentConfig::new(Architecture::BaselineCnn).with_batch_size(2)],
        }
    }

    #[test]
    fn test_stage_order_is_forward() {
        assert!(RunStage::Configured < RunStage::DataBound);
        assert!(RunStage::Evaluating < RunStage::Persisted);

        let mut tracker = StageTracker::new("demo");
        tracker.advance(RunStage::DataBound);
        tracker.advance(RunStage::Compiled);
        assert_eq!(tracker.stage, RunStage::Compiled);
    }

    #[test]
    fn test_artifact_names() {
        let suite = SuiteConfig::default();
        let artifacts = ExperimentArtifacts::plan("ResNet50", &suite);
        assert_eq!(artifacts.checkpoint_file(), PathBuf::from("./ResNet50_best_model.mpk"));
        assert_eq!(artifacts.training_log, PathBuf::from("./ResNet50_training.log"));
        assert_eq!(
            artifacts.history_csv,
            PathBuf::from("./results_models/ResNet50_training_history.csv")
        );
        assert_eq!(
            artifacts.model,
            PathBuf::from("./results_models/ResNet50_model.tar.gz")
        );
    }

    #[test]
    fn test_bind_data_rejects_mismatched_classes() {
        let dir = tempdir().unwrap();
        write_tree(&dir.path().join("train"), &["angry", "happy"], 1);
        write_tree(&dir.path().join("test"), &["angry", "sad"], 1);

        let settings = DatasetSettings {
            train_dir: dir.path().join("train"),
            test_dir: dir.path().join("test"),
            image_size: 8,
            num_classes: 2,
            augmentation: Default::default(),
        };
        let err = bind_data(&settings).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExperimentError>(),
            Some(ExperimentError::ClassSetMismatch { .. })
        ));
    }

    #[test]
    fn test_bind_data_rejects_wrong_class_count() {
        let dir = tempdir().unwrap();
        write_tree(&dir.path().join("train"), &["angry", "happy"], 1);
        write_tree(&dir.path().join("test"), &["angry", "happy"], 1);

        let settings = DatasetSettings {
            train_dir: dir.path().join("train"),
            test_dir: dir.path().join("test"),
            image_size: 8,
            num_classes: 7,
            augmentation: Default::default(),
        };
        let err = bind_data(&settings).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExperimentError>(),
            Some(ExperimentError::ClassCountMismatch { expected: 7, actual: 2 })
        ));
    }

    #[test]
    fn test_insufficient_samples_aborts_before_fitting() {
        let dir = tempdir().unwrap();
        let mut suite = tiny_suite(&dir);
        suite.experiments = vec![ExperimentConfig::new(Architecture::BaselineCnn).with_batch_size(64)];

        let err = run_suite(&suite).unwrap_err();
        assert!(err
            .chain()
            .any(|cause| matches!(
                cause.downcast_ref::<ExperimentError>(),
                Some(ExperimentError::InsufficientSamples { samples: 4, batch_size: 64 })
            )));
        assert!(!suite.output.results_dir.join("BaselineCNN_model.tar.gz").exists());
    }

    #[test]
    fn test_end_to_end_single_epoch() {
        let dir = tempdir().unwrap();
        let suite = tiny_suite(&dir);

        let reports = run_suite(&suite).unwrap();
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!(report.stage, RunStage::Persisted);
        assert_eq!(report.history.len(), 1);
        assert_eq!(report.confusion.total(), 4);
        assert_eq!(report.confusion.row_sums(), vec![2, 2]);

        let history = std::fs::read_to_string(&report.artifacts.history_csv).unwrap();
        assert_eq!(history.lines().count(), 2);

        let log = std::fs::read_to_string(&report.artifacts.training_log).unwrap();
        assert_eq!(log.lines().count(), 2);

        assert!(report.artifacts.checkpoint_file().exists());
        assert!(std::fs::metadata(&report.artifacts.model).unwrap().len() > 0);
        assert!(report.artifacts.heatmap.as_ref().unwrap().exists());

        let metadata = load_metadata(&report.artifacts.model).unwrap();
        assert_eq!(metadata.class_labels, vec!["angry", "happy"]);
        assert_eq!(metadata.epochs_run, 1);
        assert_eq!(metadata.architecture, Architecture::BaselineCnn);
    }

    #[test]
    fn test_backbone_receives_three_channel_batches() {
        let dir = tempdir().unwrap();
        let mut suite = tiny_suite(&dir);
        suite.output.render_heatmap = false;
        suite.experiments =
            vec![ExperimentConfig::new(Architecture::EfficientNetB0).with_batch_size(2)];

        let reports = run_suite(&suite).unwrap();
        let report = &reports[0];
        assert_eq!(report.stage, RunStage::Persisted);
        assert_eq!(report.history.len(), 1);
        assert_eq!(report.confusion.total(), 4);
        assert!(report.artifacts.heatmap.is_none());

        let metadata = load_metadata(&report.artifacts.model).unwrap();
        assert_eq!(metadata.architecture, Architecture::EfficientNetB0);
        assert_eq!(metadata.input_shape.channels, 3);
        assert_eq!(metadata.input_shape.height, 8);
    }

    #[test]
    fn test_undersized_input_is_rejected_before_building() {
        let dir = tempdir().unwrap();
        let mut suite = tiny_suite(&dir);
        suite.dataset.image_size = 6;

        let err = run_suite(&suite).unwrap_err();
        assert!(err.chain().any(|cause| matches!(
            cause.downcast_ref::<ExperimentError>(),
            Some(ExperimentError::ImageTooSmall { size: 6, minimum: 8, .. })
        )));
        assert!(!suite.output.checkpoint_dir.join("BaselineCNN_training.log").exists());
    }
}
