//! エポック単位の学習ループ
//!
//! 1エポック = 学習バッチ `steps_per_epoch` 個 + 検証バッチ `validation_steps` 個。
//! エポック終了時に履歴へ1行追加し、登録されたコールバックを順に呼びます。

use anyhow::{Context, Result};
use burn::{
    module::AutodiffModule,
    optim::{GradientsParams, Optimizer},
    tensor::{backend::AutodiffBackend, backend::Backend, ElementConversion},
    train::ClassificationOutput,
};

use crate::dataset::ImageBatch;
use crate::error::ExperimentError;
use crate::ml::callbacks::{TrainingCallback, TrainingContext};
use crate::ml::classifier::{CompiledModel, ExpressionClassifier};
use crate::ml::history::{EpochLogs, TrainingHistory};

/// 1エポックあたりのステップ数（端数のサンプルは切り捨て）
pub fn steps_for(samples: usize, batch_size: usize) -> usize {
    samples / batch_size.max(1)
}

/// 学習の規模
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FitPlan {
    pub epochs: usize,
    pub steps_per_epoch: usize,
    pub validation_steps: usize,
}

impl FitPlan {
    /// サンプル数とバッチサイズから組み立てる
    ///
    /// どちらかのステップ数が0になる場合は `InsufficientSamples` を返します。
    pub fn from_samples(
        epochs: usize,
        train_samples: usize,
        validation_samples: usize,
        batch_size: usize,
    ) -> Result<Self, ExperimentError> {
        let steps_per_epoch = steps_for(train_samples, batch_size);
        let validation_steps = steps_for(validation_samples, batch_size);

        for samples in [train_samples, validation_samples] {
            if steps_for(samples, batch_size) == 0 {
                return Err(ExperimentError::InsufficientSamples {
                    samples,
                    batch_size,
                });
            }
        }

        Ok(Self {
            epochs,
            steps_per_epoch,
            validation_steps,
        })
    }
}

/// 学習結果
pub struct FitOutcome<M> {
    pub model: M,
    pub history: TrainingHistory,
    pub learning_rate: f64,
    pub stopped_early: bool,
}

/// サンプル数で重み付けした損失と正解数の集計
#[derive(Debug, Default, Clone, Copy)]
struct MetricAccumulator {
    loss_sum: f64,
    correct: usize,
    samples: usize,
}

impl MetricAccumulator {
    fn update<B: Backend>(&mut self, output: &ClassificationOutput<B>) -> f64 {
        let batch_size = output.targets.dims()[0];
        let loss: f64 = output.loss.clone().into_scalar().elem();

        let predictions = output.output.clone().argmax(1).reshape([batch_size]);
        let correct: i64 = predictions
            .equal(output.targets.clone())
            .int()
            .sum()
            .into_scalar()
            .elem();

        self.loss_sum += loss * batch_size as f64;
        self.correct += correct as usize;
        self.samples += batch_size;
        loss
    }

    fn loss(&self) -> f64 {
        if self.samples == 0 {
            return f64::NAN;
        }
        self.loss_sum / self.samples as f64
    }

    fn accuracy(&self) -> f64 {
        if self.samples == 0 {
            return 0.0;
        }
        self.correct as f64 / self.samples as f64
    }
}

/// モデルを学習する
///
/// # 引数
/// - `train`: 学習バッチ列（尽きるとエラー）
/// - `make_validation`: エポックごとに呼ばれ、先頭から読む検証バッチ列を返す
/// - `callbacks`: エポック終了ごとに登録順で呼ばれる
pub fn fit<B, M, T, V, F>(
    compiled: CompiledModel<M>,
    train: &mut T,
    mut make_validation: F,
    plan: &FitPlan,
    callbacks: &mut [Box<dyn TrainingCallback<B, M>>],
    device: &B::Device,
) -> Result<FitOutcome<M>>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + ExpressionClassifier<B>,
    M::InnerModule: ExpressionClassifier<B::InnerBackend>,
    T: Iterator<Item = Result<ImageBatch, ExperimentError>>,
    V: Iterator<Item = Result<ImageBatch, ExperimentError>>,
    F: FnMut() -> V,
{
    let CompiledModel {
        model,
        optimizer,
        learning_rate,
    } = compiled;
    let channels = model.input_channels();
    let mut optimizer = optimizer.init::<B, M>();
    let mut ctx = TrainingContext::new(model, learning_rate);
    let mut history = TrainingHistory::new();

    for callback in callbacks.iter_mut() {
        callback.on_train_begin(&mut ctx)?;
    }

    tracing::info!(
        "[Fit] 開始: {}エポック, {}ステップ/エポック, 検証{}ステップ",
        plan.epochs,
        plan.steps_per_epoch,
        plan.validation_steps
    );

    for epoch in 0..plan.epochs {
        let mut train_metrics = MetricAccumulator::default();

        for step in 0..plan.steps_per_epoch {
            let batch = train
                .next()
                .context("学習バッチが途中で尽きました")??;
            let (images, targets) = batch.to_tensors::<B>(channels, device)?;

            let output = ctx.model.forward_classification(images, targets);
            let batch_loss = train_metrics.update(&output);

            let grads = output.loss.backward();
            let grads = GradientsParams::from_grads(grads, &ctx.model);
            ctx.model = optimizer.step(ctx.learning_rate, ctx.model, grads);

            if (step + 1) % 50 == 0 || step + 1 == plan.steps_per_epoch {
                tracing::debug!(
                    "  step {:>4}/{}: loss = {:.4}, acc = {:.4}",
                    step + 1,
                    plan.steps_per_epoch,
                    batch_loss,
                    train_metrics.accuracy()
                );
            }
        }

        let val_metrics = validate::<B::InnerBackend, _, _>(
            &ctx.model.valid(),
            make_validation(),
            plan.validation_steps,
            channels,
            device,
        )?;

        let logs = EpochLogs {
            epoch,
            accuracy: train_metrics.accuracy(),
            learning_rate: ctx.learning_rate,
            loss: train_metrics.loss(),
            val_accuracy: val_metrics.accuracy(),
            val_loss: val_metrics.loss(),
        };
        tracing::info!(
            "Epoch {}/{} - loss: {:.4} - accuracy: {:.4} - val_loss: {:.4} - val_accuracy: {:.4} - lr: {:.2e}",
            epoch + 1,
            plan.epochs,
            logs.loss,
            logs.accuracy,
            logs.val_loss,
            logs.val_accuracy,
            logs.learning_rate
        );
        history.push(logs);

        for callback in callbacks.iter_mut() {
            callback.on_epoch_end(&logs, &mut ctx)?;
        }

        if ctx.stop_training {
            break;
        }
    }

    for callback in callbacks.iter_mut() {
        callback.on_train_end(&mut ctx)?;
    }

    tracing::info!("[Fit] 完了: {}エポック実行", history.len());

    Ok(FitOutcome {
        model: ctx.model,
        history,
        learning_rate: ctx.learning_rate,
        stopped_early: ctx.stop_training,
    })
}

/// 勾配なしで検証バッチを先頭から `steps` 個評価
fn validate<B, M, V>(
    model: &M,
    batches: V,
    steps: usize,
    channels: usize,
    device: &B::Device,
) -> Result<MetricAccumulator>
where
    B: Backend,
    M: ExpressionClassifier<B>,
    V: Iterator<Item = Result<ImageBatch, ExperimentError>>,
{
    let mut metrics = MetricAccumulator::default();
    for batch in batches.take(steps) {
        let (images, targets) = batch?.to_tensors::<B>(channels, device)?;
        let output = model.forward_classification(images, targets);
        metrics.update(&output);
    }
    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{BatchGenerator, ChannelStream, ImageCorpus, ImageItem};
    use crate::ml::baseline_cnn::BaselineCnnConfig;
    use crate::ml::callbacks::ReduceLrOnPlateau;
    use crate::ml::classifier::{compile, DEFAULT_LEARNING_RATE};
    use crate::model::config::AugmentationSettings;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;
    use image::{GrayImage, Luma};
    use std::sync::Arc;

    type TestBackend = Autodiff<NdArray>;
    type TestModel = crate::ml::BaselineCnn<TestBackend>;

    fn corpus(n: usize) -> Arc<ImageCorpus> {
        let items = (0..n)
            .map(|i| ImageItem {
                image: GrayImage::from_pixel(8, 8, Luma([(i * 30) as u8])),
                label: i % 2,
            })
            .collect();
        Arc::new(ImageCorpus::from_items(items, 8, 2))
    }

    struct StopAfterFirstEpoch;

    impl TrainingCallback<TestBackend, TestModel> for StopAfterFirstEpoch {
        fn on_epoch_end(
            &mut self,
            _logs: &EpochLogs,
            ctx: &mut TrainingContext<TestModel>,
        ) -> Result<()> {
            ctx.stop_training = true;
            Ok(())
        }
    }

    /// 検証損失を常に同じ値に見せて学習率削減へ渡す
    struct FlatValLoss(ReduceLrOnPlateau);

    impl TrainingCallback<TestBackend, TestModel> for FlatValLoss {
        fn on_epoch_end(
            &mut self,
            logs: &EpochLogs,
            ctx: &mut TrainingContext<TestModel>,
        ) -> Result<()> {
            let flat = EpochLogs {
                val_loss: 1.0,
                ..*logs
            };
            TrainingCallback::<TestBackend, TestModel>::on_epoch_end(&mut self.0, &flat, ctx)
        }
    }

    fn run(epochs: usize, callbacks: &mut [Box<dyn TrainingCallback<TestBackend, TestModel>>]) -> FitOutcome<TestModel> {
        let device = Default::default();
        let model = BaselineCnnConfig::new(2)
            .with_image_size(8)
            .init::<TestBackend>(&device);
        let train_corpus = corpus(4);
        let test_corpus = corpus(4);

        let plan = FitPlan::from_samples(epochs, 4, 4, 2).unwrap();
        let mut train = ChannelStream::new(
            BatchGenerator::training(train_corpus, &AugmentationSettings::default(), 2, 7),
            1,
        );
        let make_validation = || {
            ChannelStream::new(BatchGenerator::evaluation(test_corpus.clone(), 1.0 / 255.0, 2), 1)
        };

        fit(compile(model), &mut train, make_validation, &plan, callbacks, &device).unwrap()
    }

    #[test]
    fn test_steps_drop_remainder() {
        assert_eq!(steps_for(28_709, 64), 448);
        assert_eq!(steps_for(28_000, 64), 437);
        assert_eq!(steps_for(3, 4), 0);
    }

    #[test]
    fn test_plan_rejects_too_few_samples() {
        let err = FitPlan::from_samples(1, 3, 100, 4).unwrap_err();
        assert!(matches!(
            err,
            ExperimentError::InsufficientSamples { samples: 3, batch_size: 4 }
        ));
        assert!(FitPlan::from_samples(1, 100, 3, 4).is_err());
    }

    #[test]
    fn test_fit_records_one_row_per_epoch() {
        let outcome = run(2, &mut []);
        assert_eq!(outcome.history.len(), 2);
        assert!(!outcome.stopped_early);

        for (i, logs) in outcome.history.epochs().iter().enumerate() {
            assert_eq!(logs.epoch, i);
            assert!(logs.loss.is_finite());
            assert!(logs.val_loss.is_finite());
            assert!((0.0..=1.0).contains(&logs.accuracy));
            assert!((0.0..=1.0).contains(&logs.val_accuracy));
        }
    }

    #[test]
    fn test_fit_honours_stop_flag() {
        let mut callbacks: Vec<Box<dyn TrainingCallback<TestBackend, TestModel>>> =
            vec![Box::new(StopAfterFirstEpoch)];
        let outcome = run(5, &mut callbacks);
        assert_eq!(outcome.history.len(), 1);
        assert!(outcome.stopped_early);
    }

    #[test]
    fn test_reduced_learning_rate_is_used_next_epoch() {
        let mut callbacks: Vec<Box<dyn TrainingCallback<TestBackend, TestModel>>> =
            vec![Box::new(FlatValLoss(ReduceLrOnPlateau::new(0.2, 1, 0.0)))];
        let outcome = run(6, &mut callbacks);
        assert_eq!(outcome.history.len(), 6);

        let lr0 = DEFAULT_LEARNING_RATE;
        let expected = [lr0, lr0, lr0 * 0.2, lr0 * 0.04, lr0 * 0.008, lr0 * 0.0016];
        for (logs, want) in outcome.history.epochs().iter().zip(expected) {
            assert!(
                (logs.learning_rate - want).abs() <= want * 1e-9,
                "epoch {}: {} != {}",
                logs.epoch,
                logs.learning_rate,
                want
            );
        }
        assert!((outcome.learning_rate - lr0 * 0.00032).abs() <= lr0 * 1e-12);
    }
}
