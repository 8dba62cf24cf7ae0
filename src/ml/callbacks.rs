//! 学習ループに差し込むコールバック
//!
//! いずれも `val_loss` を監視し、エポック終了ごとに呼ばれます。

use anyhow::{Context, Result};
use burn::{
    module::Module,
    record::{DefaultFileRecorder, FullPrecisionSettings},
    tensor::backend::Backend,
};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use crate::ml::history::{EpochLogs, CSV_HEADER};

/// コールバックが読み書きする学習状態
pub struct TrainingContext<M> {
    pub model: M,
    pub learning_rate: f64,
    pub stop_training: bool,
}

impl<M> TrainingContext<M> {
    pub fn new(model: M, learning_rate: f64) -> Self {
        Self {
            model,
            learning_rate,
            stop_training: false,
        }
    }
}

pub trait TrainingCallback<B: Backend, M: Module<B>> {
    fn on_train_begin(&mut self, _ctx: &mut TrainingContext<M>) -> Result<()> {
        Ok(())
    }

    fn on_epoch_end(&mut self, logs: &EpochLogs, ctx: &mut TrainingContext<M>) -> Result<()>;

    fn on_train_end(&mut self, _ctx: &mut TrainingContext<M>) -> Result<()> {
        Ok(())
    }
}

/// 検証損失が改善したときだけ重みを保存
pub struct ModelCheckpoint {
    path: PathBuf,
    best: Option<f64>,
}

impl ModelCheckpoint {
    /// `path` の拡張子はレコーダーが付与する（`.mpk`）
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            best: None,
        }
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }
}

impl<B: Backend, M: Module<B>> TrainingCallback<B, M> for ModelCheckpoint {
    fn on_epoch_end(&mut self, logs: &EpochLogs, ctx: &mut TrainingContext<M>) -> Result<()> {
        let improved = self.best.map_or(true, |best| logs.val_loss < best);
        if !improved {
            tracing::debug!(
                "[Checkpoint] epoch {}: val_loss {:.5} は改善せず",
                logs.epoch + 1,
                logs.val_loss
            );
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let recorder = DefaultFileRecorder::<FullPrecisionSettings>::new();
        ctx.model
            .clone()
            .save_file(self.path.clone(), &recorder)
            .with_context(|| format!("チェックポイントの保存に失敗: {}", self.path.display()))?;

        tracing::info!(
            "[Checkpoint] epoch {}: val_loss {} -> {:.5}, 保存先 {}.mpk",
            logs.epoch + 1,
            self.best
                .map(|b| format!("{:.5}", b))
                .unwrap_or_else(|| "inf".to_string()),
            logs.val_loss,
            self.path.display()
        );
        self.best = Some(logs.val_loss);
        Ok(())
    }
}

/// 検証損失が `patience` エポック改善しなければ学習を止める
pub struct EarlyStopping<M> {
    patience: usize,
    restore_best_weights: bool,
    wait: usize,
    best: Option<f64>,
    best_weights: Option<M>,
    best_epoch: Option<usize>,
    stopped_epoch: Option<usize>,
}

impl<M> EarlyStopping<M> {
    pub fn new(patience: usize, restore_best_weights: bool) -> Self {
        Self {
            patience,
            restore_best_weights,
            wait: 0,
            best: None,
            best_weights: None,
            best_epoch: None,
            stopped_epoch: None,
        }
    }

    pub fn stopped_epoch(&self) -> Option<usize> {
        self.stopped_epoch
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }
}

impl<B: Backend, M: Module<B>> TrainingCallback<B, M> for EarlyStopping<M> {
    fn on_train_begin(&mut self, _ctx: &mut TrainingContext<M>) -> Result<()> {
        self.wait = 0;
        self.best = None;
        self.best_weights = None;
        self.best_epoch = None;
        self.stopped_epoch = None;
        Ok(())
    }

    fn on_epoch_end(&mut self, logs: &EpochLogs, ctx: &mut TrainingContext<M>) -> Result<()> {
        let improved = self.best.map_or(true, |best| logs.val_loss < best);
        if improved {
            self.best = Some(logs.val_loss);
            self.best_epoch = Some(logs.epoch);
            self.wait = 0;
            if self.restore_best_weights {
                self.best_weights = Some(ctx.model.clone());
            }
            return Ok(());
        }

        self.wait += 1;
        if self.wait >= self.patience {
            ctx.stop_training = true;
            self.stopped_epoch = Some(logs.epoch);
            tracing::info!(
                "[EarlyStopping] epoch {}: {}エポック改善なし、学習を停止します",
                logs.epoch + 1,
                self.wait
            );
        }
        Ok(())
    }

    fn on_train_end(&mut self, ctx: &mut TrainingContext<M>) -> Result<()> {
        if !self.restore_best_weights {
            return Ok(());
        }
        if let (Some(weights), Some(epoch)) = (self.best_weights.take(), self.best_epoch) {
            tracing::info!(
                "[EarlyStopping] epoch {} の重みを復元します (val_loss {:.5})",
                epoch + 1,
                self.best.unwrap_or(f64::NAN)
            );
            ctx.model = weights;
        }
        Ok(())
    }
}

/// 検証損失が停滞したら学習率を `factor` 倍にする
pub struct ReduceLrOnPlateau {
    factor: f64,
    patience: usize,
    min_lr: f64,
    min_delta: f64,
    wait: usize,
    best: Option<f64>,
}

impl ReduceLrOnPlateau {
    pub fn new(factor: f64, patience: usize, min_lr: f64) -> Self {
        Self {
            factor,
            patience,
            min_lr,
            min_delta: 1e-4,
            wait: 0,
            best: None,
        }
    }

    /// 監視値を1つ進めて、新しい学習率を返す
    pub fn step_with_metric(&mut self, metric: f64, learning_rate: f64) -> f64 {
        let improved = self
            .best
            .map_or(true, |best| metric < best - self.min_delta);

        if improved {
            self.best = Some(metric);
            self.wait = 0;
            return learning_rate;
        }

        self.wait += 1;
        if self.wait >= self.patience && learning_rate > self.min_lr {
            self.wait = 0;
            return (learning_rate * self.factor).max(self.min_lr);
        }
        learning_rate
    }
}

impl<B: Backend, M: Module<B>> TrainingCallback<B, M> for ReduceLrOnPlateau {
    fn on_epoch_end(&mut self, logs: &EpochLogs, ctx: &mut TrainingContext<M>) -> Result<()> {
        let new_lr = self.step_with_metric(logs.val_loss, ctx.learning_rate);
        if new_lr < ctx.learning_rate {
            tracing::info!(
                "[ReduceLROnPlateau] epoch {}: 学習率 {:.2e} -> {:.2e}",
                logs.epoch + 1,
                ctx.learning_rate,
                new_lr
            );
            ctx.learning_rate = new_lr;
        }
        Ok(())
    }
}

/// エポックごとに1行ずつCSVへ書き出す
pub struct CsvLogger {
    path: PathBuf,
    writer: Option<csv::Writer<BufWriter<File>>>,
}

impl CsvLogger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
        }
    }

    fn open(&mut self) -> Result<&mut csv::Writer<BufWriter<File>>> {
        if self.writer.is_none() {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let file = File::create(&self.path)
                .with_context(|| format!("ログファイルの作成に失敗: {}", self.path.display()))?;
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(BufWriter::new(file));
            writer.write_record(CSV_HEADER)?;
            writer.flush()?;
            self.writer = Some(writer);
        }
        // 直前で必ず Some にしている
        self.writer
            .as_mut()
            .context("CSVログが開かれていません")
    }
}

impl<B: Backend, M: Module<B>> TrainingCallback<B, M> for CsvLogger {
    fn on_train_begin(&mut self, _ctx: &mut TrainingContext<M>) -> Result<()> {
        self.writer = None;
        self.open()?;
        Ok(())
    }

    fn on_epoch_end(&mut self, logs: &EpochLogs, _ctx: &mut TrainingContext<M>) -> Result<()> {
        let writer = self.open()?;
        writer.serialize(logs)?;
        writer.flush()?;
        Ok(())
    }

    fn on_train_end(&mut self, _ctx: &mut TrainingContext<M>) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            writer
                .into_inner()
                .map_err(|e| anyhow::anyhow!("CSVログのクローズに失敗: {}", e))?
                .flush()?;
        }
        Ok(())
    }
}
