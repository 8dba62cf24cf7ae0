//! 学習済みモデルのメタデータ
//!
//! tar.gz内に以下の構成で保存されます:
//! - metadata.json: このメタデータ（JSON形式）
//! - model.bin: モデルの重み（バイナリ）

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ml::classifier::InputShape;
use crate::model::config::Architecture;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// 実験名（ファイル名の接頭辞）
    pub experiment_name: String,

    pub architecture: Architecture,

    /// クラスID順のクラス名
    /// 例: ["angry", "disgust", "fear", "happy", "neutral", "sad", "surprise"]
    pub class_labels: Vec<String>,

    /// モデル入力の形状
    pub input_shape: InputShape,

    pub batch_size: usize,

    /// 実際に回したエポック数（早期終了した場合は上限より少ない）
    pub epochs_run: usize,

    /// 最良の検証損失
    #[serde(default)]
    pub best_val_loss: Option<f64>,

    /// テストセットでの正解率
    #[serde(default)]
    pub test_accuracy: Option<f64>,

    /// 学習終了時の学習率
    pub final_learning_rate: f64,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    pub fn new(
        experiment_name: impl Into<String>,
        architecture: Architecture,
        class_labels: Vec<String>,
        input_shape: InputShape,
        batch_size: usize,
    ) -> Self {
        Self {
            experiment_name: experiment_name.into(),
            architecture,
            class_labels,
            input_shape,
            batch_size,
            epochs_run: 0,
            best_val_loss: None,
            test_accuracy: None,
            final_learning_rate: 0.0,
            trained_at: chrono::Local::now().to_rfc3339(),
        }
    }

    pub fn with_training_summary(
        mut self,
        epochs_run: usize,
        best_val_loss: Option<f64>,
        final_learning_rate: f64,
    ) -> Self {
        self.epochs_run = epochs_run;
        self.best_val_loss = best_val_loss;
        self.final_learning_rate = final_learning_rate;
        self
    }

    pub fn with_test_accuracy(mut self, accuracy: f64) -> Self {
        self.test_accuracy = Some(accuracy);
        self
    }

    pub fn num_classes(&self) -> usize {
        self.class_labels.len()
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("メタデータのJSON変換に失敗")
    }

    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("メタデータのJSON解析に失敗")
    }
}
