//! エポックごとの学習履歴

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 1エポック分の指標
///
/// フィールド順がそのままCSVの列順になります。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochLogs {
    pub epoch: usize,
    pub accuracy: f64,
    pub learning_rate: f64,
    pub loss: f64,
    pub val_accuracy: f64,
    pub val_loss: f64,
}

/// 学習履歴（エポック順に追記のみ）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingHistory {
    epochs: Vec<EpochLogs>,
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, logs: EpochLogs) {
        self.epochs.push(logs);
    }

    pub fn epochs(&self) -> &[EpochLogs] {
        &self.epochs
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn last(&self) -> Option<&EpochLogs> {
        self.epochs.last()
    }

    /// 検証損失が最小のエポック
    pub fn best_val_loss(&self) -> Option<&EpochLogs> {
        self.epochs
            .iter()
            .min_by(|a, b| a.val_loss.total_cmp(&b.val_loss))
    }

    /// 全エポックをヘッダ付きCSVで書き出す
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("履歴ファイルの作成に失敗: {}", path.display()))?;

        for logs in &self.epochs {
            writer.serialize(logs)?;
        }
        // 空の履歴でもヘッダ行は書く
        if self.epochs.is_empty() {
            writer.write_record(CSV_HEADER)?;
        }
        writer.flush()?;

        Ok(())
    }
}

/// CSVの列名
pub const CSV_HEADER: [&str; 6] = [
    "epoch",
    "accuracy",
    "learning_rate",
    "loss",
    "val_accuracy",
    "val_loss",
];

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn logs(epoch: usize, val_loss: f64) -> EpochLogs {
        EpochLogs {
            epoch,
            accuracy: 0.5,
            learning_rate: 1e-3,
            loss: 1.0,
            val_accuracy: 0.4,
            val_loss,
        }
    }

    #[test]
    fn test_history_keeps_epoch_order() {
        let mut history = TrainingHistory::new();
        history.push(logs(0, 1.2));
        history.push(logs(1, 0.9));
        history.push(logs(2, 1.1));

        assert_eq!(history.len(), 3);
        assert_eq!(history.last().unwrap().epoch, 2);
        assert_eq!(history.best_val_loss().unwrap().epoch, 1);
    }

    #[test]
    fn test_write_csv_one_row_per_epoch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.csv");

        let mut history = TrainingHistory::new();
        history.push(logs(0, 1.2));
        history.push(logs(1, 0.9));
        history.write_csv(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER.join(","));
        assert_eq!(
            lines[0],
            "epoch,accuracy,learning_rate,loss,val_accuracy,val_loss"
        );
        assert!(lines[2].starts_with("1,"));
    }

    #[test]
    fn test_write_csv_empty_history_has_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.csv");
        TrainingHistory::new().write_csv(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), CSV_HEADER.join(","));
    }
}
