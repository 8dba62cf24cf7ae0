//! クラスラベルの対応表
//!
//! サブディレクトリ名をアルファベット順に並べ、その位置をクラスIDとします。

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;

use crate::error::ExperimentError;

/// クラスID ⇔ クラス名 の全単射
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassLabelMap {
    names: Vec<String>,
    indices: HashMap<String, usize>,
}

impl ClassLabelMap {
    /// クラス名の一覧から作成（順序がそのままクラスIDになる）
    pub fn new(names: Vec<String>) -> Self {
        let indices = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self { names, indices }
    }

    /// ディレクトリ直下のサブディレクトリ名からクラスを推定
    pub fn from_directory(data_dir: &Path) -> Result<Self> {
        if !data_dir.is_dir() {
            return Err(ExperimentError::DatasetNotFound(data_dir.to_path_buf()).into());
        }

        let mut names = Vec::new();
        for entry in std::fs::read_dir(data_dir)
            .with_context(|| format!("ディレクトリを読み込めません: {}", data_dir.display()))?
        {
            let path = entry?.path();
            if path.is_dir() {
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| anyhow::anyhow!("不正なディレクトリ名: {}", path.display()))?
                    .to_string();
                names.push(name);
            }
        }
        names.sort();

        Ok(Self::new(names))
    }

    /// テスト側のクラス構成が同一であることを確認
    pub fn ensure_same_classes(&self, other: &ClassLabelMap) -> Result<(), ExperimentError> {
        if self.names != other.names {
            return Err(ExperimentError::ClassSetMismatch {
                train: self.names.clone(),
                test: other.names.clone(),
            });
        }
        Ok(())
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn index(&self, name: &str) -> Option<usize> {
        self.indices.get(name).copied()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
