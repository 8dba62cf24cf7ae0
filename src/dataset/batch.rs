//! ホスト側のバッチ表現とテンソルへの変換

use anyhow::Result;
use burn::tensor::{backend::Backend, Int, Tensor, TensorData};

use crate::error::ExperimentError;

/// 画像バッチ（NHWC、one-hotラベル付き）
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBatch {
    /// 画素値 [N * H * W * C]
    pub images: Vec<f32>,
    /// one-hotラベル [N * num_classes]
    pub labels: Vec<f32>,
    pub batch_size: usize,
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    pub num_classes: usize,
}

impl ImageBatch {
    /// クラスIDの一覧からone-hotラベルを組み立てる
    pub fn from_class_ids(
        images: Vec<f32>,
        class_ids: &[usize],
        height: usize,
        width: usize,
        channels: usize,
        num_classes: usize,
    ) -> Self {
        let batch_size = class_ids.len();
        debug_assert_eq!(images.len(), batch_size * height * width * channels);

        let mut labels = vec![0.0f32; batch_size * num_classes];
        for (row, &class_id) in class_ids.iter().enumerate() {
            labels[row * num_classes + class_id] = 1.0;
        }

        Self {
            images,
            labels,
            batch_size,
            height,
            width,
            channels,
            num_classes,
        }
    }

    pub fn len(&self) -> usize {
        self.batch_size
    }

    pub fn is_empty(&self) -> bool {
        self.batch_size == 0
    }

    /// [N, H, W, C]
    pub fn shape(&self) -> [usize; 4] {
        [self.batch_size, self.height, self.width, self.channels]
    }

    /// one-hotラベルのargmax（正解クラスID）
    pub fn class_ids(&self) -> Vec<usize> {
        self.labels
            .chunks(self.num_classes)
            .map(|row| argmax(row))
            .collect()
    }

    /// 1チャネルを3回複製した3チャネルのバッチを返す
    pub fn to_rgb(self) -> Result<Self, ExperimentError> {
        if self.channels != 1 {
            return Err(ExperimentError::ChannelMismatch {
                expected: 1,
                actual: self.channels,
            });
        }

        let images = self
            .images
            .iter()
            .flat_map(|&value| [value, value, value])
            .collect();

        Ok(Self {
            images,
            channels: 3,
            ..self
        })
    }

    /// 複数のバッチを1つに連結する
    pub fn concat(batches: Vec<ImageBatch>) -> Option<Self> {
        let mut iter = batches.into_iter();
        let mut merged = iter.next()?;
        for batch in iter {
            debug_assert_eq!(batch.channels, merged.channels);
            merged.images.extend(batch.images);
            merged.labels.extend(batch.labels);
            merged.batch_size += batch.batch_size;
        }
        Some(merged)
    }

    /// 先頭から `start..end` の範囲を切り出す
    pub fn slice(&self, start: usize, end: usize) -> Self {
        let end = end.min(self.batch_size);
        let pixels = self.height * self.width * self.channels;
        Self {
            images: self.images[start * pixels..end * pixels].to_vec(),
            labels: self.labels[start * self.num_classes..end * self.num_classes].to_vec(),
            batch_size: end - start,
            ..*self
        }
    }

    /// モデル入力 [N, C, H, W] とターゲット [N] のテンソルへ変換
    ///
    /// チャネル数がモデルの入力と異なる場合はエラーになります。
    pub fn to_tensors<B: Backend>(
        &self,
        expected_channels: usize,
        device: &B::Device,
    ) -> Result<(Tensor<B, 4>, Tensor<B, 1, Int>)> {
        if self.channels != expected_channels {
            return Err(ExperimentError::ChannelMismatch {
                expected: expected_channels,
                actual: self.channels,
            }
            .into());
        }

        let data = TensorData::new(self.images.clone(), self.shape());
        let images = Tensor::<B, 4>::from_data(data, device).permute([0, 3, 1, 2]);

        let targets: Vec<i64> = self.class_ids().into_iter().map(|id| id as i64).collect();
        let targets = Tensor::<B, 1, Int>::from_ints(targets.as_slice(), device);

        Ok((images, targets))
    }
}

pub(crate) fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best_i, best_v), (i, &v)| {
            if v > best_v {
                (i, v)
            } else {
                (best_i, best_v)
            }
        })
        .0
}
