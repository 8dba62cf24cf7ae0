//! テストセットの推論
//!
//! 検証と同じステップ数ぶんのバッチをメモリに展開してから、
//! バッチ単位で推論して予測クラスと正解クラスを並べます。

use anyhow::Result;
use burn::tensor::backend::Backend;

use crate::dataset::batch::argmax;
use crate::dataset::ImageBatch;
use crate::error::ExperimentError;
use crate::ml::classifier::ExpressionClassifier;

/// 予測結果（同じ長さ）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Predictions {
    pub y_true: Vec<usize>,
    pub y_pred: Vec<usize>,
}

impl Predictions {
    pub fn len(&self) -> usize {
        self.y_true.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y_true.is_empty()
    }
}

/// 先頭から `steps` 個のバッチを取り出して1つにまとめる
pub fn materialize<I>(batches: I, steps: usize) -> Result<Option<ImageBatch>>
where
    I: Iterator<Item = Result<ImageBatch, ExperimentError>>,
{
    let batches = batches
        .take(steps)
        .collect::<Result<Vec<_>, ExperimentError>>()?;
    Ok(ImageBatch::concat(batches))
}

/// まとめたテストデータを `batch_size` ずつ推論する
pub fn predict<B, M>(
    model: &M,
    data: &ImageBatch,
    batch_size: usize,
    device: &B::Device,
) -> Result<Predictions>
where
    B: Backend,
    M: ExpressionClassifier<B>,
{
    if model.num_classes() != data.num_classes {
        return Err(ExperimentError::ClassCountMismatch {
            expected: data.num_classes,
            actual: model.num_classes(),
        }
        .into());
    }

    let channels = model.input_channels();
    let num_classes = model.num_classes();
    let batch_size = batch_size.max(1);
    let mut y_pred = Vec::with_capacity(data.len());

    let mut start = 0;
    while start < data.len() {
        let end = (start + batch_size).min(data.len());
        let (images, _) = data.slice(start, end).to_tensors::<B>(channels, device)?;
        let probs = model
            .forward_softmax(images)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| anyhow::anyhow!("推論結果の取得に失敗: {:?}", e))?;

        y_pred.extend(probs.chunks(num_classes).map(argmax));
        start = end;
    }

    Ok(Predictions {
        y_true: data.class_ids(),
        y_pred,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::baseline_cnn::BaselineCnnConfig;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn batch(n: usize, classes: usize) -> ImageBatch {
        let labels: Vec<usize> = (0..n).map(|i| i % classes).collect();
        ImageBatch::from_class_ids(vec![0.5; n * 8 * 8], &labels, 8, 8, 1, classes)
    }

    #[test]
    fn test_materialize_takes_exact_steps() {
        let source = (0..5).map(|_| Ok(batch(2, 2)));
        let data = materialize(source, 3).unwrap().unwrap();
        assert_eq!(data.len(), 6);

        let empty = materialize(std::iter::empty(), 3).unwrap();
        assert!(empty.is_none());
    }

    #[test]
    fn test_materialize_propagates_errors() {
        let source = vec![
            Ok(batch(2, 2)),
            Err(ExperimentError::ChannelMismatch {
                expected: 1,
                actual: 3,
            }),
        ];
        assert!(materialize(source.into_iter(), 2).is_err());
    }

    #[test]
    fn test_predict_covers_every_sample() {
        let device = Default::default();
        let model = BaselineCnnConfig::new(3)
            .with_image_size(8)
            .init::<TestBackend>(&device);
        let data = batch(5, 3);

        let predictions = predict::<TestBackend, _>(&model, &data, 2, &device).unwrap();
        assert_eq!(predictions.len(), 5);
        assert_eq!(predictions.y_true, vec![0, 1, 2, 0, 1]);
        assert!(predictions.y_pred.iter().all(|&p| p < 3));
    }

    #[test]
    fn test_predict_rejects_class_count_mismatch() {
        let device = Default::default();
        let model = BaselineCnnConfig::new(7)
            .with_image_size(8)
            .init::<TestBackend>(&device);
        let err = predict::<TestBackend, _>(&model, &batch(2, 3), 2, &device).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExperimentError>(),
            Some(ExperimentError::ClassCountMismatch {
                expected: 3,
                actual: 7
            })
        ));
    }
}
