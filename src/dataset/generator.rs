//! 画像バッチのジェネレータ
//!
//! 学習用はシャッフル＋データ拡張をしながら無限に、
//! 評価用は固定順で1周だけバッチを生成します。

use burn::data::dataset::Dataset;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Arc;

use crate::dataset::{Augmenter, ImageBatch, ImageCorpus};
use crate::model::config::AugmentationSettings;

/// コーパスからバッチを順に取り出すイテレータ
///
/// 1周の最後はバッチサイズに満たない端数バッチになります。
/// 繰り返しモードでは端数バッチの後に並びをシャッフルし直して次の周回に入ります。
pub struct BatchGenerator {
    corpus: Arc<ImageCorpus>,
    augmenter: Augmenter,
    batch_size: usize,
    shuffle: bool,
    repeat: bool,
    order: Vec<usize>,
    cursor: usize,
    rng: StdRng,
}

impl BatchGenerator {
    /// 学習用（シャッフル・データ拡張あり、無限に繰り返す）
    pub fn training(
        corpus: Arc<ImageCorpus>,
        augmentation: &AugmentationSettings,
        batch_size: usize,
        seed: u64,
    ) -> Self {
        Self::new(corpus, Augmenter::from_settings(augmentation), batch_size, true, true, seed)
    }

    /// 評価用（スケーリングのみ、固定順で1周）
    pub fn evaluation(corpus: Arc<ImageCorpus>, rescale: f32, batch_size: usize) -> Self {
        Self::new(corpus, Augmenter::rescale_only(rescale), batch_size, false, false, 0)
    }

    fn new(
        corpus: Arc<ImageCorpus>,
        augmenter: Augmenter,
        batch_size: usize,
        shuffle: bool,
        repeat: bool,
        seed: u64,
    ) -> Self {
        let mut generator = Self {
            order: (0..corpus.len()).collect(),
            corpus,
            augmenter,
            batch_size: batch_size.max(1),
            shuffle,
            repeat,
            cursor: 0,
            rng: StdRng::seed_from_u64(seed),
        };
        generator.reshuffle();
        generator
    }

    /// コーパスのサンプル数
    pub fn sample_count(&self) -> usize {
        self.corpus.len()
    }

    fn reshuffle(&mut self) {
        if self.shuffle {
            self.order.shuffle(&mut self.rng);
        }
    }
}

impl Iterator for BatchGenerator {
    type Item = ImageBatch;

    fn next(&mut self) -> Option<ImageBatch> {
        if self.order.is_empty() {
            return None;
        }
        if self.cursor >= self.order.len() {
            if !self.repeat {
                return None;
            }
            self.cursor = 0;
            self.reshuffle();
        }

        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = &self.order[self.cursor..end];
        self.cursor = end;

        let size = self.corpus.image_size();
        let mut images = Vec::with_capacity(indices.len() * size * size);
        let mut class_ids = Vec::with_capacity(indices.len());
        for &index in indices {
            let item = self.corpus.get(index)?;
            images.extend(self.augmenter.apply(&item.image, &mut self.rng));
            class_ids.push(item.label);
        }

        Some(ImageBatch::from_class_ids(
            images,
            &class_ids,
            size,
            size,
            1,
            self.corpus.num_classes(),
        ))
    }
}
