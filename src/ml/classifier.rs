//! 3種類のモデルに共通する分類器の契約
//!
//! 出力はクラス数と同じ幅のロジットで、確率はsoftmaxで正規化します。
//! 学習はカテゴリカル交差エントロピー、Adam（学習率0.001）、正解率で監視します。

use burn::{
    module::Module,
    nn::loss::CrossEntropyLossConfig,
    optim::AdamConfig,
    tensor::{activation::softmax, backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};
use serde::{Deserialize, Serialize};

/// 学習率の初期値
pub const DEFAULT_LEARNING_RATE: f64 = 1e-3;

/// モデル入力の形状 (H, W, C)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputShape {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl InputShape {
    /// 正方形画像
    pub fn square(size: usize, channels: usize) -> Self {
        Self {
            height: size,
            width: size,
            channels,
        }
    }
}

/// 表情分類モデル
pub trait ExpressionClassifier<B: Backend>: Module<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, channels, height, width]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;

    /// 受け付ける入力チャネル数
    fn input_channels(&self) -> usize;

    /// 出力層の幅
    fn num_classes(&self) -> usize;

    /// 損失に加える正則化項（無ければNone）
    fn regularization_loss(&self) -> Option<Tensor<B, 1>> {
        None
    }

    /// クラスごとの確率 [batch_size, num_classes]
    fn forward_softmax(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// 順伝播と損失計算
    fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let mut loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        if let Some(penalty) = self.regularization_loss() {
            loss = loss + penalty;
        }

        ClassificationOutput::new(loss, output, targets)
    }
}

/// 学習の準備が整ったモデル（モデル本体 + 最適化手法 + 学習率）
pub struct CompiledModel<M> {
    pub model: M,
    pub optimizer: AdamConfig,
    pub learning_rate: f64,
}

/// 既定の学習契約でモデルをまとめる
pub fn compile<M>(model: M) -> CompiledModel<M> {
    CompiledModel {
        model,
        optimizer: AdamConfig::new(),
        learning_rate: DEFAULT_LEARNING_RATE,
    }
}

impl<M> CompiledModel<M> {
    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }
}
