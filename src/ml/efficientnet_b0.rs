//! EfficientNetB0バックボーンの分類器（3チャネル入力、事前学習なし）

use burn::{
    config::Config,
    module::Module,
    nn::{Dropout, DropoutConfig, Linear, LinearConfig},
    tensor::{
        activation::{sigmoid, silu},
        backend::Backend,
        Tensor,
    },
};

use crate::ml::blocks::{global_average_pool, ConvBn};
use crate::ml::classifier::{compile, CompiledModel, ExpressionClassifier, InputShape};

/// SEブロックの縮小率（入力チャネル基準）
const SE_RATIO: f64 = 0.25;
const STEM_CHANNELS: usize = 32;
const HEAD_CHANNELS: usize = 1280;

/// MBConvステージの定義
#[derive(Debug, Clone, Copy)]
struct StageSpec {
    expand_ratio: usize,
    kernel: usize,
    stride: usize,
    in_channels: usize,
    out_channels: usize,
    repeats: usize,
}

const fn stage(
    expand_ratio: usize,
    kernel: usize,
    stride: usize,
    in_channels: usize,
    out_channels: usize,
    repeats: usize,
) -> StageSpec {
    StageSpec {
        expand_ratio,
        kernel,
        stride,
        in_channels,
        out_channels,
        repeats,
    }
}

/// B0（幅・深さ係数 1.0）
const B0_STAGES: [StageSpec; 7] = [
    stage(1, 3, 1, 32, 16, 1),
    stage(6, 3, 2, 16, 24, 2),
    stage(6, 5, 2, 24, 40, 2),
    stage(6, 3, 2, 40, 80, 3),
    stage(6, 5, 1, 80, 112, 3),
    stage(6, 5, 2, 112, 192, 4),
    stage(6, 3, 1, 192, 320, 1),
];

#[derive(Config, Debug)]
pub struct EfficientNetB0Config {
    /// 分類クラス数
    pub num_classes: usize,
    #[config(default = 3)]
    pub in_channels: usize,
    /// 分類ヘッド直前のドロップアウト率
    #[config(default = 0.5)]
    pub dropout: f64,
}

impl EfficientNetB0Config {
    pub fn init<B: Backend>(&self, device: &B::Device) -> EfficientNetB0<B> {
        let mut blocks = Vec::new();
        for spec in B0_STAGES.iter() {
            for i in 0..spec.repeats {
                // 繰り返しの2個目以降はstride 1、入力は前ブロックの出力
                let (in_channels, stride) = if i == 0 {
                    (spec.in_channels, spec.stride)
                } else {
                    (spec.out_channels, 1)
                };
                blocks.push(MbConv::new(
                    in_channels,
                    spec.out_channels,
                    spec.expand_ratio,
                    spec.kernel,
                    stride,
                    device,
                ));
            }
        }

        let last_channels = B0_STAGES[B0_STAGES.len() - 1].out_channels;

        EfficientNetB0 {
            stem: ConvBn::new(self.in_channels, STEM_CHANNELS, 3, 2, device),
            blocks,
            head: ConvBn::new(last_channels, HEAD_CHANNELS, 1, 1, device),
            dropout: DropoutConfig::new(self.dropout).init(),
            fc: LinearConfig::new(HEAD_CHANNELS, self.num_classes).init(device),
            in_channels: self.in_channels,
            num_classes: self.num_classes,
        }
    }
}

/// Squeeze-and-Excitation
#[derive(Module, Debug)]
pub struct SqueezeExcitation<B: Backend> {
    reduce: Linear<B>,
    expand: Linear<B>,
}

impl<B: Backend> SqueezeExcitation<B> {
    pub fn new(channels: usize, squeezed: usize, device: &B::Device) -> Self {
        Self {
            reduce: LinearConfig::new(channels, squeezed).init(device),
            expand: LinearConfig::new(squeezed, channels).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch_size, channels, _, _] = x.dims();
        let scale = global_average_pool(x.clone());
        let scale = silu(self.reduce.forward(scale));
        let scale = sigmoid(self.expand.forward(scale));
        let scale = scale.reshape([batch_size, channels, 1, 1]).expand(x.shape());
        x * scale
    }
}

/// 倒立残差ブロック（MBConv）
#[derive(Module, Debug)]
pub struct MbConv<B: Backend> {
    expand: Option<ConvBn<B>>,
    depthwise: ConvBn<B>,
    se: SqueezeExcitation<B>,
    project: ConvBn<B>,
    residual: bool,
}

impl<B: Backend> MbConv<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        expand_ratio: usize,
        kernel: usize,
        stride: usize,
        device: &B::Device,
    ) -> Self {
        let hidden = in_channels * expand_ratio;
        let expand =
            (expand_ratio != 1).then(|| ConvBn::new(in_channels, hidden, 1, 1, device));
        let squeezed = ((in_channels as f64 * SE_RATIO) as usize).max(1);

        Self {
            expand,
            depthwise: ConvBn::grouped(hidden, hidden, kernel, stride, hidden, device),
            se: SqueezeExcitation::new(hidden, squeezed, device),
            project: ConvBn::new(hidden, out_channels, 1, 1, device),
            residual: stride == 1 && in_channels == out_channels,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = match &self.expand {
            Some(expand) => silu(expand.forward(x.clone())),
            None => x.clone(),
        };
        let out = silu(self.depthwise.forward(out));
        let out = self.se.forward(out);
        let out = self.project.forward(out);

        if self.residual {
            out + x
        } else {
            out
        }
    }
}

/// EfficientNetB0 + 大域平均プーリング + Dropout + 全結合
#[derive(Module, Debug)]
pub struct EfficientNetB0<B: Backend> {
    stem: ConvBn<B>,
    blocks: Vec<MbConv<B>>,
    head: ConvBn<B>,
    dropout: Dropout,
    fc: Linear<B>,
    in_channels: usize,
    num_classes: usize,
}

impl<B: Backend> ExpressionClassifier<B> for EfficientNetB0<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = silu(self.stem.forward(images));
        for block in &self.blocks {
            x = block.forward(x);
        }
        let x = silu(self.head.forward(x));

        let x = global_average_pool(x);
        let x = self.dropout.forward(x);
        self.fc.forward(x)
    }

    fn input_channels(&self) -> usize {
        self.in_channels
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }
}

/// EfficientNetB0を構築してコンパイル
pub fn build_efficientnet_b0<B: Backend>(
    input_shape: InputShape,
    num_classes: usize,
    device: &B::Device,
) -> CompiledModel<EfficientNetB0<B>> {
    let model = EfficientNetB0Config::new(num_classes)
        .with_in_channels(input_shape.channels)
        .init(device);
    tracing::debug!(
        "[EfficientNetB0] 入力 {}x{}x{}, MBConvブロック数 {}",
        input_shape.height,
        input_shape.width,
        input_shape.channels,
        model.blocks.len()
    );
    compile(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::classifier::test_utils::assert_probability_rows;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_stage_table_block_count() {
        let total: usize = B0_STAGES.iter().map(|s| s.repeats).sum();
        assert_eq!(total, 16);
    }

    #[test]
    fn test_mbconv_residual_only_when_shape_kept() {
        let device = Default::default();
        let block = MbConv::<TestBackend>::new(16, 16, 6, 3, 1, &device);
        assert!(block.residual);
        let x = Tensor::<TestBackend, 4>::ones([1, 16, 8, 8], &device);
        assert_eq!(block.forward(x).dims(), [1, 16, 8, 8]);

        let block = MbConv::<TestBackend>::new(16, 24, 6, 5, 2, &device);
        assert!(!block.residual);
        let x = Tensor::<TestBackend, 4>::ones([1, 16, 8, 8], &device);
        assert_eq!(block.forward(x).dims(), [1, 24, 4, 4]);
    }

    #[test]
    fn test_output_width_and_probabilities() {
        let device = Default::default();
        let compiled =
            build_efficientnet_b0::<TestBackend>(InputShape::square(48, 3), 7, &device);
        assert_eq!(compiled.model.input_channels(), 3);
        assert_eq!(compiled.model.num_classes(), 7);

        let input = Tensor::<TestBackend, 4>::random(
            [2, 3, 48, 48],
            burn::tensor::Distribution::Uniform(0.0, 1.0),
            &device,
        );
        assert_probability_rows(compiled.model.forward_softmax(input), 2, 7);
    }
}
