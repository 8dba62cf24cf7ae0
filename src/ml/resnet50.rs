//! ResNet50バックボーンの分類器（3チャネル入力、事前学習なし）

use burn::{
    config::Config,
    module::Module,
    nn::{
        pool::{MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Tensor},
};

use crate::ml::blocks::{global_average_pool, ConvBn};
use crate::ml::classifier::{compile, CompiledModel, ExpressionClassifier, InputShape};

/// ボトルネックの出力チャネル倍率
const EXPANSION: usize = 4;

#[derive(Config, Debug)]
pub struct ResNet50Config {
    /// 分類クラス数
    pub num_classes: usize,
    #[config(default = 3)]
    pub in_channels: usize,
    /// 各ステージのブロック数
    #[config(default = "[3, 4, 6, 3]")]
    pub blocks: [usize; 4],
    /// 分類ヘッド直前のドロップアウト率
    #[config(default = 0.5)]
    pub dropout: f64,
}

impl ResNet50Config {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ResNet50<B> {
        let widths = [64, 128, 256, 512];
        let mut in_channels = 64;
        let mut stages = Vec::new();

        for (stage, (&count, &width)) in self.blocks.iter().zip(widths.iter()).enumerate() {
            // 最初のステージ以外は先頭ブロックで解像度を半分にする
            let first_stride = if stage == 0 { 1 } else { 2 };
            for i in 0..count {
                let stride = if i == 0 { first_stride } else { 1 };
                stages.push(Bottleneck::new(in_channels, width, stride, device));
                in_channels = width * EXPANSION;
            }
        }

        ResNet50 {
            stem: ConvBn::new(self.in_channels, 64, 7, 2, device),
            stem_pool: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
            blocks: stages,
            dropout: DropoutConfig::new(self.dropout).init(),
            fc: LinearConfig::new(in_channels, self.num_classes).init(device),
            activation: Relu::new(),
            in_channels: self.in_channels,
            num_classes: self.num_classes,
        }
    }
}

/// 1x1 → 3x3 → 1x1 のボトルネックブロック
#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    reduce: ConvBn<B>,
    conv: ConvBn<B>,
    expand: ConvBn<B>,
    shortcut: Option<ConvBn<B>>,
    activation: Relu,
}

impl<B: Backend> Bottleneck<B> {
    pub fn new(in_channels: usize, width: usize, stride: usize, device: &B::Device) -> Self {
        let out_channels = width * EXPANSION;
        // 形状が変わるときだけショートカットに射影を入れる
        let shortcut = (stride != 1 || in_channels != out_channels)
            .then(|| ConvBn::new(in_channels, out_channels, 1, stride, device));

        Self {
            reduce: ConvBn::new(in_channels, width, 1, stride, device),
            conv: ConvBn::new(width, width, 3, 1, device),
            expand: ConvBn::new(width, out_channels, 1, 1, device),
            shortcut,
            activation: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.shortcut {
            Some(projection) => projection.forward(x.clone()),
            None => x.clone(),
        };

        let out = self.activation.forward(self.reduce.forward(x));
        let out = self.activation.forward(self.conv.forward(out));
        let out = self.expand.forward(out);

        self.activation.forward(out + identity)
    }
}

/// ResNet50 + 大域平均プーリング + Dropout + 全結合
#[derive(Module, Debug)]
pub struct ResNet50<B: Backend> {
    stem: ConvBn<B>,
    stem_pool: MaxPool2d,
    blocks: Vec<Bottleneck<B>>,
    dropout: Dropout,
    fc: Linear<B>,
    activation: Relu,
    in_channels: usize,
    num_classes: usize,
}

impl<B: Backend> ExpressionClassifier<B> for ResNet50<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.activation.forward(self.stem.forward(images));
        let mut x = self.stem_pool.forward(x);

        for block in &self.blocks {
            x = block.forward(x);
        }

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

/// ResNet50を構築してコンパイル
pub fn build_resnet50<B: Backend>(
    input_shape: InputShape,
    num_classes: usize,
    device: &B::Device,
) -> CompiledModel<ResNet50<B>> {
    let model = ResNet50Config::new(num_classes)
        .with_in_channels(input_shape.channels)
        .init(device);
    tracing::debug!(
        "[ResNet50] 入力 {}x{}x{}, パラメータ数 {}",
        input_shape.height,
        input_shape.width,
        input_shape.channels,
        model.num_params()
    );
    compile(model)
}
