//! 浅いCNN（グレースケール1チャネル入力）

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d,
        Relu,
    },
    tensor::{backend::Backend, Tensor},
};

use crate::ml::classifier::{compile, CompiledModel, ExpressionClassifier, InputShape};

/// 2回のプーリング後に特徴マップが残る最小の入力サイズ
pub const MIN_IMAGE_SIZE: usize = 8;

/// モデル設定
#[derive(Config, Debug)]
pub struct BaselineCnnConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// 入力チャネル数
    #[config(default = 1)]
    pub in_channels: usize,
    /// 入力画像サイズ（正方形）
    #[config(default = 48)]
    pub image_size: usize,
    /// conv3/conv4 のカーネルに掛けるL2係数
    #[config(default = 0.01)]
    pub l2: f64,
}

impl BaselineCnnConfig {
    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> BaselineCnn<B> {
        // Conv1, Conv2 (same) : size
        // Pool1               : size / 2
        // Conv4 (valid)       : size / 2 - 2
        // Pool2               : (size / 2 - 2) / 2
        let after_pool1 = self.image_size / 2;
        let after_conv4 = after_pool1.saturating_sub(2);
        let feature_map_size = after_conv4 / 2;

        assert!(
            feature_map_size > 0,
            "入力サイズが小さすぎます: {} (最小{}x{}が必要)",
            self.image_size,
            MIN_IMAGE_SIZE,
            MIN_IMAGE_SIZE
        );

        let d = 256 * feature_map_size * feature_map_size;
        tracing::debug!(
            "[BaselineCNN] 入力 {}x{}x{} -> 特徴マップ 256x{}x{} -> Flatten {}",
            self.image_size,
            self.image_size,
            self.in_channels,
            feature_map_size,
            feature_map_size,
            d
        );

        let same = |[i, o]: [usize; 2]| {
            Conv2dConfig::new([i, o], [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .init(device)
        };

        BaselineCnn {
            conv1: same([self.in_channels, 32]),
            conv2: same([32, 64]),
            bn1: BatchNormConfig::new(64).init(device),
            pool1: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            dropout1: DropoutConfig::new(0.25).init(),

            conv3: same([64, 128]),
            conv4: Conv2dConfig::new([128, 256], [3, 3])
                .with_padding(PaddingConfig2d::Valid)
                .init(device),
            bn2: BatchNormConfig::new(256).init(device),
            pool2: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            dropout2: DropoutConfig::new(0.25).init(),

            fc1: LinearConfig::new(d, 1024).init(device),
            dropout3: DropoutConfig::new(0.5).init(),
            fc2: LinearConfig::new(1024, self.num_classes).init(device),

            activation: Relu::new(),
            in_channels: self.in_channels,
            num_classes: self.num_classes,
            l2: self.l2,
        }
    }
}

/// 表情分類用の浅いCNN
///
/// # アーキテクチャ
/// - Conv 32 (same) + ReLU, Conv 64 (same) + ReLU, BatchNorm, MaxPool 2x2, Dropout 0.25
/// - Conv 128 (same, L2) + ReLU, Conv 256 (valid, L2) + ReLU, BatchNorm, MaxPool 2x2, Dropout 0.25
/// - Flatten, FC 1024 + ReLU, Dropout 0.5
/// - FC num_classes（softmaxは分類時）
#[derive(Module, Debug)]
pub struct BaselineCnn<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    bn1: BatchNorm<B>,
    pool1: MaxPool2d,
    dropout1: Dropout,

    conv3: Conv2d<B>,
    conv4: Conv2d<B>,
    bn2: BatchNorm<B>,
    pool2: MaxPool2d,
    dropout2: Dropout,

    fc1: Linear<B>,
    dropout3: Dropout,
    fc2: Linear<B>,

    activation: Relu,
    in_channels: usize,
    num_classes: usize,
    l2: f64,
}

impl<B: Backend> ExpressionClassifier<B> for BaselineCnn<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.activation.forward(self.conv1.forward(images));
        let x = self.activation.forward(self.conv2.forward(x));
        let x = self.bn1.forward(x);
        let x = self.pool1.forward(x);
        let x = self.dropout1.forward(x);

        let x = self.activation.forward(self.conv3.forward(x));
        let x = self.activation.forward(self.conv4.forward(x));
        let x = self.bn2.forward(x);
        let x = self.pool2.forward(x);
        let x = self.dropout2.forward(x);

        let [_, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);

        let x = self.activation.forward(self.fc1.forward(x));
        let x = self.dropout3.forward(x);
        self.fc2.forward(x)
    }

    fn input_channels(&self) -> usize {
        self.in_channels
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// `l2 * (Σ conv3.w² + Σ conv4.w²)`
    fn regularization_loss(&self) -> Option<Tensor<B, 1>> {
        let conv3 = self.conv3.weight.val().powf_scalar(2.0).sum();
        let conv4 = self.conv4.weight.val().powf_scalar(2.0).sum();
        Some((conv3 + conv4).mul_scalar(self.l2))
    }
}

/// 浅いCNNを構築してコンパイル
pub fn build_baseline_cnn<B: Backend>(
    input_shape: InputShape,
    num_classes: usize,
    device: &B::Device,
) -> CompiledModel<BaselineCnn<B>> {
    let model = BaselineCnnConfig::new(num_classes)
        .with_in_channels(input_shape.channels)
        .with_image_size(input_shape.height)
        .init(device);
    compile(model)
}
