//! 実験設定管理モジュール
//!
//! データセットのパス、学習ハイパーパラメータ、コールバック方針、
//! 実行する実験の一覧をJSON形式で保存・読み込みします。

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    #[default]
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// モデルのアーキテクチャ
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Architecture {
    /// 浅いCNN（グレースケール1チャネル入力）
    BaselineCnn,
    /// ResNet50バックボーン（3チャネル入力）
    ResNet50,
    /// EfficientNetB0バックボーン（3チャネル入力）
    EfficientNetB0,
}

impl Architecture {
    /// モデルが要求する入力チャネル数
    pub fn input_channels(&self) -> usize {
        match self {
            Architecture::BaselineCnn => 1,
            Architecture::ResNet50 | Architecture::EfficientNetB0 => 3,
        }
    }

    /// グレースケールのバッチを3チャネルに変換する必要があるか
    pub fn requires_rgb(&self) -> bool {
        self.input_channels() == 3
    }

    /// 標準のバッチサイズ（バックボーン系はメモリ消費が大きいため小さめ）
    pub fn default_batch_size(&self) -> usize {
        match self {
            Architecture::BaselineCnn => 64,
            Architecture::ResNet50 | Architecture::EfficientNetB0 => 32,
        }
    }

    /// 受け付ける最小の入力サイズ（正方形の一辺）
    pub fn min_image_size(&self) -> usize {
        match self {
            Architecture::BaselineCnn => crate::ml::baseline_cnn::MIN_IMAGE_SIZE,
            Architecture::ResNet50 | Architecture::EfficientNetB0 => 1,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Architecture::BaselineCnn => "BaselineCNN",
            Architecture::ResNet50 => "ResNet50",
            Architecture::EfficientNetB0 => "EfficientNetB0",
        }
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// 学習時のデータ拡張設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AugmentationSettings {
    /// 画素値に掛ける係数
    pub rescale: f32,
    /// ランダムズームの幅（倍率は [1 - zoom_range, 1 + zoom_range]）
    pub zoom_range: f32,
    /// ランダム左右反転
    pub horizontal_flip: bool,
}

impl Default for AugmentationSettings {
    fn default() -> Self {
        Self {
            rescale: 1.0 / 255.0,
            zoom_range: 0.3,
            horizontal_flip: true,
        }
    }
}

/// データセット設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSettings {
    /// 学習用ディレクトリ（クラスごとのサブディレクトリを含む）
    pub train_dir: PathBuf,
    /// テスト用ディレクトリ
    pub test_dir: PathBuf,
    /// 画像サイズ（正方形、ピクセル）
    pub image_size: usize,
    /// 分類クラス数
    pub num_classes: usize,
    #[serde(default)]
    pub augmentation: AugmentationSettings,
}

impl Default for DatasetSettings {
    fn default() -> Self {
        Self {
            train_dir: PathBuf::from("./A/data/fer2013/train/"),
            test_dir: PathBuf::from("./A/data/fer2013/test/"),
            image_size: 48,
            num_classes: 7,
            augmentation: AugmentationSettings::default(),
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// エポック数
    pub num_epochs: usize,
    /// 学習率の初期値
    pub learning_rate: f64,
    /// シャッフル用のランダムシード
    pub seed: u64,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 50,
            learning_rate: 1e-3,
            seed: 42,
        }
    }
}

/// コールバック設定（すべて val_loss を監視）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackSettings {
    /// 改善が無いまま何エポックで学習を打ち切るか
    pub early_stopping_patience: usize,
    /// 打ち切り時に最良の重みへ戻すか
    pub restore_best_weights: bool,
    /// 学習率を下げる係数
    pub lr_reduce_factor: f64,
    /// 改善が無いまま何エポックで学習率を下げるか
    pub lr_reduce_patience: usize,
    /// 学習率の下限
    pub min_learning_rate: f64,
}

impl Default for CallbackSettings {
    fn default() -> Self {
        Self {
            early_stopping_patience: 7,
            restore_best_weights: true,
            lr_reduce_factor: 0.2,
            lr_reduce_patience: 4,
            min_learning_rate: 0.0,
        }
    }
}

/// 出力先設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSettings {
    /// ベストチェックポイントとエポックログの保存先
    pub checkpoint_dir: PathBuf,
    /// 学習履歴・最終モデル・ヒートマップの保存先
    pub results_dir: PathBuf,
    /// 混同行列のヒートマップを描画するか
    #[serde(default = "default_true")]
    pub render_heatmap: bool,
}

fn default_true() -> bool {
    true
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from("."),
            results_dir: PathBuf::from("./results_models"),
            render_heatmap: true,
        }
    }
}

/// 1回分の実験
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// 表示名（出力ファイル名の接頭辞にも使う）
    pub name: String,
    pub architecture: Architecture,
    pub batch_size: usize,
}

impl ExperimentConfig {
    /// アーキテクチャ標準のバッチサイズで作成
    pub fn new(architecture: Architecture) -> Self {
        Self {
            name: architecture.display_name().to_string(),
            architecture,
            batch_size: architecture.default_batch_size(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// 実験スイート全体の設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    pub dataset: DatasetSettings,
    pub training: TrainingSettings,
    #[serde(default)]
    pub callbacks: CallbackSettings,
    #[serde(default)]
    pub output: OutputSettings,
    /// 順番に実行する実験
    pub experiments: Vec<ExperimentConfig>,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            device_type: DeviceType::default(),
            dataset: DatasetSettings::default(),
            training: TrainingSettings::default(),
            callbacks: CallbackSettings::default(),
            output: OutputSettings::default(),
            experiments: vec![
                ExperimentConfig::new(Architecture::BaselineCnn),
                ExperimentConfig::new(Architecture::ResNet50),
                ExperimentConfig::new(Architecture::EfficientNetB0),
            ],
        }
    }
}

impl SuiteConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("experiment_config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: SuiteConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// デフォルトパスから設定を読み込む
    pub fn load_or_default() -> anyhow::Result<Self> {
        Self::load_or_default_from(Self::default_path())
    }

    /// 設定を読み込む、ファイルが存在しない場合だけデフォルト設定を返す
    ///
    /// ファイルがあって読めない・解析できない場合はエラーを返します。
    pub fn load_or_default_from<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("設定ファイルが存在しません。デフォルト設定を使用します");
            return Ok(Self::default());
        }

        let config = Self::load(path)
            .with_context(|| format!("設定ファイルの読み込みに失敗しました: {}", path.display()))?;
        tracing::info!("設定ファイルを読み込みました: {}", path.display());
        Ok(config)
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 設定情報を表示
    pub fn display(&self) {
        println!("=== 実験設定 ===");
        println!("計算デバイス: {}", self.device_type);
        println!("学習データ: {}", self.dataset.train_dir.display());
        println!("テストデータ: {}", self.dataset.test_dir.display());
        println!(
            "画像サイズ: {}x{}, クラス数: {}",
            self.dataset.image_size, self.dataset.image_size, self.dataset.num_classes
        );
        println!("\n--- トレーニング設定 ---");
        println!("エポック数: {}", self.training.num_epochs);
        println!("学習率: {}", self.training.learning_rate);
        println!("シード: {}", self.training.seed);
        println!("\n--- コールバック ---");
        println!(
            "EarlyStopping: patience={}, restore_best_weights={}",
            self.callbacks.early_stopping_patience, self.callbacks.restore_best_weights
        );
        println!(
            "ReduceLROnPlateau: factor={}, patience={}",
            self.callbacks.lr_reduce_factor, self.callbacks.lr_reduce_patience
        );
        println!("\n--- 実験 ---");
        for experiment in &self.experiments {
            println!(
                "{} ({}), バッチサイズ: {}",
                experiment.name, experiment.architecture, experiment.batch_size
            );
        }
        println!("========================\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SuiteConfig::default();
        assert_eq!(config.device_type, DeviceType::Wgpu);
        assert_eq!(config.dataset.num_classes, 7);
        assert_eq!(config.dataset.image_size, 48);
        assert_eq!(config.training.num_epochs, 50);
        assert_eq!(config.callbacks.early_stopping_patience, 7);
        assert_eq!(config.callbacks.lr_reduce_patience, 4);

        let names: Vec<&str> = config.experiments.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["BaselineCNN", "ResNet50", "EfficientNetB0"]);
    }

    #[test]
    fn test_batch_size_by_architecture() {
        assert_eq!(ExperimentConfig::new(Architecture::BaselineCnn).batch_size, 64);
        assert_eq!(ExperimentConfig::new(Architecture::ResNet50).batch_size, 32);
        assert_eq!(ExperimentConfig::new(Architecture::EfficientNetB0).batch_size, 32);
        assert!(!Architecture::BaselineCnn.requires_rgb());
        assert!(Architecture::EfficientNetB0.requires_rgb());
        assert_eq!(Architecture::BaselineCnn.min_image_size(), 8);
        assert_eq!(Architecture::ResNet50.min_image_size(), 1);
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = SuiteConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: SuiteConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.device_type, deserialized.device_type);
        assert_eq!(config.experiments.len(), deserialized.experiments.len());
        assert_eq!(deserialized.experiments[1].architecture, Architecture::ResNet50);
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let json = r#"{
            "device_type": "Cpu",
            "dataset": {"train_dir": "t", "test_dir": "v", "image_size": 48, "num_classes": 7},
            "training": {"num_epochs": 1, "learning_rate": 0.001, "seed": 1},
            "experiments": [{"name": "x", "architecture": "BaselineCnn", "batch_size": 2}]
        }"#;
        let config: SuiteConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.device_type, DeviceType::Cpu);
        assert!(config.dataset.augmentation.horizontal_flip);
        assert!(config.output.render_heatmap);
        assert_eq!(config.callbacks.lr_reduce_factor, 0.2);
    }

    #[test]
    fn test_absent_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiment_config.json");
        let config = SuiteConfig::load_or_default_from(&path).unwrap();
        assert_eq!(config.experiments.len(), 3);
        assert_eq!(config.device_type, DeviceType::Wgpu);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiment_config.json");
        std::fs::write(&path, r#"{"device_type":"Cpu","experiments":[{"name":"x""#).unwrap();

        let err = SuiteConfig::load_or_default_from(&path).unwrap_err();
        assert!(err.to_string().contains("experiment_config.json"));
        assert!(err.chain().any(|cause| cause.is::<serde_json::Error>()));
    }

    #[test]
    fn test_saved_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiment_config.json");
        let mut config = SuiteConfig::default();
        config.device_type = DeviceType::Cpu;
        config.experiments.truncate(1);
        config.save(&path).unwrap();

        let loaded = SuiteConfig::load_or_default_from(&path).unwrap();
        assert_eq!(loaded.device_type, DeviceType::Cpu);
        assert_eq!(loaded.experiments.len(), 1);
    }

    #[test]
    fn test_device_type_display() {
        assert_eq!(format!("{}", DeviceType::Wgpu), "WGPU (GPU)");
        assert_eq!(format!("{}", DeviceType::Cpu), "CPU (NdArray)");
    }
}
