pub mod baseline_cnn;
pub mod blocks;
pub mod callbacks;
pub mod classifier;
pub mod efficientnet_b0;
pub mod evaluation;
pub mod history;
pub mod resnet50;
pub mod training;

pub use baseline_cnn::{build_baseline_cnn, BaselineCnn, BaselineCnnConfig};
pub use callbacks::{
    CsvLogger, EarlyStopping, ModelCheckpoint, ReduceLrOnPlateau, TrainingCallback,
    TrainingContext,
};
pub use classifier::{compile, CompiledModel, ExpressionClassifier, InputShape};
pub use efficientnet_b0::{build_efficientnet_b0, EfficientNetB0, EfficientNetB0Config};
pub use evaluation::{materialize, predict, Predictions};
pub use history::{EpochLogs, TrainingHistory};
pub use resnet50::{build_resnet50, ResNet50, ResNet50Config};
pub use training::{fit, steps_for, FitOutcome, FitPlan};
