pub mod config;
pub mod model_metadata;
pub mod model_storage;

pub use config::{
    Architecture, AugmentationSettings, CallbackSettings, DatasetSettings, DeviceType,
    ExperimentConfig, OutputSettings, SuiteConfig, TrainingSettings,
};
pub use model_metadata::ModelMetadata;
pub use model_storage::{
    decode_into, encode_model, load_metadata, load_model_binary, load_model_with_metadata,
    print_metadata_info, save_model_with_metadata, save_trained_model,
};
