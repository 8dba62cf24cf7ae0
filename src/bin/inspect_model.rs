//! 保存済みモデル（tar.gz）のメタデータ表示と重みの復元確認

use anyhow::{Context, Result};
use burn::tensor::Tensor;
use fer_experiments_lib::backend::cpu_device;
use fer_experiments_lib::ml::{
    BaselineCnnConfig, EfficientNetB0Config, ExpressionClassifier, ResNet50Config,
};
use fer_experiments_lib::model::{
    decode_into, load_model_with_metadata, print_metadata_info, Architecture, ModelMetadata,
};
use std::path::PathBuf;

type InspectBackend = burn::backend::NdArray;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let model_path = args
        .get(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./results_models/BaselineCNN_model.tar.gz"));

    let (metadata, binary) = load_model_with_metadata(&model_path)
        .with_context(|| format!("モデルを読み込めません: {}", model_path.display()))?;
    println!("✓ モデルメタデータ読み込み成功: {}", model_path.display());
    print_metadata_info(&metadata);

    let width = restore_and_run(&metadata, binary)?;
    println!("✓ 重みの復元成功: 出力幅 {}", width);

    Ok(())
}

/// 重みを復元してゼロ画像で1回推論し、出力幅を返す
fn restore_and_run(metadata: &ModelMetadata, binary: Vec<u8>) -> Result<usize> {
    let device = cpu_device();
    let shape = metadata.input_shape;
    let num_classes = metadata.num_classes();
    let input = Tensor::<InspectBackend, 4>::zeros(
        [1, shape.channels, shape.height, shape.width],
        &device,
    );

    let output = match metadata.architecture {
        Architecture::BaselineCnn => {
            let model = BaselineCnnConfig::new(num_classes)
                .with_in_channels(shape.channels)
                .with_image_size(shape.height)
                .init::<InspectBackend>(&device);
            decode_into::<InspectBackend, _>(model, binary, &device)?.forward_softmax(input)
        }
        Architecture::ResNet50 => {
            let model = ResNet50Config::new(num_classes)
                .with_in_channels(shape.channels)
                .init::<InspectBackend>(&device);
            decode_into::<InspectBackend, _>(model, binary, &device)?.forward_softmax(input)
        }
        Architecture::EfficientNetB0 => {
            let model = EfficientNetB0Config::new(num_classes)
                .with_in_channels(shape.channels)
                .init::<InspectBackend>(&device);
            decode_into::<InspectBackend, _>(model, binary, &device)?.forward_softmax(input)
        }
    };

    let [_, width] = output.dims();
    Ok(width)
}
