//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（アーキテクチャ、クラス名、学習結果）
//! - model.bin       - モデルの重み（BinBytesRecorder, f32）

use anyhow::{Context, Result};
use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::Backend,
};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};

use crate::model::model_metadata::ModelMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";

/// `.tar.gz` で終わっていなければ拡張子を付け替える
pub fn artifact_path(output_path: &Path) -> PathBuf {
    let name = output_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if name.ends_with(".tar.gz") {
        output_path.to_path_buf()
    } else {
        output_path.with_extension("tar.gz")
    }
}

/// モデルの重みをバイト列に変換
pub fn encode_model<B: Backend, M: Module<B>>(model: M) -> Result<Vec<u8>> {
    BinBytesRecorder::<FullPrecisionSettings>::default()
        .record(model.into_record(), ())
        .map_err(|e| anyhow::anyhow!("モデル重みのシリアライズに失敗: {:?}", e))
}

/// 初期化済みモデルにバイト列の重みを読み込む
pub fn decode_into<B: Backend, M: Module<B>>(
    model: M,
    model_binary: Vec<u8>,
    device: &B::Device,
) -> Result<M> {
    let record = BinBytesRecorder::<FullPrecisionSettings>::default()
        .load(model_binary, device)
        .map_err(|e| anyhow::anyhow!("モデル重みの読み込みエラー: {:?}", e))?;
    Ok(model.load_record(record))
}

fn append_entry<W: std::io::Write>(builder: &mut Builder<W>, name: &str, bytes: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append(&header, bytes)
        .with_context(|| format!("{} をtarへ追加できません", name))
}

/// メタデータと共にモデルをTar.gz形式で保存
///
/// 戻り値は実際に書き込んだパス。
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
) -> Result<PathBuf> {
    let tar_gz_path = artifact_path(output_path);

    if let Some(parent) = tar_gz_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("ディレクトリを作成できません: {}", parent.display()))?;
        }
    }

    let file = File::create(&tar_gz_path)
        .with_context(|| format!("ファイルを作成できません: {}", tar_gz_path.display()))?;
    let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));

    append_entry(&mut builder, METADATA_ENTRY, metadata.to_json_string()?.as_bytes())?;
    append_entry(&mut builder, MODEL_ENTRY, model_binary)?;

    builder
        .into_inner()
        .context("tarアーカイブの書き込みに失敗")?
        .finish()
        .context("gzip圧縮の完了に失敗")?;

    Ok(tar_gz_path)
}

/// 学習済みモデルを保存（重みの変換込み）
pub fn save_trained_model<B: Backend, M: Module<B>>(
    output_path: &Path,
    metadata: &ModelMetadata,
    model: M,
) -> Result<PathBuf> {
    let binary = encode_model::<B, M>(model)?;
    save_model_with_metadata(output_path, metadata, &binary)
}

/// アーカイブ内の指定エントリを読み出す（無ければNone）
fn read_entries(tar_gz_path: &Path, wanted: &[&str]) -> Result<Vec<Option<Vec<u8>>>> {
    let file = File::open(tar_gz_path)
        .with_context(|| format!("ファイルを開けません: {}", tar_gz_path.display()))?;
    let mut archive = Archive::new(GzDecoder::new(file));
    let mut found = vec![None; wanted.len()];

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().into_owned();
        if let Some(slot) = wanted.iter().position(|name| *name == path) {
            let mut buffer = Vec::new();
            entry.read_to_end(&mut buffer)?;
            found[slot] = Some(buffer);
        }
    }

    Ok(found)
}

fn parse_metadata(bytes: Vec<u8>) -> Result<ModelMetadata> {
    let json = String::from_utf8(bytes).context("metadata.json がUTF-8ではありません")?;
    ModelMetadata::from_json_string(&json)
}

/// Tar.gzからモデルメタデータを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata> {
    let mut entries = read_entries(tar_gz_path, &[METADATA_ENTRY])?;
    let bytes = entries
        .remove(0)
        .with_context(|| format!("{} がアーカイブにありません", METADATA_ENTRY))?;
    parse_metadata(bytes)
}

/// Tar.gzからモデルバイナリを読み込む
pub fn load_model_binary(tar_gz_path: &Path) -> Result<Vec<u8>> {
    read_entries(tar_gz_path, &[MODEL_ENTRY])?
        .remove(0)
        .with_context(|| format!("{} がアーカイブにありません", MODEL_ENTRY))
}

/// メタデータとモデルバイナリを共に読み込む
pub fn load_model_with_metadata(tar_gz_path: &Path) -> Result<(ModelMetadata, Vec<u8>)> {
    let mut entries = read_entries(tar_gz_path, &[METADATA_ENTRY, MODEL_ENTRY])?;
    let binary = entries
        .pop()
        .flatten()
        .with_context(|| format!("{} がアーカイブにありません", MODEL_ENTRY))?;
    let metadata = entries
        .pop()
        .flatten()
        .with_context(|| format!("{} がアーカイブにありません", METADATA_ENTRY))?;
    Ok((parse_metadata(metadata)?, binary))
}

/// メタデータをコンソールに表示
pub fn print_metadata_info(metadata: &ModelMetadata) {
    println!("\n=== モデルメタデータ ===");
    println!("実験名: {}", metadata.experiment_name);
    println!("アーキテクチャ: {}", metadata.architecture);
    println!("クラス ({}): {}", metadata.num_classes(), metadata.class_labels.join(", "));
    println!(
        "入力形状: {}x{}x{}",
        metadata.input_shape.height, metadata.input_shape.width, metadata.input_shape.channels
    );
    println!("バッチサイズ: {}", metadata.batch_size);
    println!("学習エポック数: {}", metadata.epochs_run);
    match metadata.best_val_loss {
        Some(loss) => println!("最良val_loss: {:.4}", loss),
        None => println!("最良val_loss: -"),
    }
    match metadata.test_accuracy {
        Some(acc) => println!("テスト正解率: {:.4}", acc),
        None => println!("テスト正解率: -"),
    }
    println!("最終学習率: {:.2e}", metadata.final_learning_rate);
    println!("学習日時: {}", metadata.trained_at);
    println!("========================");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::baseline_cnn::BaselineCnnConfig;
    use crate::ml::classifier::{ExpressionClassifier, InputShape};
    use crate::model::config::Architecture;
    use burn::tensor::Tensor;
    use burn_ndarray::NdArray;
    use tempfile::tempdir;

    type TestBackend = NdArray;

    fn metadata() -> ModelMetadata {
        ModelMetadata::new(
            "BaselineCNN",
            Architecture::BaselineCnn,
            vec!["angry".to_string(), "happy".to_string()],
            InputShape::square(8, 1),
            2,
        )
        .with_training_summary(1, Some(0.7), 1e-3)
    }

    #[test]
    fn test_artifact_path_extension() {
        assert_eq!(
            artifact_path(Path::new("out/BaselineCNN_model")),
            PathBuf::from("out/BaselineCNN_model.tar.gz")
        );
        assert_eq!(
            artifact_path(Path::new("out/m.tar.gz")),
            PathBuf::from("out/m.tar.gz")
        );
    }

    #[test]
    fn test_save_and_load_archive() {
        let dir = tempdir().unwrap();
        let path = save_model_with_metadata(
            &dir.path().join("nested").join("demo_model"),
            &metadata(),
            &[1, 2, 3, 4],
        )
        .unwrap();

        assert!(path.exists());
        assert_eq!(load_metadata(&path).unwrap(), metadata_without_time(&path));
        assert_eq!(load_model_binary(&path).unwrap(), vec![1, 2, 3, 4]);

        let (restored, binary) = load_model_with_metadata(&path).unwrap();
        assert_eq!(restored.class_labels, vec!["angry", "happy"]);
        assert_eq!(binary.len(), 4);
    }

    fn metadata_without_time(path: &Path) -> ModelMetadata {
        // 保存時刻は読み戻した値をそのまま使う
        let mut expected = metadata();
        expected.trained_at = load_metadata(path).unwrap().trained_at;
        expected
    }

    #[test]
    fn test_load_missing_archive_fails() {
        let dir = tempdir().unwrap();
        assert!(load_metadata(&dir.path().join("missing.tar.gz")).is_err());
    }

    #[test]
    fn test_weights_survive_round_trip() {
        let dir = tempdir().unwrap();
        let device = Default::default();
        let config = BaselineCnnConfig::new(2).with_image_size(8);
        let model = config.init::<TestBackend>(&device);
        let input = Tensor::<TestBackend, 4>::ones([1, 1, 8, 8], &device);
        let expected = model
            .forward(input.clone())
            .into_data()
            .to_vec::<f32>()
            .unwrap();

        let path =
            save_trained_model::<TestBackend, _>(&dir.path().join("w"), &metadata(), model).unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() > 0);

        let (_, binary) = load_model_with_metadata(&path).unwrap();
        let fresh = config.init::<TestBackend>(&device);
        let restored = decode_into::<TestBackend, _>(fresh, binary, &device).unwrap();

        let actual = restored.forward(input).into_data().to_vec::<f32>().unwrap();
        for (a, e) in actual.iter().zip(&expected) {
            assert!((a - e).abs() < 1e-5);
        }
    }
}
