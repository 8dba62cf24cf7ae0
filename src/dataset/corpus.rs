//! ディレクトリ構造からラベル付き画像コーパスを読み込む

use anyhow::{Context, Result};
use burn::data::dataset::Dataset;
use image::{imageops::FilterType, GrayImage};
use std::path::{Path, PathBuf};

use crate::dataset::ClassLabelMap;
use crate::error::ExperimentError;

/// 読み込み対象の拡張子
const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// コーパスの1要素（グレースケール画像とクラスID）
#[derive(Clone, Debug)]
pub struct ImageItem {
    pub image: GrayImage,
    pub label: usize,
}

/// メモリ上に展開したグレースケール画像コーパス
///
/// 画像はすべて読み込み時に `image_size` x `image_size` へ揃えます。
/// 読み込みに失敗した画像があればその時点でエラーになります。
#[derive(Debug, Clone)]
pub struct ImageCorpus {
    root: PathBuf,
    items: Vec<ImageItem>,
    image_size: usize,
    num_classes: usize,
}

impl ImageCorpus {
    /// ラベル対応表の順序でクラスディレクトリを走査して読み込む
    pub fn from_directory(data_dir: &Path, labels: &ClassLabelMap, image_size: usize) -> Result<Self> {
        if !data_dir.is_dir() {
            return Err(ExperimentError::DatasetNotFound(data_dir.to_path_buf()).into());
        }

        let mut items = Vec::new();
        for (class_id, class_name) in labels.names().iter().enumerate() {
            let class_dir = data_dir.join(class_name);
            if !class_dir.is_dir() {
                tracing::warn!("クラスディレクトリが存在しません: {}", class_dir.display());
                continue;
            }

            let mut paths: Vec<PathBuf> = std::fs::read_dir(&class_dir)
                .with_context(|| format!("ディレクトリを読み込めません: {}", class_dir.display()))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| path.is_file() && is_image_file(path))
                .collect();
            // ディレクトリの列挙順はOS依存なのでファイル名で固定する
            paths.sort();

            if paths.is_empty() {
                tracing::warn!("クラス '{}' に画像がありません", class_name);
            }

            for path in &paths {
                let image = load_grayscale(path, image_size)?;
                items.push(ImageItem { image, label: class_id });
            }
            tracing::debug!("  クラス '{}': {} 枚", class_name, paths.len());
        }

        if items.is_empty() {
            return Err(ExperimentError::EmptyCorpus(data_dir.to_path_buf()).into());
        }

        tracing::info!(
            "{} から {} 枚の画像を {} クラスで読み込みました",
            data_dir.display(),
            items.len(),
            labels.len()
        );

        Ok(Self {
            root: data_dir.to_path_buf(),
            items,
            image_size,
            num_classes: labels.len(),
        })
    }

    /// 読み込み済みの要素から作成
    pub fn from_items(items: Vec<ImageItem>, image_size: usize, num_classes: usize) -> Self {
        Self {
            root: PathBuf::new(),
            items,
            image_size,
            num_classes,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// クラスごとのサンプル数
    pub fn class_distribution(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.num_classes];
        for item in &self.items {
            if item.label < self.num_classes {
                counts[item.label] += 1;
            }
        }
        counts
    }
}

impl Dataset<ImageItem> for ImageCorpus {
    fn get(&self, index: usize) -> Option<ImageItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// 画像をグレースケールで読み込み、必要ならサイズを揃える
fn load_grayscale(path: &Path, image_size: usize) -> Result<GrayImage> {
    let image = image::open(path)
        .with_context(|| format!("画像読み込み失敗: {}", path.display()))?
        .to_luma8();

    let size = image_size as u32;
    if image.width() == size && image.height() == size {
        Ok(image)
    } else {
        Ok(image::imageops::resize(&image, size, size, FilterType::Nearest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn write_image(path: &Path, size: u32, value: u8) {
        GrayImage::from_pixel(size, size, Luma([value])).save(path).unwrap();
    }

    #[test]
    fn test_loads_and_resizes_images() {
        let dir = tempfile::tempdir().unwrap();
        for (class, value) in [("happy", 200u8), ("sad", 20u8)] {
            let class_dir = dir.path().join(class);
            std::fs::create_dir(&class_dir).unwrap();
            write_image(&class_dir.join("a.png"), 48, value);
            write_image(&class_dir.join("b.png"), 64, value);
            std::fs::write(class_dir.join("notes.txt"), "skip").unwrap();
        }

        let labels = ClassLabelMap::from_directory(dir.path()).unwrap();
        let corpus = ImageCorpus::from_directory(dir.path(), &labels, 48).unwrap();

        assert_eq!(corpus.len(), 4);
        assert_eq!(corpus.class_distribution(), vec![2, 2]);
        for index in 0..corpus.len() {
            let item = corpus.get(index).unwrap();
            assert_eq!(item.image.dimensions(), (48, 48));
        }
        let first = corpus.get(0).unwrap();
        assert_eq!(first.label, 0);
        assert_eq!(first.image.get_pixel(0, 0)[0], 200);
    }

    #[test]
    fn test_empty_corpus_is_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("happy")).unwrap();
        let labels = ClassLabelMap::from_directory(dir.path()).unwrap();

        let err = ImageCorpus::from_directory(dir.path(), &labels, 48).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExperimentError>(),
            Some(ExperimentError::EmptyCorpus(_))
        ));
    }
}
