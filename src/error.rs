//! 実験ハーネスのエラー定義
//!
//! どのエラーも回復せずに実行全体を中断させます。

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExperimentError {
    /// 学習/テスト用ディレクトリが存在しない
    #[error("データセットのディレクトリが存在しません: {}", .0.display())]
    DatasetNotFound(PathBuf),

    /// 画像が1枚も見つからない
    #[error("画像が見つかりません: {}", .0.display())]
    EmptyCorpus(PathBuf),

    /// train と test でクラス構成が異なる
    #[error("クラス構成が一致しません: train={train:?}, test={test:?}")]
    ClassSetMismatch { train: Vec<String>, test: Vec<String> },

    /// バッチ1つ分にも満たないサンプル数
    #[error("サンプル数 {samples} がバッチサイズ {batch_size} に満たないため1ステップも実行できません")]
    InsufficientSamples { samples: usize, batch_size: usize },

    /// バッチのチャネル数がモデルの入力と一致しない
    #[error("チャネル数が一致しません: 期待 {expected}, 実際 {actual}")]
    ChannelMismatch { expected: usize, actual: usize },

    /// ラベルのクラス数がモデル出力と一致しない
    #[error("クラス数が一致しません: 期待 {expected}, 実際 {actual}")]
    ClassCountMismatch { expected: usize, actual: usize },

    /// アーキテクチャが受け付けない入力サイズ
    #[error("{architecture} には {minimum}x{minimum} 以上の入力が必要です (設定値 {size})")]
    ImageTooSmall {
        architecture: String,
        size: usize,
        minimum: usize,
    },
}
