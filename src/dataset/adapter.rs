//! グレースケール → 3チャネル変換アダプタ
//!
//! ResNet50/EfficientNetB0 は3チャネル入力を前提とするため、
//! 上流のバッチを1つ取り出すごとに、チャネルを3回複製したバッチを1つ返します。
//! 上流のイテレータを所有して消費するので、巻き戻して再利用はできません。

use crate::dataset::ImageBatch;
use crate::error::ExperimentError;

/// 上流のイテレータをラップする3チャネル化アダプタ
pub struct GrayscaleToRgb<I> {
    source: I,
}

impl<I> GrayscaleToRgb<I>
where
    I: Iterator<Item = ImageBatch>,
{
    pub fn new(source: I) -> Self {
        Self { source }
    }
}

impl<I> Iterator for GrayscaleToRgb<I>
where
    I: Iterator<Item = ImageBatch>,
{
    type Item = Result<ImageBatch, ExperimentError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.source.next().map(ImageBatch::to_rgb)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.source.size_hint()
    }
}

/// バッチイテレータに `.to_rgb()` を生やす拡張トレイト
pub trait ChannelAdapterExt: Iterator<Item = ImageBatch> + Sized {
    fn to_rgb(self) -> GrayscaleToRgb<Self> {
        GrayscaleToRgb::new(self)
    }
}

impl<I: Iterator<Item = ImageBatch>> ChannelAdapterExt for I {}

/// アーキテクチャが要求するチャネル数に合わせたバッチ列
///
/// 学習ループはこの型だけを見ればよく、変換の有無を意識しません。
pub enum ChannelStream<I> {
    Grayscale(I),
    Rgb(GrayscaleToRgb<I>),
}

impl<I> ChannelStream<I>
where
    I: Iterator<Item = ImageBatch>,
{
    pub fn new(source: I, channels: usize) -> Self {
        if channels == 3 {
            ChannelStream::Rgb(source.to_rgb())
        } else {
            ChannelStream::Grayscale(source)
        }
    }
}

impl<I> Iterator for ChannelStream<I>
where
    I: Iterator<Item = ImageBatch>,
{
    type Item = Result<ImageBatch, ExperimentError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            ChannelStream::Grayscale(source) => source.next().map(Ok),
            ChannelStream::Rgb(adapter) => adapter.next(),
        }
    }
}
