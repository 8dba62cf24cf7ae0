pub mod adapter;
pub mod augmentation;
pub mod batch;
pub mod corpus;
pub mod generator;
pub mod labels;

pub use adapter::{ChannelAdapterExt, ChannelStream, GrayscaleToRgb};
pub use augmentation::Augmenter;
pub use batch::ImageBatch;
pub use corpus::{ImageCorpus, ImageItem};
pub use generator::BatchGenerator;
pub use labels::ClassLabelMap;
