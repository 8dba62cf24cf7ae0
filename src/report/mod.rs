pub mod heatmap;
pub mod metrics;

pub use heatmap::{render_confusion_heatmap, save_confusion_heatmap};
pub use metrics::{ClassificationReport, ConfusionMatrix};
