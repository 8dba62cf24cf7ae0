//! 表情認識（7クラス、48x48グレースケール）の学習・評価ハーネス
#![recursion_limit = "256"]

pub mod backend;
pub mod dataset;
pub mod error;
pub mod experiment;
pub mod logging;
pub mod ml;
pub mod model;
pub mod report;

pub use error::ExperimentError;
pub use experiment::{run_experiment, run_suite, ExperimentReport, RunStage};
