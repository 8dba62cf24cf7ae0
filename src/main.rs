//! 実験スイートの実行
//!
//! カレントディレクトリの `experiment_config.json` を読み込み（無ければ既定値、壊れていればエラー）、
//! 記載された実験を順番に学習・評価します。

use anyhow::Result;
use fer_experiments_lib::logging::{init_logging, LogConfig};
use fer_experiments_lib::model::SuiteConfig;
use fer_experiments_lib::run_suite;

fn main() -> Result<()> {
    init_logging(&LogConfig::from_env())?;

    let config = SuiteConfig::load_or_default()?;
    config.display();

    let reports = run_suite(&config)?;

    println!("\n=== 実験結果 ===");
    for report in &reports {
        println!("{}", report.summary());
    }
    println!("================");

    Ok(())
}
