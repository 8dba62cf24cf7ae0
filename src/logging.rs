//! ログ初期化
//!
//! `tracing` のfmtサブスクライバを1度だけ登録します。

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// ログレベルを指定する環境変数
pub const LOG_LEVEL_ENV: &str = "FER_LOG";

/// ログ設定
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    pub include_target: bool,
    pub ansi_colors: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            include_target: false,
            ansi_colors: true,
        }
    }
}

impl LogConfig {
    /// 環境変数 `FER_LOG` からレベルを読み込む（未設定ならInfo）
    pub fn from_env() -> Self {
        let level = std::env::var(LOG_LEVEL_ENV)
            .map(|value| LogLevel::parse(&value))
            .unwrap_or(LogLevel::Info);
        Self {
            level,
            include_target: level == LogLevel::Debug || level == LogLevel::Trace,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }

    /// 文字列から変換（不明な値はInfo）
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

/// グローバルなサブスクライバを登録
pub fn init_logging(config: &LogConfig) -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.level.to_tracing_level())
        .with_ansi(config.ansi_colors)
        .with_target(config.include_target)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("ログの初期化に失敗しました: {}", e))?;

    Ok(())
}
