use clap::ValueEnum;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
  /// The logging level: `off`, `error`, `warn`, `info`, `debug`, `trace`.
  /// Default: `info`.
  #[serde(default)]
  pub level: LogLevel,
  /// Standard log format, json, or disabled.
  /// Default: standard.
  #[serde(default)]
  pub stdio: StdioLogMode,
  /// Whether to use the pretty multi-line format.
  /// Default: false.
  #[serde(default)]
  pub pretty: bool,
  /// Whether to emit ANSI colors.
  /// Default: true.
  #[serde(default = "default_ansi")]
  pub ansi: bool,
}

fn default_ansi() -> bool {
  true
}

impl Default for LogConfig {
  fn default() -> LogConfig {
    LogConfig {
      level: Default::default(),
      stdio: Default::default(),
      pretty: false,
      ansi: true,
    }
  }
}

#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
  Off,
  Error,
  Warn,
  #[default]
  Info,
  Debug,
  Trace,
}

impl From<LogLevel> for tracing::level_filters::LevelFilter {
  fn from(value: LogLevel) -> Self {
    use tracing::level_filters::LevelFilter;
    match value {
      LogLevel::Off => LevelFilter::OFF,
      LogLevel::Error => LevelFilter::ERROR,
      LogLevel::Warn => LevelFilter::WARN,
      LogLevel::Info => LevelFilter::INFO,
      LogLevel::Debug => LevelFilter::DEBUG,
      LogLevel::Trace => LevelFilter::TRACE,
    }
  }
}

#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum StdioLogMode {
  #[default]
  Standard,
  Json,
  None,
}
