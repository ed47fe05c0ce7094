//! 日志系统
//!
//! 基于 tracing 生态：
//!
//! - 多级别日志，支持 `RUST_LOG` 覆盖
//! - 控制台输出与按时间轮转的文件输出（非阻塞写入）
//! - 可选 JSON 格式
//!
//! # 示例
//!
//! ```rust,no_run
//! use chips_runtime::utils::logger::{Logger, LoggerConfig, RotationStrategy};
//!
//! let _guard = Logger::init(
//!     LoggerConfig::builder()
//!         .level("debug")
//!         .file_output("./logs")
//!         .rotation(RotationStrategy::Hourly)
//!         .build(),
//! )?;
//!
//! tracing::info!(bundle_id = 3, operation = "start", "模块包已启动");
//! # Ok::<(), chips_runtime::CoreError>(())
//! ```

use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::core::LogConfig;
use crate::utils::{CoreError, Result};

/// 日志文件名前缀
const DEFAULT_FILE_PREFIX: &str = "chips-runtime";

/// 日志轮转策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationStrategy {
    /// 单个日志文件
    Never,
    /// 每分钟轮转（主要用于测试）
    Minutely,
    /// 每小时轮转
    Hourly,
    /// 每天轮转
    #[default]
    Daily,
}

impl RotationStrategy {
    fn to_rotation(self) -> Rotation {
        match self {
            RotationStrategy::Never => Rotation::NEVER,
            RotationStrategy::Minutely => Rotation::MINUTELY,
            RotationStrategy::Hourly => Rotation::HOURLY,
            RotationStrategy::Daily => Rotation::DAILY,
        }
    }
}

impl FromStr for RotationStrategy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "never" => Ok(RotationStrategy::Never),
            "minutely" => Ok(RotationStrategy::Minutely),
            "hourly" => Ok(RotationStrategy::Hourly),
            "daily" => Ok(RotationStrategy::Daily),
            other => Err(CoreError::InvalidConfigValue {
                key: "logging.rotation".to_string(),
                reason: format!("未知的轮转策略 '{}'", other),
            }),
        }
    }
}

impl std::fmt::Display for RotationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RotationStrategy::Never => write!(f, "never"),
            RotationStrategy::Minutely => write!(f, "minutely"),
            RotationStrategy::Hourly => write!(f, "hourly"),
            RotationStrategy::Daily => write!(f, "daily"),
        }
    }
}

/// 日志系统配置
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// 默认日志级别（"trace", "debug", "info", "warn", "error"）
    pub level: String,
    pub json_format: bool,
    pub console_output: bool,
    /// 文件输出目录，`None` 表示不写文件
    pub file_output: Option<PathBuf>,
    pub file_prefix: String,
    pub rotation: RotationStrategy,
    pub show_target: bool,
    pub show_file_line: bool,
    /// 额外的过滤指令（EnvFilter 格式），例如 "chips_runtime::bundle=trace"
    pub filter_directives: Option<String>,
    pub ansi_colors: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            console_output: true,
            file_output: None,
            file_prefix: DEFAULT_FILE_PREFIX.to_string(),
            rotation: RotationStrategy::Daily,
            show_target: true,
            show_file_line: false,
            filter_directives: None,
            ansi_colors: true,
        }
    }
}

impl LoggerConfig {
    pub fn builder() -> LoggerConfigBuilder {
        LoggerConfigBuilder::default()
    }

    /// 从运行时配置的日志段创建
    ///
    /// 轮转策略已在配置校验时检查，无法识别时退回每天轮转。
    pub fn from_log_config(log_config: &LogConfig) -> Self {
        Self {
            level: log_config.level.clone(),
            json_format: log_config.json_format,
            file_output: if log_config.file_output {
                Some(
                    log_config
                        .log_dir
                        .clone()
                        .unwrap_or_else(|| PathBuf::from("./logs")),
                )
            } else {
                None
            },
            rotation: log_config.rotation.parse().unwrap_or_default(),
            ..Default::default()
        }
    }

    fn env_filter(&self) -> EnvFilter {
        let mut filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));
        if let Some(directives) = &self.filter_directives {
            for directive in directives.split(',').map(str::trim).filter(|d| !d.is_empty()) {
                match directive.parse() {
                    Ok(directive) => filter = filter.add_directive(directive),
                    Err(e) => eprintln!("忽略无效的日志过滤指令 '{}': {}", directive, e),
                }
            }
        }
        filter
    }
}

/// 日志配置构建器
#[derive(Debug, Default)]
pub struct LoggerConfigBuilder {
    config: LoggerConfig,
}

impl LoggerConfigBuilder {
    pub fn level(mut self, level: impl Into<String>) -> Self {
        self.config.level = level.into();
        self
    }

    pub fn json_format(mut self, enable: bool) -> Self {
        self.config.json_format = enable;
        self
    }

    pub fn console_output(mut self, enable: bool) -> Self {
        self.config.console_output = enable;
        self
    }

    pub fn file_output(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.file_output = Some(dir.into());
        self
    }

    pub fn file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.file_prefix = prefix.into();
        self
    }

    pub fn rotation(mut self, strategy: RotationStrategy) -> Self {
        self.config.rotation = strategy;
        self
    }

    pub fn show_file_line(mut self, enable: bool) -> Self {
        self.config.show_file_line = enable;
        self
    }

    pub fn filter_directives(mut self, directives: impl Into<String>) -> Self {
        self.config.filter_directives = Some(directives.into());
        self
    }

    pub fn ansi_colors(mut self, enable: bool) -> Self {
        self.config.ansi_colors = enable;
        self
    }

    pub fn build(self) -> LoggerConfig {
        self.config
    }
}

/// 日志守卫
///
/// 持有非阻塞写入器的 WorkerGuard；丢弃时刷新挂起的日志。
#[derive(Default)]
pub struct LogGuard {
    _guards: Vec<WorkerGuard>,
}

impl LogGuard {
    /// 是否持有写入器（重复初始化时返回的守卫为空）
    pub fn is_active(&self) -> bool {
        !self._guards.is_empty()
    }
}

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// 日志系统
pub struct Logger;

impl Logger {
    /// 初始化全局日志订阅者
    ///
    /// 返回的守卫必须保持到程序退出。重复初始化返回 [`CoreError::InitFailed`]。
    pub fn init(config: LoggerConfig) -> Result<LogGuard> {
        if LOGGER_INITIALIZED.get().is_some() {
            return Err(CoreError::InitFailed("日志系统已初始化".to_string()));
        }

        let mut guards = Vec::new();
        let mut layers: Vec<BoxedLayer> = Vec::new();

        if config.console_output {
            let (writer, guard) = tracing_appender::non_blocking(io::stdout());
            guards.push(guard);
            layers.push(Self::layer(&config, writer, config.ansi_colors));
        }

        if let Some(dir) = &config.file_output {
            let appender = RollingFileAppender::new(
                config.rotation.to_rotation(),
                dir,
                format!("{}.log", config.file_prefix),
            );
            let (writer, guard) = tracing_appender::non_blocking(appender);
            guards.push(guard);
            layers.push(Self::layer(&config, writer, false));
        }

        tracing_subscriber::registry()
            .with(layers)
            .with(config.env_filter())
            .try_init()
            .map_err(|e| CoreError::InitFailed(format!("日志系统初始化失败: {}", e)))?;

        let _ = LOGGER_INITIALIZED.set(());
        Ok(LogGuard { _guards: guards })
    }

    /// 初始化日志系统，已初始化时返回空守卫
    pub fn try_init(config: LoggerConfig) -> LogGuard {
        Self::init(config).unwrap_or_default()
    }

    fn layer(
        config: &LoggerConfig,
        writer: tracing_appender::non_blocking::NonBlocking,
        ansi: bool,
    ) -> BoxedLayer {
        let layer = fmt::layer()
            .with_writer(writer)
            .with_target(config.show_target)
            .with_file(config.show_file_line)
            .with_line_number(config.show_file_line);
        if config.json_format {
            layer.json().with_ansi(false).boxed()
        } else {
            layer.with_ansi(ansi).boxed()
        }
    }
}

/// 标准日志字段名称
pub mod fields {
    pub const BUNDLE_ID: &str = "bundle_id";
    pub const REVISION: &str = "revision";
    pub const LOCATION: &str = "location";
    pub const SYMBOLIC_NAME: &str = "symbolic_name";
    pub const PACKAGE: &str = "package";
    pub const OPERATION: &str = "operation";
    pub const STATE: &str = "state";
    pub const ERROR: &str = "error";
}
