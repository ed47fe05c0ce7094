//! 运行时配置
//!
//! 定义运行时的配置结构和加载逻辑。

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::utils::{CoreError, Result};

/// 生命周期配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// 普通状态变更的等待上限（毫秒）
    #[serde(default = "default_state_change_timeout_ms")]
    pub state_change_timeout_ms: u64,

    /// 卸载的等待上限（毫秒）
    #[serde(default = "default_uninstall_timeout_ms")]
    pub uninstall_timeout_ms: u64,

    /// 激活器执行超时（毫秒），0 表示不限
    #[serde(default)]
    pub activation_timeout_ms: u64,

    /// 模块包线程池大小
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
}

fn default_state_change_timeout_ms() -> u64 {
    5000
}

fn default_uninstall_timeout_ms() -> u64 {
    30000
}

fn default_worker_count() -> usize {
    4
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            state_change_timeout_ms: default_state_change_timeout_ms(),
            uninstall_timeout_ms: default_uninstall_timeout_ms(),
            activation_timeout_ms: 0,
            worker_count: default_worker_count(),
        }
    }
}

impl LifecycleConfig {
    pub fn state_change_timeout(&self) -> Duration {
        Duration::from_millis(self.state_change_timeout_ms)
    }

    pub fn uninstall_timeout(&self) -> Duration {
        Duration::from_millis(self.uninstall_timeout_ms)
    }

    /// 激活器超时，未配置时为 `None`
    pub fn activation_timeout(&self) -> Option<Duration> {
        (self.activation_timeout_ms > 0).then(|| Duration::from_millis(self.activation_timeout_ms))
    }
}

/// 系统模块包导出的包
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemPackage {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// 解析器配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// 支持的执行环境
    #[serde(default)]
    pub execution_environments: Vec<String>,

    /// 系统模块包导出的包
    #[serde(default)]
    pub system_packages: Vec<SystemPackage>,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: String,

    /// 是否输出到文件
    #[serde(default)]
    pub file_output: bool,

    /// 日志文件目录
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// 是否输出 JSON 格式
    #[serde(default)]
    pub json_format: bool,

    /// 日志轮转策略
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_output: false,
            log_dir: None,
            json_format: false,
            rotation: default_rotation(),
        }
    }
}

/// 模块包配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BundlesConfig {
    /// 扫描 bundle.yaml 的目录
    #[serde(default)]
    pub bundle_dirs: Vec<PathBuf>,

    /// 安装后自动启动的模块包（符号名）
    #[serde(default)]
    pub auto_start: Vec<String>,
}

/// 运行时配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// 配置文件路径
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    #[serde(default)]
    pub resolver: ResolverConfig,

    #[serde(default)]
    pub logging: LogConfig,

    #[serde(default)]
    pub bundles: BundlesConfig,

    /// 数据目录
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl RuntimeConfig {
    /// 创建配置构建器
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// 从文件加载配置，按扩展名选择 JSON 或 YAML
    pub async fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| CoreError::ConfigLoadFailed(format!("{}: {}", path.display(), e)))?;

        let mut config: RuntimeConfig = if path.extension().map(|e| e == "json").unwrap_or(false) {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };

        config.config_path = Some(path);
        config.validate()?;
        Ok(config)
    }

    /// 校验配置取值
    pub fn validate(&self) -> Result<()> {
        if self.lifecycle.worker_count == 0 {
            return Err(CoreError::InvalidConfigValue {
                key: "lifecycle.worker_count".to_string(),
                reason: "必须大于 0".to_string(),
            });
        }
        if self.lifecycle.state_change_timeout_ms == 0 {
            return Err(CoreError::InvalidConfigValue {
                key: "lifecycle.state_change_timeout_ms".to_string(),
                reason: "必须大于 0".to_string(),
            });
        }
        if self.lifecycle.uninstall_timeout_ms < self.lifecycle.state_change_timeout_ms {
            return Err(CoreError::InvalidConfigValue {
                key: "lifecycle.uninstall_timeout_ms".to_string(),
                reason: "不能小于 state_change_timeout_ms".to_string(),
            });
        }
        if !matches!(self.logging.rotation.as_str(), "minutely" | "hourly" | "daily" | "never") {
            return Err(CoreError::InvalidConfigValue {
                key: "logging.rotation".to_string(),
                reason: format!("未知的轮转策略 '{}'", self.logging.rotation),
            });
        }
        Ok(())
    }

    /// 合并另一个配置（用于覆盖）
    pub fn merge(&mut self, other: RuntimeConfig) {
        // 只覆盖非默认值的配置
        if other.lifecycle.state_change_timeout_ms != default_state_change_timeout_ms() {
            self.lifecycle.state_change_timeout_ms = other.lifecycle.state_change_timeout_ms;
        }
        if other.lifecycle.uninstall_timeout_ms != default_uninstall_timeout_ms() {
            self.lifecycle.uninstall_timeout_ms = other.lifecycle.uninstall_timeout_ms;
        }
        if other.lifecycle.activation_timeout_ms != 0 {
            self.lifecycle.activation_timeout_ms = other.lifecycle.activation_timeout_ms;
        }
        if other.lifecycle.worker_count != default_worker_count() {
            self.lifecycle.worker_count = other.lifecycle.worker_count;
        }
        if other.logging.level != default_log_level() {
            self.logging.level = other.logging.level;
        }
        if other.logging.file_output {
            self.logging.file_output = true;
            self.logging.log_dir = other.logging.log_dir;
        }
        if other.logging.json_format {
            self.logging.json_format = true;
        }
        self.resolver
            .execution_environments
            .extend(other.resolver.execution_environments);
        self.resolver.system_packages.extend(other.resolver.system_packages);
        self.bundles.bundle_dirs.extend(other.bundles.bundle_dirs);
        self.bundles.auto_start.extend(other.bundles.auto_start);
        if other.data_dir.is_some() {
            self.data_dir = other.data_dir;
        }
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// 创建新的构建器
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
        }
    }

    /// 设置配置文件路径
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.config_path = Some(path.into());
        self
    }

    /// 设置状态变更等待上限
    pub fn state_change_timeout_ms(mut self, ms: u64) -> Self {
        self.config.lifecycle.state_change_timeout_ms = ms;
        self
    }

    /// 设置卸载等待上限
    pub fn uninstall_timeout_ms(mut self, ms: u64) -> Self {
        self.config.lifecycle.uninstall_timeout_ms = ms;
        self
    }

    /// 设置激活器超时
    pub fn activation_timeout_ms(mut self, ms: u64) -> Self {
        self.config.lifecycle.activation_timeout_ms = ms;
        self
    }

    /// 设置模块包线程池大小
    pub fn worker_count(mut self, count: usize) -> Self {
        self.config.lifecycle.worker_count = count;
        self
    }

    /// 添加支持的执行环境
    pub fn execution_environment(mut self, env: impl Into<String>) -> Self {
        self.config.resolver.execution_environments.push(env.into());
        self
    }

    /// 添加系统模块包导出的包
    pub fn system_package(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.config.resolver.system_packages.push(SystemPackage {
            name: name.into(),
            version: version.into(),
        });
        self
    }

    /// 设置日志级别
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// 启用文件日志
    pub fn file_logging(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.config.logging.file_output = true;
        self.config.logging.log_dir = Some(log_dir.into());
        self
    }

    /// 启用 JSON 格式日志
    pub fn json_logging(mut self) -> Self {
        self.config.logging.json_format = true;
        self
    }

    /// 添加模块包目录
    pub fn bundle_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.bundles.bundle_dirs.push(dir.into());
        self
    }

    /// 添加自动启动的模块包
    pub fn auto_start(mut self, symbolic_name: impl Into<String>) -> Self {
        self.config.bundles.auto_start.push(symbolic_name.into());
        self
    }

    /// 设置数据目录
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = Some(dir.into());
        self
    }

    /// 构建配置
    pub fn build(self) -> RuntimeConfig {
        self.config
    }
}
