//! 薯片模块运行时错误类型定义
//!
//! 本模块定义了运行时中使用的所有错误类型。错误按来源分为四类：
//! 声明错误、解析失败、激活失败与状态变更竞争。

use thiserror::Error;

use crate::bundle::resolver::FailureReason;
use crate::bundle::state::{BundleId, PendingOperation};

/// 运行时核心错误类型
#[derive(Error, Debug)]
pub enum CoreError {
    // ==================== 声明错误 ====================

    /// 模块包清单无效（格式错误、重复声明等）
    #[error("模块包清单无效: {0}")]
    InvalidManifest(String),

    /// 版本号或版本范围格式无效
    #[error("版本格式无效: '{value}' - {reason}")]
    InvalidVersion {
        value: String,
        reason: String,
    },

    // ==================== 解析失败 ====================

    /// 模块包解析失败
    #[error("模块包 {bundle} 解析失败: {reason}")]
    ResolutionFailed {
        bundle: BundleId,
        reason: FailureReason,
    },

    // ==================== 激活失败 ====================

    /// 激活器执行失败（启动或停止）
    #[error("模块包 {bundle} 激活器执行失败: {reason}")]
    ActivationFailed {
        bundle: BundleId,
        reason: String,
    },

    /// 片段模块包不能被启动
    #[error("片段模块包 {0} 不能被启动")]
    FragmentNotStartable(BundleId),

    // ==================== 状态变更竞争 ====================

    /// 另一个状态变更正在进行中
    #[error("模块包 {bundle} 正在进行状态变更 ({operation:?})，等待超时")]
    StateChangeInProgress {
        bundle: BundleId,
        operation: PendingOperation,
    },

    // ==================== 模块包管理错误 ====================

    /// 模块包未找到
    #[error("模块包未找到: {0}")]
    BundleNotFound(BundleId),

    /// 模块包已卸载
    #[error("模块包已卸载: {0}")]
    BundleUninstalled(BundleId),

    /// 当前状态不允许该操作
    #[error("模块包 {bundle} 当前状态不允许执行 {operation}: {reason}")]
    InvalidState {
        bundle: BundleId,
        operation: String,
        reason: String,
    },

    /// 修订版本未找到
    #[error("修订版本未找到: {0}")]
    RevisionNotFound(String),

    /// 权限被拒绝
    #[error("权限被拒绝: {0}")]
    PermissionDenied(String),

    /// 存储层错误
    #[error("存储错误: {0}")]
    Storage(String),

    // ==================== 配置错误 ====================

    /// 配置加载失败
    #[error("配置加载失败: {0}")]
    ConfigLoadFailed(String),

    /// 配置值无效
    #[error("配置值无效: '{key}' - {reason}")]
    InvalidConfigValue {
        key: String,
        reason: String,
    },

    // ==================== IO 和序列化错误 ====================

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// JSON 序列化/反序列化错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML 序列化/反序列化错误
    #[error("YAML 错误: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// 版本解析错误
    #[error("版本解析错误: {0}")]
    VersionParse(#[from] semver::Error),

    // ==================== 通用错误 ====================

    /// 内部错误
    #[error("内部错误: {0}")]
    Internal(String),

    /// 初始化失败
    #[error("初始化失败: {0}")]
    InitFailed(String),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// 运行时操作结果类型别名
pub type Result<T> = std::result::Result<T, CoreError>;

/// 错误码常量
pub mod error_code {
    // 声明错误 (DECL-xxx)
    pub const DECLARATION_INVALID: &str = "DECL-001";
    pub const DECLARATION_VERSION: &str = "DECL-002";

    // 解析错误 (RESOLVE-xxx)
    pub const RESOLVE_FAILED: &str = "RESOLVE-001";
    pub const RESOLVE_REJECTED: &str = "RESOLVE-002";

    // 激活错误 (ACTIVATE-xxx)
    pub const ACTIVATION_FAILED: &str = "ACTIVATE-001";
    pub const ACTIVATION_FRAGMENT: &str = "ACTIVATE-002";

    // 生命周期错误 (BUNDLE-xxx)
    pub const BUNDLE_NOT_FOUND: &str = "BUNDLE-001";
    pub const BUNDLE_UNINSTALLED: &str = "BUNDLE-002";
    pub const BUNDLE_INVALID_STATE: &str = "BUNDLE-003";
    pub const BUNDLE_STATE_CHANGE: &str = "BUNDLE-004";

    // 权限错误 (PERMISSION-xxx)
    pub const PERMISSION_DENIED: &str = "PERMISSION-001";

    // 存储错误 (STORAGE-xxx)
    pub const STORAGE_FAILED: &str = "STORAGE-001";

    // 配置错误 (CONFIG-xxx)
    pub const CONFIG_LOAD_FAILED: &str = "CONFIG-001";
    pub const CONFIG_INVALID_VALUE: &str = "CONFIG-002";
}

impl CoreError {
    /// 获取错误码
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::InvalidManifest(_) => error_code::DECLARATION_INVALID,
            CoreError::InvalidVersion { .. } | CoreError::VersionParse(_) => {
                error_code::DECLARATION_VERSION
            }
            CoreError::ResolutionFailed { reason, .. } if reason.is_policy_rejection() => {
                error_code::RESOLVE_REJECTED
            }
            CoreError::ResolutionFailed { .. } => error_code::RESOLVE_FAILED,
            CoreError::ActivationFailed { .. } => error_code::ACTIVATION_FAILED,
            CoreError::FragmentNotStartable(_) => error_code::ACTIVATION_FRAGMENT,
            CoreError::BundleNotFound(_) => error_code::BUNDLE_NOT_FOUND,
            CoreError::BundleUninstalled(_) => error_code::BUNDLE_UNINSTALLED,
            CoreError::InvalidState { .. } => error_code::BUNDLE_INVALID_STATE,
            CoreError::StateChangeInProgress { .. } => error_code::BUNDLE_STATE_CHANGE,
            CoreError::PermissionDenied(_) => error_code::PERMISSION_DENIED,
            CoreError::Storage(_) => error_code::STORAGE_FAILED,
            CoreError::ConfigLoadFailed(_) => error_code::CONFIG_LOAD_FAILED,
            CoreError::InvalidConfigValue { .. } => error_code::CONFIG_INVALID_VALUE,
            _ => "UNKNOWN",
        }
    }

    /// 是否为可重试的错误
    ///
    /// 状态变更竞争总是可以安全重试；解析失败在环境变化后也可重试。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::StateChangeInProgress { .. } | CoreError::ResolutionFailed { .. }
        )
    }
}
