//! 外部协作方
//!
//! 权限检查、服务注册表与激活器注册表。解析钩子定义在解析器中，这里重导出。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use super::worker::BundleActivator;
use crate::bundle::BundleId;

pub use crate::bundle::ResolverHook;

/// 需要权限检查的生命周期操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleAction {
    Install,
    Resolve,
    Start,
    Stop,
    Update,
    Uninstall,
    Refresh,
}

impl fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleAction::Install => "install",
            LifecycleAction::Resolve => "resolve",
            LifecycleAction::Start => "start",
            LifecycleAction::Stop => "stop",
            LifecycleAction::Update => "update",
            LifecycleAction::Uninstall => "uninstall",
            LifecycleAction::Refresh => "refresh",
        };
        f.write_str(name)
    }
}

/// 权限检查
///
/// 每个生命周期操作开始前调用；返回 `Err` 时该操作以
/// [`CoreError::PermissionDenied`](crate::utils::CoreError::PermissionDenied) 失败。
/// 安装时模块包尚不存在，`bundle` 为 `None`。
pub trait PermissionGate: Send + Sync {
    fn check(&self, bundle: Option<BundleId>, action: LifecycleAction) -> std::result::Result<(), String>;
}

/// 服务注册表
pub trait ServiceRegistry: Send + Sync {
    /// 释放模块包注册的全部服务，返回释放的数量
    fn release_bundle(&self, bundle: BundleId) -> usize;
}

/// 激活器注册表：清单中的激活器名称 -> 激活器实现
#[derive(Clone, Default)]
pub struct ActivatorRegistry {
    activators: Arc<RwLock<HashMap<String, Arc<dyn BundleActivator>>>>,
}

impl ActivatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册激活器，同名时替换
    pub async fn register(&self, name: impl Into<String>, activator: Arc<dyn BundleActivator>) {
        let name = name.into();
        debug!(activator = %name, "注册激活器");
        self.activators.write().await.insert(name, activator);
    }

    pub async fn unregister(&self, name: &str) -> bool {
        self.activators.write().await.remove(name).is_some()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn BundleActivator>> {
        self.activators.read().await.get(name).cloned()
    }

    pub async fn len(&self) -> usize {
        self.activators.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.activators.read().await.is_empty()
    }
}
