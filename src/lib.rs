//! # Chips Runtime - 薯片动态模块运行时
//!
//! 薯片生态的模块包运行时，提供以下核心功能：
//!
//! - **包依赖解析**: 按版本范围与属性把导入连线到导出，支持模块包依赖、片段与动态导入
//! - **生命周期管理**: 安装、解析、启动、停止、更新、卸载与刷新
//! - **并发控制**: 单一生命周期锁加每个模块包的进行中操作，有界等待
//! - **激活器线程池**: 激活器在锁外运行，支持超时与中止
//! - **生命周期事件**: 同步监听器与广播订阅
//!
//! ## 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chips_runtime::{BundleManifest, Framework, MemoryStore, RuntimeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = MemoryStore::new();
//!     store
//!         .stage("mem:greeter", BundleManifest::new("greeter", "1.0").export("greeter.api", "1.0"))
//!         .await;
//!
//!     let framework = Framework::builder(RuntimeConfig::default())
//!         .store(Arc::new(store))
//!         .build()?;
//!
//!     let id = framework.install("mem:greeter").await?;
//!     framework.start(id).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## 模块结构
//!
//! - `bundle` - 版本、清单、包表、修订版本与解析器
//! - `framework` - 生命周期操作、锁、线程池、事件与存储
//! - `core` - 运行时配置
//! - `utils` - 错误类型与日志

#![warn(rustdoc::missing_crate_level_docs)]

pub mod bundle;
pub mod core;
pub mod framework;
pub mod utils;

// 重导出常用类型，方便使用
pub use bundle::{
    Bundle, BundleId, BundleInfo, BundleManifest, BundleRevision, BundleState, FailureReason,
    ManifestParser, PackageSource, PackageTable, PendingOperation, ResolutionReport, Resolver,
    ResolverHook, RevisionId, VersionRange, SYSTEM_BUNDLE_ID,
};

pub use framework::{
    ArchiveStore, BundleActivator, BundleContext, BundleEvent, BundleEventKind, DirectoryStore,
    EventCallback, Framework, FrameworkBuilder, LifecycleAction, ListenerId, MemoryStore,
    PermissionGate, ServiceRegistry, WiringInfo,
};

pub use utils::{error_code, CoreError, Result};
pub use utils::logger::{fields, LogGuard, Logger, LoggerConfig, LoggerConfigBuilder, RotationStrategy};

pub use core::config::{
    BundlesConfig, LifecycleConfig, LogConfig, ResolverConfig, RuntimeConfig, RuntimeConfigBuilder,
    SystemPackage,
};

/// 库版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
