//! 存档存储
//!
//! 运行时通过 [`ArchiveStore`] 读取模块包清单、清除修订版本的存储资源以及
//! 记录持久启动标志。提供两个实现：按位置暂存清单的 [`MemoryStore`]，
//! 以及把位置视为包含 `bundle.yaml` 的目录的 [`DirectoryStore`]。

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::bundle::{BundleId, BundleManifest, ManifestParser, RevisionId};
use crate::utils::{CoreError, Result};

/// 目录中的清单文件名
pub const MANIFEST_FILE: &str = "bundle.yaml";

/// 存档存储
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// 读取位置上的清单
    async fn read_manifest(&self, location: &str) -> Result<BundleManifest>;

    /// 清除修订版本占用的存储资源
    async fn purge(&self, revision: RevisionId) -> Result<()>;

    /// 设置持久启动标志
    async fn set_persistent_flag(&self, bundle: BundleId, started: bool) -> Result<()>;
}

/// 记录已清除的修订版本与持久标志
#[derive(Debug, Default)]
struct StoreRecords {
    purged: Vec<RevisionId>,
    persistent: HashSet<BundleId>,
}

impl StoreRecords {
    fn purge(&mut self, revision: RevisionId) {
        info!(revision = %revision, "修订版本存储已清除");
        self.purged.push(revision);
    }

    fn set_persistent(&mut self, bundle: BundleId, started: bool) {
        debug!(bundle_id = %bundle, started, "设置持久启动标志");
        if started {
            self.persistent.insert(bundle);
        } else {
            self.persistent.remove(&bundle);
        }
    }
}

/// 内存存储：每个位置保存最近一次暂存的清单
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    manifests: Arc<RwLock<HashMap<String, BundleManifest>>>,
    records: Arc<RwLock<StoreRecords>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 暂存清单，安装或更新时读取
    pub async fn stage(&self, location: impl Into<String>, manifest: BundleManifest) {
        self.manifests.write().await.insert(location.into(), manifest);
    }

    /// 已清除的修订版本，按清除顺序
    pub async fn purged(&self) -> Vec<RevisionId> {
        self.records.read().await.purged.clone()
    }

    pub async fn is_persistent(&self, bundle: BundleId) -> bool {
        self.records.read().await.persistent.contains(&bundle)
    }
}

#[async_trait]
impl ArchiveStore for MemoryStore {
    async fn read_manifest(&self, location: &str) -> Result<BundleManifest> {
        self.manifests
            .read()
            .await
            .get(location)
            .cloned()
            .ok_or_else(|| CoreError::Storage(format!("位置 '{}' 没有暂存的清单", location)))
    }

    async fn purge(&self, revision: RevisionId) -> Result<()> {
        self.records.write().await.purge(revision);
        Ok(())
    }

    async fn set_persistent_flag(&self, bundle: BundleId, started: bool) -> Result<()> {
        self.records.write().await.set_persistent(bundle, started);
        Ok(())
    }
}

/// 目录存储：位置是包含 `bundle.yaml` 的目录
#[derive(Debug, Clone, Default)]
pub struct DirectoryStore {
    records: Arc<RwLock<StoreRecords>>,
}

impl DirectoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 扫描目录，返回所有包含清单文件的子目录（排序后）
    ///
    /// 不存在的目录会被跳过并记录警告。
    pub async fn scan(dirs: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        for dir in dirs {
            if !dir.exists() {
                warn!(dir = %dir.display(), "模块包目录不存在");
                continue;
            }
            let mut entries = tokio::fs::read_dir(dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.is_dir() && path.join(MANIFEST_FILE).is_file() {
                    found.push(path);
                }
            }
        }
        found.sort();
        debug!(count = found.len(), "扫描到模块包目录");
        Ok(found)
    }

    pub async fn purged(&self) -> Vec<RevisionId> {
        self.records.read().await.purged.clone()
    }

    pub async fn is_persistent(&self, bundle: BundleId) -> bool {
        self.records.read().await.persistent.contains(&bundle)
    }
}

#[async_trait]
impl ArchiveStore for DirectoryStore {
    async fn read_manifest(&self, location: &str) -> Result<BundleManifest> {
        let path = Path::new(location).join(MANIFEST_FILE);
        ManifestParser::parse_file(&path).await.map_err(|e| match e {
            CoreError::Io(io) => CoreError::Storage(format!("{}: {}", path.display(), io)),
            other => other,
        })
    }

    async fn purge(&self, revision: RevisionId) -> Result<()> {
        self.records.write().await.purge(revision);
        Ok(())
    }

    async fn set_persistent_flag(&self, bundle: BundleId, started: bool) -> Result<()> {
        self.records.write().await.set_persistent(bundle, started);
        Ok(())
    }
}
