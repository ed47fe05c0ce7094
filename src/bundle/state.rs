//! 模块包身份与生命周期状态

use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::manifest::BundleManifest;
use super::resolver::FailureReason;
use super::revision::RevisionId;

/// 模块包标识，安装时分配，终身不变
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BundleId(pub u64);

/// 系统模块包标识
pub const SYSTEM_BUNDLE_ID: BundleId = BundleId(0);

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 模块包状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BundleState {
    /// 已安装，尚未解析
    Installed,
    /// 已解析，可以启动
    Resolved,
    /// 正在启动（激活器运行中）
    Starting,
    /// 运行中
    Active,
    /// 正在停止
    Stopping,
    /// 已卸载（终态）
    Uninstalled,
}

impl BundleState {
    /// 是否处于已解析之后的状态
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            BundleState::Resolved | BundleState::Starting | BundleState::Active | BundleState::Stopping
        )
    }

    /// 是否可以启动
    pub fn can_start(&self) -> bool {
        matches!(self, BundleState::Installed | BundleState::Resolved)
    }
}

impl fmt::Display for BundleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BundleState::Installed => "INSTALLED",
            BundleState::Resolved => "RESOLVED",
            BundleState::Starting => "STARTING",
            BundleState::Active => "ACTIVE",
            BundleState::Stopping => "STOPPING",
            BundleState::Uninstalled => "UNINSTALLED",
        };
        f.write_str(name)
    }
}

/// 进行中的操作，非 `None` 时表示某个状态变更独占该模块包
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PendingOperation {
    #[default]
    None,
    Activating,
    Deactivating,
    Resolving,
    Uninstalling,
    Unresolving,
    Updating,
}

impl PendingOperation {
    /// 进行中的激活或停用可以被协作式中止
    pub fn is_abortable(&self) -> bool {
        matches!(self, PendingOperation::Activating | PendingOperation::Deactivating)
    }
}

/// 模块包
///
/// 稳定身份（id、位置）加上有序的修订版本列表：下标 0 为当前修订版本，
/// 之后是仍被使用的僵尸修订版本。
#[derive(Debug, Clone)]
pub struct Bundle {
    pub id: BundleId,
    pub location: String,
    pub state: BundleState,
    pub pending: PendingOperation,
    pub revisions: Vec<RevisionId>,
    /// 最近一次解析失败的原因，下一次显式解析前一直保留
    pub failure: Option<FailureReason>,
    /// 进行中激活/停用的中止标志
    pub abort: Option<Arc<AtomicBool>>,
    /// 最近一次的清单（卸载后仍保留）
    pub last_headers: BundleManifest,
    pub installed_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl Bundle {
    pub fn new(id: BundleId, location: impl Into<String>, revision: RevisionId, headers: BundleManifest) -> Self {
        let now = Utc::now();
        Self {
            id,
            location: location.into(),
            state: BundleState::Installed,
            pending: PendingOperation::None,
            revisions: vec![revision],
            failure: None,
            abort: None,
            last_headers: headers,
            installed_at: now,
            last_modified: now,
        }
    }

    /// 当前修订版本；已卸载的模块包没有当前修订版本
    pub fn current_revision(&self) -> Option<RevisionId> {
        if self.state == BundleState::Uninstalled {
            return None;
        }
        self.revisions.first().copied()
    }

    /// 除当前修订版本以外仍保留的修订版本
    pub fn zombie_revisions(&self) -> &[RevisionId] {
        if self.state == BundleState::Uninstalled {
            &self.revisions
        } else if self.revisions.len() > 1 {
            &self.revisions[1..]
        } else {
            &[]
        }
    }

    /// 设置状态并刷新修改时间
    pub fn set_state(&mut self, state: BundleState) {
        self.state = state;
        self.last_modified = Utc::now();
    }

    /// 生成对外快照
    pub fn info(&self) -> BundleInfo {
        BundleInfo {
            id: self.id,
            location: self.location.clone(),
            symbolic_name: self.last_headers.symbolic_name.clone(),
            version: self.last_headers.version.clone(),
            state: self.state,
            revisions: self.revisions.clone(),
            failure: self.failure.as_ref().map(|f| f.to_string()),
            last_modified: self.last_modified,
        }
    }
}

/// 模块包对外快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleInfo {
    pub id: BundleId,
    pub location: String,
    pub symbolic_name: String,
    pub version: String,
    pub state: BundleState,
    pub revisions: Vec<RevisionId>,
    pub failure: Option<String>,
    pub last_modified: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(BundleState::Installed.can_start());
        assert!(BundleState::Resolved.can_start());
        assert!(!BundleState::Active.can_start());
        assert!(BundleState::Active.is_resolved());
        assert!(!BundleState::Installed.is_resolved());
        assert!(!BundleState::Uninstalled.is_resolved());
    }

    #[test]
    fn test_zombie_revisions() {
        let current = RevisionId::new(BundleId(4), 1);
        let old = RevisionId::new(BundleId(4), 0);
        let mut bundle = Bundle::new(BundleId(4), "mem:a", current, BundleManifest::new("a", "1.0"));
        bundle.revisions.push(old);

        assert_eq!(bundle.current_revision(), Some(current));
        assert_eq!(bundle.zombie_revisions(), &[old]);

        bundle.set_state(BundleState::Uninstalled);
        assert_eq!(bundle.current_revision(), None);
        assert_eq!(bundle.zombie_revisions().len(), 2);
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&BundleState::Active).unwrap();
        assert_eq!(json, "\"ACTIVE\"");
    }
}
