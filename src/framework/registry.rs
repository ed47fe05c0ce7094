//! 框架状态
//!
//! 生命周期锁保护的全部结构性数据：模块包、修订版本、包表与位置索引，
//! 以及尚未分发的事件队列。

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use super::events::{BundleEvent, BundleEventKind};
use crate::bundle::{
    dependents_of, Bundle, BundleDeclaration, BundleId, BundleManifest, BundleRevision,
    BundleState, FailureReason, ManifestParser, PackageTable, ReleaseOutcome, ResolutionReport,
    Resolver, ResolverHook, RevisionId, RevisionKind, SYSTEM_BUNDLE_ID,
    SYSTEM_BUNDLE_SYMBOLIC_NAME,
};
use crate::core::ResolverConfig;
use crate::utils::{CoreError, Result};

/// 系统模块包的位置
pub const SYSTEM_BUNDLE_LOCATION: &str = "System Bundle";

/// 框架状态
#[derive(Debug)]
pub struct FrameworkState {
    pub(crate) bundles: BTreeMap<BundleId, Bundle>,
    pub(crate) revisions: BTreeMap<RevisionId, BundleRevision>,
    pub(crate) packages: PackageTable,
    /// 位置 -> 模块包，卸载时立即移除
    pub(crate) locations: HashMap<String, BundleId>,
    environments: Vec<String>,
    next_bundle_id: u64,
    next_sequence: u64,
    events: Vec<BundleEvent>,
}

impl FrameworkState {
    /// 创建框架状态，系统模块包以 ACTIVE 状态存在
    pub fn new(config: &ResolverConfig) -> Result<Self> {
        let mut manifest = BundleManifest::new(SYSTEM_BUNDLE_SYMBOLIC_NAME, crate::VERSION);
        for package in &config.system_packages {
            let version = if package.version.is_empty() {
                "0.0.0"
            } else {
                package.version.as_str()
            };
            manifest = manifest.export(package.name.clone(), version);
        }
        let declaration = ManifestParser::declare(&manifest)
            .map_err(|e| CoreError::InitFailed(format!("系统模块包声明无效: {}", e)))?;

        let mut state = Self {
            bundles: BTreeMap::new(),
            revisions: BTreeMap::new(),
            packages: PackageTable::new(),
            locations: HashMap::new(),
            environments: config.execution_environments.clone(),
            next_bundle_id: SYSTEM_BUNDLE_ID.0 + 1,
            next_sequence: 0,
            events: Vec::new(),
        };

        let revision_id = RevisionId::new(SYSTEM_BUNDLE_ID, 0);
        let mut revision = BundleRevision::install(revision_id, Arc::new(declaration), &mut state.packages);
        revision
            .wiring
            .mark_resolved(BTreeMap::new(), Vec::new(), BTreeMap::new());
        state.revisions.insert(revision_id, revision);

        let mut bundle = Bundle::new(SYSTEM_BUNDLE_ID, SYSTEM_BUNDLE_LOCATION, revision_id, manifest);
        bundle.set_state(BundleState::Active);
        state.bundles.insert(SYSTEM_BUNDLE_ID, bundle);
        state
            .locations
            .insert(SYSTEM_BUNDLE_LOCATION.to_string(), SYSTEM_BUNDLE_ID);

        info!(
            exports = config.system_packages.len(),
            "系统模块包已就绪"
        );
        Ok(state)
    }

    /// 在本状态上构造解析器
    pub fn resolver(&mut self) -> Resolver<'_> {
        Resolver::new(
            &self.bundles,
            &mut self.revisions,
            &mut self.packages,
            &self.environments,
        )
    }

    pub fn bundle(&self, id: BundleId) -> Result<&Bundle> {
        self.bundles.get(&id).ok_or(CoreError::BundleNotFound(id))
    }

    pub fn bundle_mut(&mut self, id: BundleId) -> Result<&mut Bundle> {
        self.bundles.get_mut(&id).ok_or(CoreError::BundleNotFound(id))
    }

    pub fn bundle_ids(&self) -> Vec<BundleId> {
        self.bundles.keys().copied().collect()
    }

    pub fn revision(&self, id: RevisionId) -> Option<&BundleRevision> {
        self.revisions.get(&id)
    }

    pub fn packages(&self) -> &PackageTable {
        &self.packages
    }

    pub fn location_of(&self, location: &str) -> Option<BundleId> {
        self.locations.get(location).copied()
    }

    /// 刷新闭包：从根模块包出发，沿包连线、模块包依赖与片段附着传递到全部依赖方
    ///
    /// 未指定根时取所有持有僵尸修订版本的模块包以及所有已卸载的模块包。
    /// 系统模块包不参与刷新。
    pub fn refresh_closure(&self, roots: Option<&[BundleId]>) -> Result<Vec<BundleId>> {
        let mut pending: Vec<BundleId> = match roots {
            Some(roots) => {
                for id in roots {
                    self.bundle(*id)?;
                }
                roots.to_vec()
            }
            None => self
                .bundles
                .values()
                .filter(|bundle| {
                    bundle.state == BundleState::Uninstalled || !bundle.zombie_revisions().is_empty()
                })
                .map(|bundle| bundle.id)
                .collect(),
        };

        let mut closure = BTreeSet::new();
        while let Some(id) = pending.pop() {
            if id == SYSTEM_BUNDLE_ID || !closure.insert(id) {
                continue;
            }
            let Some(bundle) = self.bundles.get(&id) else {
                continue;
            };
            for revision in &bundle.revisions {
                for dependent in dependents_of(&self.revisions, &self.packages, *revision) {
                    if !closure.contains(&dependent.bundle) {
                        pending.push(dependent.bundle);
                    }
                }
            }
        }
        Ok(closure.into_iter().collect())
    }

    /// 当前修订版本是否为片段
    pub fn is_fragment(&self, id: BundleId) -> bool {
        self.bundles
            .get(&id)
            .and_then(Bundle::current_revision)
            .and_then(|rev| self.revisions.get(&rev))
            .map_or(false, BundleRevision::is_fragment)
    }

    /// 安装新模块包，产生 INSTALLED 事件
    pub fn install_bundle(
        &mut self,
        location: &str,
        manifest: BundleManifest,
        declaration: BundleDeclaration,
    ) -> BundleId {
        let id = BundleId(self.next_bundle_id);
        self.next_bundle_id += 1;

        let revision_id = RevisionId::new(id, 0);
        let revision = BundleRevision::install(revision_id, Arc::new(declaration), &mut self.packages);
        self.revisions.insert(revision_id, revision);
        self.bundles
            .insert(id, Bundle::new(id, location, revision_id, manifest));
        self.locations.insert(location.to_string(), id);

        info!(bundle_id = %id, location = %location, "模块包已安装");
        self.emit(id, BundleEventKind::Installed);
        id
    }

    /// 为模块包创建新的当前修订版本，旧修订版本后移
    pub fn new_revision(
        &mut self,
        id: BundleId,
        manifest: BundleManifest,
        declaration: BundleDeclaration,
    ) -> Result<RevisionId> {
        let bundle = self.bundles.get(&id).ok_or(CoreError::BundleNotFound(id))?;
        let revision_id = bundle
            .revisions
            .iter()
            .max()
            .map_or(RevisionId::new(id, 0), RevisionId::next);
        let revision = BundleRevision::install(revision_id, Arc::new(declaration), &mut self.packages);
        self.revisions.insert(revision_id, revision);

        let bundle = self.bundle_mut(id)?;
        bundle.revisions.insert(0, revision_id);
        bundle.last_headers = manifest;
        bundle.failure = None;
        bundle.last_modified = Utc::now();
        debug!(bundle_id = %id, revision = %revision_id, "创建新修订版本");
        Ok(revision_id)
    }

    /// 排队一个事件
    pub fn emit(&mut self, id: BundleId, kind: BundleEventKind) {
        let Some(bundle) = self.bundles.get(&id) else {
            return;
        };
        self.next_sequence += 1;
        self.events.push(BundleEvent {
            kind,
            bundle: id,
            location: bundle.location.clone(),
            symbolic_name: bundle.last_headers.symbolic_name.clone(),
            timestamp: Utc::now(),
            sequence: self.next_sequence,
        });
    }

    /// 取出排队的事件
    pub fn take_events(&mut self) -> Vec<BundleEvent> {
        std::mem::take(&mut self.events)
    }

    /// 设置模块包状态并排队对应事件
    pub fn transition(&mut self, id: BundleId, state: BundleState, event: Option<BundleEventKind>) {
        if let Some(bundle) = self.bundles.get_mut(&id) {
            debug!(bundle_id = %id, from = %bundle.state, to = %state, "状态迁移");
            bundle.set_state(state);
        }
        if let Some(kind) = event {
            self.emit(id, kind);
        }
    }

    /// 解析一批修订版本并同步模块包状态
    ///
    /// 新解析的当前修订版本所属的 INSTALLED 模块包进入 RESOLVED，按解析顺序产生事件；
    /// 失败原因记录在模块包上，直到下一次显式解析。
    pub fn resolve_revisions(
        &mut self,
        targets: &[RevisionId],
        hook: Option<&dyn ResolverHook>,
    ) -> ResolutionReport {
        let report = self.resolver().resolve(targets, hook);
        self.settle_resolved(&report.resolved);

        for (revision, reason) in &report.failures {
            if let Some(bundle) = self.bundles.get_mut(&revision.bundle) {
                if bundle.current_revision() == Some(*revision) {
                    bundle.failure = Some(reason.clone());
                }
            }
        }
        report
    }

    /// 为已解析修订版本绑定一个动态导入的包，返回提供方修订版本
    ///
    /// 为此新解析的模块包与普通解析一样进入 RESOLVED。
    pub fn dynamic_import(
        &mut self,
        revision: RevisionId,
        package: &str,
        hook: Option<&dyn ResolverHook>,
    ) -> Option<RevisionId> {
        let binding = self.resolver().dynamic_import(revision, package, hook)?;
        self.settle_resolved(&binding.resolved);
        Some(binding.provider)
    }

    /// 新解析的当前修订版本所属的 INSTALLED 模块包进入 RESOLVED，按解析顺序产生事件
    fn settle_resolved(&mut self, resolved: &[RevisionId]) {
        for revision in resolved {
            let Some(bundle) = self.bundles.get_mut(&revision.bundle) else {
                continue;
            };
            if bundle.current_revision() != Some(*revision) {
                continue;
            }
            bundle.failure = None;
            if bundle.state == BundleState::Installed {
                self.transition(revision.bundle, BundleState::Resolved, Some(BundleEventKind::Resolved));
            }
        }
    }

    /// 片段失去全部宿主后回到 INSTALLED，并产生 UNRESOLVED 事件
    ///
    /// `host_gone` 为真时记录宿主不可用的失败原因。
    pub fn detach_fragments(&mut self, fragments: &[RevisionId], host_gone: bool) {
        for fragment in fragments {
            let reason = match self.revisions.get(fragment).map(BundleRevision::kind) {
                Some(RevisionKind::Fragment { host, range }) => FailureReason::FragmentHostUnavailable {
                    host: host.clone(),
                    range: range.to_string(),
                },
                Some(RevisionKind::Extension) => FailureReason::FragmentHostUnavailable {
                    host: SYSTEM_BUNDLE_SYMBOLIC_NAME.to_string(),
                    range: "0.0.0".to_string(),
                },
                _ => continue,
            };
            let Some(bundle) = self.bundles.get_mut(&fragment.bundle) else {
                continue;
            };
            if bundle.current_revision() != Some(*fragment) || !bundle.state.is_resolved() {
                continue;
            }
            if host_gone {
                bundle.failure = Some(reason);
            }
            info!(bundle_id = %fragment.bundle, "片段已失去宿主");
            self.transition(fragment.bundle, BundleState::Installed, Some(BundleEventKind::Unresolved));
        }
    }

    /// 尝试释放修订版本，导出仍在使用时保留为僵尸
    ///
    /// 释放成功返回 `true`，此时修订版本已从模块包的修订版本列表中移除，
    /// 因此失去宿主的片段回到 INSTALLED。
    pub fn release_revision(&mut self, revision: RevisionId, host_gone: bool) -> bool {
        match self.resolver().release(revision, false) {
            ReleaseOutcome::Released { detached_fragments } => {
                self.detach_fragments(&detached_fragments, host_gone);
                if let Some(bundle) = self.bundles.get_mut(&revision.bundle) {
                    bundle.revisions.retain(|rev| *rev != revision);
                }
                true
            }
            ReleaseOutcome::InUse => {
                info!(bundle_id = %revision.bundle, revision = %revision, "导出仍在使用，修订版本保留为僵尸");
                false
            }
        }
    }

    /// 解除模块包全部修订版本的解析；已解析的模块包回到 INSTALLED
    pub fn unresolve_bundle(&mut self, id: BundleId) {
        let Some(bundle) = self.bundles.get(&id) else {
            return;
        };
        let revisions = bundle.revisions.clone();
        let was_resolved = bundle.state.is_resolved();

        for revision in revisions {
            let detached = self.resolver().unresolve(revision);
            self.detach_fragments(&detached, false);
        }
        if was_resolved {
            self.transition(id, BundleState::Installed, Some(BundleEventKind::Unresolved));
        }
    }

    /// 释放模块包的全部僵尸修订版本，返回已释放的修订版本
    ///
    /// 已卸载且不再持有修订版本的模块包随之被移除。
    pub fn purge_zombies(&mut self, id: BundleId) -> Vec<RevisionId> {
        let Some(bundle) = self.bundles.get(&id) else {
            return Vec::new();
        };
        let zombies = bundle.zombie_revisions().to_vec();

        let purged: Vec<RevisionId> = zombies
            .into_iter()
            .filter(|revision| self.release_revision(*revision, false))
            .collect();

        let forgettable = self
            .bundles
            .get(&id)
            .map_or(false, |b| b.state == BundleState::Uninstalled && b.revisions.is_empty());
        if forgettable {
            self.forget(id);
        }
        purged
    }

    /// 忘记已卸载的模块包，其修订版本必须已全部释放
    pub fn forget(&mut self, id: BundleId) {
        if let Some(bundle) = self.bundles.remove(&id) {
            debug!(bundle_id = %id, location = %bundle.location, "移除已卸载模块包的记录");
        }
    }
}
