//! 包依赖解析器
//!
//! 根据修订版本声明的模块包依赖与导入，从包表中为其选出一组一致的提供方。
//!
//! 每个目标修订版本在独立的会话中规划。规划阶段只读：沿提供方递归规划
//! 尚未解析的修订版本（允许环），候选的所属修订版本无法解析时跳过该候选。
//! 规划成功后一次性提交全部新解析的修订版本；失败时包表与连线保持原样。

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::package::{
    ExportedPackage, ImportedPackage, PackageId, PackageRequirement, RequireBundle,
    RequireDeclaration, Resolution, Visibility,
};
use super::package_table::PackageTable;
use super::parser::SYSTEM_BUNDLE_SYMBOLIC_NAME;
use super::revision::{BundleRevision, RevisionId, RevisionKind};
use super::state::{Bundle, BundleId};
use super::version::VersionRange;

/// 解析失败原因
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    /// 没有满足导入的提供方
    #[error("没有满足 {package}@{range} 的提供方")]
    NoProvider { package: String, range: String },

    /// 没有满足依赖的模块包
    #[error("缺少依赖模块包 {symbolic_name}@{range}")]
    MissingRequiredBundle { symbolic_name: String, range: String },

    /// 运行时不支持所需的执行环境
    #[error("不支持所需的执行环境: {required}")]
    ExecutionEnvironment { required: String },

    /// 片段没有可附着的宿主
    #[error("片段宿主 {host}@{range} 不可用")]
    FragmentHostUnavailable { host: String, range: String },

    /// 片段的声明与已解析宿主不兼容
    #[error("片段的 {package} 与宿主 {host} 的声明不兼容")]
    FragmentImportConflict { package: String, host: String },

    /// 候选提供方存在，但其所属修订版本无法解析
    #[error("提供 {package} 的修订版本 {revision} 无法解析: {reason}")]
    DependencyFailed {
        package: String,
        revision: String,
        reason: String,
    },

    /// 修订版本已被取代或所属模块包已卸载
    #[error("修订版本 {revision} 已不可解析")]
    Unavailable { revision: String },

    /// 被解析钩子否决
    #[error("被解析策略拒绝")]
    RejectedByPolicy,
}

impl FailureReason {
    /// 是否为策略否决（区别于普通的找不到提供方）
    pub fn is_policy_rejection(&self) -> bool {
        matches!(self, FailureReason::RejectedByPolicy)
    }
}

/// 解析钩子
///
/// 在一批解析开始与结束时被调用，均在生命周期锁内同步执行。
pub trait ResolverHook: Send + Sync {
    /// 开始一批解析，返回 `Err` 否决整批
    fn begin(&self, triggers: &[RevisionId]) -> std::result::Result<(), String> {
        let _ = triggers;
        Ok(())
    }

    /// 是否允许解析该修订版本
    fn filter_resolvable(&self, revision: &BundleRevision) -> bool {
        let _ = revision;
        true
    }

    /// 一批解析结束
    fn end(&self, report: &ResolutionReport) {
        let _ = report;
    }
}

/// `uses` 约束冲突，仅记录不拒绝
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsesViolation {
    pub revision: RevisionId,
    pub package: String,
    pub used: String,
}

/// 一批解析的结果
#[derive(Debug, Clone, Default)]
pub struct ResolutionReport {
    /// 新解析的修订版本，按解析顺序
    pub resolved: Vec<RevisionId>,
    pub failures: BTreeMap<RevisionId, FailureReason>,
    pub uses_violations: Vec<UsesViolation>,
}

impl ResolutionReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// 释放修订版本的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// 已从包表移除；附带因此失去全部宿主的片段
    Released { detached_fragments: Vec<RevisionId> },
    /// 导出仍被使用，保留为僵尸
    InUse,
}

/// 动态导入的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicBinding {
    /// 提供内容的修订版本
    pub provider: RevisionId,
    /// 为满足该导入而新解析的修订版本，按解析顺序
    pub resolved: Vec<RevisionId>,
}

/// 类查找时包的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageSource {
    /// 活动导入
    Imported { export: PackageId, provider: RevisionId },
    /// 通过依赖模块包可见
    Required { export: PackageId, provider: RevisionId },
    /// 本地内容
    Local(RevisionId),
    /// 匹配动态导入模式，尚未绑定
    Dynamic,
    NotFound,
}

/// 按查找顺序定位包：活动导入、依赖模块包、本地内容、动态导入模式
pub fn lookup_package(
    revisions: &BTreeMap<RevisionId, BundleRevision>,
    packages: &PackageTable,
    revision: RevisionId,
    package: &str,
) -> PackageSource {
    let Some(rev) = revisions.get(&revision) else {
        return PackageSource::NotFound;
    };
    if !rev.wiring.is_resolved() {
        return PackageSource::NotFound;
    }

    if let Some(export) = rev.wiring.provider_of(package) {
        if let Some(provider) = origin_owner(packages, export) {
            return PackageSource::Imported { export, provider };
        }
    }

    for require in rev.wiring.requires() {
        let Some(required) = require.provider.and_then(|p| revisions.get(&p)) else {
            continue;
        };
        let found = required
            .wiring
            .exports()
            .get(package)
            .or_else(|| required.wiring.reexports().get(package));
        if let Some(export) = found {
            if let Some(provider) = origin_owner(packages, *export) {
                return PackageSource::Required {
                    export: *export,
                    provider,
                };
            }
        }
    }

    if rev.contains_local_package(package) {
        return PackageSource::Local(revision);
    }

    if rev
        .wiring
        .dynamic_imports()
        .iter()
        .any(|dynamic| dynamic.pattern.matches(package))
    {
        return PackageSource::Dynamic;
    }

    PackageSource::NotFound
}

/// 直接依赖该修订版本的修订版本：导出的使用方、依赖方、附着的片段与宿主
pub fn dependents_of(
    revisions: &BTreeMap<RevisionId, BundleRevision>,
    packages: &PackageTable,
    id: RevisionId,
) -> BTreeSet<RevisionId> {
    let mut dependents = BTreeSet::new();
    let Some(revision) = revisions.get(&id) else {
        return dependents;
    };
    for export in revision
        .wiring
        .exports()
        .values()
        .chain(revision.wiring.reexports().values())
    {
        dependents.extend(packages.consumer_revisions(*export));
    }
    dependents.extend(revision.required_by.iter().copied());
    dependents.extend(revision.fragments.iter().copied());
    dependents.extend(revision.fragment_hosts.iter().copied());
    dependents.remove(&id);
    dependents
}

/// 沿再导出链找到真正提供内容的修订版本
fn origin_owner(packages: &PackageTable, export: PackageId) -> Option<RevisionId> {
    let mut current = packages.export(export)?;
    while let Some(source) = current.source {
        current = packages.export(source)?;
    }
    Some(current.owner)
}

// ==================== 规划 ====================

#[derive(Debug, Clone, Default)]
struct PlannedWiring {
    bindings: BTreeMap<PackageId, PackageId>,
    requires: Vec<RequireBundle>,
}

#[derive(Debug, Clone)]
struct Attachment {
    fragment: RevisionId,
    host: RevisionId,
    /// 片段导入 -> 提供方导出
    bindings: BTreeMap<PackageId, PackageId>,
    /// 宿主在本次会话中解析时，片段的导入并入宿主
    merge_imports: bool,
}

#[derive(Debug, Clone, Default)]
struct Plan {
    order: Vec<RevisionId>,
    wirings: BTreeMap<RevisionId, PlannedWiring>,
    attachments: Vec<Attachment>,
}

impl Plan {
    fn contains(&self, id: RevisionId) -> bool {
        self.wirings.contains_key(&id) || self.attachments.iter().any(|a| a.fragment == id)
    }

    fn is_attached(&self, fragment: RevisionId, host: RevisionId) -> bool {
        self.attachments
            .iter()
            .any(|a| a.fragment == fragment && a.host == host)
    }

    fn push_order(&mut self, id: RevisionId) {
        if !self.order.contains(&id) {
            self.order.push(id);
        }
    }
}

struct Session<'s> {
    bundles: &'s BTreeMap<BundleId, Bundle>,
    revisions: &'s BTreeMap<RevisionId, BundleRevision>,
    packages: &'s PackageTable,
    environments: &'s [String],
    hook: Option<&'s dyn ResolverHook>,
    plan: Plan,
    in_progress: BTreeSet<RevisionId>,
    failed: BTreeMap<RevisionId, FailureReason>,
    /// 因宿主正在规划而暂时失败的片段，不缓存其失败
    deferred: BTreeSet<RevisionId>,
}

impl<'s> Session<'s> {
    fn is_current(&self, id: RevisionId) -> bool {
        self.bundles
            .get(&id.bundle)
            .and_then(Bundle::current_revision)
            == Some(id)
    }

    fn is_resolved(&self, id: RevisionId) -> bool {
        self.revisions
            .get(&id)
            .map_or(false, BundleRevision::is_resolved)
            || self.plan.contains(id)
    }

    /// 新的连线只能指向当前修订版本；僵尸与已卸载模块包的修订版本只为已有使用方保留
    fn plan_revision(&mut self, id: RevisionId) -> Result<(), FailureReason> {
        if self.in_progress.contains(&id) {
            return Ok(());
        }
        let revisions = self.revisions;
        let unavailable = || FailureReason::Unavailable {
            revision: id.to_string(),
        };
        if !self.is_current(id) {
            return Err(unavailable());
        }
        if self.is_resolved(id) {
            return Ok(());
        }
        if let Some(reason) = self.failed.get(&id) {
            return Err(reason.clone());
        }

        let revision = revisions.get(&id).ok_or_else(unavailable)?;
        if let Some(hook) = self.hook {
            if !hook.filter_resolvable(revision) {
                self.failed.insert(id, FailureReason::RejectedByPolicy);
                return Err(FailureReason::RejectedByPolicy);
            }
        }

        let snapshot = self.plan.clone();
        self.in_progress.insert(id);
        let outcome = if revision.is_fragment() {
            self.plan_fragment(revision)
        } else {
            self.plan_regular(revision)
        };
        self.in_progress.remove(&id);

        if let Err(reason) = &outcome {
            self.plan = snapshot;
            if !self.deferred.remove(&id) {
                self.failed.insert(id, reason.clone());
            }
            debug!(revision = %id, reason = %reason, "修订版本规划失败");
        }
        outcome
    }

    fn plan_regular(&mut self, revision: &'s BundleRevision) -> Result<(), FailureReason> {
        let id = revision.id;
        let declaration = &revision.declaration;

        let required_env = &declaration.required_execution_environment;
        if !required_env.is_empty() && !required_env.iter().any(|env| self.environments.contains(env)) {
            return Err(FailureReason::ExecutionEnvironment {
                required: required_env.join(","),
            });
        }

        // 先解析模块包依赖，直接导入在类查找时优先于依赖可见的包
        let mut requires = Vec::with_capacity(declaration.requires.len());
        for require in &declaration.requires {
            let provider = self.choose_required_bundle(id, require)?;
            requires.push(RequireBundle {
                declaration: require.clone(),
                provider,
            });
        }

        let table = self.packages;
        let own_imports: Vec<PackageId> = revision
            .wiring
            .imports()
            .values()
            .copied()
            .filter(|import| table.import(*import).map_or(false, |i| i.owner == id))
            .collect();
        let bindings = self.bind_imports(id, &own_imports)?;

        self.plan.wirings.insert(id, PlannedWiring { bindings, requires });
        self.plan.push_order(id);

        self.attach_pending_fragments(revision);
        Ok(())
    }

    fn plan_fragment(&mut self, fragment: &'s BundleRevision) -> Result<(), FailureReason> {
        let (host_name, range) = match fragment.kind() {
            RevisionKind::Fragment { host, range } => (host.clone(), range.clone()),
            RevisionKind::Extension => (SYSTEM_BUNDLE_SYMBOLIC_NAME.to_string(), VersionRange::any()),
            RevisionKind::Regular => return Ok(()),
        };

        let revisions = self.revisions;
        let mut hosts: Vec<&'s BundleRevision> = revisions
            .values()
            .filter(|host| fragment_matches(fragment, host) && self.is_current(host.id))
            .collect();
        hosts.sort_by(|a, b| b.version().cmp(a.version()).then(a.id.cmp(&b.id)));

        let mut attached = false;
        let mut deferred = false;
        let mut conflict = None;
        for host in hosts {
            if self.plan.is_attached(fragment.id, host.id) || fragment.fragment_hosts.contains(&host.id) {
                attached = true;
            } else if host.is_resolved() {
                match self.attach_to_resolved(fragment, host) {
                    Ok(bindings) => {
                        self.plan.attachments.push(Attachment {
                            fragment: fragment.id,
                            host: host.id,
                            bindings,
                            merge_imports: false,
                        });
                        self.plan.push_order(fragment.id);
                        attached = true;
                    }
                    Err(reason) => conflict = Some(reason),
                }
            } else if self.plan.wirings.contains_key(&host.id) {
                attached |= self.try_merge(fragment, host);
            } else if self.in_progress.contains(&host.id) {
                deferred = true;
            } else if self.plan_revision(host.id).is_ok() {
                attached |= self.plan.is_attached(fragment.id, host.id);
            }
        }

        if attached {
            return Ok(());
        }
        if deferred {
            self.deferred.insert(fragment.id);
        }
        Err(conflict.unwrap_or(FailureReason::FragmentHostUnavailable {
            host: host_name,
            range: range.to_string(),
        }))
    }

    /// 在宿主规划完成后，附着所有匹配且尚未附着的片段
    fn attach_pending_fragments(&mut self, host: &'s BundleRevision) {
        let revisions = self.revisions;
        for fragment in revisions.values() {
            if !fragment_matches(fragment, host)
                || !self.is_current(fragment.id)
                || self.failed.contains_key(&fragment.id)
                || fragment.fragment_hosts.contains(&host.id)
                || self.plan.is_attached(fragment.id, host.id)
            {
                continue;
            }
            if let Some(hook) = self.hook {
                if !hook.filter_resolvable(fragment) {
                    continue;
                }
            }
            self.try_merge(fragment, host);
        }
    }

    /// 把片段合并进本次会话中正在解析的宿主
    fn try_merge(&mut self, fragment: &'s BundleRevision, host: &'s BundleRevision) -> bool {
        let snapshot = self.plan.clone();
        let inserted = self.in_progress.insert(fragment.id);
        let outcome = self.merge_fragment(fragment, host);
        if inserted {
            self.in_progress.remove(&fragment.id);
        }

        match outcome {
            Ok((bindings, requires)) => {
                if let Some(planned) = self.plan.wirings.get_mut(&host.id) {
                    planned.requires.extend(requires);
                }
                self.plan.attachments.push(Attachment {
                    fragment: fragment.id,
                    host: host.id,
                    bindings,
                    merge_imports: true,
                });
                self.plan.push_order(fragment.id);
                debug!(fragment = %fragment.id, host = %host.id, "片段并入宿主");
                true
            }
            Err(reason) => {
                self.plan = snapshot;
                debug!(fragment = %fragment.id, host = %host.id, reason = %reason, "片段无法并入宿主");
                false
            }
        }
    }

    fn merge_fragment(
        &mut self,
        fragment: &'s BundleRevision,
        host: &'s BundleRevision,
    ) -> Result<(BTreeMap<PackageId, PackageId>, Vec<RequireBundle>), FailureReason> {
        let mut requires = Vec::new();
        for require in &fragment.declaration.requires {
            if host
                .declaration
                .requires
                .iter()
                .any(|r| r.symbolic_name == require.symbolic_name)
            {
                continue;
            }
            let provider = self.choose_required_bundle(host.id, require)?;
            requires.push(RequireBundle {
                declaration: require.clone(),
                provider,
            });
        }

        let imports: Vec<PackageId> = fragment.wiring.imports().values().copied().collect();
        let bindings = self.bind_imports(fragment.id, &imports)?;
        Ok((bindings, requires))
    }

    /// 附着到已解析的宿主：片段的每个导入都必须被宿主一个相同或更窄的导入覆盖
    fn attach_to_resolved(
        &self,
        fragment: &BundleRevision,
        host: &BundleRevision,
    ) -> Result<BTreeMap<PackageId, PackageId>, FailureReason> {
        let table = self.packages;
        let conflict = |package: &str| FailureReason::FragmentImportConflict {
            package: package.to_string(),
            host: host.symbolic_name().to_string(),
        };

        let mut bindings = BTreeMap::new();
        for import_id in fragment.wiring.imports().values() {
            let Some(import) = table.import(*import_id) else {
                continue;
            };
            let covering = host
                .wiring
                .imports()
                .get(&import.name)
                .and_then(|id| table.import(*id))
                .filter(|host_import| host_import.range.is_subset_of(&import.range));
            let Some(host_import) = covering else {
                return Err(conflict(&import.name));
            };

            let provider = host
                .wiring
                .active_imports()
                .and_then(|active| active.get(&host_import.id))
                .copied()
                .filter(|provider| {
                    table
                        .export(*provider)
                        .map_or(false, |export| export.satisfies(&import.requirement()))
                });
            match provider {
                Some(provider) => {
                    bindings.insert(import.id, provider);
                }
                None if import.is_optional() => {}
                None => return Err(conflict(&import.name)),
            }
        }

        for require in &fragment.declaration.requires {
            let covered = host.declaration.requires.iter().any(|r| {
                r.symbolic_name == require.symbolic_name && r.range.is_subset_of(&require.range)
            });
            if !covered {
                return Err(conflict(&require.symbolic_name));
            }
        }

        Ok(bindings)
    }

    fn choose_required_bundle(
        &mut self,
        requester: RevisionId,
        require: &RequireDeclaration,
    ) -> Result<Option<RevisionId>, FailureReason> {
        let revisions = self.revisions;
        let mut candidates: Vec<&BundleRevision> = revisions
            .values()
            .filter(|candidate| {
                candidate.id.bundle != requester.bundle
                    && self.is_current(candidate.id)
                    && !candidate.is_fragment()
                    && candidate.symbolic_name() == require.symbolic_name
                    && require.range.contains(candidate.version())
            })
            .collect();
        candidates.sort_by(|a, b| b.version().cmp(a.version()).then(a.id.cmp(&b.id)));

        for candidate in candidates {
            if self.plan_revision(candidate.id).is_ok() {
                return Ok(Some(candidate.id));
            }
        }

        match require.resolution {
            Resolution::Optional => Ok(None),
            Resolution::Mandatory => Err(FailureReason::MissingRequiredBundle {
                symbolic_name: require.symbolic_name.clone(),
                range: require.range.to_string(),
            }),
        }
    }

    fn bind_imports(
        &mut self,
        requester: RevisionId,
        imports: &[PackageId],
    ) -> Result<BTreeMap<PackageId, PackageId>, FailureReason> {
        let table = self.packages;
        let outcomes = table.resolve(requester, imports, &mut |export| self.accept_provider(requester, export));

        let mut bindings = BTreeMap::new();
        for binding in outcomes {
            match binding.outcome {
                Ok(export) => {
                    bindings.insert(binding.import, export);
                }
                Err(reason) => {
                    let Some(import) = table.import(binding.import) else {
                        continue;
                    };
                    if import.is_optional() {
                        debug!(revision = %requester, package = %import.name, "可选导入未绑定");
                        continue;
                    }
                    debug!(revision = %requester, reason = %reason, "必需导入无法满足");
                    return Err(self.import_failure(import));
                }
            }
        }
        Ok(bindings)
    }

    fn accept_provider(&mut self, requester: RevisionId, export: &ExportedPackage) -> bool {
        if export.owner == requester {
            return true;
        }
        self.is_live(export.owner) && self.plan_revision(export.owner).is_ok()
    }

    /// 当前修订版本；已附着的片段还要求至少一个宿主是当前修订版本
    fn is_live(&self, id: RevisionId) -> bool {
        if !self.is_current(id) {
            return false;
        }
        match self.revisions.get(&id) {
            Some(revision) if revision.is_fragment() => {
                revision.fragment_hosts.is_empty()
                    || revision.fragment_hosts.iter().any(|host| self.is_current(*host))
            }
            Some(_) => true,
            None => false,
        }
    }

    fn import_failure(&self, import: &ImportedPackage) -> FailureReason {
        let table = self.packages;
        let blocked = table
            .candidates(&import.requirement())
            .into_iter()
            .filter_map(|candidate| table.export(candidate))
            .map(|export| export.owner)
            .find(|owner| self.is_live(*owner));

        match blocked {
            Some(owner) => FailureReason::DependencyFailed {
                package: import.name.clone(),
                revision: owner.to_string(),
                reason: self
                    .failed
                    .get(&owner)
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "不可解析".to_string()),
            },
            None => FailureReason::NoProvider {
                package: import.name.clone(),
                range: import.range.to_string(),
            },
        }
    }
}

fn fragment_matches(fragment: &BundleRevision, host: &BundleRevision) -> bool {
    if host.is_fragment() {
        return false;
    }
    match fragment.kind() {
        RevisionKind::Fragment { host: name, range } => {
            host.symbolic_name() == name && range.contains(host.version())
        }
        RevisionKind::Extension => host.symbolic_name() == SYSTEM_BUNDLE_SYMBOLIC_NAME,
        RevisionKind::Regular => false,
    }
}

// ==================== 解析器 ====================

/// 解析器
///
/// 持有框架状态中修订版本表与包表的可变借用，只应在生命周期锁内构造。
pub struct Resolver<'a> {
    bundles: &'a BTreeMap<BundleId, Bundle>,
    revisions: &'a mut BTreeMap<RevisionId, BundleRevision>,
    packages: &'a mut PackageTable,
    environments: &'a [String],
}

impl<'a> Resolver<'a> {
    pub fn new(
        bundles: &'a BTreeMap<BundleId, Bundle>,
        revisions: &'a mut BTreeMap<RevisionId, BundleRevision>,
        packages: &'a mut PackageTable,
        environments: &'a [String],
    ) -> Self {
        Self {
            bundles,
            revisions,
            packages,
            environments,
        }
    }

    /// 解析一批修订版本
    ///
    /// 每个目标独立成事务，一个目标失败不影响其他目标。已解析的目标直接成功。
    pub fn resolve(&mut self, targets: &[RevisionId], hook: Option<&dyn ResolverHook>) -> ResolutionReport {
        let mut report = ResolutionReport::default();

        if let Some(hook) = hook {
            if let Err(reason) = hook.begin(targets) {
                warn!(reason = %reason, "解析钩子否决了本批解析");
                for target in targets {
                    report.failures.insert(*target, FailureReason::RejectedByPolicy);
                }
                hook.end(&report);
                return report;
            }
        }

        for target in targets {
            let planned = {
                let mut session = self.session(hook);
                session.plan_revision(*target).map(|()| session.plan)
            };

            match planned {
                Ok(plan) => {
                    let resolved = self.commit(plan);
                    report.uses_violations.extend(self.check_uses(&resolved));
                    report.resolved.extend(resolved);
                }
                Err(reason) => {
                    info!(revision = %target, reason = %reason, "修订版本解析失败");
                    report.failures.insert(*target, reason);
                }
            }
        }

        if let Some(hook) = hook {
            hook.end(&report);
        }
        report
    }

    fn session<'s>(&'s self, hook: Option<&'s dyn ResolverHook>) -> Session<'s> {
        Session {
            bundles: self.bundles,
            revisions: &*self.revisions,
            packages: &*self.packages,
            environments: self.environments,
            hook,
            plan: Plan::default(),
            in_progress: BTreeSet::new(),
            failed: BTreeMap::new(),
            deferred: BTreeSet::new(),
        }
    }

    fn commit(&mut self, plan: Plan) -> Vec<RevisionId> {
        let Plan {
            order,
            mut wirings,
            attachments,
        } = plan;

        // 片段的导出（以及合并时的导入）并入宿主
        for attachment in &attachments {
            let Some(fragment) = self.revisions.get_mut(&attachment.fragment) else {
                continue;
            };
            fragment.fragment_hosts.insert(attachment.host);
            let exports = fragment.wiring.exports().clone();
            let imports = fragment.wiring.imports().clone();

            if let Some(host) = self.revisions.get_mut(&attachment.host) {
                host.fragments.insert(attachment.fragment);
                for (name, id) in exports {
                    if !host.wiring.exports().contains_key(&name) {
                        host.wiring.add_export(name, id);
                    }
                }
                if attachment.merge_imports {
                    for (name, id) in imports {
                        if !host.wiring.imports().contains_key(&name) {
                            host.wiring.add_import(name, id);
                        }
                    }
                }
            }
        }

        for id in &order {
            let Some(planned) = wirings.remove(id) else {
                continue;
            };
            for (import, export) in &planned.bindings {
                self.packages.bind(*import, *export);
            }
            for provider in planned.requires.iter().filter_map(|r| r.provider) {
                if let Some(required) = self.revisions.get_mut(&provider) {
                    required.required_by.insert(*id);
                }
            }
            let reexports = self.register_reexports(*id, &planned.requires);
            if let Some(revision) = self.revisions.get_mut(id) {
                revision
                    .wiring
                    .mark_resolved(planned.bindings, planned.requires, reexports);
            }
            info!(revision = %id, "修订版本已解析");
        }

        for attachment in attachments {
            for (import, export) in &attachment.bindings {
                self.packages.bind(*import, *export);
                if let Some(host) = self.revisions.get_mut(&attachment.host) {
                    host.wiring.add_binding(*import, *export);
                }
            }
            info!(fragment = %attachment.fragment, host = %attachment.host, "片段已附着");
        }

        order
    }

    fn register_reexports(&mut self, owner: RevisionId, requires: &[RequireBundle]) -> BTreeMap<String, PackageId> {
        let mut reexports = BTreeMap::new();
        let Some(revision) = self.revisions.get(&owner) else {
            return reexports;
        };
        let owner_name = revision.symbolic_name().to_string();
        let owner_version = revision.version().clone();

        let mut sources = Vec::new();
        for require in requires {
            if require.declaration.visibility != Visibility::Reexport {
                continue;
            }
            let Some(required) = require.provider.and_then(|p| self.revisions.get(&p)) else {
                continue;
            };
            for (name, id) in required.wiring.exports().iter().chain(required.wiring.reexports()) {
                if !revision.wiring.exports().contains_key(name) {
                    sources.push((name.clone(), *id));
                }
            }
        }

        for (name, id) in sources {
            if reexports.contains_key(&name) {
                continue;
            }
            let source = self.packages.export(id).and_then(|e| e.source).unwrap_or(id);
            if let Some(reexport) = self
                .packages
                .register_reexport(owner, &owner_name, &owner_version, source)
            {
                debug!(revision = %owner, package = %name, "登记再导出");
                reexports.insert(name, reexport);
            }
        }
        reexports
    }

    /// 检查新解析修订版本的 `uses` 约束，冲突只记录
    fn check_uses(&self, resolved: &[RevisionId]) -> Vec<UsesViolation> {
        let mut violations = Vec::new();
        for id in resolved {
            let Some(revision) = self.revisions.get(id) else {
                continue;
            };
            let Some(active) = revision.wiring.active_imports() else {
                continue;
            };
            for provider in active.values() {
                let Some(export) = self.packages.export(*provider) else {
                    continue;
                };
                let Some(owner) = self.revisions.get(&export.owner) else {
                    continue;
                };
                for used in &export.uses {
                    let mine = revision.wiring.provider_of(used);
                    let theirs = owner
                        .wiring
                        .exports()
                        .get(used)
                        .copied()
                        .or_else(|| owner.wiring.provider_of(used));
                    let (Some(mine), Some(theirs)) = (mine, theirs) else {
                        continue;
                    };
                    if origin_owner(&*self.packages, mine) != origin_owner(&*self.packages, theirs) {
                        warn!(
                            revision = %id,
                            package = %export.name,
                            used = %used,
                            "uses 约束冲突，按非严格连线保留"
                        );
                        violations.push(UsesViolation {
                            revision: *id,
                            package: export.name.clone(),
                            used: used.clone(),
                        });
                    }
                }
            }
        }
        violations
    }

    /// 解除修订版本的连线，返回因此失去全部宿主的片段
    ///
    /// 导出保持登记，其使用方的绑定不受影响。
    pub fn unresolve(&mut self, id: RevisionId) -> Vec<RevisionId> {
        let Some(revision) = self.revisions.get(&id) else {
            return Vec::new();
        };

        if revision.is_fragment() {
            let hosts: Vec<RevisionId> = revision.fragment_hosts.iter().copied().collect();
            for host in hosts {
                self.detach_fragment(id, host);
            }
            return Vec::new();
        }

        let fragments: Vec<RevisionId> = revision.fragments.iter().copied().collect();
        for fragment in &fragments {
            self.detach_fragment(*fragment, id);
        }
        let detached_fragments = fragments
            .into_iter()
            .filter(|f| {
                self.revisions
                    .get(f)
                    .map_or(false, |rev| rev.fragment_hosts.is_empty())
            })
            .collect();

        let Some(revision) = self.revisions.get_mut(&id) else {
            return detached_fragments;
        };
        if !revision.wiring.is_resolved() {
            return detached_fragments;
        }

        let bound: Vec<PackageId> = revision
            .wiring
            .active_imports()
            .map(|active| active.keys().copied().collect())
            .unwrap_or_default();
        let detached = revision.wiring.clear();
        for import in bound {
            self.packages.unbind(import);
        }
        self.packages
            .unregister_packages(&detached.reexports, &detached.dynamic_imports, true);
        for provider in detached.required_providers {
            if let Some(required) = self.revisions.get_mut(&provider) {
                required.required_by.remove(&id);
            }
        }

        info!(revision = %id, "修订版本已解除解析");
        detached_fragments
    }

    fn detach_fragment(&mut self, fragment: RevisionId, host: RevisionId) {
        let Some(frag) = self.revisions.get_mut(&fragment) else {
            return;
        };
        frag.fragment_hosts.remove(&host);
        let still_attached = !frag.fragment_hosts.is_empty();
        let imports: Vec<PackageId> = frag.wiring.imports().values().copied().collect();
        let ids: BTreeSet<PackageId> = frag
            .wiring
            .exports()
            .values()
            .chain(frag.wiring.imports().values())
            .copied()
            .collect();

        if let Some(host_rev) = self.revisions.get_mut(&host) {
            host_rev.fragments.remove(&fragment);
            host_rev.wiring.remove_merged(&ids);
        }
        if !still_attached {
            for import in imports {
                self.packages.unbind(import);
            }
        }
        debug!(fragment = %fragment, host = %host, "片段已脱离宿主");
    }

    /// 修订版本自身拥有的导出（不含片段并入的导出），以及再导出
    fn owned_exports(&self, revision: &BundleRevision) -> Vec<PackageId> {
        revision
            .wiring
            .exports()
            .values()
            .copied()
            .filter(|export| {
                self.packages
                    .export(*export)
                    .map_or(false, |e| e.owner == revision.id)
            })
            .chain(revision.wiring.reexports().values().copied())
            .collect()
    }

    /// 释放后会随之失效的导出：自身的导出与再导出，加上只附着在本宿主上的片段并入的导出
    fn exports_at_stake(&self, revision: &BundleRevision) -> Vec<PackageId> {
        let mut exports = self.owned_exports(revision);
        for fragment in &revision.fragments {
            let Some(fragment) = self.revisions.get(fragment) else {
                continue;
            };
            if fragment.fragment_hosts.iter().any(|host| *host != revision.id) {
                continue;
            }
            exports.extend(fragment.wiring.exports().values().copied());
        }
        exports
    }

    /// 释放修订版本：解除连线并从包表与修订版本表移除
    ///
    /// 除非 `force`，导出（包括片段并入的导出）仍被其他修订版本使用或仍被依赖时
    /// 返回 [`ReleaseOutcome::InUse`]，不做任何修改。
    pub fn release(&mut self, id: RevisionId, force: bool) -> ReleaseOutcome {
        let Some(revision) = self.revisions.get(&id) else {
            return ReleaseOutcome::Released {
                detached_fragments: Vec::new(),
            };
        };
        let exports = self.exports_at_stake(revision);
        if !force && (self.packages.exports_in_use(&exports) || !revision.required_by.is_empty()) {
            debug!(revision = %id, "导出仍在使用中");
            return ReleaseOutcome::InUse;
        }

        let detached_fragments = self.unresolve(id);
        let Some(revision) = self.revisions.remove(&id) else {
            return ReleaseOutcome::Released { detached_fragments };
        };
        let exports = self.owned_exports(&revision);
        let imports: Vec<PackageId> = revision
            .wiring
            .imports()
            .values()
            .copied()
            .filter(|import| self.packages.import(*import).map_or(false, |i| i.owner == id))
            .collect();
        self.packages.unregister_packages(&exports, &imports, true);

        info!(revision = %id, "修订版本已释放");
        ReleaseOutcome::Released { detached_fragments }
    }

    /// 直接依赖该修订版本的修订版本
    pub fn dependents(&self, id: RevisionId) -> BTreeSet<RevisionId> {
        dependents_of(&*self.revisions, &*self.packages, id)
    }

    /// 按查找顺序定位包
    pub fn lookup(&self, id: RevisionId, package: &str) -> PackageSource {
        lookup_package(&*self.revisions, &*self.packages, id, package)
    }

    /// 动态导入：为已解析修订版本绑定一个匹配动态导入模式的包
    ///
    /// 提供方的选择与普通导入相同，尚未解析的提供方在同一事务中解析。
    /// 不触碰已有绑定。
    pub fn dynamic_import(
        &mut self,
        id: RevisionId,
        package: &str,
        hook: Option<&dyn ResolverHook>,
    ) -> Option<DynamicBinding> {
        let revision = self.revisions.get(&id)?;
        if !revision.wiring.is_resolved() {
            return None;
        }
        if let Some(existing) = revision.wiring.provider_of(package) {
            return origin_owner(&*self.packages, existing).map(|provider| DynamicBinding {
                provider,
                resolved: Vec::new(),
            });
        }
        let declaration = revision
            .wiring
            .dynamic_imports()
            .iter()
            .find(|dynamic| dynamic.pattern.matches(package))?
            .clone();
        let requirement = PackageRequirement {
            name: package,
            range: &declaration.range,
            attributes: &declaration.attributes,
        };

        let (chosen, plan) = {
            let mut session = self.session(hook);
            let mut chosen = None;
            for candidate in self.packages.candidates(&requirement) {
                let Some(export) = self.packages.export(candidate) else {
                    continue;
                };
                if export.owner != id && session.accept_provider(id, export) {
                    chosen = Some(candidate);
                    break;
                }
            }
            (chosen?, session.plan)
        };

        let resolved = self.commit(plan);
        self.check_uses(&resolved);
        let (import, provider) =
            self.packages
                .register_dynamic_import(id, package, &declaration, &mut |export| export.id == chosen)?;

        if let Some(revision) = self.revisions.get_mut(&id) {
            revision
                .wiring
                .accept_dynamic(package.to_string(), import, provider);
        }
        let provider = origin_owner(&*self.packages, provider)?;
        Some(DynamicBinding { provider, resolved })
    }
}
