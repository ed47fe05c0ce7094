//! 包表
//!
//! 全局的包登记表：包名 -> 所有已安装修订版本导出的该包，以及尚未绑定、
//! 等待该包名的导入。包表只在生命周期锁内被修改，所有修改都经过
//! 登记、解除登记、绑定与动态导入这几个入口。

use std::collections::{BTreeMap, BTreeSet, HashMap};

use semver::Version;
use tracing::{debug, trace};

use super::package::{
    DynamicImport, ExportDeclaration, ExportedPackage, ImportDeclaration, ImportedPackage,
    PackageId, PackageRequirement, Resolution,
};
use super::revision::RevisionId;

/// 单个导入的解析结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportBinding {
    pub import: PackageId,
    /// 成功时为选中的提供方导出，失败时为原因
    pub outcome: std::result::Result<PackageId, String>,
}

/// 包表
#[derive(Debug, Default)]
pub struct PackageTable {
    next_id: u64,
    exports: HashMap<PackageId, ExportedPackage>,
    imports: HashMap<PackageId, ImportedPackage>,
    /// 包名 -> 导出 id，按所属修订版本升序
    exports_by_name: HashMap<String, Vec<PackageId>>,
    /// 包名 -> 尚未绑定的导入
    waiting: HashMap<String, BTreeSet<PackageId>>,
}

impl PackageTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self) -> PackageId {
        self.next_id += 1;
        PackageId(self.next_id)
    }

    // ==================== 登记 ====================

    /// 登记一个修订版本声明的导出与导入，从不失败
    ///
    /// 不同修订版本对同名同版本的导出可以并存，由解析时的选择规则决定胜者。
    pub fn register_packages(
        &mut self,
        owner: RevisionId,
        owner_name: &str,
        owner_version: &Version,
        exports: &[ExportDeclaration],
        imports: &[ImportDeclaration],
    ) -> (BTreeMap<String, PackageId>, BTreeMap<String, PackageId>) {
        let mut export_ids = BTreeMap::new();
        for decl in exports {
            let id = self.allocate();
            let export = ExportedPackage::from_declaration(id, owner, owner_name, owner_version, decl);
            self.insert_export(export);
            export_ids.insert(decl.name.clone(), id);
        }

        let mut import_ids = BTreeMap::new();
        for decl in imports {
            let id = self.allocate();
            let import = ImportedPackage::from_declaration(id, owner, decl);
            self.insert_import(import);
            import_ids.insert(decl.name.clone(), id);
        }

        debug!(
            revision = %owner,
            exports = export_ids.len(),
            imports = import_ids.len(),
            "登记修订版本的包"
        );
        (export_ids, import_ids)
    }

    /// 登记一个再导出：以 `owner` 的名义重新提供 `source` 导出
    pub fn register_reexport(&mut self, owner: RevisionId, owner_name: &str, owner_version: &Version, source: PackageId) -> Option<PackageId> {
        let original = self.exports.get(&source)?.clone();
        let id = self.allocate();
        let export = ExportedPackage {
            id,
            owner,
            owner_name: owner_name.to_string(),
            owner_version: owner_version.clone(),
            source: Some(source),
            consumers: BTreeSet::new(),
            ..original
        };
        self.insert_export(export);
        Some(id)
    }

    fn insert_export(&mut self, export: ExportedPackage) {
        let list = self.exports_by_name.entry(export.name.clone()).or_default();
        let position = list
            .iter()
            .position(|other| {
                self.exports
                    .get(other)
                    .map_or(false, |existing| existing.owner > export.owner)
            })
            .unwrap_or(list.len());
        list.insert(position, export.id);
        self.exports.insert(export.id, export);
    }

    fn insert_import(&mut self, import: ImportedPackage) {
        if import.provider.is_none() {
            self.waiting
                .entry(import.name.clone())
                .or_default()
                .insert(import.id);
        }
        self.imports.insert(import.id, import);
    }

    // ==================== 解除登记 ====================

    /// 检查导出集合中是否有被其他修订版本使用的导出
    pub fn exports_in_use(&self, exports: &[PackageId]) -> bool {
        exports.iter().any(|id| {
            self.exports.get(id).map_or(false, |export| {
                export.consumers.iter().any(|consumer| {
                    self.imports
                        .get(consumer)
                        .map_or(false, |import| import.owner != export.owner)
                })
            })
        })
    }

    /// 解除登记一个修订版本的导出与导入
    ///
    /// 除非 `force`，只要集合中有导出仍被其他修订版本使用就返回 `false`，
    /// 且不做任何修改。强制移除时，仍连线到这些导出的导入被解除绑定。
    pub fn unregister_packages(&mut self, exports: &[PackageId], imports: &[PackageId], force: bool) -> bool {
        if !force && self.exports_in_use(exports) {
            trace!(exports = exports.len(), "导出仍在使用中，拒绝解除登记");
            return false;
        }

        for id in imports {
            self.unbind(*id);
            if let Some(import) = self.imports.remove(id) {
                if let Some(waiting) = self.waiting.get_mut(&import.name) {
                    waiting.remove(id);
                    if waiting.is_empty() {
                        self.waiting.remove(&import.name);
                    }
                }
            }
        }

        for id in exports {
            let Some(export) = self.exports.remove(id) else {
                continue;
            };
            for consumer in &export.consumers {
                if let Some(import) = self.imports.get_mut(consumer) {
                    import.provider = None;
                    self.waiting
                        .entry(import.name.clone())
                        .or_default()
                        .insert(import.id);
                }
            }
            if let Some(list) = self.exports_by_name.get_mut(&export.name) {
                list.retain(|other| other != id);
                if list.is_empty() {
                    self.exports_by_name.remove(&export.name);
                }
            }
        }

        true
    }

    // ==================== 解析 ====================

    /// 查找满足需求的导出，按选择顺序排列：版本最高者优先，版本相同时
    /// 所属模块包 id 最小者优先
    pub fn candidates(&self, requirement: &PackageRequirement<'_>) -> Vec<PackageId> {
        let mut found: Vec<&ExportedPackage> = self
            .exports_by_name
            .get(requirement.name)
            .into_iter()
            .flatten()
            .filter_map(|id| self.exports.get(id))
            .filter(|export| export.satisfies(requirement))
            .collect();

        found.sort_by(|a, b| b.version.cmp(&a.version).then(a.owner.cmp(&b.owner)));
        found.into_iter().map(|export| export.id).collect()
    }

    /// 为一组待解析的导入选择提供方
    ///
    /// 对每个导入按 [`candidates`](Self::candidates) 的顺序逐个尝试，
    /// `accept` 决定候选是否可用（例如其所属修订版本能否被解析）。
    /// 本方法不修改包表，返回每个导入的绑定结果或失败原因。
    pub fn resolve(
        &self,
        requester: RevisionId,
        pending_imports: &[PackageId],
        accept: &mut dyn FnMut(&ExportedPackage) -> bool,
    ) -> Vec<ImportBinding> {
        let mut bindings = Vec::with_capacity(pending_imports.len());
        for import_id in pending_imports {
            let Some(import) = self.imports.get(import_id) else {
                continue;
            };

            let candidates = self.candidates(&import.requirement());
            let chosen = candidates
                .into_iter()
                .find(|candidate| self.exports.get(candidate).map_or(false, |e| accept(e)));

            let outcome = match chosen {
                Some(export) => {
                    trace!(revision = %requester, package = %import.name, provider = %export, "选中提供方");
                    Ok(export)
                }
                None => Err(format!("没有满足 {}@{} 的提供方", import.name, import.range)),
            };
            bindings.push(ImportBinding {
                import: *import_id,
                outcome,
            });
        }
        bindings
    }

    /// 动态导入：为单个包名查找提供方，并登记一个新的已绑定导入
    ///
    /// 不触碰已有的任何绑定。没有可用提供方时返回 `None`。
    pub fn register_dynamic_import(
        &mut self,
        owner: RevisionId,
        package: &str,
        declaration: &DynamicImport,
        accept: &mut dyn FnMut(&ExportedPackage) -> bool,
    ) -> Option<(PackageId, PackageId)> {
        let requirement = PackageRequirement {
            name: package,
            range: &declaration.range,
            attributes: &declaration.attributes,
        };
        let provider = self
            .candidates(&requirement)
            .into_iter()
            .find(|candidate| self.exports.get(candidate).map_or(false, |e| accept(e)))?;

        let id = self.allocate();
        let import = ImportedPackage {
            id,
            name: package.to_string(),
            range: declaration.range.clone(),
            attributes: declaration.attributes.clone(),
            resolution: Resolution::Optional,
            owner,
            provider: None,
            dynamic: true,
        };
        self.imports.insert(id, import);
        self.bind(id, provider);
        debug!(revision = %owner, package, provider = %provider, "动态导入已绑定");
        Some((id, provider))
    }

    /// 提交一条导入到导出的绑定
    pub fn bind(&mut self, import: PackageId, export: PackageId) -> bool {
        if !self.exports.contains_key(&export) {
            return false;
        }
        let Some(imp) = self.imports.get_mut(&import) else {
            return false;
        };
        if let Some(previous) = imp.provider.replace(export) {
            if let Some(prev) = self.exports.get_mut(&previous) {
                prev.consumers.remove(&import);
            }
        }
        if let Some(waiting) = self.waiting.get_mut(&imp.name) {
            waiting.remove(&import);
        }
        if let Some(exp) = self.exports.get_mut(&export) {
            exp.consumers.insert(import);
        }
        true
    }

    /// 解除一个导入的绑定，使其重新等待
    pub fn unbind(&mut self, import: PackageId) {
        let Some(imp) = self.imports.get_mut(&import) else {
            return;
        };
        if let Some(provider) = imp.provider.take() {
            if let Some(exp) = self.exports.get_mut(&provider) {
                exp.consumers.remove(&import);
            }
            self.waiting
                .entry(imp.name.clone())
                .or_default()
                .insert(import);
        }
    }

    // ==================== 查询 ====================

    pub fn export(&self, id: PackageId) -> Option<&ExportedPackage> {
        self.exports.get(&id)
    }

    pub fn import(&self, id: PackageId) -> Option<&ImportedPackage> {
        self.imports.get(&id)
    }

    /// 某个包名下的所有导出，按所属修订版本升序
    pub fn exports_named(&self, name: &str) -> Vec<&ExportedPackage> {
        self.exports_by_name
            .get(name)
            .into_iter()
            .flatten()
            .filter_map(|id| self.exports.get(id))
            .collect()
    }

    /// 等待某个包名的未绑定导入
    pub fn waiting_on(&self, name: &str) -> Vec<PackageId> {
        self.waiting
            .get(name)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// 使用某个导出的修订版本（不含导出者自身）
    pub fn consumer_revisions(&self, export: PackageId) -> BTreeSet<RevisionId> {
        let Some(exp) = self.exports.get(&export) else {
            return BTreeSet::new();
        };
        exp.consumers
            .iter()
            .filter_map(|consumer| self.imports.get(consumer))
            .map(|import| import.owner)
            .filter(|owner| *owner != exp.owner)
            .collect()
    }

    pub fn export_count(&self) -> usize {
        self.exports.len()
    }

    pub fn import_count(&self) -> usize {
        self.imports.len()
    }
}
