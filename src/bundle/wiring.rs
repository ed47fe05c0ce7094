//! 修订版本的连线
//!
//! 保存一个修订版本声明的导出、导入、动态导入与模块包依赖，以及解析成功后
//! 实际接受的导入（活动导入）。包对象本身存放在包表中，这里只保存 [`PackageId`]。

use std::collections::{BTreeMap, BTreeSet};

use super::package::{DynamicImport, PackageId, RequireBundle};
use super::revision::RevisionId;

/// 模块包连线
#[derive(Debug, Clone, Default)]
pub struct BundleWiring {
    /// 导出：包名 -> 导出 id（按包名唯一）
    exports: BTreeMap<String, PackageId>,
    /// 导入：包名 -> 导入 id（按包名唯一）
    imports: BTreeMap<String, PackageId>,
    dynamic_imports: Vec<DynamicImport>,
    requires: Vec<RequireBundle>,
    /// 活动导入：导入 id -> 提供方导出 id，仅在解析成功后存在
    active_imports: Option<BTreeMap<PackageId, PackageId>>,
    /// 通过动态导入接受的导入：包名 -> 导入 id
    dynamic_accepted: BTreeMap<String, PackageId>,
    /// 解析时登记的再导出：包名 -> 导出 id
    reexports: BTreeMap<String, PackageId>,
}

/// 解除连线时需要从包表移除的对象
#[derive(Debug, Default)]
pub struct DetachedPackages {
    pub dynamic_imports: Vec<PackageId>,
    pub reexports: Vec<PackageId>,
    pub required_providers: Vec<RevisionId>,
}

impl BundleWiring {
    pub fn new(
        exports: BTreeMap<String, PackageId>,
        imports: BTreeMap<String, PackageId>,
        dynamic_imports: Vec<DynamicImport>,
        requires: Vec<RequireBundle>,
    ) -> Self {
        Self {
            exports,
            imports,
            dynamic_imports,
            requires,
            active_imports: None,
            dynamic_accepted: BTreeMap::new(),
            reexports: BTreeMap::new(),
        }
    }

    pub fn exports(&self) -> &BTreeMap<String, PackageId> {
        &self.exports
    }

    pub fn imports(&self) -> &BTreeMap<String, PackageId> {
        &self.imports
    }

    pub fn dynamic_imports(&self) -> &[DynamicImport] {
        &self.dynamic_imports
    }

    pub fn requires(&self) -> &[RequireBundle] {
        &self.requires
    }

    pub fn reexports(&self) -> &BTreeMap<String, PackageId> {
        &self.reexports
    }

    pub fn dynamic_accepted(&self) -> &BTreeMap<String, PackageId> {
        &self.dynamic_accepted
    }

    pub fn is_resolved(&self) -> bool {
        self.active_imports.is_some()
    }

    /// 活动导入（未解析时为 `None`）
    pub fn active_imports(&self) -> Option<&BTreeMap<PackageId, PackageId>> {
        self.active_imports.as_ref()
    }

    /// 按包名查找已绑定的提供方导出
    pub fn provider_of(&self, package: &str) -> Option<PackageId> {
        let active = self.active_imports.as_ref()?;
        let import = self
            .imports
            .get(package)
            .or_else(|| self.dynamic_accepted.get(package))?;
        active.get(import).copied()
    }

    /// 所有已绑定的提供方导出
    pub fn bound_providers(&self) -> Vec<PackageId> {
        self.active_imports
            .as_ref()
            .map(|active| active.values().copied().collect())
            .unwrap_or_default()
    }

    /// 追加导出（片段合并或扩展附着时使用）
    pub fn add_export(&mut self, name: String, id: PackageId) {
        self.exports.insert(name, id);
    }

    /// 追加导入（片段附着到未解析宿主时使用）
    pub fn add_import(&mut self, name: String, id: PackageId) {
        self.imports.insert(name, id);
    }

    /// 追加模块包依赖（片段附着到未解析宿主时使用）
    pub fn add_require(&mut self, require: RequireBundle) {
        self.requires.push(require);
    }

    /// 追加动态导入模式
    pub fn add_dynamic_import(&mut self, pattern: DynamicImport) {
        self.dynamic_imports.push(pattern);
    }

    /// 提交解析结果
    pub fn mark_resolved(
        &mut self,
        bindings: BTreeMap<PackageId, PackageId>,
        requires: Vec<RequireBundle>,
        reexports: BTreeMap<String, PackageId>,
    ) {
        self.active_imports = Some(bindings);
        self.requires = requires;
        self.reexports = reexports;
    }

    /// 在已解析的连线上追加一个动态导入绑定，不影响已有绑定
    pub fn accept_dynamic(&mut self, name: String, import: PackageId, provider: PackageId) -> bool {
        match self.active_imports.as_mut() {
            Some(active) => {
                active.insert(import, provider);
                self.dynamic_accepted.insert(name, import);
                true
            }
            None => false,
        }
    }

    /// 片段附着到已解析宿主时，追加片段导入的绑定
    pub fn add_binding(&mut self, import: PackageId, provider: PackageId) -> bool {
        match self.active_imports.as_mut() {
            Some(active) => {
                active.insert(import, provider);
                true
            }
            None => false,
        }
    }

    /// 移除片段合并进来的导出与导入
    pub fn remove_merged(&mut self, ids: &BTreeSet<PackageId>) {
        self.exports.retain(|_, id| !ids.contains(id));
        self.imports.retain(|_, id| !ids.contains(id));
        if let Some(active) = self.active_imports.as_mut() {
            active.retain(|import, _| !ids.contains(import));
        }
    }

    /// 解除连线，回到未解析状态
    pub fn clear(&mut self) -> DetachedPackages {
        self.active_imports = None;
        let detached = DetachedPackages {
            dynamic_imports: std::mem::take(&mut self.dynamic_accepted).into_values().collect(),
            reexports: std::mem::take(&mut self.reexports).into_values().collect(),
            required_providers: self.requires.iter().filter_map(|r| r.provider).collect(),
        };
        for require in &mut self.requires {
            require.provider = None;
        }
        detached
    }
}
