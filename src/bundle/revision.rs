//! 模块包修订版本
//!
//! 每次安装或更新都会产生一个新的修订版本。被取代但导出仍在使用中的修订版本
//! 成为"僵尸"，直到刷新排空其使用者后才被清除。

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use semver::Version;
use serde::{Deserialize, Serialize};

use super::package::RequireBundle;
use super::package_table::PackageTable;
use super::parser::BundleDeclaration;
use super::state::BundleId;
use super::version::VersionRange;
use super::wiring::BundleWiring;

/// 修订版本标识：模块包 id 加代数
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RevisionId {
    pub bundle: BundleId,
    pub generation: u32,
}

impl RevisionId {
    pub fn new(bundle: BundleId, generation: u32) -> Self {
        Self { bundle, generation }
    }

    /// 下一代修订版本
    pub fn next(&self) -> Self {
        Self::new(self.bundle, self.generation + 1)
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.bundle, self.generation)
    }
}

/// 修订版本种类
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevisionKind {
    /// 普通模块包
    Regular,
    /// 片段，附着到匹配的宿主
    Fragment { host: String, range: VersionRange },
    /// 框架扩展，附着到系统模块包
    Extension,
}

impl RevisionKind {
    pub fn is_fragment(&self) -> bool {
        !matches!(self, RevisionKind::Regular)
    }
}

/// 模块包修订版本
#[derive(Debug, Clone)]
pub struct BundleRevision {
    pub id: RevisionId,
    pub declaration: Arc<BundleDeclaration>,
    pub wiring: BundleWiring,
    /// 片段已附着的宿主修订版本
    pub fragment_hosts: BTreeSet<RevisionId>,
    /// 宿主上已附着的片段修订版本
    pub fragments: BTreeSet<RevisionId>,
    /// 通过模块包依赖连线到本修订版本的修订版本
    pub required_by: BTreeSet<RevisionId>,
}

impl BundleRevision {
    pub fn new(id: RevisionId, declaration: Arc<BundleDeclaration>, wiring: BundleWiring) -> Self {
        Self {
            id,
            declaration,
            wiring,
            fragment_hosts: BTreeSet::new(),
            fragments: BTreeSet::new(),
            required_by: BTreeSet::new(),
        }
    }

    /// 创建修订版本并把其声明的导出与导入登记进包表
    pub fn install(id: RevisionId, declaration: Arc<BundleDeclaration>, packages: &mut PackageTable) -> Self {
        let (exports, imports) = packages.register_packages(
            id,
            &declaration.symbolic_name,
            &declaration.version,
            &declaration.exports,
            &declaration.imports,
        );
        let requires = declaration
            .requires
            .iter()
            .cloned()
            .map(|declaration| RequireBundle {
                declaration,
                provider: None,
            })
            .collect();
        let wiring = BundleWiring::new(exports, imports, declaration.dynamic_imports.clone(), requires);
        Self::new(id, declaration, wiring)
    }

    pub fn symbolic_name(&self) -> &str {
        &self.declaration.symbolic_name
    }

    pub fn version(&self) -> &Version {
        &self.declaration.version
    }

    pub fn kind(&self) -> &RevisionKind {
        &self.declaration.kind
    }

    pub fn is_fragment(&self) -> bool {
        self.declaration.kind.is_fragment()
    }

    /// 片段以附着宿主为已解析，普通修订版本以连线为准
    pub fn is_resolved(&self) -> bool {
        if self.is_fragment() {
            !self.fragment_hosts.is_empty()
        } else {
            self.wiring.is_resolved()
        }
    }

    /// 本地内容中是否包含该包（导出包或私有包）
    pub fn contains_local_package(&self, package: &str) -> bool {
        self.wiring.exports().contains_key(package)
            || self.declaration.private_packages.contains(package)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::manifest::BundleManifest;
    use crate::bundle::parser::ManifestParser;

    #[test]
    fn test_install_registers_packages() {
        let mut packages = PackageTable::new();
        let manifest = BundleManifest::new("a", "1.0")
            .export("pkg.a", "1.0")
            .import("pkg.b", "[1.0,2.0)")
            .private_package("pkg.a.impl");
        let declaration = Arc::new(ManifestParser::declare(&manifest).unwrap());
        let revision = BundleRevision::install(RevisionId::new(BundleId(1), 0), declaration, &mut packages);

        assert_eq!(packages.export_count(), 1);
        assert_eq!(packages.import_count(), 1);
        assert!(!revision.is_resolved());
        assert!(revision.contains_local_package("pkg.a"));
        assert!(revision.contains_local_package("pkg.a.impl"));
        assert!(!revision.contains_local_package("pkg.b"));
    }

    #[test]
    fn test_fragment_resolved_when_attached() {
        let mut packages = PackageTable::new();
        let manifest = BundleManifest::new("f", "1.0").fragment_of("host", "1.0");
        let declaration = Arc::new(ManifestParser::declare(&manifest).unwrap());
        let mut revision = BundleRevision::install(RevisionId::new(BundleId(2), 0), declaration, &mut packages);

        assert!(revision.is_fragment());
        assert!(!revision.is_resolved());
        revision.fragment_hosts.insert(RevisionId::new(BundleId(1), 0));
        assert!(revision.is_resolved());
    }
}
