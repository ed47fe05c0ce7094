//! 包声明与包连线
//!
//! 声明类型（`*Declaration`）由清单解析产生，是不可变的；
//! [`ExportedPackage`] 与 [`ImportedPackage`] 是登记进包表后的运行期对象，
//! 彼此之间只通过 [`PackageId`] 引用，避免引用环。

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use semver::Version;
use serde::{Deserialize, Serialize};

use super::revision::RevisionId;
use super::version::VersionRange;

/// 匹配模块包符号名的伪属性
pub const BUNDLE_SYMBOLIC_NAME_ATTRIBUTE: &str = "bundle-symbolic-name";
/// 匹配模块包版本的伪属性
pub const BUNDLE_VERSION_ATTRIBUTE: &str = "bundle-version";

/// 包表中导出/导入对象的标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PackageId(pub u64);

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pkg#{}", self.0)
    }
}

/// 解析策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// 必须满足，否则整个修订版本解析失败
    #[default]
    Mandatory,
    /// 无法满足时保持未绑定
    Optional,
}

/// 依赖模块包的可见性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// 目标的包只对依赖方可见
    #[default]
    Private,
    /// 目标的包被再导出
    Reexport,
}

/// 导出声明
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportDeclaration {
    pub name: String,
    pub version: Version,
    pub attributes: BTreeMap<String, String>,
    pub uses: Vec<String>,
    pub mandatory: Vec<String>,
}

/// 导入声明
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportDeclaration {
    pub name: String,
    pub range: VersionRange,
    pub attributes: BTreeMap<String, String>,
    pub resolution: Resolution,
}

impl ImportDeclaration {
    /// 转换为匹配用的需求
    pub fn requirement(&self) -> PackageRequirement<'_> {
        PackageRequirement {
            name: &self.name,
            range: &self.range,
            attributes: &self.attributes,
        }
    }
}

/// 包名模式
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PackagePattern {
    /// 精确包名
    Exact(String),
    /// `prefix.*`，匹配 prefix 下的所有子包（不含 prefix 本身）
    Prefix(String),
    /// `*`，匹配任意包
    Any,
}

impl PackagePattern {
    /// 检查包名是否匹配
    pub fn matches(&self, package: &str) -> bool {
        match self {
            PackagePattern::Exact(name) => name == package,
            PackagePattern::Prefix(prefix) => package
                .strip_prefix(prefix.as_str())
                .map(|rest| rest.starts_with('.') && rest.len() > 1)
                .unwrap_or(false),
            PackagePattern::Any => true,
        }
    }
}

impl fmt::Display for PackagePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackagePattern::Exact(name) => write!(f, "{}", name),
            PackagePattern::Prefix(prefix) => write!(f, "{}.*", prefix),
            PackagePattern::Any => write!(f, "*"),
        }
    }
}

/// 动态导入声明
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicImport {
    pub pattern: PackagePattern,
    pub range: VersionRange,
    pub attributes: BTreeMap<String, String>,
}

/// 模块包依赖声明
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequireDeclaration {
    pub symbolic_name: String,
    pub range: VersionRange,
    pub visibility: Visibility,
    pub resolution: Resolution,
}

/// 对导出包的匹配需求
#[derive(Debug, Clone, Copy)]
pub struct PackageRequirement<'a> {
    pub name: &'a str,
    pub range: &'a VersionRange,
    pub attributes: &'a BTreeMap<String, String>,
}

/// 已登记的导出包
#[derive(Debug, Clone)]
pub struct ExportedPackage {
    pub id: PackageId,
    pub name: String,
    pub version: Version,
    pub attributes: BTreeMap<String, String>,
    pub uses: Vec<String>,
    pub mandatory: Vec<String>,
    /// 提供该包的修订版本
    pub owner: RevisionId,
    /// 提供方符号名（用于伪属性匹配）
    pub owner_name: String,
    /// 提供方版本（用于伪属性匹配）
    pub owner_version: Version,
    /// 再导出时指向原始导出
    pub source: Option<PackageId>,
    /// 当前连线到本导出的导入
    pub consumers: BTreeSet<PackageId>,
}

impl ExportedPackage {
    /// 从声明创建导出包
    pub fn from_declaration(
        id: PackageId,
        owner: RevisionId,
        owner_name: &str,
        owner_version: &Version,
        decl: &ExportDeclaration,
    ) -> Self {
        Self {
            id,
            name: decl.name.clone(),
            version: decl.version.clone(),
            attributes: decl.attributes.clone(),
            uses: decl.uses.clone(),
            mandatory: decl.mandatory.clone(),
            owner,
            owner_name: owner_name.to_string(),
            owner_version: owner_version.clone(),
            source: None,
            consumers: BTreeSet::new(),
        }
    }

    /// 检查本导出是否满足需求
    pub fn satisfies(&self, requirement: &PackageRequirement<'_>) -> bool {
        if self.name != requirement.name || !requirement.range.contains(&self.version) {
            return false;
        }

        for (key, expected) in requirement.attributes {
            let matched = match key.as_str() {
                BUNDLE_SYMBOLIC_NAME_ATTRIBUTE => &self.owner_name == expected,
                BUNDLE_VERSION_ATTRIBUTE => VersionRange::parse(expected)
                    .map(|range| range.contains(&self.owner_version))
                    .unwrap_or(false),
                _ => self.attributes.get(key) == Some(expected),
            };
            if !matched {
                return false;
            }
        }

        self.mandatory
            .iter()
            .all(|attr| requirement.attributes.contains_key(attr))
    }
}

/// 已登记的导入包
#[derive(Debug, Clone)]
pub struct ImportedPackage {
    pub id: PackageId,
    pub name: String,
    pub range: VersionRange,
    pub attributes: BTreeMap<String, String>,
    pub resolution: Resolution,
    pub owner: RevisionId,
    /// 已绑定的提供方导出
    pub provider: Option<PackageId>,
    /// 是否通过动态导入产生
    pub dynamic: bool,
}

impl ImportedPackage {
    /// 从声明创建导入包
    pub fn from_declaration(id: PackageId, owner: RevisionId, decl: &ImportDeclaration) -> Self {
        Self {
            id,
            name: decl.name.clone(),
            range: decl.range.clone(),
            attributes: decl.attributes.clone(),
            resolution: decl.resolution,
            owner,
            provider: None,
            dynamic: false,
        }
    }

    /// 转换为匹配用的需求
    pub fn requirement(&self) -> PackageRequirement<'_> {
        PackageRequirement {
            name: &self.name,
            range: &self.range,
            attributes: &self.attributes,
        }
    }

    pub fn is_optional(&self) -> bool {
        self.resolution == Resolution::Optional
    }
}

/// 已解析的模块包依赖
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequireBundle {
    pub declaration: RequireDeclaration,
    /// 提供方修订版本
    pub provider: Option<RevisionId>,
}
