//! 模块包清单解析器
//!
//! 负责从 bundle.yaml 解析清单，并把文本形式的声明校验、转换为类型化的
//! [`BundleDeclaration`]。所有声明错误在修订版本创建之前一次性报告，
//! 不会部分生效。

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use semver::Version;

use super::manifest::BundleManifest;
use super::package::{
    DynamicImport, ExportDeclaration, ImportDeclaration, PackagePattern, RequireDeclaration,
    Resolution, Visibility,
};
use super::revision::RevisionKind;
use super::version::{parse_version, VersionRange};
use crate::utils::{CoreError, Result};

/// 系统模块包符号名
pub const SYSTEM_BUNDLE_SYMBOLIC_NAME: &str = "system.bundle";

/// 类型化的模块包声明
#[derive(Debug, Clone)]
pub struct BundleDeclaration {
    /// 原始清单
    pub manifest: BundleManifest,
    pub symbolic_name: String,
    pub version: Version,
    pub kind: RevisionKind,
    pub activator: Option<String>,
    /// 按包名排序
    pub exports: Vec<ExportDeclaration>,
    /// 按包名排序
    pub imports: Vec<ImportDeclaration>,
    pub dynamic_imports: Vec<DynamicImport>,
    pub requires: Vec<RequireDeclaration>,
    pub private_packages: BTreeSet<String>,
    pub required_execution_environment: Vec<String>,
}

/// 清单解析器
#[derive(Debug, Clone, Default)]
pub struct ManifestParser;

fn package_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_\-]*(\.[A-Za-z_][A-Za-z0-9_\-]*)*$")
            .expect("包名正则是常量")
    })
}

impl ManifestParser {
    pub fn new() -> Self {
        Self
    }

    /// 从文件解析清单
    pub async fn parse_file(path: &Path) -> Result<BundleManifest> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse_string(&content)
    }

    /// 从 YAML 字符串解析清单，并校验声明
    pub fn parse_string(content: &str) -> Result<BundleManifest> {
        let manifest: BundleManifest = serde_yaml::from_str(content)?;
        Self::declare(&manifest)?;
        Ok(manifest)
    }

    /// 校验清单并转换为类型化声明
    ///
    /// 执行以下验证：
    /// - 符号名与包名格式
    /// - 版本号与版本范围格式
    /// - 导出/导入按包名唯一
    /// - 片段与扩展的约束（扩展不能声明导入、依赖与激活器）
    pub fn declare(manifest: &BundleManifest) -> Result<BundleDeclaration> {
        let mut errors: Vec<String> = Vec::new();

        // 1. 符号名与版本
        if manifest.symbolic_name.is_empty() {
            errors.push("符号名不能为空".to_string());
        } else if !Self::is_valid_package_name(&manifest.symbolic_name) {
            errors.push(format!("符号名 '{}' 格式无效", manifest.symbolic_name));
        }

        let version = match parse_version(&manifest.version) {
            Ok(v) => v,
            Err(e) => {
                errors.push(e.to_string());
                Version::new(0, 0, 0)
            }
        };

        // 2. 导出
        let mut exports = Vec::with_capacity(manifest.exports.len());
        let mut seen = BTreeSet::new();
        for header in &manifest.exports {
            if !Self::is_valid_package_name(&header.name) {
                errors.push(format!("导出包名 '{}' 格式无效", header.name));
                continue;
            }
            if !seen.insert(header.name.clone()) {
                errors.push(format!("重复的导出包 '{}'", header.name));
                continue;
            }
            match parse_version(&header.version) {
                Ok(v) => exports.push(ExportDeclaration {
                    name: header.name.clone(),
                    version: v,
                    attributes: header.attributes.clone(),
                    uses: header.uses.clone(),
                    mandatory: header.mandatory.clone(),
                }),
                Err(e) => errors.push(format!("导出包 '{}': {}", header.name, e)),
            }
        }
        exports.sort_by(|a, b| a.name.cmp(&b.name));

        // 3. 导入
        let mut imports = Vec::with_capacity(manifest.imports.len());
        let mut seen = BTreeSet::new();
        for header in &manifest.imports {
            if !Self::is_valid_package_name(&header.name) {
                errors.push(format!("导入包名 '{}' 格式无效", header.name));
                continue;
            }
            if !seen.insert(header.name.clone()) {
                errors.push(format!("重复的导入包 '{}'", header.name));
                continue;
            }
            match VersionRange::parse(&header.version) {
                Ok(range) => imports.push(ImportDeclaration {
                    name: header.name.clone(),
                    range,
                    attributes: header.attributes.clone(),
                    resolution: if header.optional {
                        Resolution::Optional
                    } else {
                        Resolution::Mandatory
                    },
                }),
                Err(e) => errors.push(format!("导入包 '{}': {}", header.name, e)),
            }
        }
        imports.sort_by(|a, b| a.name.cmp(&b.name));

        // 4. 动态导入
        let mut dynamic_imports = Vec::with_capacity(manifest.dynamic_imports.len());
        for header in &manifest.dynamic_imports {
            let pattern = match Self::parse_pattern(&header.pattern) {
                Some(p) => p,
                None => {
                    errors.push(format!("动态导入模式 '{}' 格式无效", header.pattern));
                    continue;
                }
            };
            match VersionRange::parse(&header.version) {
                Ok(range) => dynamic_imports.push(DynamicImport {
                    pattern,
                    range,
                    attributes: header.attributes.clone(),
                }),
                Err(e) => errors.push(format!("动态导入 '{}': {}", header.pattern, e)),
            }
        }

        // 5. 模块包依赖
        let mut requires = Vec::with_capacity(manifest.requires.len());
        let mut seen = BTreeSet::new();
        for header in &manifest.requires {
            if !Self::is_valid_package_name(&header.symbolic_name) {
                errors.push(format!("依赖模块包名 '{}' 格式无效", header.symbolic_name));
                continue;
            }
            if !seen.insert(header.symbolic_name.clone()) {
                errors.push(format!("重复的模块包依赖 '{}'", header.symbolic_name));
                continue;
            }
            match VersionRange::parse(&header.version) {
                Ok(range) => requires.push(RequireDeclaration {
                    symbolic_name: header.symbolic_name.clone(),
                    range,
                    visibility: if header.reexport {
                        Visibility::Reexport
                    } else {
                        Visibility::Private
                    },
                    resolution: if header.optional {
                        Resolution::Optional
                    } else {
                        Resolution::Mandatory
                    },
                }),
                Err(e) => errors.push(format!("模块包依赖 '{}': {}", header.symbolic_name, e)),
            }
        }

        // 6. 私有包
        for name in &manifest.private_packages {
            if !Self::is_valid_package_name(name) {
                errors.push(format!("私有包名 '{}' 格式无效", name));
            }
        }

        // 7. 种类
        let kind = if manifest.extension {
            match &manifest.fragment_host {
                Some(host) if host.symbolic_name != SYSTEM_BUNDLE_SYMBOLIC_NAME => {
                    errors.push(format!(
                        "扩展模块包只能附着到 '{}'，而不是 '{}'",
                        SYSTEM_BUNDLE_SYMBOLIC_NAME, host.symbolic_name
                    ));
                }
                _ => {}
            }
            if !manifest.imports.is_empty()
                || !manifest.requires.is_empty()
                || !manifest.dynamic_imports.is_empty()
            {
                errors.push("扩展模块包不能声明导入或模块包依赖".to_string());
            }
            if manifest.activator.is_some() {
                errors.push("扩展模块包不能声明激活器".to_string());
            }
            RevisionKind::Extension
        } else if let Some(host) = &manifest.fragment_host {
            if !Self::is_valid_package_name(&host.symbolic_name) {
                errors.push(format!("片段宿主名 '{}' 格式无效", host.symbolic_name));
            }
            match VersionRange::parse(&host.version) {
                Ok(range) => RevisionKind::Fragment {
                    host: host.symbolic_name.clone(),
                    range,
                },
                Err(e) => {
                    errors.push(format!("片段宿主版本: {}", e));
                    RevisionKind::Regular
                }
            }
        } else {
            RevisionKind::Regular
        };

        if !errors.is_empty() {
            return Err(CoreError::InvalidManifest(errors.join("; ")));
        }

        Ok(BundleDeclaration {
            manifest: manifest.clone(),
            symbolic_name: manifest.symbolic_name.clone(),
            version,
            kind,
            activator: manifest.activator.clone(),
            exports,
            imports,
            dynamic_imports,
            requires,
            private_packages: manifest.private_packages.iter().cloned().collect(),
            required_execution_environment: manifest.required_execution_environment.clone(),
        })
    }

    /// 解析包名模式
    pub fn parse_pattern(pattern: &str) -> Option<PackagePattern> {
        let pattern = pattern.trim();
        if pattern == "*" {
            return Some(PackagePattern::Any);
        }
        if let Some(prefix) = pattern.strip_suffix(".*") {
            return Self::is_valid_package_name(prefix)
                .then(|| PackagePattern::Prefix(prefix.to_string()));
        }
        Self::is_valid_package_name(pattern).then(|| PackagePattern::Exact(pattern.to_string()))
    }

    /// 检查包名格式：以点分隔的标识符
    pub fn is_valid_package_name(name: &str) -> bool {
        package_name_regex().is_match(name)
    }
}
