//! 模块包清单定义
//!
//! 定义模块包描述文件 (bundle.yaml) 中的所有数据结构。这里只描述原始的
//! 文本形式，类型化与校验由 [`ManifestParser`](super::parser::ManifestParser) 完成。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 模块包清单
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BundleManifest {
    /// 符号名（与版本一起唯一标识一个模块包内容）
    pub symbolic_name: String,

    /// 版本号
    #[serde(default)]
    pub version: String,

    /// 激活器名称，在激活器注册表中查找
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activator: Option<String>,

    /// 片段宿主声明，存在时本模块包为片段
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment_host: Option<FragmentHostHeader>,

    /// 是否为框架扩展（附着到系统模块包的片段）
    #[serde(default)]
    pub extension: bool,

    /// 导出的包
    #[serde(default)]
    pub exports: Vec<ExportHeader>,

    /// 导入的包
    #[serde(default)]
    pub imports: Vec<ImportHeader>,

    /// 动态导入模式
    #[serde(default)]
    pub dynamic_imports: Vec<DynamicImportHeader>,

    /// 依赖的模块包
    #[serde(default)]
    pub requires: Vec<RequireHeader>,

    /// 私有包（本地内容，不导出）
    #[serde(default)]
    pub private_packages: Vec<String>,

    /// 所需的执行环境，满足其一即可
    #[serde(default)]
    pub required_execution_environment: Vec<String>,
}

impl BundleManifest {
    /// 创建只含符号名与版本的清单
    pub fn new(symbolic_name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            symbolic_name: symbolic_name.into(),
            version: version.into(),
            ..Default::default()
        }
    }

    /// 添加导出包
    pub fn export(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.exports.push(ExportHeader::new(name, version));
        self
    }

    /// 添加导入包
    pub fn import(mut self, name: impl Into<String>, range: impl Into<String>) -> Self {
        self.imports.push(ImportHeader::new(name, range));
        self
    }

    /// 添加可选导入包
    pub fn optional_import(mut self, name: impl Into<String>, range: impl Into<String>) -> Self {
        let mut header = ImportHeader::new(name, range);
        header.optional = true;
        self.imports.push(header);
        self
    }

    /// 添加动态导入模式
    pub fn dynamic_import(mut self, pattern: impl Into<String>) -> Self {
        self.dynamic_imports.push(DynamicImportHeader {
            pattern: pattern.into(),
            version: String::new(),
            attributes: BTreeMap::new(),
        });
        self
    }

    /// 添加模块包依赖
    pub fn require(mut self, symbolic_name: impl Into<String>, range: impl Into<String>) -> Self {
        self.requires.push(RequireHeader {
            symbolic_name: symbolic_name.into(),
            version: range.into(),
            reexport: false,
            optional: false,
        });
        self
    }

    /// 添加可再导出的模块包依赖
    pub fn require_reexport(
        mut self,
        symbolic_name: impl Into<String>,
        range: impl Into<String>,
    ) -> Self {
        self.requires.push(RequireHeader {
            symbolic_name: symbolic_name.into(),
            version: range.into(),
            reexport: true,
            optional: false,
        });
        self
    }

    /// 声明为指定宿主的片段
    pub fn fragment_of(mut self, host: impl Into<String>, range: impl Into<String>) -> Self {
        self.fragment_host = Some(FragmentHostHeader {
            symbolic_name: host.into(),
            version: range.into(),
        });
        self
    }

    /// 设置激活器
    pub fn with_activator(mut self, activator: impl Into<String>) -> Self {
        self.activator = Some(activator.into());
        self
    }

    /// 添加私有包
    pub fn private_package(mut self, name: impl Into<String>) -> Self {
        self.private_packages.push(name.into());
        self
    }
}

/// 导出包声明
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportHeader {
    /// 包名
    pub name: String,

    /// 包版本
    #[serde(default)]
    pub version: String,

    /// 匹配属性
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,

    /// uses 约束：本包的类型引用了哪些其他包
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uses: Vec<String>,

    /// 导入方必须显式指定的属性
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mandatory: Vec<String>,
}

impl ExportHeader {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            ..Default::default()
        }
    }
}

/// 导入包声明
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportHeader {
    /// 包名
    pub name: String,

    /// 版本范围
    #[serde(default)]
    pub version: String,

    /// 匹配属性
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,

    /// 是否为可选导入
    #[serde(default)]
    pub optional: bool,
}

impl ImportHeader {
    pub fn new(name: impl Into<String>, range: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: range.into(),
            ..Default::default()
        }
    }
}

/// 动态导入声明
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicImportHeader {
    /// 包名模式：`com.foo`、`com.foo.*` 或 `*`
    pub pattern: String,

    /// 版本范围
    #[serde(default)]
    pub version: String,

    /// 匹配属性
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

/// 模块包依赖声明
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequireHeader {
    /// 目标模块包符号名
    pub symbolic_name: String,

    /// 版本范围
    #[serde(default)]
    pub version: String,

    /// 是否再导出目标的包
    #[serde(default)]
    pub reexport: bool,

    /// 是否可选
    #[serde(default)]
    pub optional: bool,
}

/// 片段宿主声明
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FragmentHostHeader {
    /// 宿主符号名
    pub symbolic_name: String,

    /// 宿主版本范围
    #[serde(default)]
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_builder() {
        let manifest = BundleManifest::new("com.example.a", "1.0.0")
            .export("pkg.x", "1.0")
            .import("pkg.y", "[1.0,2.0)")
            .with_activator("a.Activator");

        assert_eq!(manifest.exports.len(), 1);
        assert_eq!(manifest.imports[0].version, "[1.0,2.0)");
        assert_eq!(manifest.activator.as_deref(), Some("a.Activator"));
        assert!(manifest.fragment_host.is_none());
    }

    #[test]
    fn test_manifest_yaml_defaults() {
        let yaml = r#"
symbolic_name: com.example.b
imports:
  - name: pkg.x
    version: "[1.0,2.0)"
  - name: pkg.opt
    optional: true
"#;
        let manifest: BundleManifest = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(manifest.version, "");
        assert_eq!(manifest.imports.len(), 2);
        assert!(!manifest.imports[0].optional);
        assert!(manifest.imports[1].optional);
        assert!(!manifest.extension);
    }
}
