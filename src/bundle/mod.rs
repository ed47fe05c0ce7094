//! 模块包解析模型
//!
//! 包含模块包与包依赖解析的核心组件：
//! - 版本号与版本范围
//! - 清单声明与解析
//! - 包表、连线与修订版本
//! - 模块包身份与生命周期状态
//! - 解析器

pub mod manifest;
pub mod package;
pub mod package_table;
pub mod parser;
pub mod resolver;
pub mod revision;
pub mod state;
pub mod version;
pub mod wiring;

// 重导出常用类型
pub use manifest::{
    BundleManifest, DynamicImportHeader, ExportHeader, FragmentHostHeader, ImportHeader,
    RequireHeader,
};
pub use package::{
    DynamicImport, ExportDeclaration, ExportedPackage, ImportDeclaration, ImportedPackage,
    PackageId, PackagePattern, RequireBundle, RequireDeclaration, Resolution, Visibility,
};
pub use package_table::PackageTable;
pub use parser::{BundleDeclaration, ManifestParser, SYSTEM_BUNDLE_SYMBOLIC_NAME};
pub use resolver::{
    dependents_of, lookup_package, DynamicBinding, FailureReason, PackageSource, ReleaseOutcome,
    ResolutionReport, Resolver, ResolverHook, UsesViolation,
};
pub use revision::{BundleRevision, RevisionId, RevisionKind};
pub use state::{Bundle, BundleId, BundleInfo, BundleState, PendingOperation, SYSTEM_BUNDLE_ID};
pub use version::{format_version, parse_version, VersionRange};
pub use wiring::BundleWiring;
