//! 包依赖解析集成测试
//!
//! 通过框架 API 验证提供方选择、失败与恢复、策略否决、属性匹配与系统包。

use std::collections::BTreeMap;
use std::sync::Arc;

use chips_runtime::bundle::manifest::{ExportHeader, ImportHeader};
use chips_runtime::{
    error_code, BundleId, BundleManifest, BundleRevision, BundleState, CoreError, FailureReason,
    Framework, MemoryStore, ResolverHook, RevisionId, RuntimeConfig, SYSTEM_BUNDLE_ID,
};

async fn setup(config: RuntimeConfig, manifests: Vec<(&str, BundleManifest)>) -> (Framework, MemoryStore) {
    let store = MemoryStore::new();
    for (location, manifest) in manifests {
        store.stage(location, manifest).await;
    }
    let framework = Framework::builder(config)
        .store(Arc::new(store.clone()))
        .build()
        .unwrap();
    (framework, store)
}

async fn current(framework: &Framework, id: BundleId) -> RevisionId {
    framework.current_revision(id).await.unwrap().unwrap()
}

/// 选择最高版本，版本相同时选择 id 最小的模块包
#[tokio::test]
async fn test_provider_selection_is_deterministic() {
    let (framework, _) = setup(
        RuntimeConfig::default(),
        vec![
            ("mem:old", BundleManifest::new("old", "1.0").export("pkg.x", "1.0")),
            ("mem:new1", BundleManifest::new("new1", "1.0").export("pkg.x", "1.2")),
            ("mem:new2", BundleManifest::new("new2", "1.0").export("pkg.x", "1.2")),
            ("mem:c1", BundleManifest::new("c1", "1.0").import("pkg.x", "[1.0,2.0)")),
            ("mem:c2", BundleManifest::new("c2", "1.0").import("pkg.x", "[1.0,2.0)")),
        ],
    )
    .await;

    let mut ids = Vec::new();
    for location in ["mem:old", "mem:new1", "mem:new2", "mem:c1", "mem:c2"] {
        ids.push(framework.install(location).await.unwrap());
    }
    let new1 = current(&framework, ids[1]).await;

    framework.resolve(ids[3]).await.unwrap();
    framework.resolve(ids[4]).await.unwrap();

    for consumer in [ids[3], ids[4]] {
        let wiring = framework.wiring(current(&framework, consumer).await).await.unwrap();
        assert_eq!(wiring.imports.get("pkg.x"), Some(&new1));
    }
}

#[tokio::test]
async fn test_no_provider_then_recovery() {
    let (framework, _) = setup(
        RuntimeConfig::default(),
        vec![
            ("mem:c", BundleManifest::new("c", "1.0").import("pkg.y", "[1.0,2.0)")),
            ("mem:d", BundleManifest::new("d", "1.0").export("pkg.y", "1.0")),
        ],
    )
    .await;
    let c = framework.install("mem:c").await.unwrap();

    let err = framework.resolve(c).await.unwrap_err();
    assert!(matches!(
        &err,
        CoreError::ResolutionFailed { reason: FailureReason::NoProvider { package, .. }, .. } if package == "pkg.y"
    ));
    assert_eq!(err.error_code(), error_code::RESOLVE_FAILED);
    assert_eq!(framework.state(c).await.unwrap(), BundleState::Installed);
    assert!(matches!(
        framework.failure(c).await.unwrap(),
        Some(FailureReason::NoProvider { .. })
    ));

    let d = framework.install("mem:d").await.unwrap();
    framework.resolve(c).await.unwrap();
    assert_eq!(framework.state(c).await.unwrap(), BundleState::Resolved);
    assert_eq!(framework.state(d).await.unwrap(), BundleState::Resolved);
    assert!(framework.failure(c).await.unwrap().is_none());
}

#[tokio::test]
async fn test_batch_resolve_isolates_failures() {
    let (framework, _) = setup(
        RuntimeConfig::default(),
        vec![
            ("mem:a", BundleManifest::new("a", "1.0").export("pkg.x", "1.0")),
            ("mem:b", BundleManifest::new("b", "1.0").import("pkg.x", "1.0")),
            ("mem:broken", BundleManifest::new("broken", "1.0").import("pkg.missing", "1.0")),
        ],
    )
    .await;
    let a = framework.install("mem:a").await.unwrap();
    let b = framework.install("mem:b").await.unwrap();
    let broken = framework.install("mem:broken").await.unwrap();

    assert!(!framework.resolve_bundles(None).await.unwrap());
    assert_eq!(framework.state(a).await.unwrap(), BundleState::Resolved);
    assert_eq!(framework.state(b).await.unwrap(), BundleState::Resolved);
    assert_eq!(framework.state(broken).await.unwrap(), BundleState::Installed);
}

#[tokio::test]
async fn test_failed_dependency_is_skipped_for_alternative() {
    let (framework, _) = setup(
        RuntimeConfig::default(),
        vec![
            (
                "mem:bad",
                BundleManifest::new("bad", "1.0")
                    .export("pkg.x", "2.0")
                    .import("pkg.missing", "1.0"),
            ),
            ("mem:good", BundleManifest::new("good", "1.0").export("pkg.x", "1.5")),
            ("mem:user", BundleManifest::new("user", "1.0").import("pkg.x", "[1.0,3.0)")),
        ],
    )
    .await;
    let bad = framework.install("mem:bad").await.unwrap();
    let good = framework.install("mem:good").await.unwrap();
    let user = framework.install("mem:user").await.unwrap();

    framework.resolve(user).await.unwrap();
    let wiring = framework.wiring(current(&framework, user).await).await.unwrap();
    assert_eq!(wiring.imports.get("pkg.x"), Some(&current(&framework, good).await));
    assert_eq!(framework.state(bad).await.unwrap(), BundleState::Installed);
}

struct BlockNamed(&'static str);

impl ResolverHook for BlockNamed {
    fn filter_resolvable(&self, revision: &BundleRevision) -> bool {
        revision.symbolic_name() != self.0
    }
}

#[tokio::test]
async fn test_hook_rejection_is_distinct_from_no_provider() {
    let store = MemoryStore::new();
    store.stage("mem:blocked", BundleManifest::new("blocked", "1.0")).await;
    let framework = Framework::builder(RuntimeConfig::default())
        .store(Arc::new(store))
        .resolver_hook(Arc::new(BlockNamed("blocked")))
        .build()
        .unwrap();

    let id = framework.install("mem:blocked").await.unwrap();
    let err = framework.resolve(id).await.unwrap_err();
    assert_eq!(err.error_code(), error_code::RESOLVE_REJECTED);
    assert!(framework.failure(id).await.unwrap().unwrap().is_policy_rejection());
}

#[tokio::test]
async fn test_attribute_matching() {
    let mut export = ExportHeader::new("pkg.attr", "1.0");
    export.attributes.insert("vendor".to_string(), "acme".to_string());
    let mut provider = BundleManifest::new("provider", "1.0");
    provider.exports.push(export);

    let import_with = |vendor: &str| {
        let mut import = ImportHeader::new("pkg.attr", "1.0");
        import.attributes = BTreeMap::from([("vendor".to_string(), vendor.to_string())]);
        let mut manifest = BundleManifest::new(format!("wants-{}", vendor), "1.0");
        manifest.imports.push(import);
        manifest
    };

    let (framework, _) = setup(
        RuntimeConfig::default(),
        vec![
            ("mem:provider", provider),
            ("mem:acme", import_with("acme")),
            ("mem:other", import_with("other")),
        ],
    )
    .await;
    framework.install("mem:provider").await.unwrap();
    let acme = framework.install("mem:acme").await.unwrap();
    let other = framework.install("mem:other").await.unwrap();

    framework.resolve(acme).await.unwrap();
    assert!(matches!(
        framework.resolve(other).await,
        Err(CoreError::ResolutionFailed { reason: FailureReason::NoProvider { .. }, .. })
    ));
}

#[tokio::test]
async fn test_system_packages_and_execution_environment() {
    let config = RuntimeConfig::builder()
        .system_package("chips.api", "2.1")
        .execution_environment("chips-1")
        .build();
    let mut needs_env = BundleManifest::new("needs-env", "1.0");
    needs_env.required_execution_environment = vec!["chips-9".to_string()];

    let (framework, _) = setup(
        config,
        vec![
            ("mem:client", BundleManifest::new("client", "1.0").import("chips.api", "[2.0,3.0)")),
            ("mem:env", needs_env),
        ],
    )
    .await;

    let client = framework.install("mem:client").await.unwrap();
    framework.resolve(client).await.unwrap();
    let wiring = framework.wiring(current(&framework, client).await).await.unwrap();
    assert_eq!(wiring.imports["chips.api"].bundle, SYSTEM_BUNDLE_ID);

    let env = framework.install("mem:env").await.unwrap();
    assert!(matches!(
        framework.resolve(env).await,
        Err(CoreError::ResolutionFailed { reason: FailureReason::ExecutionEnvironment { .. }, .. })
    ));
}

#[tokio::test]
async fn test_require_bundle_visible_to_class_lookup() {
    let (framework, _) = setup(
        RuntimeConfig::default(),
        vec![
            ("mem:lib", BundleManifest::new("lib", "1.0").export("lib.api", "1.0")),
            ("mem:app", BundleManifest::new("app", "1.0").require("lib", "[1.0,2.0)")),
            ("mem:needs", BundleManifest::new("needs", "1.0").require("absent", "1.0")),
        ],
    )
    .await;
    let lib = framework.install("mem:lib").await.unwrap();
    let app = framework.install("mem:app").await.unwrap();
    let needs = framework.install("mem:needs").await.unwrap();

    framework.resolve(app).await.unwrap();
    let app_rev = current(&framework, app).await;
    let lib_rev = current(&framework, lib).await;
    assert_eq!(
        framework.find_class_provider(app_rev, "lib.api.Client").await.unwrap(),
        Some(lib_rev)
    );
    assert_eq!(framework.wiring(app_rev).await.unwrap().required, vec![lib_rev]);

    assert!(matches!(
        framework.resolve(needs).await,
        Err(CoreError::ResolutionFailed { reason: FailureReason::MissingRequiredBundle { .. }, .. })
    ));
}

/// 动态导入与普通导入一样会解析尚未解析的提供方
#[tokio::test]
async fn test_dynamic_import_resolves_installed_provider() {
    let (framework, _) = setup(
        RuntimeConfig::default(),
        vec![
            ("mem:app", BundleManifest::new("app", "1.0").dynamic_import("com.plugins.*")),
            ("mem:video", BundleManifest::new("video", "1.0").export("com.plugins.video", "1.0")),
            (
                "mem:audio",
                BundleManifest::new("audio", "1.0")
                    .export("com.plugins.audio", "1.0")
                    .import("com.missing", "1.0"),
            ),
        ],
    )
    .await;
    let app = framework.install("mem:app").await.unwrap();
    framework.resolve(app).await.unwrap();
    let video = framework.install("mem:video").await.unwrap();
    let audio = framework.install("mem:audio").await.unwrap();
    assert_eq!(framework.state(video).await.unwrap(), BundleState::Installed);

    let app_rev = current(&framework, app).await;
    let video_rev = current(&framework, video).await;
    assert_eq!(
        framework.find_class_provider(app_rev, "com.plugins.video.Player").await.unwrap(),
        Some(video_rev)
    );
    assert_eq!(framework.state(video).await.unwrap(), BundleState::Resolved);
    assert_eq!(framework.wiring(app_rev).await.unwrap().imports["com.plugins.video"], video_rev);

    // 无法解析的提供方不会被绑定
    assert_eq!(
        framework.find_class_provider(app_rev, "com.plugins.audio.Mixer").await.unwrap(),
        None
    );
    assert_eq!(framework.state(audio).await.unwrap(), BundleState::Installed);
}
