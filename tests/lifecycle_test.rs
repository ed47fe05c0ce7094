//! 生命周期集成测试
//!
//! 测试启动、停止、更新、卸载与刷新的状态机，僵尸修订版本，片段以及事件顺序。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chips_runtime::{
    BundleActivator, BundleContext, BundleEvent, BundleEventKind, BundleId, BundleManifest,
    BundleState, CoreError, DirectoryStore, FailureReason, Framework, MemoryStore, Result,
    RevisionId, RuntimeConfig,
};
use tempfile::TempDir;

type EventLog = Arc<Mutex<Vec<(BundleId, BundleEventKind)>>>;

async fn setup() -> (Framework, MemoryStore, EventLog) {
    let store = MemoryStore::new();
    let framework = Framework::builder(RuntimeConfig::default())
        .store(Arc::new(store.clone()))
        .build()
        .unwrap();

    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    framework
        .add_listener(Arc::new(move |event: &BundleEvent| {
            sink.lock().unwrap().push((event.bundle, event.kind));
        }))
        .await;
    (framework, store, log)
}

fn drain(log: &EventLog) -> Vec<(BundleId, BundleEventKind)> {
    std::mem::take(&mut *log.lock().unwrap())
}

async fn current(framework: &Framework, id: BundleId) -> RevisionId {
    framework.current_revision(id).await.unwrap().unwrap()
}

/// 记录调用顺序的激活器
#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<String>>,
}

impl Recorder {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl BundleActivator for Recorder {
    async fn start(&self, context: &BundleContext) -> Result<()> {
        self.calls.lock().unwrap().push(format!("start {}", context.bundle_id()));
        Ok(())
    }

    async fn stop(&self, context: &BundleContext) -> Result<()> {
        self.calls.lock().unwrap().push(format!("stop {}", context.bundle_id()));
        Ok(())
    }
}

struct FailingStart;

#[async_trait]
impl BundleActivator for FailingStart {
    async fn start(&self, _context: &BundleContext) -> Result<()> {
        Err(CoreError::Internal("start exploded".to_string()))
    }

    async fn stop(&self, _context: &BundleContext) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_start_stop_events_and_idempotence() {
    use BundleEventKind::*;

    let (framework, store, log) = setup().await;
    store.stage("mem:a", BundleManifest::new("a", "1.0")).await;

    let a = framework.install("mem:a").await.unwrap();
    framework.start(a).await.unwrap();
    assert_eq!(drain(&log), vec![(a, Installed), (a, Resolved), (a, Starting), (a, Started)]);

    // 已 ACTIVE 时启动为空操作
    framework.start(a).await.unwrap();
    assert!(drain(&log).is_empty());

    framework.stop(a).await.unwrap();
    assert_eq!(drain(&log), vec![(a, Stopping), (a, Stopped)]);
    assert_eq!(framework.state(a).await.unwrap(), BundleState::Resolved);

    // 已 RESOLVED 时停止为空操作
    framework.stop(a).await.unwrap();
    assert!(drain(&log).is_empty());
}

#[tokio::test]
async fn test_broadcast_subscription() {
    let (framework, store, _) = setup().await;
    let mut events = framework.subscribe_events();
    store.stage("mem:a", BundleManifest::new("a", "1.0")).await;

    let a = framework.install("mem:a").await.unwrap();
    let event = events.recv().await.unwrap();
    assert_eq!(event.bundle, a);
    assert_eq!(event.kind, BundleEventKind::Installed);
    assert_eq!(event.location, "mem:a");
}

#[tokio::test]
async fn test_activation_failure_rolls_back() {
    use BundleEventKind::*;

    let (framework, store, log) = setup().await;
    framework.register_activator("failing", Arc::new(FailingStart)).await;
    store
        .stage("mem:a", BundleManifest::new("a", "1.0").with_activator("failing"))
        .await;

    let a = framework.install("mem:a").await.unwrap();
    drain(&log);

    let err = framework.start(a).await.unwrap_err();
    assert!(matches!(err, CoreError::ActivationFailed { bundle, .. } if bundle == a));
    assert_eq!(framework.state(a).await.unwrap(), BundleState::Resolved);
    assert_eq!(
        drain(&log),
        vec![(a, Resolved), (a, Starting), (a, Stopping), (a, Stopped)]
    );
    assert!(!store.is_persistent(a).await);
}

/// 更新被使用的提供方：旧修订版本成为僵尸，刷新后清除并重新连线
#[tokio::test]
async fn test_update_creates_zombie_until_refresh() {
    let (framework, store, _) = setup().await;
    store
        .stage("mem:a", BundleManifest::new("a", "1.0").export("pkg.x", "1.0"))
        .await;
    store
        .stage("mem:b", BundleManifest::new("b", "1.0").import("pkg.x", "[1.0,2.0)"))
        .await;

    let a = framework.install("mem:a").await.unwrap();
    let b = framework.install("mem:b").await.unwrap();
    framework.start(b).await.unwrap();

    let old_a = current(&framework, a).await;
    let b_rev = current(&framework, b).await;
    assert_eq!(framework.wiring(b_rev).await.unwrap().imports["pkg.x"], old_a);

    store
        .stage("mem:a", BundleManifest::new("a", "1.1").export("pkg.x", "1.1"))
        .await;
    framework.update(a).await.unwrap();

    let new_a = current(&framework, a).await;
    assert_ne!(new_a, old_a);
    assert_eq!(framework.revisions(a).await.unwrap(), vec![new_a, old_a]);
    assert_eq!(framework.state(a).await.unwrap(), BundleState::Installed);
    assert_eq!(framework.consumers(old_a, "pkg.x").await, vec![b_rev]);

    // B 的连线不受影响
    assert_eq!(framework.state(b).await.unwrap(), BundleState::Active);
    assert_eq!(framework.wiring(b_rev).await.unwrap().imports["pkg.x"], old_a);
    assert!(store.purged().await.is_empty());

    framework.refresh(None).await.unwrap();

    assert_eq!(framework.revisions(a).await.unwrap(), vec![new_a]);
    assert_eq!(store.purged().await, vec![old_a]);
    assert_eq!(framework.state(a).await.unwrap(), BundleState::Resolved);
    assert_eq!(framework.state(b).await.unwrap(), BundleState::Active);
    let b_rev = current(&framework, b).await;
    assert_eq!(framework.wiring(b_rev).await.unwrap().imports["pkg.x"], new_a);
}

/// 更新后才解析的使用方连线到新修订版本，僵尸只为已有使用方保留
#[tokio::test]
async fn test_new_importer_after_update_binds_current_revision() {
    let (framework, store, _) = setup().await;
    store
        .stage("mem:a", BundleManifest::new("a", "1.0").export("pkg.x", "1.0"))
        .await;
    store
        .stage("mem:b", BundleManifest::new("b", "1.0").import("pkg.x", "1.0"))
        .await;
    store
        .stage("mem:c", BundleManifest::new("c", "1.0").import("pkg.x", "1.0"))
        .await;

    let a = framework.install("mem:a").await.unwrap();
    let b = framework.install("mem:b").await.unwrap();
    framework.start(b).await.unwrap();
    let old_a = current(&framework, a).await;
    let b_rev = current(&framework, b).await;

    // 新修订版本导出相同版本的包
    store
        .stage("mem:a", BundleManifest::new("a", "1.1").export("pkg.x", "1.0"))
        .await;
    framework.update(a).await.unwrap();
    let new_a = current(&framework, a).await;
    assert_eq!(framework.revisions(a).await.unwrap(), vec![new_a, old_a]);

    let c = framework.install("mem:c").await.unwrap();
    framework.resolve(c).await.unwrap();
    let c_rev = current(&framework, c).await;
    assert_eq!(framework.wiring(c_rev).await.unwrap().imports["pkg.x"], new_a);
    assert_eq!(framework.state(a).await.unwrap(), BundleState::Resolved);

    assert_eq!(framework.consumers(old_a, "pkg.x").await, vec![b_rev]);
    assert_eq!(framework.consumers(new_a, "pkg.x").await, vec![c_rev]);
    assert_eq!(framework.wiring(b_rev).await.unwrap().imports["pkg.x"], old_a);
}

/// 已卸载模块包的僵尸不会被新的使用方选中
#[tokio::test]
async fn test_new_importer_after_uninstall_finds_no_provider() {
    let (framework, store, _) = setup().await;
    store.stage("mem:a", BundleManifest::new("a", "1.0").export("pkg.x", "1.0")).await;
    store.stage("mem:b", BundleManifest::new("b", "1.0").import("pkg.x", "1.0")).await;
    store.stage("mem:c", BundleManifest::new("c", "1.0").import("pkg.x", "1.0")).await;

    let a = framework.install("mem:a").await.unwrap();
    let b = framework.install("mem:b").await.unwrap();
    framework.resolve(b).await.unwrap();
    let old_a = current(&framework, a).await;

    framework.uninstall(a).await.unwrap();
    assert_eq!(framework.revisions(a).await.unwrap(), vec![old_a]);

    let c = framework.install("mem:c").await.unwrap();
    assert!(matches!(
        framework.resolve(c).await,
        Err(CoreError::ResolutionFailed { reason: FailureReason::NoProvider { .. }, .. })
    ));
    assert_eq!(framework.state(c).await.unwrap(), BundleState::Installed);

    // 重新安装提供方后可以解析
    let a2 = framework.install("mem:a").await.unwrap();
    framework.resolve(c).await.unwrap();
    let c_rev = current(&framework, c).await;
    assert_eq!(
        framework.wiring(c_rev).await.unwrap().imports["pkg.x"],
        current(&framework, a2).await
    );
    let b_rev = current(&framework, b).await;
    assert_eq!(framework.wiring(b_rev).await.unwrap().imports["pkg.x"], old_a);
}

#[tokio::test]
async fn test_update_unused_revision_is_purged() {
    use BundleEventKind::*;

    let (framework, store, log) = setup().await;
    store.stage("mem:a", BundleManifest::new("a", "1.0").export("pkg.x", "1.0")).await;

    let a = framework.install("mem:a").await.unwrap();
    framework.resolve(a).await.unwrap();
    let old = current(&framework, a).await;
    drain(&log);

    store.stage("mem:a", BundleManifest::new("a", "2.0").export("pkg.x", "2.0")).await;
    framework.update(a).await.unwrap();

    assert_eq!(framework.revisions(a).await.unwrap().len(), 1);
    assert_eq!(store.purged().await, vec![old]);
    assert_eq!(drain(&log), vec![(a, Unresolved), (a, Updated)]);
    assert_eq!(framework.bundle(a).await.unwrap().version, "2.0");
}

#[tokio::test]
async fn test_update_restarts_active_bundle() {
    use BundleEventKind::*;

    let (framework, store, log) = setup().await;
    let recorder = Arc::new(Recorder::default());
    framework.register_activator("recorder", recorder.clone()).await;
    store
        .stage("mem:a", BundleManifest::new("a", "1.0").with_activator("recorder"))
        .await;

    let a = framework.install("mem:a").await.unwrap();
    framework.start(a).await.unwrap();
    drain(&log);

    store
        .stage("mem:a", BundleManifest::new("a", "1.1").with_activator("recorder"))
        .await;
    framework.update(a).await.unwrap();

    assert_eq!(framework.state(a).await.unwrap(), BundleState::Active);
    assert_eq!(
        recorder.calls(),
        vec![format!("start {}", a), format!("stop {}", a), format!("start {}", a)]
    );
    assert_eq!(
        drain(&log),
        vec![
            (a, Stopping),
            (a, Stopped),
            (a, Unresolved),
            (a, Updated),
            (a, Resolved),
            (a, Starting),
            (a, Started),
        ]
    );
}

#[tokio::test]
async fn test_update_with_invalid_manifest_changes_nothing() {
    let (framework, store, log) = setup().await;
    store.stage("mem:a", BundleManifest::new("a", "1.0")).await;
    let a = framework.install("mem:a").await.unwrap();
    framework.start(a).await.unwrap();
    let before = framework.revisions(a).await.unwrap();
    drain(&log);

    store.stage("mem:a", BundleManifest::new("a", "not-a-version")).await;
    assert!(framework.update(a).await.is_err());

    assert_eq!(framework.state(a).await.unwrap(), BundleState::Active);
    assert_eq!(framework.revisions(a).await.unwrap(), before);
    assert!(drain(&log).is_empty());
}

/// 卸载被使用的提供方：位置立即释放，僵尸保留到刷新
#[tokio::test]
async fn test_uninstall_keeps_zombie_and_frees_location() {
    use BundleEventKind::*;

    let (framework, store, log) = setup().await;
    store.stage("mem:a", BundleManifest::new("a", "1.0").export("pkg.x", "1.0")).await;
    store.stage("mem:b", BundleManifest::new("b", "1.0").import("pkg.x", "1.0")).await;

    let a = framework.install("mem:a").await.unwrap();
    let b = framework.install("mem:b").await.unwrap();
    framework.resolve(b).await.unwrap();
    let old_a = current(&framework, a).await;
    drain(&log);

    framework.uninstall(a).await.unwrap();
    assert_eq!(drain(&log), vec![(a, Unresolved), (a, Uninstalled)]);
    assert_eq!(framework.state(a).await.unwrap(), BundleState::Uninstalled);
    assert_eq!(framework.current_revision(a).await.unwrap(), None);
    assert_eq!(framework.revisions(a).await.unwrap(), vec![old_a]);
    assert_eq!(framework.find_by_location("mem:a").await, None);
    assert!(matches!(framework.start(a).await, Err(CoreError::BundleUninstalled(_))));
    assert!(matches!(framework.uninstall(a).await, Err(CoreError::BundleUninstalled(_))));

    // 同一位置可以重新安装
    let a2 = framework.install("mem:a").await.unwrap();
    assert_ne!(a2, a);

    let b_rev = current(&framework, b).await;
    assert_eq!(framework.wiring(b_rev).await.unwrap().imports["pkg.x"], old_a);

    framework.refresh(None).await.unwrap();
    assert!(matches!(framework.bundle(a).await, Err(CoreError::BundleNotFound(_))));
    assert_eq!(store.purged().await, vec![old_a]);
    let b_rev = current(&framework, b).await;
    assert_eq!(
        framework.wiring(b_rev).await.unwrap().imports["pkg.x"],
        current(&framework, a2).await
    );
}

#[tokio::test]
async fn test_fragment_attach_and_host_uninstall() {
    let (framework, store, _) = setup().await;
    store.stage("mem:host", BundleManifest::new("host", "1.0").export("host.api", "1.0")).await;
    store
        .stage(
            "mem:frag",
            BundleManifest::new("frag", "1.0")
                .fragment_of("host", "[1.0,2.0)")
                .export("frag.api", "1.0"),
        )
        .await;

    let host = framework.install("mem:host").await.unwrap();
    framework.resolve(host).await.unwrap();
    let frag = framework.install("mem:frag").await.unwrap();
    framework.resolve(frag).await.unwrap();

    let host_rev = current(&framework, host).await;
    let frag_rev = current(&framework, frag).await;
    let host_wiring = framework.wiring(host_rev).await.unwrap();
    assert!(host_wiring.exports.contains_key("frag.api"));
    assert_eq!(host_wiring.fragments, vec![frag_rev]);
    assert_eq!(framework.wiring(frag_rev).await.unwrap().hosts, vec![host_rev]);
    assert_eq!(framework.state(frag).await.unwrap(), BundleState::Resolved);

    framework.uninstall(host).await.unwrap();
    assert_eq!(framework.state(frag).await.unwrap(), BundleState::Installed);
    assert!(matches!(
        framework.failure(frag).await.unwrap(),
        Some(FailureReason::FragmentHostUnavailable { .. })
    ));
}

/// 片段并入宿主的导出仍被使用时，卸载宿主只留下僵尸，片段保持附着直到刷新
#[tokio::test]
async fn test_host_with_consumed_fragment_export_becomes_zombie() {
    let (framework, store, _) = setup().await;
    store.stage("mem:host", BundleManifest::new("host", "1.0")).await;
    store
        .stage(
            "mem:frag",
            BundleManifest::new("frag", "1.0")
                .fragment_of("host", "[1.0,2.0)")
                .export("frag.api", "1.0"),
        )
        .await;
    store
        .stage("mem:user", BundleManifest::new("user", "1.0").import("frag.api", "1.0"))
        .await;

    let host = framework.install("mem:host").await.unwrap();
    framework.resolve(host).await.unwrap();
    let frag = framework.install("mem:frag").await.unwrap();
    framework.resolve(frag).await.unwrap();
    let user = framework.install("mem:user").await.unwrap();
    framework.resolve(user).await.unwrap();

    let host_rev = current(&framework, host).await;
    let frag_rev = current(&framework, frag).await;
    let user_rev = current(&framework, user).await;
    assert_eq!(framework.wiring(user_rev).await.unwrap().imports["frag.api"], frag_rev);

    framework.uninstall(host).await.unwrap();
    assert_eq!(framework.revisions(host).await.unwrap(), vec![host_rev]);
    assert!(store.purged().await.is_empty());
    assert_eq!(framework.state(frag).await.unwrap(), BundleState::Resolved);
    assert_eq!(framework.wiring(host_rev).await.unwrap().fragments, vec![frag_rev]);
    assert_eq!(framework.state(user).await.unwrap(), BundleState::Resolved);
    assert_eq!(framework.wiring(user_rev).await.unwrap().imports["frag.api"], frag_rev);

    framework.refresh(None).await.unwrap();
    assert!(matches!(framework.bundle(host).await, Err(CoreError::BundleNotFound(_))));
    assert_eq!(store.purged().await, vec![host_rev]);
    assert_eq!(framework.state(frag).await.unwrap(), BundleState::Installed);
    assert!(matches!(
        framework.failure(frag).await.unwrap(),
        Some(FailureReason::FragmentHostUnavailable { .. })
    ));
    assert_eq!(framework.state(user).await.unwrap(), BundleState::Installed);
}

#[tokio::test]
async fn test_refresh_restarts_dependents() {
    let (framework, store, _) = setup().await;
    let recorder = Arc::new(Recorder::default());
    framework.register_activator("recorder", recorder.clone()).await;
    store.stage("mem:lib", BundleManifest::new("lib", "1.0").export("lib.api", "1.0")).await;
    store
        .stage(
            "mem:app",
            BundleManifest::new("app", "1.0")
                .import("lib.api", "1.0")
                .with_activator("recorder"),
        )
        .await;
    store.stage("mem:other", BundleManifest::new("other", "1.0")).await;

    let lib = framework.install("mem:lib").await.unwrap();
    let app = framework.install("mem:app").await.unwrap();
    let other = framework.install("mem:other").await.unwrap();
    framework.start(app).await.unwrap();
    framework.start(other).await.unwrap();

    framework.refresh(Some(&[lib])).await.unwrap();

    assert_eq!(framework.state(app).await.unwrap(), BundleState::Active);
    assert_eq!(framework.state(lib).await.unwrap(), BundleState::Resolved);
    assert_eq!(
        recorder.calls(),
        vec![format!("start {}", app), format!("stop {}", app), format!("start {}", app)]
    );
    // 不在闭包中的模块包不受影响
    assert_eq!(framework.state(other).await.unwrap(), BundleState::Active);
}

/// 通过上下文添加的监听器在模块包停止时移除
struct ListeningActivator(Arc<AtomicUsize>);

#[async_trait]
impl BundleActivator for ListeningActivator {
    async fn start(&self, context: &BundleContext) -> Result<()> {
        let seen = self.0.clone();
        context
            .add_listener(Arc::new(move |_event: &BundleEvent| {
                seen.fetch_add(1, Ordering::SeqCst);
            }))
            .await;
        Ok(())
    }

    async fn stop(&self, _context: &BundleContext) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_context_listener_removed_on_stop() {
    let (framework, store, _) = setup().await;
    let seen = Arc::new(AtomicUsize::new(0));
    framework
        .register_activator("listening", Arc::new(ListeningActivator(seen.clone())))
        .await;
    store
        .stage("mem:a", BundleManifest::new("a", "1.0").with_activator("listening"))
        .await;
    store.stage("mem:b", BundleManifest::new("b", "1.0")).await;
    store.stage("mem:c", BundleManifest::new("c", "1.0")).await;

    let a = framework.install("mem:a").await.unwrap();
    framework.start(a).await.unwrap();
    // STARTED 事件
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    framework.install("mem:b").await.unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 2);

    framework.stop(a).await.unwrap();
    let after_stop = seen.load(Ordering::SeqCst);
    framework.install("mem:c").await.unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), after_stop);
}

#[tokio::test]
async fn test_shutdown_keeps_persistent_flags() {
    let (framework, store, _) = setup().await;
    store.stage("mem:a", BundleManifest::new("a", "1.0")).await;
    store.stage("mem:b", BundleManifest::new("b", "1.0")).await;
    let a = framework.install("mem:a").await.unwrap();
    let b = framework.install("mem:b").await.unwrap();
    framework.start(a).await.unwrap();
    framework.start(b).await.unwrap();

    framework.shutdown().await.unwrap();

    assert_eq!(framework.state(a).await.unwrap(), BundleState::Resolved);
    assert_eq!(framework.state(b).await.unwrap(), BundleState::Resolved);
    assert!(store.is_persistent(a).await);
    assert!(store.is_persistent(b).await);
}

#[tokio::test]
async fn test_initialize_from_bundle_directories() {
    let temp = TempDir::new().unwrap();
    let write_bundle = |name: &str, content: &str| {
        let dir = temp.path().join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("bundle.yaml"), content).unwrap();
    };
    write_bundle(
        "api",
        "symbolic_name: greeter.api\nversion: \"1.0\"\nexports:\n  - name: greeter\n    version: \"1.0\"\n",
    );
    write_bundle(
        "impl",
        "symbolic_name: greeter.impl\nversion: \"1.0\"\nimports:\n  - name: greeter\n    version: \"[1.0,2.0)\"\n",
    );
    write_bundle(
        "broken",
        "symbolic_name: broken\nversion: \"1.0\"\nimports:\n  - name: nowhere\n    version: \"1.0\"\n",
    );

    let config = RuntimeConfig::builder()
        .bundle_dir(temp.path())
        .auto_start("greeter.impl")
        .build();
    let framework = Framework::builder(config)
        .store(Arc::new(DirectoryStore::new()))
        .build()
        .unwrap();

    let installed = framework.initialize().await.unwrap();
    assert_eq!(installed.len(), 3);

    let bundles = framework.bundles().await;
    let state_of = |name: &str| {
        bundles
            .iter()
            .find(|info| info.symbolic_name == name)
            .map(|info| info.state)
            .unwrap()
    };
    assert_eq!(state_of("system.bundle"), BundleState::Active);
    assert_eq!(state_of("greeter.api"), BundleState::Resolved);
    assert_eq!(state_of("greeter.impl"), BundleState::Active);
    assert_eq!(state_of("broken"), BundleState::Installed);
    assert!(bundles
        .iter()
        .find(|info| info.symbolic_name == "broken")
        .and_then(|info| info.failure.clone())
        .is_some());
}
