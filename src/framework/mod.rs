//! 模块包框架
//!
//! 对外提供安装、解析、启动、停止、更新、卸载与刷新等生命周期操作。
//!
//! 所有结构性修改都在唯一的生命周期锁内进行；激活器在锁外的模块包线程池中
//! 执行，期间模块包上的进行中操作阻止其他状态变更。事件在操作释放锁之前
//! 按产生顺序分发。
//!
//! # 使用示例
//!
//! ```ignore
//! use std::sync::Arc;
//! use chips_runtime::{BundleManifest, Framework, MemoryStore, RuntimeConfig};
//!
//! let store = MemoryStore::new();
//! store.stage("mem:a", BundleManifest::new("a", "1.0").export("pkg.x", "1.0")).await;
//!
//! let framework = Framework::builder(RuntimeConfig::default())
//!     .store(Arc::new(store))
//!     .build()?;
//! let id = framework.install("mem:a").await?;
//! framework.start(id).await?;
//! ```

pub mod events;
pub mod hooks;
pub mod lock;
pub mod registry;
pub mod storage;
pub mod worker;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, MutexGuard};
use tracing::{debug, info, instrument, warn};

use crate::bundle::{
    format_version, lookup_package, Bundle, BundleId, BundleInfo, BundleState, FailureReason,
    ManifestParser, PackageSource, PendingOperation, RevisionId, SYSTEM_BUNDLE_ID,
};
use crate::core::RuntimeConfig;
use crate::utils::{CoreError, Result};

pub use events::{BundleEvent, BundleEventKind, EventCallback, EventDispatcher, ListenerId};
pub use hooks::{ActivatorRegistry, LifecycleAction, PermissionGate, ResolverHook, ServiceRegistry};
pub use lock::LifecycleLock;
pub use registry::{FrameworkState, SYSTEM_BUNDLE_LOCATION};
pub use storage::{ArchiveStore, DirectoryStore, MemoryStore, MANIFEST_FILE};
pub use worker::{ActivatorPhase, BundleActivator, BundleContext, WorkOutcome, WorkerPool};

type StateGuard<'a> = MutexGuard<'a, FrameworkState>;

/// 修订版本连线的对外快照
#[derive(Debug, Clone, Serialize)]
pub struct WiringInfo {
    pub revision: RevisionId,
    pub resolved: bool,
    /// 包名 -> 提供方修订版本（含动态导入）
    pub imports: BTreeMap<String, RevisionId>,
    /// 包名 -> 版本（含并入的片段导出）
    pub exports: BTreeMap<String, String>,
    /// 连线到的依赖模块包
    pub required: Vec<RevisionId>,
    pub fragments: Vec<RevisionId>,
    pub hosts: Vec<RevisionId>,
}

struct FrameworkInner {
    config: RuntimeConfig,
    lock: LifecycleLock,
    dispatcher: EventDispatcher,
    workers: WorkerPool,
    activators: ActivatorRegistry,
    store: Arc<dyn ArchiveStore>,
    permission_gate: Option<Arc<dyn PermissionGate>>,
    resolver_hook: Option<Arc<dyn ResolverHook>>,
    service_registry: Option<Arc<dyn ServiceRegistry>>,
}

/// 框架构建器
pub struct FrameworkBuilder {
    config: RuntimeConfig,
    store: Option<Arc<dyn ArchiveStore>>,
    permission_gate: Option<Arc<dyn PermissionGate>>,
    resolver_hook: Option<Arc<dyn ResolverHook>>,
    service_registry: Option<Arc<dyn ServiceRegistry>>,
}

impl FrameworkBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            store: None,
            permission_gate: None,
            resolver_hook: None,
            service_registry: None,
        }
    }

    /// 设置存档存储，默认为 [`MemoryStore`]
    pub fn store(mut self, store: Arc<dyn ArchiveStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn permission_gate(mut self, gate: Arc<dyn PermissionGate>) -> Self {
        self.permission_gate = Some(gate);
        self
    }

    pub fn resolver_hook(mut self, hook: Arc<dyn ResolverHook>) -> Self {
        self.resolver_hook = Some(hook);
        self
    }

    pub fn service_registry(mut self, registry: Arc<dyn ServiceRegistry>) -> Self {
        self.service_registry = Some(registry);
        self
    }

    /// 构建框架
    pub fn build(self) -> Result<Framework> {
        self.config.validate()?;
        let state = FrameworkState::new(&self.config.resolver)?;
        let workers = WorkerPool::new(self.config.lifecycle.worker_count);
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn ArchiveStore>);

        info!(
            workers = workers.size(),
            state_change_timeout_ms = self.config.lifecycle.state_change_timeout_ms,
            "框架已创建"
        );

        Ok(Framework {
            inner: Arc::new(FrameworkInner {
                config: self.config,
                lock: LifecycleLock::new(state),
                dispatcher: EventDispatcher::new(),
                workers,
                activators: ActivatorRegistry::new(),
                store,
                permission_gate: self.permission_gate,
                resolver_hook: self.resolver_hook,
                service_registry: self.service_registry,
            }),
        })
    }
}

/// 模块包框架
#[derive(Clone)]
pub struct Framework {
    inner: Arc<FrameworkInner>,
}

impl Framework {
    /// 使用默认协作方创建框架
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        FrameworkBuilder::new(config).build()
    }

    /// 创建框架构建器
    pub fn builder(config: RuntimeConfig) -> FrameworkBuilder {
        FrameworkBuilder::new(config)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub(crate) fn dispatcher(&self) -> &EventDispatcher {
        &self.inner.dispatcher
    }

    // ==================== 协作方与事件 ====================

    /// 注册激活器，清单中 `activator` 字段按名称引用
    pub async fn register_activator(&self, name: impl Into<String>, activator: Arc<dyn BundleActivator>) {
        self.inner.activators.register(name, activator).await;
    }

    /// 添加框架级生命周期监听器
    pub async fn add_listener(&self, callback: EventCallback) -> ListenerId {
        self.inner.dispatcher.add_listener(None, callback).await
    }

    pub async fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.dispatcher.remove_listener(id).await
    }

    /// 订阅生命周期事件广播
    pub fn subscribe_events(&self) -> broadcast::Receiver<BundleEvent> {
        self.inner.dispatcher.subscribe()
    }

    fn check_permission(&self, bundle: Option<BundleId>, action: LifecycleAction) -> Result<()> {
        let Some(gate) = &self.inner.permission_gate else {
            return Ok(());
        };
        gate.check(bundle, action).map_err(|reason| {
            warn!(bundle_id = ?bundle, action = %action, reason = %reason, "权限检查拒绝操作");
            CoreError::PermissionDenied(format!("{}: {}", action, reason))
        })
    }

    fn reject_system_bundle(id: BundleId, operation: &str) -> Result<()> {
        if id == SYSTEM_BUNDLE_ID {
            return Err(CoreError::InvalidState {
                bundle: id,
                operation: operation.to_string(),
                reason: "系统模块包不受生命周期操作管理".to_string(),
            });
        }
        Ok(())
    }

    /// 分发排队的事件，保持锁与占用
    async fn flush(&self, guard: &mut StateGuard<'_>) {
        let events = guard.take_events();
        self.inner.dispatcher.dispatch(events).await;
    }

    /// 分发排队的事件，结束占用并释放锁
    async fn finish(&self, mut guard: StateGuard<'_>, bundles: &[BundleId]) {
        self.flush(&mut guard).await;
        self.inner.lock.release(guard, bundles);
    }

    /// 清除已释放修订版本的存储资源
    async fn purge(&self, revisions: Vec<RevisionId>) {
        for revision in revisions {
            if let Err(e) = self.inner.store.purge(revision).await {
                warn!(revision = %revision, error = %e, "清除修订版本存储失败");
            }
        }
    }

    // ==================== 安装与解析 ====================

    /// 从位置安装模块包
    ///
    /// 位置已安装时直接返回已有的模块包，不产生事件。
    #[instrument(skip(self))]
    pub async fn install(&self, location: &str) -> Result<BundleId> {
        self.check_permission(None, LifecycleAction::Install)?;
        if let Some(id) = self.inner.lock.lock().await.location_of(location) {
            debug!(bundle_id = %id, "位置已安装");
            return Ok(id);
        }

        let manifest = self.inner.store.read_manifest(location).await?;
        let declaration = ManifestParser::declare(&manifest)?;

        let mut guard = self.inner.lock.lock().await;
        if let Some(id) = guard.location_of(location) {
            return Ok(id);
        }
        let id = guard.install_bundle(location, manifest, declaration);
        self.finish(guard, &[]).await;
        Ok(id)
    }

    /// 在锁内解析模块包的当前修订版本
    fn resolve_locked(&self, state: &mut FrameworkState, id: BundleId) -> Result<()> {
        let bundle = state.bundle(id)?;
        if bundle.state == BundleState::Uninstalled {
            return Err(CoreError::BundleUninstalled(id));
        }
        if bundle.state.is_resolved() {
            return Ok(());
        }
        let revision = bundle
            .current_revision()
            .ok_or(CoreError::BundleUninstalled(id))?;

        let report = state.resolve_revisions(&[revision], self.inner.resolver_hook.as_deref());
        match report.failures.get(&revision) {
            Some(reason) => Err(CoreError::ResolutionFailed {
                bundle: id,
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    /// 解析模块包；已解析时为空操作
    #[instrument(skip(self), fields(bundle_id = %id))]
    pub async fn resolve(&self, id: BundleId) -> Result<()> {
        self.check_permission(Some(id), LifecycleAction::Resolve)?;
        let mut guard = self
            .inner
            .lock
            .claim(id, PendingOperation::Resolving, self.inner.config.lifecycle.state_change_timeout(), false)
            .await?;
        let result = self.resolve_locked(&mut guard, id);
        self.finish(guard, &[id]).await;
        result
    }

    /// 解析一批 INSTALLED 模块包（`None` 表示全部），返回是否全部解析成功
    ///
    /// 一个模块包失败不影响其他模块包。
    #[instrument(skip(self))]
    pub async fn resolve_bundles(&self, bundles: Option<&[BundleId]>) -> Result<bool> {
        match bundles {
            Some(ids) => {
                for id in ids {
                    self.check_permission(Some(*id), LifecycleAction::Resolve)?;
                }
            }
            None => self.check_permission(None, LifecycleAction::Resolve)?,
        }

        let requested = bundles.map(<[BundleId]>::to_vec);
        let (mut guard, claimed) = self
            .inner
            .lock
            .claim_many(
                |state| {
                    let candidates = match &requested {
                        Some(ids) => ids.clone(),
                        None => state.bundle_ids(),
                    };
                    let mut selected = Vec::new();
                    for id in candidates {
                        if state.bundle(id)?.state == BundleState::Installed {
                            selected.push(id);
                        }
                    }
                    Ok(selected)
                },
                PendingOperation::Resolving,
                self.inner.config.lifecycle.state_change_timeout(),
                false,
            )
            .await?;

        let targets: Vec<RevisionId> = claimed
            .iter()
            .filter_map(|id| guard.bundle(*id).ok().and_then(Bundle::current_revision))
            .collect();
        let report = guard.resolve_revisions(&targets, self.inner.resolver_hook.as_deref());
        info!(
            resolved = report.resolved.len(),
            failed = report.failures.len(),
            "批量解析完成"
        );
        self.finish(guard, &claimed).await;
        Ok(report.is_success())
    }

    // ==================== 启动与停止 ====================

    /// 查找模块包当前修订版本声明的激活器
    async fn activator_for(&self, state: &FrameworkState, id: BundleId) -> Result<Option<Arc<dyn BundleActivator>>> {
        let name = state
            .bundle(id)?
            .current_revision()
            .and_then(|rev| state.revision(rev))
            .and_then(|rev| rev.declaration.activator.clone());
        let Some(name) = name else {
            return Ok(None);
        };
        match self.inner.activators.get(&name).await {
            Some(activator) => Ok(Some(activator)),
            None => Err(CoreError::ActivationFailed {
                bundle: id,
                reason: format!("激活器 '{}' 未注册", name),
            }),
        }
    }

    /// 启动已占用的模块包，返回锁与结果
    ///
    /// 失败或被中止时经 STOPPING 回滚到 RESOLVED。
    async fn activate<'a>(&'a self, mut guard: StateGuard<'a>, id: BundleId) -> (StateGuard<'a>, Result<()>) {
        let prepared = self.prepare_activation(&mut guard, id).await;
        let (activator, abort) = match prepared {
            Ok(Some(prepared)) => prepared,
            Ok(None) => return (guard, Ok(())),
            Err(e) => return (guard, Err(e)),
        };

        self.flush(&mut guard).await;
        drop(guard);

        let outcome = match activator {
            Some(activator) => {
                self.inner
                    .workers
                    .run(
                        activator,
                        BundleContext::new(id, self.clone()),
                        ActivatorPhase::Start,
                        abort.clone(),
                        self.inner.config.lifecycle.activation_timeout(),
                    )
                    .await
            }
            None if abort.load(Ordering::SeqCst) => WorkOutcome::Aborted,
            None => WorkOutcome::Completed,
        };

        let mut guard = self.inner.lock.lock().await;
        let still_starting = guard
            .bundle(id)
            .map_or(false, |bundle| bundle.state == BundleState::Starting);

        let reason = match outcome {
            WorkOutcome::Completed if still_starting => {
                guard.transition(id, BundleState::Active, Some(BundleEventKind::Started));
                info!(bundle_id = %id, "模块包已启动");
                return (guard, Ok(()));
            }
            WorkOutcome::Completed => "激活期间状态已改变".to_string(),
            WorkOutcome::Aborted => "激活已被中止".to_string(),
            WorkOutcome::Failed(reason) => reason,
        };

        warn!(bundle_id = %id, reason = %reason, "模块包启动失败，回滚");
        let (guard, _) = self.deactivate(guard, id).await;
        (guard, Err(CoreError::ActivationFailed { bundle: id, reason }))
    }

    /// 检查并进入 STARTING；已 ACTIVE 时返回 `None`
    async fn prepare_activation(
        &self,
        guard: &mut StateGuard<'_>,
        id: BundleId,
    ) -> Result<Option<(Option<Arc<dyn BundleActivator>>, Arc<AtomicBool>)>> {
        match guard.bundle(id)?.state {
            BundleState::Uninstalled => return Err(CoreError::BundleUninstalled(id)),
            BundleState::Active => return Ok(None),
            state if !state.can_start() => {
                return Err(CoreError::InvalidState {
                    bundle: id,
                    operation: "start".to_string(),
                    reason: format!("模块包正处于 {} 状态", state),
                })
            }
            _ => {}
        }
        if guard.is_fragment(id) {
            return Err(CoreError::FragmentNotStartable(id));
        }

        self.resolve_locked(guard, id)?;
        let activator = self.activator_for(guard, id).await?;

        let abort = Arc::new(AtomicBool::new(false));
        guard.bundle_mut(id)?.abort = Some(abort.clone());
        guard.transition(id, BundleState::Starting, Some(BundleEventKind::Starting));
        Ok(Some((activator, abort)))
    }

    /// 停止已占用的模块包：经 STOPPING 到 RESOLVED，尽力调用激活器的 `stop`
    ///
    /// 无论 `stop` 是否成功，状态都会到达 RESOLVED，归属于模块包的监听器与服务被清除。
    async fn deactivate<'a>(&'a self, mut guard: StateGuard<'a>, id: BundleId) -> (StateGuard<'a>, Result<()>) {
        let activator = match self.activator_for(&guard, id).await {
            Ok(activator) => activator,
            Err(e) => {
                warn!(bundle_id = %id, error = %e, "找不到激活器，跳过 stop");
                None
            }
        };
        let abort = Arc::new(AtomicBool::new(false));
        if let Ok(bundle) = guard.bundle_mut(id) {
            bundle.abort = Some(abort.clone());
        }
        guard.transition(id, BundleState::Stopping, Some(BundleEventKind::Stopping));
        self.flush(&mut guard).await;
        drop(guard);

        let outcome = match activator {
            Some(activator) => {
                self.inner
                    .workers
                    .run(
                        activator,
                        BundleContext::new(id, self.clone()),
                        ActivatorPhase::Stop,
                        abort,
                        self.inner.config.lifecycle.activation_timeout(),
                    )
                    .await
            }
            None => WorkOutcome::Completed,
        };

        let removed = self.inner.dispatcher.remove_owned(id).await;
        let released = self
            .inner
            .service_registry
            .as_ref()
            .map_or(0, |registry| registry.release_bundle(id));

        let mut guard = self.inner.lock.lock().await;
        if let Ok(bundle) = guard.bundle_mut(id) {
            bundle.abort = None;
        }
        guard.transition(id, BundleState::Resolved, Some(BundleEventKind::Stopped));
        info!(bundle_id = %id, listeners = removed, services = released, "模块包已停止");

        let result = match outcome {
            WorkOutcome::Completed => Ok(()),
            WorkOutcome::Aborted => Err(CoreError::ActivationFailed {
                bundle: id,
                reason: "停止已被中止".to_string(),
            }),
            WorkOutcome::Failed(reason) => Err(CoreError::ActivationFailed { bundle: id, reason }),
        };
        (guard, result)
    }

    /// 启动模块包，必要时先解析；已 ACTIVE 时为空操作
    #[instrument(skip(self), fields(bundle_id = %id))]
    pub async fn start(&self, id: BundleId) -> Result<()> {
        self.check_permission(Some(id), LifecycleAction::Start)?;
        let guard = self
            .inner
            .lock
            .claim(id, PendingOperation::Activating, self.inner.config.lifecycle.state_change_timeout(), false)
            .await?;
        let was_active = guard.bundle(id).map_or(false, |b| b.state == BundleState::Active);

        let (guard, result) = self.activate(guard, id).await;
        self.finish(guard, &[id]).await;

        if result.is_ok() && !was_active {
            if let Err(e) = self.inner.store.set_persistent_flag(id, true).await {
                warn!(bundle_id = %id, error = %e, "设置持久启动标志失败");
            }
        }
        result
    }

    /// 停止模块包；已 RESOLVED 或 INSTALLED 时为空操作
    #[instrument(skip(self), fields(bundle_id = %id))]
    pub async fn stop(&self, id: BundleId) -> Result<()> {
        self.stop_bundle(id, true).await
    }

    async fn stop_bundle(&self, id: BundleId, clear_persistent: bool) -> Result<()> {
        self.check_permission(Some(id), LifecycleAction::Stop)?;
        Self::reject_system_bundle(id, "stop")?;
        let guard = self
            .inner
            .lock
            .claim(id, PendingOperation::Deactivating, self.inner.config.lifecycle.state_change_timeout(), false)
            .await?;

        let (guard, result) = match guard.bundle(id).map(|b| b.state) {
            Err(e) => (guard, Err(e)),
            Ok(BundleState::Uninstalled) => (guard, Err(CoreError::BundleUninstalled(id))),
            Ok(BundleState::Active) => self.deactivate(guard, id).await,
            Ok(_) => (guard, Ok(())),
        };
        let stopped = result.is_ok();
        self.finish(guard, &[id]).await;

        if stopped && clear_persistent {
            if let Err(e) = self.inner.store.set_persistent_flag(id, false).await {
                warn!(bundle_id = %id, error = %e, "清除持久启动标志失败");
            }
        }
        result
    }

    // ==================== 更新与卸载 ====================

    /// 更新模块包
    ///
    /// 新清单在停止模块包之前读取并校验，失败时不做任何修改。旧修订版本的导出
    /// 仍在使用时保留为僵尸；此前 ACTIVE 的模块包会重新启动，启动错误返回给调用方。
    #[instrument(skip(self), fields(bundle_id = %id))]
    pub async fn update(&self, id: BundleId) -> Result<()> {
        self.check_permission(Some(id), LifecycleAction::Update)?;
        Self::reject_system_bundle(id, "update")?;

        let location = {
            let guard = self.inner.lock.lock().await;
            let bundle = guard.bundle(id)?;
            if bundle.state == BundleState::Uninstalled {
                return Err(CoreError::BundleUninstalled(id));
            }
            bundle.location.clone()
        };
        let manifest = self.inner.store.read_manifest(&location).await?;
        let declaration = ManifestParser::declare(&manifest)?;

        let mut guard = self
            .inner
            .lock
            .claim(id, PendingOperation::Updating, self.inner.config.lifecycle.state_change_timeout(), false)
            .await?;

        let state = match guard.bundle(id) {
            Ok(bundle) if bundle.state != BundleState::Uninstalled => bundle.state,
            Ok(_) => {
                self.finish(guard, &[id]).await;
                return Err(CoreError::BundleUninstalled(id));
            }
            Err(e) => {
                self.finish(guard, &[id]).await;
                return Err(e);
            }
        };

        let was_active = state == BundleState::Active;
        if was_active {
            let (stopped, result) = self.deactivate(guard, id).await;
            guard = stopped;
            if let Err(e) = result {
                warn!(bundle_id = %id, error = %e, "更新前停止模块包失败");
            }
        }

        let (old, was_resolved) = match guard.bundle(id) {
            Ok(bundle) => (bundle.current_revision(), bundle.state.is_resolved()),
            Err(_) => (None, false),
        };
        let mut purged = Vec::new();
        if let Err(e) = guard.new_revision(id, manifest, declaration) {
            self.finish(guard, &[id]).await;
            return Err(e);
        }
        if let Some(old) = old {
            if guard.release_revision(old, false) {
                purged.push(old);
            }
        }
        guard.transition(
            id,
            BundleState::Installed,
            was_resolved.then_some(BundleEventKind::Unresolved),
        );
        guard.emit(id, BundleEventKind::Updated);
        info!(bundle_id = %id, zombie = purged.is_empty() && old.is_some(), "模块包已更新");

        let (guard, result) = if was_active {
            self.activate(guard, id).await
        } else {
            (guard, Ok(()))
        };
        self.finish(guard, &[id]).await;
        self.purge(purged).await;
        result
    }

    /// 卸载模块包
    ///
    /// 等待上限较长，并会中止进行中的激活/停用。位置立即释放；导出仍在使用的
    /// 修订版本保留为僵尸，直到刷新。
    #[instrument(skip(self), fields(bundle_id = %id))]
    pub async fn uninstall(&self, id: BundleId) -> Result<()> {
        self.check_permission(Some(id), LifecycleAction::Uninstall)?;
        Self::reject_system_bundle(id, "uninstall")?;

        let mut guard = self
            .inner
            .lock
            .claim(id, PendingOperation::Uninstalling, self.inner.config.lifecycle.uninstall_timeout(), true)
            .await?;

        let state = match guard.bundle(id) {
            Ok(bundle) if bundle.state != BundleState::Uninstalled => bundle.state,
            Ok(_) => {
                self.finish(guard, &[id]).await;
                return Err(CoreError::BundleUninstalled(id));
            }
            Err(e) => {
                self.finish(guard, &[id]).await;
                return Err(e);
            }
        };

        if state == BundleState::Active {
            let (stopped, result) = self.deactivate(guard, id).await;
            guard = stopped;
            if let Err(e) = result {
                warn!(bundle_id = %id, error = %e, "卸载前停止模块包失败");
            }
        }

        let (current, was_resolved, location) = match guard.bundle(id) {
            Ok(bundle) => (
                bundle.current_revision(),
                bundle.state.is_resolved(),
                bundle.location.clone(),
            ),
            Err(e) => {
                self.finish(guard, &[id]).await;
                return Err(e);
            }
        };

        let mut purged = Vec::new();
        if let Some(current) = current {
            if guard.release_revision(current, true) {
                purged.push(current);
            }
        }
        if guard.location_of(&location) == Some(id) {
            guard.locations.remove(&location);
        }
        if was_resolved {
            guard.transition(id, BundleState::Installed, Some(BundleEventKind::Unresolved));
        }
        guard.transition(id, BundleState::Uninstalled, Some(BundleEventKind::Uninstalled));
        info!(bundle_id = %id, location = %location, "模块包已卸载");

        self.finish(guard, &[id]).await;
        self.purge(purged).await;
        Ok(())
    }

    // ==================== 刷新 ====================

    /// 刷新模块包
    ///
    /// 计算依赖闭包，停止其中 ACTIVE 的模块包，解除全部解析，清除僵尸修订版本，
    /// 忘记已卸载的模块包，然后重新解析并重启此前 ACTIVE 的模块包。
    #[instrument(skip(self))]
    pub async fn refresh(&self, roots: Option<&[BundleId]>) -> Result<()> {
        self.check_permission(None, LifecycleAction::Refresh)?;
        let roots = roots.map(<[BundleId]>::to_vec);
        let (mut guard, members) = self
            .inner
            .lock
            .claim_many(
                |state| state.refresh_closure(roots.as_deref()),
                PendingOperation::Unresolving,
                self.inner.config.lifecycle.state_change_timeout(),
                false,
            )
            .await?;

        if members.is_empty() {
            self.finish(guard, &members).await;
            return Ok(());
        }
        info!(members = ?members, "刷新模块包");

        let was_active: Vec<BundleId> = members
            .iter()
            .copied()
            .filter(|id| guard.bundle(*id).map_or(false, |b| b.state == BundleState::Active))
            .collect();

        for id in was_active.iter().rev() {
            let (stopped, result) = self.deactivate(guard, *id).await;
            guard = stopped;
            if let Err(e) = result {
                warn!(bundle_id = %id, error = %e, "刷新时停止模块包失败");
            }
        }

        for id in &members {
            guard.unresolve_bundle(*id);
        }

        let mut purged = Vec::new();
        for id in &members {
            purged.extend(guard.purge_zombies(*id));
        }

        let targets: Vec<RevisionId> = members
            .iter()
            .filter_map(|id| guard.bundle(*id).ok().and_then(Bundle::current_revision))
            .collect();
        guard.resolve_revisions(&targets, self.inner.resolver_hook.as_deref());

        for id in &was_active {
            let (started, result) = self.activate(guard, *id).await;
            guard = started;
            if let Err(e) = result {
                warn!(bundle_id = %id, error = %e, "刷新后重启模块包失败");
            }
        }

        info!(purged = purged.len(), "刷新完成");
        self.finish(guard, &members).await;
        self.purge(purged).await;
        Ok(())
    }

    // ==================== 类查找 ====================

    /// 按查找顺序定位修订版本可见的包
    pub async fn lookup(&self, revision: RevisionId, package: &str) -> PackageSource {
        let guard = self.inner.lock.lock().await;
        lookup_package(&guard.revisions, &guard.packages, revision, package)
    }

    /// 找到类所在包的提供方修订版本
    ///
    /// 依次查找活动导入、依赖模块包、本地内容，最后尝试动态导入。
    /// 动态导入先读取连线，需要绑定时重新加锁并再次校验。
    #[instrument(skip(self))]
    pub async fn find_class_provider(&self, revision: RevisionId, class_name: &str) -> Result<Option<RevisionId>> {
        let Some((package, _)) = class_name.rsplit_once('.') else {
            return Ok(None);
        };

        match self.lookup(revision, package).await {
            PackageSource::Imported { provider, .. } | PackageSource::Required { provider, .. } => {
                Ok(Some(provider))
            }
            PackageSource::Local(owner) => Ok(Some(owner)),
            PackageSource::NotFound => Ok(None),
            PackageSource::Dynamic => self.register_dynamic_import(revision, package).await,
        }
    }

    /// 为已解析的修订版本绑定一个匹配动态导入模式的包，返回提供方修订版本
    pub async fn register_dynamic_import(&self, revision: RevisionId, package: &str) -> Result<Option<RevisionId>> {
        let mut guard = self.inner.lock.lock().await;
        let source = lookup_package(&guard.revisions, &guard.packages, revision, package);
        let provider = match source {
            PackageSource::Imported { provider, .. } | PackageSource::Required { provider, .. } => {
                Some(provider)
            }
            PackageSource::Local(owner) => Some(owner),
            PackageSource::NotFound => None,
            PackageSource::Dynamic => {
                let provider = guard.dynamic_import(revision, package, self.inner.resolver_hook.as_deref());
                match provider {
                    Some(provider) => {
                        info!(revision = %revision, package = %package, provider = %provider, "动态导入已绑定")
                    }
                    None => debug!(revision = %revision, package = %package, "动态导入没有可用的提供方"),
                }
                provider
            }
        };
        self.flush(&mut guard).await;
        Ok(provider)
    }

    // ==================== 查询 ====================

    pub async fn bundle(&self, id: BundleId) -> Result<BundleInfo> {
        Ok(self.inner.lock.lock().await.bundle(id)?.info())
    }

    /// 全部模块包快照，按 id 升序
    pub async fn bundles(&self) -> Vec<BundleInfo> {
        let guard = self.inner.lock.lock().await;
        guard.bundles.values().map(Bundle::info).collect()
    }

    pub async fn state(&self, id: BundleId) -> Result<BundleState> {
        Ok(self.inner.lock.lock().await.bundle(id)?.state)
    }

    /// 最近一次解析失败的原因
    pub async fn failure(&self, id: BundleId) -> Result<Option<FailureReason>> {
        Ok(self.inner.lock.lock().await.bundle(id)?.failure.clone())
    }

    pub async fn current_revision(&self, id: BundleId) -> Result<Option<RevisionId>> {
        Ok(self.inner.lock.lock().await.bundle(id)?.current_revision())
    }

    /// 模块包的修订版本列表：当前修订版本在前，其后是僵尸
    pub async fn revisions(&self, id: BundleId) -> Result<Vec<RevisionId>> {
        Ok(self.inner.lock.lock().await.bundle(id)?.revisions.clone())
    }

    pub async fn find_by_location(&self, location: &str) -> Option<BundleId> {
        self.inner.lock.lock().await.location_of(location)
    }

    /// 修订版本的连线快照
    pub async fn wiring(&self, revision: RevisionId) -> Option<WiringInfo> {
        let guard = self.inner.lock.lock().await;
        let rev = guard.revision(revision)?;
        let packages = guard.packages();

        let imports = rev
            .wiring
            .imports()
            .keys()
            .chain(rev.wiring.dynamic_accepted().keys())
            .filter_map(|name| {
                let export = rev.wiring.provider_of(name)?;
                Some((name.clone(), packages.export(export)?.owner))
            })
            .collect();
        let exports = rev
            .wiring
            .exports()
            .iter()
            .chain(rev.wiring.reexports())
            .filter_map(|(name, id)| Some((name.clone(), format_version(&packages.export(*id)?.version))))
            .collect();

        Some(WiringInfo {
            revision,
            resolved: rev.is_resolved(),
            imports,
            exports,
            required: rev.wiring.requires().iter().filter_map(|r| r.provider).collect(),
            fragments: rev.fragments.iter().copied().collect(),
            hosts: rev.fragment_hosts.iter().copied().collect(),
        })
    }

    /// 使用修订版本某个导出的修订版本
    pub async fn consumers(&self, revision: RevisionId, package: &str) -> Vec<RevisionId> {
        let guard = self.inner.lock.lock().await;
        guard
            .revision(revision)
            .and_then(|rev| rev.wiring.exports().get(package).copied())
            .map(|export| guard.packages().consumer_revisions(export).into_iter().collect())
            .unwrap_or_default()
    }

    // ==================== 启动与关闭 ====================

    /// 安装配置目录中的全部模块包，批量解析，并启动自动启动列表中的模块包
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<Vec<BundleId>> {
        let dirs = &self.inner.config.bundles.bundle_dirs;
        let locations = DirectoryStore::scan(dirs).await?;
        info!(count = locations.len(), "扫描到模块包");

        let mut installed = Vec::with_capacity(locations.len());
        for location in locations {
            let location = location.to_string_lossy().to_string();
            match self.install(&location).await {
                Ok(id) => installed.push(id),
                Err(e) => warn!(location = %location, error = %e, "安装模块包失败"),
            }
        }

        if !self.resolve_bundles(None).await? {
            warn!("部分模块包未能解析");
        }

        for name in &self.inner.config.bundles.auto_start {
            let matching: Vec<BundleId> = self
                .bundles()
                .await
                .into_iter()
                .filter(|info| &info.symbolic_name == name && info.state != BundleState::Uninstalled)
                .map(|info| info.id)
                .collect();
            if matching.is_empty() {
                warn!(symbolic_name = %name, "自动启动的模块包未安装");
            }
            for id in matching {
                if let Err(e) = self.start(id).await {
                    warn!(bundle_id = %id, symbolic_name = %name, error = %e, "自动启动模块包失败");
                }
            }
        }
        Ok(installed)
    }

    /// 按 id 逆序停止全部 ACTIVE 模块包，保留持久启动标志
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<()> {
        let active: Vec<BundleId> = self
            .bundles()
            .await
            .into_iter()
            .filter(|info| info.id != SYSTEM_BUNDLE_ID && info.state == BundleState::Active)
            .map(|info| info.id)
            .collect();

        for id in active.into_iter().rev() {
            if let Err(e) = self.stop_bundle(id, false).await {
                warn!(bundle_id = %id, error = %e, "关闭时停止模块包失败");
            }
        }
        info!("框架已关闭");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::BundleManifest;
    use std::sync::Mutex;

    async fn framework_with(manifests: &[(&str, BundleManifest)]) -> (Framework, MemoryStore) {
        let store = MemoryStore::new();
        for (location, manifest) in manifests {
            store.stage(*location, manifest.clone()).await;
        }
        let framework = Framework::builder(RuntimeConfig::default())
            .store(Arc::new(store.clone()))
            .build()
            .unwrap();
        (framework, store)
    }

    struct Recorder(Arc<Mutex<Vec<String>>>);

    #[async_trait::async_trait]
    impl BundleActivator for Recorder {
        async fn start(&self, context: &BundleContext) -> Result<()> {
            self.0.lock().unwrap().push(format!("start {}", context.bundle_id()));
            Ok(())
        }

        async fn stop(&self, context: &BundleContext) -> Result<()> {
            self.0.lock().unwrap().push(format!("stop {}", context.bundle_id()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_install_same_location_returns_existing() {
        let (framework, _) = framework_with(&[("mem:a", BundleManifest::new("a", "1.0"))]).await;
        let first = framework.install("mem:a").await.unwrap();
        let second = framework.install("mem:a").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(framework.bundles().await.len(), 2);
    }

    #[tokio::test]
    async fn test_install_invalid_manifest_rejected() {
        let bad = BundleManifest::new("bad", "1.0")
            .export("pkg.x", "1.0")
            .export("pkg.x", "1.0");
        let (framework, _) = framework_with(&[("mem:bad", bad)]).await;
        let err = framework.install("mem:bad").await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidManifest(_)));
        assert_eq!(framework.find_by_location("mem:bad").await, None);
    }

    #[tokio::test]
    async fn test_start_runs_activator_and_sets_persistent_flag() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (framework, store) = framework_with(&[(
            "mem:a",
            BundleManifest::new("a", "1.0").with_activator("recorder"),
        )])
        .await;
        framework
            .register_activator("recorder", Arc::new(Recorder(calls.clone())))
            .await;

        let id = framework.install("mem:a").await.unwrap();
        framework.start(id).await.unwrap();
        assert_eq!(framework.state(id).await.unwrap(), BundleState::Active);
        assert!(store.is_persistent(id).await);

        framework.stop(id).await.unwrap();
        assert_eq!(framework.state(id).await.unwrap(), BundleState::Resolved);
        assert!(!store.is_persistent(id).await);
        assert_eq!(
            *calls.lock().unwrap(),
            vec![format!("start {}", id), format!("stop {}", id)]
        );
    }

    #[tokio::test]
    async fn test_missing_activator_fails_start_without_transition() {
        let (framework, _) = framework_with(&[(
            "mem:a",
            BundleManifest::new("a", "1.0").with_activator("missing"),
        )])
        .await;
        let id = framework.install("mem:a").await.unwrap();
        let err = framework.start(id).await.unwrap_err();
        assert!(matches!(err, CoreError::ActivationFailed { .. }));
        assert_eq!(framework.state(id).await.unwrap(), BundleState::Resolved);
    }

    #[tokio::test]
    async fn test_system_bundle_is_protected() {
        let (framework, _) = framework_with(&[]).await;
        assert_eq!(framework.state(SYSTEM_BUNDLE_ID).await.unwrap(), BundleState::Active);
        assert!(matches!(
            framework.stop(SYSTEM_BUNDLE_ID).await,
            Err(CoreError::InvalidState { .. })
        ));
        assert!(matches!(
            framework.uninstall(SYSTEM_BUNDLE_ID).await,
            Err(CoreError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_fragment_not_startable() {
        let (framework, _) = framework_with(&[
            ("mem:host", BundleManifest::new("host", "1.0")),
            ("mem:frag", BundleManifest::new("frag", "1.0").fragment_of("host", "1.0")),
        ])
        .await;
        framework.install("mem:host").await.unwrap();
        let frag = framework.install("mem:frag").await.unwrap();
        assert!(matches!(
            framework.start(frag).await,
            Err(CoreError::FragmentNotStartable(_))
        ));
    }

    #[tokio::test]
    async fn test_permission_gate_vetoes() {
        struct DenyUninstall;
        impl PermissionGate for DenyUninstall {
            fn check(&self, _bundle: Option<BundleId>, action: LifecycleAction) -> std::result::Result<(), String> {
                if action == LifecycleAction::Uninstall {
                    Err("not allowed".to_string())
                } else {
                    Ok(())
                }
            }
        }

        let store = MemoryStore::new();
        store.stage("mem:a", BundleManifest::new("a", "1.0")).await;
        let framework = Framework::builder(RuntimeConfig::default())
            .store(Arc::new(store))
            .permission_gate(Arc::new(DenyUninstall))
            .build()
            .unwrap();

        let id = framework.install("mem:a").await.unwrap();
        let err = framework.uninstall(id).await.unwrap_err();
        assert!(matches!(err, CoreError::PermissionDenied(_)));
        assert_eq!(framework.state(id).await.unwrap(), BundleState::Installed);
    }

    #[tokio::test]
    async fn test_find_class_provider_order() {
        let (framework, _) = framework_with(&[
            ("mem:a", BundleManifest::new("a", "1.0").export("pkg.x", "1.0")),
            (
                "mem:b",
                BundleManifest::new("b", "1.0")
                    .import("pkg.x", "[1.0,2.0)")
                    .private_package("pkg.b.impl")
                    .dynamic_import("pkg.dyn.*"),
            ),
            ("mem:c", BundleManifest::new("c", "1.0").export("pkg.dyn.api", "1.0")),
        ])
        .await;
        let a = framework.install("mem:a").await.unwrap();
        let b = framework.install("mem:b").await.unwrap();
        let c = framework.install("mem:c").await.unwrap();
        assert!(framework.resolve_bundles(None).await.unwrap());

        let b_rev = framework.current_revision(b).await.unwrap().unwrap();
        let a_rev = framework.current_revision(a).await.unwrap().unwrap();
        let c_rev = framework.current_revision(c).await.unwrap().unwrap();

        assert_eq!(
            framework.find_class_provider(b_rev, "pkg.x.Widget").await.unwrap(),
            Some(a_rev)
        );
        assert_eq!(
            framework.find_class_provider(b_rev, "pkg.b.impl.Helper").await.unwrap(),
            Some(b_rev)
        );
        assert_eq!(
            framework.find_class_provider(b_rev, "pkg.dyn.api.Service").await.unwrap(),
            Some(c_rev)
        );
        assert_eq!(
            framework.find_class_provider(b_rev, "pkg.other.Thing").await.unwrap(),
            None
        );

        let wiring = framework.wiring(b_rev).await.unwrap();
        assert_eq!(wiring.imports.get("pkg.dyn.api"), Some(&c_rev));
    }
}
